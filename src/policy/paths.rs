// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Changed-path guard.
//!
//! Agent output is untrusted: whatever the agent claims, the files it
//! actually touched are checked here before tests or merges run. Globs use
//! `globset` defaults, so `*` also matches across `/`.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the allow-list is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathPolicyMode {
    /// Only the deny-list is enforced.
    #[default]
    AllowAllWithDenylist,
    /// Every changed path must also match the allow-list.
    AllowlistEnforced,
}

/// A path guard failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathViolation {
    #[error("Changed forbidden path: {path}")]
    Denied { path: String, pattern: String },

    #[error("Changed path outside allow-list: {path}")]
    OutsideAllowList { path: String },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl PathViolation {
    /// The offending path, if the violation is about a path.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Denied { path, .. } | Self::OutsideAllowList { path } => Some(path),
            Self::InvalidPattern { .. } => None,
        }
    }
}

/// Compiled allow/deny globs.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    allowed: GlobSet,
    allowed_empty: bool,
    denied: GlobSet,
    denied_patterns: Vec<String>,
    mode: PathPolicyMode,
}

impl PathPolicy {
    pub fn new(
        allowed: &[String],
        denied: &[String],
        mode: PathPolicyMode,
    ) -> Result<Self, PathViolation> {
        Ok(Self {
            allowed: build_globset(allowed)?,
            allowed_empty: allowed.is_empty(),
            denied: build_globset(denied)?,
            denied_patterns: denied.to_vec(),
            mode,
        })
    }

    pub fn mode(&self) -> PathPolicyMode {
        self.mode
    }

    /// Check every path against the deny-list, then (when enforced) every
    /// path against the allow-list. The first violation is returned.
    pub fn validate<S: AsRef<str>>(&self, paths: &[S]) -> Result<(), PathViolation> {
        let normalized: Vec<String> = paths.iter().map(|p| normalize(p.as_ref())).collect();

        for path in &normalized {
            if let Some(idx) = self.denied.matches(path).first() {
                return Err(PathViolation::Denied {
                    path: path.clone(),
                    pattern: self.denied_patterns[*idx].clone(),
                });
            }
        }

        if self.mode == PathPolicyMode::AllowAllWithDenylist || self.allowed_empty {
            return Ok(());
        }

        match normalized.iter().find(|p| !self.allowed.is_match(p.as_str())) {
            Some(path) => Err(PathViolation::OutsideAllowList { path: path.clone() }),
            None => Ok(()),
        }
    }
}

/// One-shot form of [`PathPolicy::validate`].
pub fn validate_changed_paths<S: AsRef<str>>(
    paths: &[S],
    allowed: &[String],
    denied: &[String],
    mode: PathPolicyMode,
) -> Result<(), PathViolation> {
    PathPolicy::new(allowed, denied, mode)?.validate(paths)
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").map(str::to_string).unwrap_or(path)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, PathViolation> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| PathViolation::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| PathViolation::InvalidPattern {
        pattern: patterns.join(","),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn policy(mode: PathPolicyMode) -> PathPolicy {
        PathPolicy::new(
            &strings(&["src/**", "tests/**", "Cargo.toml"]),
            &strings(&[".env", "config.yaml", ".git/**"]),
            mode,
        )
        .unwrap()
    }

    #[test]
    fn test_denied_path_fails_in_every_mode() {
        for mode in [PathPolicyMode::AllowAllWithDenylist, PathPolicyMode::AllowlistEnforced] {
            let err = policy(mode).validate(&["src/lib.rs", ".env"]).unwrap_err();
            assert_eq!(err.to_string(), "Changed forbidden path: .env");
            assert_eq!(err.path(), Some(".env"));
        }
    }

    #[test]
    fn test_allowlist_advisory_by_default() {
        let p = policy(PathPolicyMode::AllowAllWithDenylist);
        assert!(p.validate(&["README.md", "scripts/run.sh"]).is_ok());
    }

    #[test]
    fn test_allowlist_enforced() {
        let p = policy(PathPolicyMode::AllowlistEnforced);
        assert!(p.validate(&["src/main.rs", "tests/it.rs", "Cargo.toml"]).is_ok());

        let err = p.validate(&["src/main.rs", "README.md"]).unwrap_err();
        assert_eq!(
            err,
            PathViolation::OutsideAllowList {
                path: "README.md".to_string()
            }
        );
    }

    #[test]
    fn test_deny_pass_runs_before_allow_pass() {
        // README.md is outside the allow-list but comes first; the denied
        // path must still be the reported violation.
        let p = policy(PathPolicyMode::AllowlistEnforced);
        let err = p.validate(&["README.md", "config.yaml"]).unwrap_err();
        assert!(matches!(err, PathViolation::Denied { ref pattern, .. } if pattern == "config.yaml"));
    }

    #[test]
    fn test_empty_allowlist_enforces_nothing() {
        let p = PathPolicy::new(&[], &strings(&[".env"]), PathPolicyMode::AllowlistEnforced).unwrap();
        assert!(p.validate(&["anything/at/all.txt"]).is_ok());
    }

    #[test]
    fn test_windows_separators_and_dot_prefix() {
        let p = policy(PathPolicyMode::AllowlistEnforced);
        assert!(p.validate(&["src\\nested\\mod.rs", "./Cargo.toml"]).is_ok());
        assert!(p.validate(&[".git\\config"]).is_err());
    }

    #[test]
    fn test_star_crosses_directories() {
        let result = validate_changed_paths(
            &["deep/nested/secret.pem"],
            &[],
            &strings(&["*.pem"]),
            PathPolicyMode::AllowAllWithDenylist,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = PathPolicy::new(&strings(&["src/[oops"]), &[], PathPolicyMode::AllowlistEnforced)
            .unwrap_err();
        assert!(matches!(err, PathViolation::InvalidPattern { .. }));
    }
}
