// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the task runtime.
//!
//! Sources, highest precedence first:
//! - CLI flags ([`CliOverrides`])
//! - Repository config: `.foreman.yaml`, `.foreman.yml` or `.foreman.json`
//! - Global config: `~/.foreman/config.yaml`
//! - Built-in defaults
//!
//! The repository file replaces the global one rather than merging with it.

mod loader;
mod types;

pub use loader::{
    find_repo_config, get_global_config_dir, get_global_config_path, init_config,
    load_config_file, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};
pub use types::{AgentCommandConfig, CleanupConfig, MergeGateConfig, RiskProfile, RuntimeConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Command-line values that override file configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub database_path: Option<PathBuf>,
    pub worktree_root: Option<PathBuf>,
    pub worker_concurrency: Option<usize>,
    pub default_agent: Option<String>,
    pub test_command: Option<String>,
}

impl CliOverrides {
    fn apply(self, config: &mut RuntimeConfig) {
        if let Some(path) = self.database_path {
            config.database_path = Some(path);
        }
        if let Some(path) = self.worktree_root {
            config.worktree_root = Some(path);
        }
        if let Some(n) = self.worker_concurrency {
            config.worker_concurrency = n;
        }
        if let Some(agent) = self.default_agent {
            config.default_agent = agent;
        }
        if let Some(cmd) = self.test_command {
            config.default_test_command = cmd;
        }
    }
}

/// Load, override and validate the configuration for a repository.
pub fn load_config(repo_root: &Path, overrides: CliOverrides) -> Result<RuntimeConfig, ConfigError> {
    let mut config = match find_repo_config(repo_root) {
        Some(path) => load_config_file(&path)?,
        None => match get_global_config_path().filter(|p| p.exists()) {
            Some(path) => load_config_file(&path)?,
            None => RuntimeConfig::default(),
        },
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_repo_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.yaml"),
            "default_test_command: make check\ncleanup:\n  retention_hours: 1\n",
        )
        .unwrap();

        let config = load_config(temp.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.default_test_command, "make check");
        assert_eq!(config.cleanup.retention_hours, 1);
    }

    #[test]
    fn test_cli_overrides_win() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.json"),
            r#"{"worker_concurrency": 2, "default_agent": "codex"}"#,
        )
        .unwrap();

        let overrides = CliOverrides {
            worker_concurrency: Some(6),
            ..Default::default()
        };
        let config = load_config(temp.path(), overrides).unwrap();
        assert_eq!(config.worker_concurrency, 6);
        assert_eq!(config.default_agent, "codex");
    }

    #[test]
    fn test_invalid_override_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.yaml"), "").unwrap();
        let overrides = CliOverrides {
            worker_concurrency: Some(0),
            ..Default::default()
        };
        assert!(load_config(temp.path(), overrides).is_err());
    }
}
