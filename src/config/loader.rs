// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::RuntimeConfig;

/// Repository-level config files, searched in order.
pub const CONFIG_FILES: &[&str] = &[".foreman.yaml", ".foreman.yml", ".foreman.json"];

/// Global config directory name under the home directory.
pub const GLOBAL_CONFIG_DIR: &str = ".foreman";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.yaml";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Find the first repository config file that exists.
pub fn find_repo_config(repo_root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| repo_root.join(name))
        .find(|path| path.exists())
}

/// Load a configuration file (JSON or YAML, chosen by extension).
pub fn load_config_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "json" => serde_json::from_str(&content).map_err(ConfigError::from),
        _ => {
            if content.trim().is_empty() {
                return Ok(RuntimeConfig::default());
            }
            serde_yaml::from_str(&content).map_err(ConfigError::from)
        }
    }
}

/// Write a config file for a repository. Fails if one already exists.
pub fn init_config(repo_root: &Path, config: &RuntimeConfig) -> Result<PathBuf, ConfigError> {
    if let Some(existing) = find_repo_config(repo_root) {
        return Err(ConfigError::invalid(
            "init",
            format!("{} already exists", existing.display()),
        ));
    }
    let path = repo_root.join(CONFIG_FILES[0]);
    let content = serde_yaml::to_string(config)?;
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES[0], ".foreman.yaml");
        assert_eq!(CONFIG_FILES.len(), 3);
    }

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir().unwrap();
        assert!(dir.ends_with(".foreman"));
    }

    #[test]
    fn test_find_repo_config_prefers_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "{}").unwrap();
        std::fs::write(temp.path().join(".foreman.yaml"), "").unwrap();

        let found = find_repo_config(temp.path()).unwrap();
        assert!(found.ends_with(".foreman.yaml"));
    }

    #[test]
    fn test_load_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".foreman.json");
        std::fs::write(&path, r#"{"default_agent": "codex", "owners": ["alice"]}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.default_agent, "codex");
        assert_eq!(config.owners, vec!["alice".to_string()]);
    }

    #[test]
    fn test_load_empty_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".foreman.yaml");
        std::fs::write(&path, "\n").unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_load_invalid_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".foreman.yml");
        std::fs::write(&path, "worker_concurrency: [not a number").unwrap();

        assert!(matches!(load_config_file(&path), Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), &RuntimeConfig::default()).unwrap();
        assert!(path.exists());

        let reloaded = load_config_file(&path).unwrap();
        assert_eq!(reloaded, RuntimeConfig::default());

        assert!(init_config(temp.path(), &RuntimeConfig::default()).is_err());
    }
}
