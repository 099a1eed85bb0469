use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::config_dir;
use crate::error::ConfigError;

/// User-scoped persistent state: the currently selected context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

/// `~/.logviewer/state.yaml`.
pub fn state_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("state.yaml"))
}

impl State {
    /// Load the persisted state; a missing file is an empty state.
    pub fn load() -> Result<State, ConfigError> {
        let Some(path) = state_path() else {
            return Ok(State::default());
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<State, ConfigError> {
        if !path.exists() {
            return Ok(State::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Persist the state with owner-only permissions.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = state_path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");

        let state = State {
            current_context: "prod-api".to_string(),
        };
        state.save_to(&path).unwrap();

        let loaded = State::load_from(&path).unwrap();
        assert_eq!(loaded, state);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let state = State::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(state, State::default());
    }
}
