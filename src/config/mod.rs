pub mod model;
pub mod resolve;
pub mod vars;
pub mod watcher;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::model::OptionMap;
use model::{ClientConfig, ContextConfig};

/// Environment variable naming one config path, or a platform
/// list-separator-delimited list of paths.
pub const CONFIG_ENV: &str = "LOGVIEWER_CONFIG";

/// User-scoped config directory: `~/.logviewer`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".logviewer"))
}

fn has_config_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Discover every file contributing to the merged config, lowest precedence
/// first. Default-directory files come first, then `LOGVIEWER_CONFIG`
/// entries, then the explicit path, so later files override earlier ones
/// key-wise during the merge.
pub fn discover_config_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(dir) = config_dir() {
        for name in ["config.yaml", "config.yml", "config.json"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                paths.push(candidate);
            }
        }
        // drop-in directory, merged lexicographically
        let dropins = dir.join("configs");
        if dropins.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&dropins)
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_file() && has_config_extension(p))
                        .collect()
                })
                .unwrap_or_default();
            entries.sort();
            paths.extend(entries);
        }
    }

    if let Ok(env_value) = std::env::var(CONFIG_ENV) {
        paths.extend(std::env::split_paths(&env_value).filter(|p| !p.as_os_str().is_empty()));
    }

    if let Some(path) = explicit {
        paths.push(path.to_path_buf());
    }

    paths
}

/// Parse one config file, dispatching on its extension.
pub fn parse_config_file(path: &Path) -> Result<ContextConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Some("yaml" | "yml") => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Load and merge every contributing file, then validate.
///
/// A merged config with no clients gets a default `local` client injected
/// so `cmd`-based contexts stay usable; a config with no contexts is an
/// error.
pub fn load_config(paths: &[PathBuf]) -> Result<ContextConfig, ConfigError> {
    let mut merged = ContextConfig::default();
    for path in paths {
        debug!(path = %path.display(), "merging config file");
        merged.merge(parse_config_file(path)?);
    }

    if merged.clients.is_empty() {
        merged.clients.insert(
            "local".to_string(),
            ClientConfig {
                client_type: "local".to_string(),
                options: OptionMap::new(),
            },
        );
    }

    if merged.contexts.is_empty() {
        return Err(ConfigError::NoContexts);
    }

    Ok(merged)
}

/// Discover and load in one step, returning the contributing paths for the
/// hot-reload watcher.
pub fn discover_and_load(
    explicit: Option<&Path>,
) -> Result<(ContextConfig, Vec<PathBuf>), ConfigError> {
    let paths = discover_config_paths(explicit);
    let config = load_config(&paths)?;
    Ok((config, paths))
}

/// Emit the config as YAML. `load(save(cfg))` round-trips.
pub fn save_config(config: &ContextConfig, path: &Path) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(config).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const MINIMAL: &str = r#"
clients:
  c1: {type: local}
contexts:
  ctx1:
    client: c1
    search:
      options: {cmd: "echo hi"}
"#;

    #[test]
    fn load_yaml_and_json() {
        let dir = TempDir::new().unwrap();
        let yaml = write(&dir, "a.yaml", MINIMAL);
        let json = write(
            &dir,
            "b.json",
            r#"{"contexts": {"ctx2": {"client": "c1"}}}"#,
        );

        let config = load_config(&[yaml, json]).unwrap();
        assert_eq!(config.context_ids(), vec!["ctx1", "ctx2"]);
    }

    #[test]
    fn later_file_overrides_earlier() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.yaml", MINIMAL);
        let b = write(
            &dir,
            "b.yaml",
            r#"
clients:
  c1: {type: docker}
"#,
        );
        let config = load_config(&[a, b]).unwrap();
        assert_eq!(config.clients["c1"].client_type, "docker");
    }

    #[test]
    fn unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.toml", "clients = {}");
        match parse_config_file(&path) {
            Err(ConfigError::UnsupportedFormat { .. }) => {}
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn malformed_content_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.yaml", "contexts: [not, a, map]");
        match parse_config_file(&path) {
            Err(ConfigError::Parse { .. }) => {}
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn no_contexts_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.yaml", "clients:\n  c1: {type: local}\n");
        match load_config(&[path]) {
            Err(ConfigError::NoContexts) => {}
            other => panic!("expected NoContexts, got {other:?}"),
        }
    }

    #[test]
    fn default_local_client_injected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "config.yaml",
            r#"
contexts:
  ctx1:
    client: local
    search:
      options: {cmd: "echo hi"}
"#,
        );
        let config = load_config(&[path]).unwrap();
        assert_eq!(config.clients["local"].client_type, "local");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.yaml", MINIMAL);
        let config = load_config(&[path]).unwrap();

        let saved = dir.path().join("saved.yaml");
        save_config(&config, &saved).unwrap();
        let reloaded = load_config(&[saved]).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn load_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.yaml", MINIMAL);
        let first = load_config(&[path.clone()]).unwrap();
        let second = load_config(&[path]).unwrap();
        assert_eq!(first, second);
    }
}
