#![allow(dead_code)]
use std::path::PathBuf;
use std::sync::Arc;

use logviewer::engine::Engine;
use tempfile::TempDir;

pub struct TestConfig {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestConfig {
    pub fn new(config_yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, config_yaml).unwrap();
        Self { dir, config_path }
    }

    pub fn rewrite(&self, config_yaml: &str) {
        std::fs::write(&self.config_path, config_yaml).unwrap();
    }

    pub fn engine(&self) -> Arc<Engine> {
        let config =
            logviewer::config::load_config(std::slice::from_ref(&self.config_path)).unwrap();
        Engine::from_config(config, vec![self.config_path.clone()]).unwrap()
    }
}

/// A config with one local echo context, the S-series starting point.
pub const ECHO_CONFIG: &str = r#"
clients:
  c1: {type: local}
contexts:
  ctx1:
    client: c1
    search:
      options: {cmd: "echo hi"}
"#;
