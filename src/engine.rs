use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::backend::ClientFactory;
use crate::config::model::ContextConfig;
use crate::config::watcher::{ConfigEvent, ConfigWatcher};
use crate::error::ConfigError;

/// One immutable view of the loaded configuration and its client factory.
/// Handlers take a snapshot at the start of a request and keep it for the
/// request's lifetime, so an in-flight request is never disturbed by a
/// reload.
pub struct EngineSnapshot {
    pub config: ContextConfig,
    pub factory: ClientFactory,
    pub sources: Vec<PathBuf>,
}

impl EngineSnapshot {
    fn build(config: ContextConfig, sources: Vec<PathBuf>) -> Result<Self, ConfigError> {
        let factory = ClientFactory::new(config.clients.clone())?;
        Ok(EngineSnapshot {
            config,
            factory,
            sources,
        })
    }
}

/// The engine owns the current `(config, factory)` snapshot behind a
/// reader-writer lock. Reads clone the `Arc` and drop the lock; the reload
/// path builds a fresh snapshot and swaps it under the write lock. A failed
/// reload leaves the previous snapshot intact.
pub struct Engine {
    snapshot: RwLock<Arc<EngineSnapshot>>,
    watcher: std::sync::Mutex<Option<ConfigWatcher>>,
}

impl Engine {
    pub fn from_config(
        config: ContextConfig,
        sources: Vec<PathBuf>,
    ) -> Result<Arc<Self>, ConfigError> {
        let snapshot = EngineSnapshot::build(config, sources)?;
        Ok(Arc::new(Engine {
            snapshot: RwLock::new(Arc::new(snapshot)),
            watcher: std::sync::Mutex::new(None),
        }))
    }

    /// Discover config files (explicit path, `LOGVIEWER_CONFIG`, then the
    /// user-scoped defaults) and build the engine from the merged result.
    pub fn discover(explicit: Option<&Path>) -> Result<Arc<Self>, ConfigError> {
        let (config, sources) = crate::config::discover_and_load(explicit)?;
        Self::from_config(config, sources)
    }

    /// The current snapshot. Cheap: clones an `Arc` under a read lock.
    pub async fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Reload the contributing files and atomically swap the snapshot.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let sources = self.snapshot().await.sources.clone();
        let config = crate::config::load_config(&sources)?;
        let next = Arc::new(EngineSnapshot::build(config, sources)?);
        *self.snapshot.write().await = next;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start the hot-reload watcher over the contributing files. Change
    /// events trigger `reload`; a reload failure is logged and the old
    /// snapshot stays live.
    pub async fn start_watcher(self: Arc<Self>) -> anyhow::Result<()> {
        let sources = self.snapshot().await.sources.clone();
        let (watcher, mut rx) = ConfigWatcher::watch(&sources)?;
        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);

        let engine = Arc::downgrade(&self);
        tokio::spawn(async move {
            while let Some(ConfigEvent::Changed) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.reload().await {
                    error!(error = %e, "config reload failed, keeping previous configuration");
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG_A: &str = r#"
clients:
  c1: {type: local}
contexts:
  ctx:
    client: c1
    search:
      options: {cmd: "echo hi"}
"#;

    const CONFIG_B: &str = r#"
clients:
  c1: {type: local}
contexts:
  other:
    client: c1
    search:
      options: {cmd: "echo bye"}
"#;

    fn engine_from(dir: &TempDir, content: &str) -> Arc<Engine> {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        let config = crate::config::load_config(std::slice::from_ref(&path)).unwrap();
        Engine::from_config(config, vec![path]).unwrap()
    }

    #[tokio::test]
    async fn reload_swaps_snapshot() {
        let dir = TempDir::new().unwrap();
        let engine = engine_from(&dir, CONFIG_A);
        assert_eq!(engine.snapshot().await.config.context_ids(), vec!["ctx"]);

        std::fs::write(dir.path().join("config.yaml"), CONFIG_B).unwrap();
        engine.reload().await.unwrap();
        assert_eq!(engine.snapshot().await.config.context_ids(), vec!["other"]);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let engine = engine_from(&dir, CONFIG_A);

        std::fs::write(dir.path().join("config.yaml"), "contexts: [broken").unwrap();
        assert!(engine.reload().await.is_err());
        assert_eq!(engine.snapshot().await.config.context_ids(), vec!["ctx"]);
    }

    #[tokio::test]
    async fn in_flight_snapshot_survives_reload() {
        let dir = TempDir::new().unwrap();
        let engine = engine_from(&dir, CONFIG_A);

        let held = engine.snapshot().await;
        std::fs::write(dir.path().join("config.yaml"), CONFIG_B).unwrap();
        engine.reload().await.unwrap();

        // the held snapshot still resolves the old context
        assert!(held.config.contexts.contains_key("ctx"));
        assert!(!engine.snapshot().await.config.contexts.contains_key("ctx"));
    }
}
