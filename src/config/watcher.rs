use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events emitted by the config watcher.
#[derive(Debug)]
pub enum ConfigEvent {
    /// One of the contributing config files changed on disk.
    Changed,
}

/// Watches every file contributing to the merged config and emits debounced
/// change events. Dropping the watcher stops it.
pub struct ConfigWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Start watching. Write/Create/Remove events on any watched file are
    /// debounced (~100 ms) and bridged from the notify thread to an async
    /// channel.
    pub fn watch(paths: &[PathBuf]) -> anyhow::Result<(Self, mpsc::Receiver<ConfigEvent>)> {
        let (tx, rx) = mpsc::channel(16);

        let watched_files: HashSet<PathBuf> =
            paths.iter().filter_map(|p| p.canonicalize().ok()).collect();

        let mut debouncer = new_debouncer(
            Duration::from_millis(100),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let relevant = events.iter().any(|e| {
                        e.kind == DebouncedEventKind::Any
                            && e.path
                                .canonicalize()
                                .map(|p| watched_files.contains(&p))
                                // a removed file no longer canonicalizes
                                .unwrap_or(true)
                    });
                    if relevant {
                        debug!("config file change detected");
                        let _ = tx.blocking_send(ConfigEvent::Changed);
                    }
                }
                Err(e) => {
                    warn!("config watcher error: {}", e);
                }
            },
        )?;

        // Watch each parent directory once; editors often replace files
        // rather than writing in place, which only the directory sees.
        let mut dirs: Vec<&Path> = paths
            .iter()
            .filter_map(|p| p.parent())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        dirs.sort();
        for dir in dirs {
            debouncer.watcher().watch(dir, RecursiveMode::NonRecursive)?;
        }

        Ok((Self { _debouncer: debouncer }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn watcher_detects_file_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "contexts: {}\n").unwrap();

        let (_watcher, mut rx) = ConfigWatcher::watch(&[path.clone()]).unwrap();

        // Give the watcher time to start
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "currentContext: ctx1").unwrap();
        file.flush().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(event.is_ok(), "should receive a change event within timeout");
        assert!(matches!(event.unwrap(), Some(ConfigEvent::Changed)));
    }
}
