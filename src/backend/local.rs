use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::model::{LogEntry, LogSearch, OptionMap};

use super::extract::FieldExtractor;
use super::result::StreamResult;
use super::{command, context_id_of, finish_entry, validate_time_order, LogClient, LogSearchResult};

/// Command-stream backend running on this machine: spawns a shell, streams
/// stdout lines as entries. The command is either the expanded `cmd`
/// template or the `hl` hybrid.
pub struct LocalClient {
    shell: String,
}

impl LocalClient {
    pub fn new(options: &OptionMap) -> Self {
        LocalClient {
            shell: options.get_str("shell").unwrap_or_else(|| "sh".to_string()),
        }
    }
}

#[async_trait]
impl LogClient for LocalClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;
        let cmd = command::build_command(search)?;
        debug!(cmd = %cmd, "spawning local command");

        let (result, tx, cancel, tracker) = StreamResult::channel(search.clone());
        let context_id = context_id_of(search);
        let extractor = FieldExtractor::new(&search.field_extraction);
        let post_filter = search.combined_filter();
        let shell = self.shell.clone();

        tracker.spawn(async move {
            let mut child = match Command::new(&shell)
                .arg("-c")
                .arg(&cmd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(error = %e, "failed to spawn local command");
                    return;
                }
            };

            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(line = %line, "local command stderr");
                    }
                });
            }

            let Some(stdout) = child.stdout.take() else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let text = line.trim_end();
                                if text.is_empty() {
                                    continue;
                                }
                                let entry = LogEntry::from_message(text);
                                if let Some(entry) =
                                    finish_entry(entry, &context_id, &extractor, post_filter.as_ref())
                                {
                                    if tx.send(vec![entry]).await.is_err() {
                                        let _ = child.start_kill();
                                        break;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "local command read error");
                                break;
                            }
                        }
                    }
                }
            }

            let _ = child.wait().await;
        });

        Ok(Box::new(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_with_cmd(cmd: &str) -> LogSearch {
        let mut search = LogSearch::default();
        search.options.insert("cmd", json!(cmd));
        search
    }

    #[tokio::test]
    async fn echo_command_yields_entry() {
        let client = LocalClient::new(&OptionMap::new());
        let mut search = search_with_cmd("echo hi");
        search.size = Some(1);

        let mut result = client.get(&search).await.unwrap();
        let batch = result.entries().await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].message, "hi");
        assert!(batch.live.is_none());
        result.close().await;
    }

    #[tokio::test]
    async fn size_bounds_initial_batch() {
        let client = LocalClient::new(&OptionMap::new());
        let mut search = search_with_cmd("seq 1 100");
        search.size = Some(5);

        let mut result = client.get(&search).await.unwrap();
        let batch = result.entries().await.unwrap();
        assert_eq!(batch.entries.len(), 5);
        result.close().await;
    }

    #[tokio::test]
    async fn post_filter_applies_to_stream() {
        let client = LocalClient::new(&OptionMap::new());
        let mut search = search_with_cmd("printf 'ERROR a\\nINFO b\\nERROR c\\n'");
        search.fields.insert("level".into(), "ERROR".into());

        let mut result = client.get(&search).await.unwrap();
        let batch = result.entries().await.unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.entries.iter().all(|e| e.message.starts_with("ERROR")));
        result.close().await;
    }

    #[tokio::test]
    async fn follow_mode_streams_live() {
        let client = LocalClient::new(&OptionMap::new());
        let mut search = search_with_cmd("echo live-line; sleep 5");
        search.follow = true;

        let mut result = client.get(&search).await.unwrap();
        let mut batch = result.entries().await.unwrap();
        assert!(batch.entries.is_empty());

        let live = batch.live.as_mut().expect("live channel");
        let first = tokio::time::timeout(std::time::Duration::from_secs(3), live.recv())
            .await
            .expect("live batch in time")
            .expect("channel open");
        assert_eq!(first[0].message, "live-line");

        // close cancels the still-sleeping child in bounded time
        tokio::time::timeout(std::time::Duration::from_secs(2), result.close())
            .await
            .expect("close returns promptly");
    }

    #[tokio::test]
    async fn json_extraction_enriches_entries() {
        let client = LocalClient::new(&OptionMap::new());
        let mut search =
            search_with_cmd(r#"echo '{"level": "warn", "msg": "disk low", "disk": "sda"}'"#);
        search.size = Some(1);
        search.field_extraction.json = Some(true);
        search.field_extraction.json_level_key = Some("level".into());
        search.field_extraction.json_message_key = Some("msg".into());

        let mut result = client.get(&search).await.unwrap();
        let batch = result.entries().await.unwrap();
        let entry = &batch.entries[0];
        assert_eq!(entry.message, "disk low");
        assert_eq!(entry.level, Some(crate::model::LogLevel::Warn));
        assert_eq!(entry.fields.get_str("disk").as_deref(), Some("sda"));
        result.close().await;
    }
}
