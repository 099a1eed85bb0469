use std::sync::Arc;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BackendError, SearchError};
use crate::model::{LogEntry, LogSearch, OptionMap};

use super::extract::FieldExtractor;
use super::result::StreamResult;
use super::{command, context_id_of, finish_entry, validate_time_order, LogClient, LogSearchResult};

/// Command-stream backend over SSH. The connection is a multiplexed master
/// session, established lazily and shared by every search against this
/// client; each search runs its own remote command.
#[derive(Debug)]
pub struct SshClient {
    destination: String,
    known_hosts: KnownHosts,
    session: Mutex<Option<Arc<Session>>>,
}

impl SshClient {
    pub fn new(options: &OptionMap) -> Result<Self, BackendError> {
        let host = options.get_str("host").ok_or_else(|| {
            SearchError::InvalidSearch("ssh client needs a 'host' option".into())
        })?;

        let mut destination = String::from("ssh://");
        if let Some(user) = options.get_str("user") {
            destination.push_str(&user);
            destination.push('@');
        }
        destination.push_str(&host);
        if let Some(port) = options.get_i64("port") {
            destination.push_str(&format!(":{port}"));
        }

        let known_hosts = match options.get_str("knownHosts").as_deref() {
            Some("strict") => KnownHosts::Strict,
            Some("accept") => KnownHosts::Accept,
            _ => KnownHosts::Add,
        };

        // Network-device CLIs sometimes need PTY allocation disabled; the
        // mux transport never allocates one, so the option is a no-op here.
        if options.get_bool("disablePty").unwrap_or(false) {
            debug!("disablePty set; mux transport runs without a PTY already");
        }

        Ok(SshClient {
            destination,
            known_hosts,
            session: Mutex::new(None),
        })
    }

    async fn session(&self) -> Result<Arc<Session>, BackendError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = Session::connect_mux(&self.destination, self.known_hosts.clone())
            .await
            .map_err(|e| BackendError::Unavailable(format!("ssh connect failed: {e}")))?;
        let session = Arc::new(session);
        *guard = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl LogClient for SshClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;
        let cmd = command::build_command(search)?;
        debug!(destination = %self.destination, cmd = %cmd, "running remote command");

        let session = self.session().await?;

        let (result, tx, cancel, tracker) = StreamResult::channel(search.clone());
        let context_id = context_id_of(search);
        let extractor = FieldExtractor::new(&search.field_extraction);
        let post_filter = search.combined_filter();

        tracker.spawn(async move {
            let mut child = match session
                .raw_command(&cmd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .await
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(error = %e, "ssh spawn failed");
                    return;
                }
            };

            if let Some(stderr) = child.stderr().take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        // surfaces the HL_ENGINE marker among other noise
                        debug!(line = %line, "remote command stderr");
                    }
                });
            }

            let Some(stdout) = child.stdout().take() else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
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
                                        break;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "ssh stream read error");
                                break;
                            }
                        }
                    }
                }
            }

            if let Err(e) = child.disconnect().await {
                debug!(error = %e, "remote command disconnect");
            }
        });

        Ok(Box::new(result))
    }
}
