use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::query_parameters::{ListContainersOptions, LogsOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::warn;

use crate::error::{BackendError, SearchError};
use crate::model::{LogEntry, LogSearch, OptionMap};

use super::extract::FieldExtractor;
use super::result::StreamResult;
use super::{context_id_of, finish_entry, parse_time, validate_time_order, LogClient, LogSearchResult};

/// Docker engine adapter: streams container logs over the local socket.
/// Containers are picked by name, compose service, or compose project.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub fn new(_options: &OptionMap) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(format!("docker connect failed: {e}")))?;
        Ok(DockerClient { docker })
    }

    /// Resolve the target container names from the search options.
    async fn select_containers(&self, search: &LogSearch) -> Result<Vec<String>, BackendError> {
        if let Some(container) = search.options.get_str("container") {
            return Ok(vec![container]);
        }

        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(service) = search.options.get_str("service") {
            filters
                .entry("label".to_string())
                .or_default()
                .push(format!("com.docker.compose.service={service}"));
        }
        if let Some(project) = search.options.get_str("project") {
            filters
                .entry("label".to_string())
                .or_default()
                .push(format!("com.docker.compose.project={project}"));
        }
        if filters.is_empty() {
            return Err(SearchError::InvalidSearch(
                "docker backend needs a 'container', 'service', or 'project' option".into(),
            )
            .into());
        }

        let options = ListContainersOptions {
            all: false,
            filters: Some(filters),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| BackendError::Internal(format!("listing containers: {e}")))?;

        let names: Vec<String> = summaries
            .iter()
            .filter_map(|s| {
                s.id.clone().or_else(|| {
                    s.names
                        .as_ref()
                        .and_then(|n| n.first())
                        .map(|n| n.trim_start_matches('/').to_string())
                })
            })
            .collect();
        Ok(names)
    }
}

#[async_trait]
impl LogClient for DockerClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;
        let containers = self.select_containers(search).await?;
        if containers.is_empty() {
            return Err(BackendError::Internal("no matching containers".into()));
        }

        let follow = search.wants_follow();
        let since = search
            .range
            .last_duration()
            .map(|d| (chrono::Utc::now() - chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())).timestamp())
            .or_else(|| {
                search
                    .range
                    .gte
                    .as_deref()
                    .and_then(parse_time)
                    .map(|t| t.timestamp())
            });
        let until = search
            .range
            .lte
            .as_deref()
            .and_then(parse_time)
            .map(|t| t.timestamp());

        let (result, tx, cancel, tracker) = StreamResult::channel(search.clone());
        let context_id = context_id_of(search);
        let post_filter = search.combined_filter();

        for container in containers {
            let docker = self.docker.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let context_id = context_id.clone();
            let post_filter = post_filter.clone();
            let extractor = FieldExtractor::new(&search.field_extraction);
            let tail = search.size.map(|s| s.to_string());

            tracker.spawn(async move {
                let options = LogsOptions {
                    follow,
                    stdout: true,
                    stderr: true,
                    timestamps: true,
                    since: since.unwrap_or(0) as i32,
                    until: until.unwrap_or(0) as i32,
                    tail: tail.unwrap_or_else(|| "all".to_string()),
                    ..Default::default()
                };
                let mut stream = docker.logs(&container, Some(options));

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = stream.next() => {
                            match item {
                                Some(Ok(output)) => {
                                    let text = match &output {
                                        LogOutput::StdOut { message } => {
                                            String::from_utf8_lossy(message).to_string()
                                        }
                                        LogOutput::StdErr { message } => {
                                            String::from_utf8_lossy(message).to_string()
                                        }
                                        _ => continue,
                                    };
                                    let Some(entry) =
                                        docker_entry(&text, &container)
                                    else {
                                        continue;
                                    };
                                    if let Some(entry) = finish_entry(
                                        entry,
                                        &context_id,
                                        &extractor,
                                        post_filter.as_ref(),
                                    ) {
                                        if tx.send(vec![entry]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(container = %container, error = %e, "docker log stream error");
                                    break;
                                }
                                None => break, // container stopped or stream ended
                            }
                        }
                    }
                }
            });
        }

        Ok(Box::new(result))
    }
}

/// Split the `timestamps: true` prefix off one log line and build an entry
/// tagged with its container.
fn docker_entry(text: &str, container: &str) -> Option<LogEntry> {
    let text = text.trim_end();
    if text.is_empty() {
        return None;
    }

    let (timestamp, message) = match text.split_once(' ') {
        Some((ts, rest)) if parse_time(ts).is_some() => (parse_time(ts), rest),
        _ => (None, text),
    };

    let mut entry = LogEntry::from_message(message);
    entry.timestamp = timestamp;
    entry
        .fields
        .insert("container", serde_json::Value::from(container));
    Some(entry)
}
