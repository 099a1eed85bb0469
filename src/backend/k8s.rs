use async_trait::async_trait;
use futures_util::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::ResourceExt;
use tracing::warn;

use crate::error::{BackendError, SearchError};
use crate::model::{LogEntry, LogSearch, OptionMap};

use super::extract::FieldExtractor;
use super::result::StreamResult;
use super::{context_id_of, finish_entry, parse_time, validate_time_order, LogClient, LogSearchResult};

/// Kubernetes pod-log adapter. Credentials come from the ambient
/// environment (kubeconfig or in-cluster). Pods are picked by the
/// `labelSelector` option, an explicit `pod` option, or a `pod` equality
/// predicate; every container of each selected pod is streamed unless a
/// `container` option narrows it.
pub struct K8sClient {
    client: kube::Client,
}

impl K8sClient {
    pub async fn new(_options: &OptionMap) -> Result<Self, BackendError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| BackendError::Unavailable(format!("kubernetes client init failed: {e}")))?;
        Ok(K8sClient { client })
    }

    async fn select_pods(
        &self,
        api: &Api<Pod>,
        search: &LogSearch,
    ) -> Result<Vec<Pod>, BackendError> {
        let explicit_pod = search.options.get_str("pod").or_else(|| {
            search
                .equality_pairs()
                .into_iter()
                .find(|(field, _)| field == "pod")
                .map(|(_, value)| value)
        });

        if let Some(name) = explicit_pod {
            let pod = api
                .get(&name)
                .await
                .map_err(|e| BackendError::Internal(format!("pod lookup failed: {e}")))?;
            return Ok(vec![pod]);
        }

        let selector = search.options.get_str("labelSelector").ok_or_else(|| {
            SearchError::InvalidSearch(
                "k8s backend needs a 'pod' or 'labelSelector' option".into(),
            )
        })?;
        let pods = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| BackendError::Internal(format!("pod list failed: {e}")))?;
        Ok(pods.items)
    }
}

#[async_trait]
impl LogClient for K8sClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;

        let namespace = search
            .options
            .get_str("namespace")
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pods = self.select_pods(&api, search).await?;
        if pods.is_empty() {
            return Err(BackendError::Internal("no matching pods".into()));
        }

        let follow = search.wants_follow();
        let since_seconds = search.range.last_duration().map(|d| d.as_secs() as i64);
        let since_time = search.range.gte.as_deref().and_then(parse_time);
        let container_opt = search.options.get_str("container");
        let previous = search.options.get_bool("previous").unwrap_or(false);
        let tail_lines = search.size.map(|s| s as i64);

        let (result, tx, cancel, tracker) = StreamResult::channel(search.clone());
        let context_id = context_id_of(search);
        let post_filter = search.combined_filter();

        for pod in pods {
            let pod_name = pod.name_any();
            let containers: Vec<String> = match &container_opt {
                Some(c) => vec![c.clone()],
                None => pod
                    .spec
                    .as_ref()
                    .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                    .unwrap_or_default(),
            };

            for container in containers {
                let api = api.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let context_id = context_id.clone();
                let post_filter = post_filter.clone();
                let extractor = FieldExtractor::new(&search.field_extraction);
                let pod_name = pod_name.clone();
                let namespace = namespace.clone();
                let params = LogParams {
                    follow,
                    container: Some(container.clone()),
                    since_seconds,
                    since_time: since_time.clone(),
                    tail_lines,
                    timestamps: true,
                    previous,
                    ..Default::default()
                };

                tracker.spawn(async move {
                    let stream = match api.log_stream(&pod_name, &params).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(pod = %pod_name, container = %container, error = %e, "log stream failed");
                            return;
                        }
                    };
                    let mut lines = stream.lines();

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            line = lines.next() => {
                                match line {
                                    Some(Ok(line)) => {
                                        let Some(entry) = pod_entry(&line, &pod_name, &namespace, &container) else {
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
                                        warn!(pod = %pod_name, error = %e, "log stream read error");
                                        break;
                                    }
                                    None => break, // stream ended
                                }
                            }
                        }
                    }
                });
            }
        }

        Ok(Box::new(result))
    }
}

/// Split the `timestamps: true` prefix and tag the entry with its origin.
fn pod_entry(line: &str, pod: &str, namespace: &str, container: &str) -> Option<LogEntry> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }

    let (timestamp, message) = match line.split_once(' ') {
        Some((ts, rest)) if parse_time(ts).is_some() => (parse_time(ts), rest),
        _ => (None, line),
    };

    let mut entry = LogEntry::from_message(message);
    entry.timestamp = timestamp;
    entry.fields.insert("pod", serde_json::Value::from(pod));
    entry
        .fields
        .insert("namespace", serde_json::Value::from(namespace));
    entry
        .fields
        .insert("container", serde_json::Value::from(container));
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_entry_splits_timestamp_and_tags_origin() {
        let entry = pod_entry(
            "2024-05-01T12:00:00.123456789Z WARN retrying",
            "api-7d9f",
            "prod",
            "app",
        )
        .unwrap();
        assert_eq!(entry.message, "WARN retrying");
        assert_eq!(entry.level, Some(crate::model::LogLevel::Warn));
        assert!(entry.timestamp.is_some());
        assert_eq!(entry.fields.get_str("pod").as_deref(), Some("api-7d9f"));
        assert_eq!(entry.fields.get_str("namespace").as_deref(), Some("prod"));
        assert_eq!(entry.fields.get_str("container").as_deref(), Some("app"));
    }

    #[test]
    fn empty_line_skipped() {
        assert!(pod_entry("", "p", "ns", "c").is_none());
    }
}
