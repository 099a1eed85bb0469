pub mod cloudwatch;
pub mod command;
pub mod docker;
pub mod dsl;
pub mod extract;
pub mod fields;
pub mod k8s;
pub mod kibana;
pub mod local;
pub mod opensearch;
pub mod result;
pub mod splunk;
pub mod ssh;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::model::ClientConfig;
use crate::error::{BackendError, ConfigError};
use crate::model::{FieldValues, FilterNode, LogEntry, LogSearch};

pub use result::{EntryBatch, LogSearchResult, MultiSearchResult, StreamResult};

/// Adapter-side hint naming the originating context. Stamped onto emitted
/// entries and never forwarded to remote systems.
pub const CONTEXT_ID_OPTION: &str = "__context_id__";

/// The uniform adapter contract every backend implements.
///
/// `get` initiates a search and hands ownership of the session to the
/// returned result; dropping or closing the result cancels in-flight work.
/// `field_values` has a generic fallback that drains one bounded search;
/// adapters with a native distinct-values facility override it.
#[async_trait]
pub trait LogClient: Send + Sync + std::fmt::Debug {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError>;

    async fn field_values(
        &self,
        search: &LogSearch,
        field_names: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>, BackendError> {
        let mut search = search.clone();
        search.follow = false;
        search.refresh = Default::default();
        if search.size.is_none() {
            search.size = Some(fields::FIELD_SCAN_CAP);
        }

        let mut result = self.get(&search).await?;
        let batch = result.entries().await?;
        result.close().await;

        let mut values = FieldValues::new();
        fields::accumulate(&mut values, &batch.entries, field_names);
        Ok(fields::into_sorted(values, field_names))
    }
}

/// Finish one adapter-produced entry: run field extraction, stamp the
/// originating context, then apply the client-side predicate for backends
/// that could not push it down. Returns `None` when filtered out.
pub fn finish_entry(
    mut entry: LogEntry,
    context_id: &str,
    extractor: &extract::FieldExtractor,
    post_filter: Option<&FilterNode>,
) -> Option<LogEntry> {
    extractor.apply(&mut entry);
    entry.context_id = context_id.to_string();
    match post_filter {
        Some(filter) if !filter.matches(&entry) => None,
        _ => Some(entry),
    }
}

/// The context id hint carried in options, if any.
pub fn context_id_of(search: &LogSearch) -> String {
    search
        .options
        .get_str(CONTEXT_ID_OPTION)
        .unwrap_or_default()
}

/// Parse an absolute range bound: RFC3339 first, then the Insights layout
/// (`2024-05-01 12:00:00.000`), then a bare date.
pub fn parse_time(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.3f") {
        return Some(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }
    None
}

/// Reject an inverted absolute range. Every backend but CloudWatch (which
/// swaps silently) calls this before dispatch.
pub fn validate_time_order(search: &LogSearch) -> Result<(), crate::error::SearchError> {
    if let (Some(gte), Some(lte)) = (&search.range.gte, &search.range.lte) {
        if let (Some(gte), Some(lte)) = (parse_time(gte), parse_time(lte)) {
            if gte > lte {
                return Err(crate::error::SearchError::InvalidSearch(format!(
                    "time range is inverted: {gte} > {lte}"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

const KNOWN_TYPES: &[&str] = &[
    "splunk",
    "opensearch",
    "kibana",
    "k8s",
    "docker",
    "cloudwatch",
    "ssh",
    "local",
];

/// Type-keyed client factory. Construction is lazy: options are retained,
/// the adapter is instantiated on first use and cached for the lifetime of
/// the factory (one config snapshot).
#[derive(Debug)]
pub struct ClientFactory {
    clients: BTreeMap<String, ClientConfig>,
    cache: Mutex<HashMap<String, Arc<dyn LogClient>>>,
}

impl ClientFactory {
    /// Validate every configured client type up front; unknown types fail
    /// here, not on first query.
    pub fn new(clients: BTreeMap<String, ClientConfig>) -> Result<Self, ConfigError> {
        for config in clients.values() {
            if !KNOWN_TYPES.contains(&config.client_type.as_str()) {
                return Err(ConfigError::UnknownClientType {
                    client_type: config.client_type.clone(),
                });
            }
        }
        Ok(ClientFactory {
            clients,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn LogClient>, BackendError> {
        let config = self
            .clients
            .get(name)
            .ok_or_else(|| ConfigError::UnknownClient {
                name: name.to_string(),
            })?;

        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(name) {
            return Ok(client.clone());
        }

        let client = build_client(config).await?;
        cache.insert(name.to_string(), client.clone());
        Ok(client)
    }
}

async fn build_client(config: &ClientConfig) -> Result<Arc<dyn LogClient>, BackendError> {
    let options = &config.options;
    let client: Arc<dyn LogClient> = match config.client_type.as_str() {
        "splunk" => Arc::new(splunk::SplunkClient::new(options)?),
        "opensearch" => Arc::new(opensearch::OpenSearchClient::new(options)?),
        "kibana" => Arc::new(kibana::KibanaClient::new(options)?),
        "k8s" => Arc::new(k8s::K8sClient::new(options).await?),
        "docker" => Arc::new(docker::DockerClient::new(options)?),
        "cloudwatch" => Arc::new(cloudwatch::CloudWatchClient::new(options).await?),
        "ssh" => Arc::new(ssh::SshClient::new(options)?),
        "local" => Arc::new(local::LocalClient::new(options)),
        other => {
            return Err(ConfigError::UnknownClientType {
                client_type: other.to_string(),
            }
            .into())
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_fails_at_factory_build() {
        let clients = BTreeMap::from([(
            "bad".to_string(),
            ClientConfig {
                client_type: "carrier-pigeon".to_string(),
                options: Default::default(),
            },
        )]);
        match ClientFactory::new(clients) {
            Err(ConfigError::UnknownClientType { client_type }) => {
                assert_eq!(client_type, "carrier-pigeon")
            }
            other => panic!("expected UnknownClientType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn factory_caches_instances() {
        let clients = BTreeMap::from([(
            "loc".to_string(),
            ClientConfig {
                client_type: "local".to_string(),
                options: Default::default(),
            },
        )]);
        let factory = ClientFactory::new(clients).unwrap();
        let a = factory.get("loc").await.unwrap();
        let b = factory.get("loc").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_client_name() {
        let factory = ClientFactory::new(BTreeMap::new()).unwrap();
        match factory.get("ghost").await {
            Err(BackendError::Config(ConfigError::UnknownClient { name })) => {
                assert_eq!(name, "ghost")
            }
            other => panic!("expected UnknownClient, got {other:?}"),
        }
    }
}
