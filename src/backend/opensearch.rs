use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{BackendError, SearchError};
use crate::model::{LogEntry, LogSearch, OptionMap, PaginationInfo};

use super::extract::FieldExtractor;
use super::result::{EntryBatch, StreamResult};
use super::{
    context_id_of, dsl, finish_entry, parse_time, validate_time_order, LogClient, LogSearchResult,
};

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_REFRESH: Duration = Duration::from_secs(5);

/// How requests reach the cluster: straight at the `_search` endpoint, or
/// tunneled through the Kibana console proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Transport {
    Direct,
    KibanaProxy,
}

/// Shared search executor for the OpenSearch and Kibana adapters.
#[derive(Clone)]
#[derive(Debug)]
pub(crate) struct EsTransport {
    http: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    transport: Transport,
}

impl EsTransport {
    pub(crate) fn new(options: &OptionMap, transport: Transport) -> Result<Self, BackendError> {
        let base_url = options
            .get_str("url")
            .ok_or_else(|| SearchError::InvalidSearch("client needs a 'url' option".into()))?;
        let headers = options.get_string_map("headers").unwrap_or_default();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.get_bool("allowInsecure").unwrap_or(false))
            .build()
            .map_err(BackendError::from_http)?;
        Ok(EsTransport {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            transport,
        })
    }

    /// Run one `_search` and return the raw hits.
    pub(crate) async fn search(&self, index: &str, body: &Value) -> Result<Vec<Value>, BackendError> {
        let mut request = match self.transport {
            Transport::Direct => self
                .http
                .post(format!("{}/{}/_search", self.base_url, index)),
            Transport::KibanaProxy => self
                .http
                .post(format!("{}/api/console/proxy", self.base_url))
                .query(&[("path", format!("/{index}/_search")), ("method", "POST".into())])
                .header("kbn-xsrf", "true"),
        };
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(BackendError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let parsed: Value = response.json().await.map_err(BackendError::from_http)?;
        Ok(parsed["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }
}

/// Build one entry from a search hit: `_source` keys become fields, the
/// message comes from `message`/`log` or the whole document, level and
/// timestamp are best-effort.
fn entry_from_hit(hit: &Value, timestamp_field: &str) -> LogEntry {
    let source = &hit["_source"];
    let message = source["message"]
        .as_str()
        .or_else(|| source["log"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| source.to_string());

    let mut entry = LogEntry::from_message(message);
    if let Some(level) = source["level"].as_str() {
        entry.level = crate::model::LogLevel::parse(level).or(entry.level);
    }
    entry.timestamp = source[timestamp_field].as_str().and_then(parse_time);
    if let Value::Object(obj) = source {
        for (key, value) in obj {
            if key != "message" {
                entry.fields.insert(key.clone(), value.clone());
            }
        }
    }
    entry
}

pub(crate) struct EsSearchState {
    pub(crate) transport: EsTransport,
    pub(crate) index: String,
    pub(crate) timestamp_field: String,
}

impl EsSearchState {
    pub(crate) fn from_options(
        transport: EsTransport,
        client_options: &OptionMap,
        search: &LogSearch,
    ) -> Self {
        let opt = |key: &str| {
            search
                .options
                .get_str(key)
                .or_else(|| client_options.get_str(key))
        };
        EsSearchState {
            transport,
            index: opt("index").unwrap_or_else(|| "_all".to_string()),
            timestamp_field: opt("timestampField").unwrap_or_else(|| "@timestamp".to_string()),
        }
    }
}

/// A paged `_search` result. Paging is `search_after` on the last hit's
/// sort key; follow mode polls with the floor advanced past the last seen
/// hit. Entries arrive newest-first as the server reports them.
struct EsResult {
    state: EsSearchState,
    search: LogSearch,
    pagination: Option<PaginationInfo>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[async_trait]
impl LogSearchResult for EsResult {
    fn search(&self) -> &LogSearch {
        &self.search
    }

    async fn entries(&mut self) -> Result<EntryBatch, BackendError> {
        let size = self.search.size.unwrap_or(DEFAULT_PAGE_SIZE);
        let body = dsl::build_request_body(&self.search, &self.state.timestamp_field, size)?;
        let hits = self.state.transport.search(&self.state.index, &body).await?;

        let context_id = context_id_of(&self.search);
        let extractor = FieldExtractor::new(&self.search.field_extraction);
        let entries: Vec<LogEntry> = hits
            .iter()
            .map(|hit| entry_from_hit(hit, &self.state.timestamp_field))
            .filter_map(|entry| finish_entry(entry, &context_id, &extractor, None))
            .collect();

        self.pagination = hits.last().map(|last| PaginationInfo {
            has_more: hits.len() >= size,
            next_page_token: dsl::encode_page_token(&last["sort"]),
        });

        let live = if self.search.wants_follow() {
            Some(self.spawn_follow(&hits))
        } else {
            None
        };

        Ok(EntryBatch { entries, live })
    }

    fn pagination(&self) -> Option<PaginationInfo> {
        self.pagination.clone()
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl EsResult {
    /// Poll for documents newer than the last seen hit, forwarding batches
    /// until canceled.
    fn spawn_follow(
        &self,
        initial_hits: &[Value],
    ) -> tokio::sync::mpsc::Receiver<Vec<LogEntry>> {
        let (tx, rx) = tokio::sync::mpsc::channel(StreamResult::CHANNEL_CAPACITY);
        let state = EsSearchState {
            transport: self.state.transport.clone(),
            index: self.state.index.clone(),
            timestamp_field: self.state.timestamp_field.clone(),
        };
        let mut search = self.search.clone();
        search.page_token = None;
        let interval = search.refresh.duration_parsed().unwrap_or(DEFAULT_REFRESH);
        let cancel = self.cancel.clone();
        let mut floor = initial_hits
            .first()
            .and_then(|hit| hit["_source"][&state.timestamp_field].as_str())
            .map(str::to_string);

        self.tracker.spawn(async move {
            let context_id = context_id_of(&search);
            let extractor = FieldExtractor::new(&search.field_extraction);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let mut poll_search = search.clone();
                if let Some(floor) = &floor {
                    poll_search.range.last = None;
                    poll_search.range.gte = Some(floor.clone());
                }
                let body = match dsl::build_request_body(
                    &poll_search,
                    &state.timestamp_field,
                    poll_search.size.unwrap_or(DEFAULT_PAGE_SIZE),
                ) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "follow poll body build failed");
                        break;
                    }
                };

                match state.transport.search(&state.index, &body).await {
                    Ok(hits) => {
                        if let Some(newest) = hits
                            .first()
                            .and_then(|h| h["_source"][&state.timestamp_field].as_str())
                        {
                            floor = Some(newest.to_string());
                        }
                        let entries: Vec<LogEntry> = hits
                            .iter()
                            .map(|hit| entry_from_hit(hit, &state.timestamp_field))
                            .filter_map(|e| finish_entry(e, &context_id, &extractor, None))
                            .collect();
                        if !entries.is_empty() && tx.send(entries).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "follow poll failed, retrying");
                    }
                }
            }
        });

        rx
    }
}

/// OpenSearch / Elasticsearch adapter speaking the `_search` API directly.
pub struct OpenSearchClient {
    transport: EsTransport,
    options: OptionMap,
}

impl OpenSearchClient {
    pub fn new(options: &OptionMap) -> Result<Self, BackendError> {
        Ok(OpenSearchClient {
            transport: EsTransport::new(options, Transport::Direct)?,
            options: options.clone(),
        })
    }

    pub(crate) fn with_transport(options: &OptionMap, transport: Transport) -> Result<Self, BackendError> {
        Ok(OpenSearchClient {
            transport: EsTransport::new(options, transport)?,
            options: options.clone(),
        })
    }
}

#[async_trait]
impl LogClient for OpenSearchClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;
        let state = EsSearchState::from_options(self.transport.clone(), &self.options, search);
        Ok(Box::new(EsResult {
            state,
            search: search.clone(),
            pagination: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }
}
