use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{BackendError, SearchError};
use crate::model::{FilterLogic, FilterNode, FilterOp, LogEntry, LogSearch, OptionMap, PaginationInfo};

use super::extract::FieldExtractor;
use super::result::{EntryBatch, StreamResult};
use super::{context_id_of, finish_entry, parse_time, validate_time_order, LogClient, LogSearchResult};

const DEFAULT_PAGE_SIZE: usize = 100;
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);
const JOB_POLL_MAX: u32 = 240;
const DEFAULT_REFRESH: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// SPL compilation
// ---------------------------------------------------------------------------

fn spl_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render one AST node as an inline SPL predicate. Regex leaves cannot live
/// inline; they are collected separately and appended as `| regex` stages.
fn spl_predicate(node: &FilterNode, regex_stages: &mut Vec<String>) -> Option<String> {
    match node {
        FilterNode::Leaf {
            field,
            op,
            value,
            negate,
        } => {
            let clause = match op {
                FilterOp::Equals => format!("{field}={}", spl_quote(value)),
                FilterOp::Match | FilterOp::Wildcard => {
                    let pattern = if *op == FilterOp::Match {
                        format!("*{value}*")
                    } else {
                        value.clone()
                    };
                    format!("{field}={}", spl_quote(&pattern))
                }
                FilterOp::Exists => format!("{field}=*"),
                FilterOp::Gt => format!("{field}>{value}"),
                FilterOp::Gte => format!("{field}>={value}"),
                FilterOp::Lt => format!("{field}<{value}"),
                FilterOp::Lte => format!("{field}<={value}"),
                FilterOp::Regex => {
                    let stage = if *negate {
                        format!("| regex {field}!={}", spl_quote(value))
                    } else {
                        format!("| regex {field}={}", spl_quote(value))
                    };
                    regex_stages.push(stage);
                    return None;
                }
            };
            Some(if *negate {
                format!("NOT {clause}")
            } else {
                clause
            })
        }
        FilterNode::Branch { logic, filters } => {
            let parts: Vec<String> = filters
                .iter()
                .filter_map(|f| spl_predicate(f, regex_stages))
                .collect();
            if parts.is_empty() {
                return None;
            }
            Some(match logic {
                FilterLogic::And => format!("({})", parts.join(" ")),
                FilterLogic::Or => format!("({})", parts.join(" OR ")),
                FilterLogic::Not => format!("NOT ({})", parts.join(" ")),
            })
        }
    }
}

/// Compile the search into one SPL string: the native query (or a `search`
/// head with the index) as the base, predicates ANDed on, time bounds as
/// `earliest`/`latest`, regex stages last.
pub fn compile_spl(search: &LogSearch, index: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();

    match &search.native_query {
        Some(native) => parts.push(native.clone()),
        None => {
            let mut head = String::from("search");
            if let Some(index) = index {
                head.push_str(&format!(" index={}", spl_quote(index)));
            }
            parts.push(head);
        }
    }

    if let Some(last) = &search.range.last {
        let compact: String = last.chars().filter(|c| !c.is_whitespace()).collect();
        parts.push(format!("earliest=-{compact}"));
    } else {
        if let Some(gte) = search.range.gte.as_deref().and_then(parse_time) {
            parts.push(format!("earliest={}", gte.timestamp()));
        }
        if let Some(lte) = search.range.lte.as_deref().and_then(parse_time) {
            parts.push(format!("latest={}", lte.timestamp()));
        }
    }

    let mut regex_stages = Vec::new();
    if let Some(filter) = search.combined_filter() {
        if let Some(clause) = spl_predicate(&filter, &mut regex_stages) {
            parts.push(clause);
        }
    }

    let mut spl = parts.join(" ");
    for stage in regex_stages {
        spl.push(' ');
        spl.push_str(&stage);
    }
    spl
}

// ---------------------------------------------------------------------------
// Job API
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct SplunkApi {
    http: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
}

impl SplunkApi {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
    }

    async fn submit_job(&self, spl: &str) -> Result<String, BackendError> {
        let response = self
            .request(self.http.post(format!("{}/services/search/jobs", self.base_url)))
            .form(&[("search", spl), ("output_mode", "json"), ("exec_mode", "normal")])
            .send()
            .await
            .map_err(BackendError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let parsed: Value = response.json().await.map_err(BackendError::from_http)?;
        parsed["sid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Internal("job response carried no sid".into()))
    }

    /// Poll the job until its dispatch state is terminal.
    async fn wait_for_job(&self, sid: &str, cancel: &CancellationToken) -> Result<(), BackendError> {
        for _ in 0..JOB_POLL_MAX {
            if cancel.is_cancelled() {
                return Err(BackendError::Canceled);
            }

            let response = self
                .request(self.http.get(format!(
                    "{}/services/search/jobs/{sid}",
                    self.base_url
                )))
                .query(&[("output_mode", "json")])
                .send()
                .await
                .map_err(BackendError::from_http)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(BackendError::from_status(status.as_u16(), body));
            }

            let parsed: Value = response.json().await.map_err(BackendError::from_http)?;
            let state = parsed["entry"][0]["content"]["dispatchState"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            match state.as_str() {
                "DONE" => return Ok(()),
                "FAILED" => {
                    return Err(BackendError::Internal(format!("search job {sid} failed")))
                }
                _ => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Canceled),
                _ = tokio::time::sleep(JOB_POLL_INTERVAL) => {}
            }
        }
        Err(BackendError::Timeout(format!(
            "search job {sid} did not complete"
        )))
    }

    async fn fetch_results(
        &self,
        sid: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<Value>, BackendError> {
        let response = self
            .request(self.http.get(format!(
                "{}/services/search/jobs/{sid}/results",
                self.base_url
            )))
            .query(&[
                ("output_mode", "json".to_string()),
                ("count", count.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await
            .map_err(BackendError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let parsed: Value = response.json().await.map_err(BackendError::from_http)?;
        Ok(parsed["results"].as_array().cloned().unwrap_or_default())
    }

    async fn delete_job(&self, sid: &str) {
        let outcome = self
            .request(self.http.delete(format!(
                "{}/services/search/jobs/{sid}",
                self.base_url
            )))
            .send()
            .await;
        if let Err(e) = outcome {
            debug!(error = %e, sid, "search job cleanup failed");
        }
    }
}

fn entry_from_row(row: &Value) -> LogEntry {
    let message = row["_raw"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| row.to_string());
    let mut entry = LogEntry::from_message(message);
    entry.timestamp = row["_time"]
        .as_str()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    if let Some(level) = row["level"].as_str() {
        entry.level = crate::model::LogLevel::parse(level).or(entry.level);
    }
    if let Value::Object(obj) = row {
        for (key, value) in obj {
            if key != "_raw" {
                entry.fields.insert(key.clone(), value.clone());
            }
        }
    }
    entry
}

/// One dispatched search job. Pagination is the server-side result offset;
/// results arrive in the job's reported order (newest first).
struct SplunkResult {
    api: SplunkApi,
    search: LogSearch,
    sid: String,
    pagination: Option<PaginationInfo>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    polling_follow: bool,
}

#[async_trait]
impl LogSearchResult for SplunkResult {
    fn search(&self) -> &LogSearch {
        &self.search
    }

    async fn entries(&mut self) -> Result<EntryBatch, BackendError> {
        self.api.wait_for_job(&self.sid, &self.cancel).await?;

        let count = self.search.size.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset: usize = match &self.search.page_token {
            Some(token) => token
                .parse()
                .map_err(|_| SearchError::InvalidPageToken(token.clone()))?,
            None => 0,
        };

        let rows = self.api.fetch_results(&self.sid, count, offset).await?;

        let context_id = context_id_of(&self.search);
        let extractor = FieldExtractor::new(&self.search.field_extraction);
        let entries: Vec<LogEntry> = rows
            .iter()
            .map(entry_from_row)
            .filter_map(|e| finish_entry(e, &context_id, &extractor, None))
            .collect();

        self.pagination = Some(PaginationInfo {
            has_more: rows.len() >= count,
            next_page_token: (offset + rows.len()).to_string(),
        });

        let live = if self.search.wants_follow() && self.polling_follow {
            Some(self.spawn_polling_follow(entries.last().and_then(|e| e.timestamp)))
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
        self.api.delete_job(&self.sid).await;
    }
}

impl SplunkResult {
    /// Follow by repeated range-shifted jobs: every interval, submit a new
    /// job whose window starts just past the newest delivered entry.
    fn spawn_polling_follow(
        &self,
        floor: Option<chrono::DateTime<chrono::Utc>>,
    ) -> tokio::sync::mpsc::Receiver<Vec<LogEntry>> {
        let (tx, rx) = tokio::sync::mpsc::channel(StreamResult::CHANNEL_CAPACITY);
        let api = self.api.clone();
        let search = self.search.clone();
        let cancel = self.cancel.clone();
        let interval = search.refresh.duration_parsed().unwrap_or(DEFAULT_REFRESH);
        let mut floor = floor.unwrap_or_else(chrono::Utc::now);

        self.tracker.spawn(async move {
            let context_id = context_id_of(&search);
            let extractor = FieldExtractor::new(&search.field_extraction);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let mut window = search.clone();
                window.range.last = None;
                window.range.gte = Some(floor.to_rfc3339());
                window.range.lte = None;
                window.page_token = None;
                let index = window.options.get_str("index");
                let spl = compile_spl(&window, index.as_deref());

                let outcome = async {
                    let sid = api.submit_job(&spl).await?;
                    api.wait_for_job(&sid, &cancel).await?;
                    let rows = api
                        .fetch_results(&sid, window.size.unwrap_or(DEFAULT_PAGE_SIZE), 0)
                        .await;
                    api.delete_job(&sid).await;
                    rows
                }
                .await;

                match outcome {
                    Ok(rows) => {
                        let entries: Vec<LogEntry> = rows
                            .iter()
                            .map(entry_from_row)
                            .filter_map(|e| finish_entry(e, &context_id, &extractor, None))
                            .collect();
                        if let Some(newest) = entries.iter().filter_map(|e| e.timestamp).max() {
                            floor = newest;
                        }
                        if !entries.is_empty() && tx.send(entries).await.is_err() {
                            break;
                        }
                    }
                    Err(BackendError::Canceled) => break,
                    Err(e) => {
                        warn!(error = %e, "polling follow iteration failed");
                    }
                }
            }
        });

        rx
    }
}

/// Splunk adapter over the search jobs REST API. The `headers` option
/// passes authorization through verbatim.
pub struct SplunkClient {
    api: SplunkApi,
    options: OptionMap,
}

impl SplunkClient {
    pub fn new(options: &OptionMap) -> Result<Self, BackendError> {
        let base_url = options
            .get_str("url")
            .ok_or_else(|| SearchError::InvalidSearch("splunk client needs a 'url' option".into()))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.get_bool("allowInsecure").unwrap_or(false))
            .build()
            .map_err(BackendError::from_http)?;
        Ok(SplunkClient {
            api: SplunkApi {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                headers: options.get_string_map("headers").unwrap_or_default(),
            },
            options: options.clone(),
        })
    }
}

#[async_trait]
impl LogClient for SplunkClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        validate_time_order(search)?;

        let index = search
            .options
            .get_str("index")
            .or_else(|| self.options.get_str("index"));
        let spl = compile_spl(search, index.as_deref());
        debug!(spl = %spl, "submitting search job");

        let sid = self.api.submit_job(&spl).await?;
        let polling_follow = search
            .options
            .get_bool("usePollingFollow")
            .or_else(|| self.options.get_bool("usePollingFollow"))
            .unwrap_or(true);

        Ok(Box::new(SplunkResult {
            api: self.api.clone(),
            search: search.clone(),
            sid,
            pagination: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            polling_follow,
        }))
    }
}
