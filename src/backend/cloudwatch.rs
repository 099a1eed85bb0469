use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_cloudwatchlogs::types::QueryStatus;
use aws_sdk_cloudwatchlogs::Client;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BackendError, SearchError};
use crate::model::{LogEntry, LogSearch, OptionMap, PaginationInfo};

use super::extract::FieldExtractor;
use super::result::EntryBatch;
use super::{context_id_of, finish_entry, parse_time, LogClient, LogSearchResult};

const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
const MAX_POLLS: u32 = 120;

/// Field names allowed into an Insights query verbatim. Anything else is
/// dropped, not escaped: the query language has no way to quote them.
static SAFE_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@]+$").expect("valid regex"));

fn escape_value(value: &str) -> String {
    value.replace('\'', r"\'")
}

/// Build the Insights query string: projected fields, one filter stage per
/// safe equality predicate, newest-first sort, and a limit when sized.
/// Unsafe field names are skipped silently.
pub fn build_insights_query(search: &LogSearch) -> String {
    let mut query = String::from("fields @timestamp, @message");

    for (field, value) in search.equality_pairs() {
        if !SAFE_FIELD_RE.is_match(&field) {
            debug!(field = %field, "skipping unsafe field name in insights filter");
            continue;
        }
        query.push_str(&format!(" | filter {field} = '{}'", escape_value(&value)));
    }

    query.push_str(" | sort @timestamp desc");
    if let Some(size) = search.size {
        query.push_str(&format!(" | limit {size}"));
    }
    query
}

/// CloudWatch filter pattern for the FilterLogEvents fallback, compiled
/// from the same safe equality predicates (JSON property syntax). Only
/// equality is expressible here; other predicates are documented as
/// Insights-only.
pub fn build_filter_pattern(search: &LogSearch) -> Option<String> {
    let clauses: Vec<String> = search
        .equality_pairs()
        .into_iter()
        .filter(|(field, _)| SAFE_FIELD_RE.is_match(field))
        .map(|(field, value)| format!("$.{field} = \"{}\"", value.replace('"', "\\\"")))
        .collect();
    if clauses.is_empty() {
        None
    } else {
        Some(format!("{{ {} }}", clauses.join(" && ")))
    }
}

/// Epoch-millisecond window from the range: `last` wins, absolute bounds
/// parse as RFC3339 or the Insights layout, an inverted pair is swapped,
/// and the default window is the last 15 minutes.
pub fn time_window(search: &LogSearch) -> (i64, i64) {
    let now = Utc::now();

    if let Some(dur) = search.range.last_duration() {
        let start = now - chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::zero());
        return (start.timestamp_millis(), now.timestamp_millis());
    }

    let gte = search.range.gte.as_deref().and_then(parse_time);
    let lte = search.range.lte.as_deref().and_then(parse_time);
    if gte.is_none() && lte.is_none() {
        let start = now - chrono::Duration::from_std(DEFAULT_WINDOW).unwrap_or(chrono::Duration::zero());
        return (start.timestamp_millis(), now.timestamp_millis());
    }

    let start = gte.map(|t| t.timestamp_millis()).unwrap_or_else(|| {
        (now - chrono::Duration::from_std(DEFAULT_WINDOW).unwrap_or(chrono::Duration::zero())).timestamp_millis()
    });
    let end = lte
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis());

    if start > end {
        (end, start)
    } else {
        (start, end)
    }
}

fn is_throttling<E: std::fmt::Debug>(err: &E) -> bool {
    let text = format!("{err:?}");
    text.contains("Throttling") || text.contains("TooManyRequests") || text.contains("LimitExceeded")
}

#[derive(Clone, Copy)]
struct PollSettings {
    interval: Duration,
    max_interval: Duration,
    factor: f64,
}

impl PollSettings {
    fn from_options(client_options: &OptionMap, search: &LogSearch) -> Self {
        let opt_f64 = |key: &str| {
            search
                .options
                .get_f64(key)
                .or_else(|| client_options.get_f64(key))
        };
        let secs = |key: &str, default: Duration| {
            opt_f64(key)
                .map(Duration::from_secs_f64)
                .unwrap_or(default)
        };
        PollSettings {
            interval: secs("pollInterval", DEFAULT_POLL_INTERVAL),
            max_interval: secs("maxPollInterval", DEFAULT_MAX_POLL_INTERVAL),
            factor: opt_f64("backoffFactor").unwrap_or(DEFAULT_BACKOFF_FACTOR),
        }
    }
}

enum QueryHandle {
    /// An Insights query in flight, to be polled.
    Insights { query_id: String },
    /// FilterLogEvents parameters, paged directly.
    FilterEvents {
        pattern: Option<String>,
        start_ms: i64,
        end_ms: i64,
    },
}

/// One CloudWatch query. Insights results arrive in one shot once the
/// query completes; the fallback pages through FilterLogEvents with
/// NextToken.
struct CloudWatchResult {
    client: Client,
    log_group: String,
    search: LogSearch,
    handle: QueryHandle,
    poll: PollSettings,
    pagination: Option<PaginationInfo>,
    cancel: CancellationToken,
}

#[async_trait]
impl LogSearchResult for CloudWatchResult {
    fn search(&self) -> &LogSearch {
        &self.search
    }

    async fn entries(&mut self) -> Result<EntryBatch, BackendError> {
        enum Plan {
            Insights(String),
            FilterEvents(Option<String>, i64, i64),
        }
        let plan = match &self.handle {
            QueryHandle::Insights { query_id } => Plan::Insights(query_id.clone()),
            QueryHandle::FilterEvents {
                pattern,
                start_ms,
                end_ms,
            } => Plan::FilterEvents(pattern.clone(), *start_ms, *end_ms),
        };

        let entries = match plan {
            Plan::Insights(query_id) => self.poll_insights(&query_id).await?,
            Plan::FilterEvents(pattern, start_ms, end_ms) => {
                self.page_filter_events(pattern, start_ms, end_ms).await?
            }
        };
        Ok(EntryBatch {
            entries,
            live: None,
        })
    }

    fn pagination(&self) -> Option<PaginationInfo> {
        self.pagination.clone()
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let QueryHandle::Insights { query_id } = &self.handle {
            let outcome = self
                .client
                .stop_query()
                .query_id(query_id)
                .send()
                .await;
            if let Err(e) = outcome {
                debug!(error = %e, "stop_query on close failed");
            }
        }
    }
}

impl CloudWatchResult {
    /// Poll GetQueryResults with exponential backoff until the query
    /// reaches a terminal status. Transient throttling backs off the same
    /// way; exhaustion surfaces as a timeout.
    async fn poll_insights(&self, query_id: &str) -> Result<Vec<LogEntry>, BackendError> {
        let mut interval = self.poll.interval;

        for _ in 0..MAX_POLLS {
            if self.cancel.is_cancelled() {
                return Err(BackendError::Canceled);
            }

            match self.client.get_query_results().query_id(query_id).send().await {
                Ok(output) => {
                    match output.status() {
                        Some(QueryStatus::Complete) => {
                            return Ok(self.insights_entries(output.results()));
                        }
                        Some(QueryStatus::Failed) => {
                            return Err(BackendError::Internal(format!(
                                "insights query {query_id} failed"
                            )))
                        }
                        Some(QueryStatus::Cancelled) => {
                            return Err(BackendError::Internal(format!(
                                "insights query {query_id} was cancelled"
                            )))
                        }
                        Some(QueryStatus::Timeout) => {
                            return Err(BackendError::Timeout(format!(
                                "insights query {query_id} timed out"
                            )))
                        }
                        _ => {} // Scheduled / Running / Unknown: keep polling
                    }
                }
                Err(e) if is_throttling(&e) => {
                    debug!(error = %e, "get_query_results throttled, backing off");
                }
                Err(e) => return Err(BackendError::Internal(e.to_string())),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BackendError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
            interval = interval.mul_f64(self.poll.factor).min(self.poll.max_interval);
        }

        Err(BackendError::Timeout(format!(
            "insights query {query_id} did not complete"
        )))
    }

    fn insights_entries(
        &self,
        results: &[Vec<aws_sdk_cloudwatchlogs::types::ResultField>],
    ) -> Vec<LogEntry> {
        let context_id = context_id_of(&self.search);
        let extractor = FieldExtractor::new(&self.search.field_extraction);

        results
            .iter()
            .map(|row| {
                let mut entry = LogEntry::default();
                for field in row {
                    let (Some(name), Some(value)) = (field.field(), field.value()) else {
                        continue;
                    };
                    match name {
                        "@message" => {
                            entry.message = value.to_string();
                        }
                        "@timestamp" => {
                            entry.timestamp = parse_time(value);
                        }
                        "@ptr" => {}
                        other => {
                            entry
                                .fields
                                .insert(other, serde_json::Value::from(value));
                        }
                    }
                }
                entry.level = crate::model::detect_log_level(&entry.message);
                entry
            })
            .filter_map(|e| finish_entry(e, &context_id, &extractor, None))
            .collect()
    }

    /// Page through FilterLogEvents until the size cap, the window end, or
    /// no forward progress.
    async fn page_filter_events(
        &mut self,
        pattern: Option<String>,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LogEntry>, BackendError> {
        let context_id = context_id_of(&self.search);
        let extractor = FieldExtractor::new(&self.search.field_extraction);
        let size = self.search.size;

        let mut entries = Vec::new();
        let mut token = self.search.page_token.clone();

        loop {
            if self.cancel.is_cancelled() {
                return Err(BackendError::Canceled);
            }

            let mut request = self
                .client
                .filter_log_events()
                .log_group_name(&self.log_group)
                .start_time(start_ms)
                .end_time(end_ms);
            if let Some(pattern) = &pattern {
                request = request.filter_pattern(pattern);
            }
            if let Some(size) = size {
                request = request.limit(size.min(10_000) as i32);
            }
            if let Some(token) = &token {
                request = request.next_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| BackendError::Internal(e.to_string()))?;

            for event in output.events() {
                let Some(message) = event.message() else {
                    continue;
                };
                let mut entry = LogEntry::from_message(message.trim_end());
                entry.timestamp = event
                    .timestamp()
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms));
                if let Some(stream) = event.log_stream_name() {
                    entry.fields.insert("logStream", serde_json::Value::from(stream));
                }
                if let Some(entry) = finish_entry(entry, &context_id, &extractor, None) {
                    entries.push(entry);
                }
            }

            let next = output.next_token().map(str::to_string);
            let done = size.is_some_and(|s| entries.len() >= s)
                || next.is_none()
                || next == token;
            token = next;
            if done {
                break;
            }
        }

        if let Some(s) = size {
            entries.truncate(s);
        }
        self.pagination = token.map(|t| PaginationInfo {
            has_more: true,
            next_page_token: t,
        });

        Ok(entries)
    }
}

/// AWS CloudWatch Logs adapter. Prefers Logs Insights (StartQuery and a
/// GetQueryResults poll loop); `useInsights: false` switches to the
/// FilterLogEvents path with its equality-only filter pattern.
pub struct CloudWatchClient {
    client: Client,
    options: OptionMap,
}

impl CloudWatchClient {
    pub async fn new(options: &OptionMap) -> Result<Self, BackendError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = options.get_str("region") {
            loader = loader.region(Region::new(region));
        }
        if let Some(profile) = options.get_str("profile") {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        Ok(CloudWatchClient {
            client: Client::new(&config),
            options: options.clone(),
        })
    }

    fn opt_str(&self, search: &LogSearch, key: &str) -> Option<String> {
        search
            .options
            .get_str(key)
            .or_else(|| self.options.get_str(key))
    }
}

#[async_trait]
impl LogClient for CloudWatchClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        let log_group = self.opt_str(search, "logGroupName").ok_or_else(|| {
            SearchError::InvalidSearch("cloudwatch client needs a 'logGroupName' option".into())
        })?;
        let use_insights = search
            .options
            .get_bool("useInsights")
            .or_else(|| self.options.get_bool("useInsights"))
            .unwrap_or(true);

        let (start_ms, end_ms) = time_window(search);
        let poll = PollSettings::from_options(&self.options, search);
        let cancel = CancellationToken::new();

        let handle = if use_insights {
            let query = build_insights_query(search);
            debug!(query = %query, log_group = %log_group, "starting insights query");

            let client = self.client.clone();
            let group = log_group.clone();
            let query_string = query.clone();
            let output = (move || {
                let client = client.clone();
                let group = group.clone();
                let query_string = query_string.clone();
                async move {
                    client
                        .start_query()
                        .log_group_name(group)
                        .query_string(query_string)
                        .start_time(start_ms / 1000)
                        .end_time(end_ms / 1000)
                        .send()
                        .await
                }
            })
            .retry(ExponentialBuilder::default())
            .when(is_throttling)
            .await
            .map_err(|e| {
                if is_throttling(&e) {
                    BackendError::Timeout(e.to_string())
                } else {
                    BackendError::Internal(e.to_string())
                }
            })?;

            let query_id = output
                .query_id()
                .map(str::to_string)
                .ok_or_else(|| BackendError::Internal("start_query returned no query id".into()))?;
            QueryHandle::Insights { query_id }
        } else {
            warn!("useInsights disabled; falling back to FilterLogEvents (equality filters only)");
            QueryHandle::FilterEvents {
                pattern: build_filter_pattern(search),
                start_ms,
                end_ms,
            }
        };

        Ok(Box::new(CloudWatchResult {
            client: self.client.clone(),
            log_group,
            search: search.clone(),
            handle,
            poll,
            pagination: None,
            cancel,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insights_query_shape() {
        let mut search = LogSearch {
            size: Some(50),
            ..Default::default()
        };
        search.fields.insert("level".into(), "ERROR".into());
        search.range.last = Some("30m".into());
        search.options.insert("logGroupName", serde_json::json!("/app"));

        let query = build_insights_query(&search);
        assert_eq!(
            query,
            "fields @timestamp, @message | filter level = 'ERROR' | sort @timestamp desc | limit 50"
        );

        let (start_ms, end_ms) = time_window(&search);
        let span = end_ms - start_ms;
        assert!((span - 30 * 60 * 1000).abs() < 2000, "span was {span}");
    }

    #[test]
    fn unsafe_field_skipped_and_value_escaped() {
        let mut search = LogSearch::default();
        search.fields.insert("ba d name".into(), "x".into());
        search.fields.insert("level".into(), "ER'ROR".into());

        let query = build_insights_query(&search);
        assert_eq!(
            query,
            r"fields @timestamp, @message | filter level = 'ER\'ROR' | sort @timestamp desc"
        );
    }

    #[test]
    fn inverted_absolute_range_swapped() {
        let mut search = LogSearch::default();
        search.range.gte = Some("2024-05-02T00:00:00Z".into());
        search.range.lte = Some("2024-05-01T00:00:00Z".into());

        let (start_ms, end_ms) = time_window(&search);
        assert!(start_ms < end_ms);
        assert_eq!(end_ms - start_ms, 24 * 3600 * 1000);
    }

    #[test]
    fn insights_layout_accepted() {
        let mut search = LogSearch::default();
        search.range.gte = Some("2024-05-01 00:00:00.000".into());
        search.range.lte = Some("2024-05-01 06:00:00.000".into());

        let (start_ms, end_ms) = time_window(&search);
        assert_eq!(end_ms - start_ms, 6 * 3600 * 1000);
    }

    #[test]
    fn default_window_is_fifteen_minutes() {
        let search = LogSearch::default();
        let (start_ms, end_ms) = time_window(&search);
        let span = end_ms - start_ms;
        assert!((span - 15 * 60 * 1000).abs() < 2000, "span was {span}");
    }

    #[test]
    fn filter_pattern_equality_only() {
        let mut search = LogSearch::default();
        search.fields.insert("level".into(), "ERROR".into());
        search.fields.insert("service".into(), "auth".into());
        search.filter = Some(crate::model::FilterNode::leaf(
            "message",
            crate::model::FilterOp::Match,
            "timeout",
        ));

        let pattern = build_filter_pattern(&search).unwrap();
        assert_eq!(pattern, r#"{ $.level = "ERROR" && $.service = "auth" }"#);
    }

    #[test]
    fn filter_pattern_none_when_no_equality() {
        let search = LogSearch::default();
        assert!(build_filter_pattern(&search).is_none());
    }
}
