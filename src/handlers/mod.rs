pub mod suggest;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    fields, LogSearchResult, MultiSearchResult, CONTEXT_ID_OPTION,
};
use crate::config::model::SearchContext;
use crate::config::resolve::{resolve_context, resolve_context_lenient};
use crate::config::vars::process_env;
use crate::engine::{Engine, EngineSnapshot};
use crate::error::{BackendError, ConfigError, SearchError};
use crate::model::{parse_filter, FieldValues, LogEntry, LogSearch};

/// Applied when a query names neither a relative nor an absolute range.
pub const DEFAULT_LAST: &str = "15m";

/// Per-request deadline imposed on backend calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SUGGESTION_COUNT: usize = 3;

// ---------------------------------------------------------------------------
// Argument & response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryArgs {
    pub last: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub size: Option<usize>,
    pub page_token: Option<String>,
    pub fields: BTreeMap<String, String>,
    /// Surface filter expression (`level = "ERROR" AND service ~ auth`).
    pub filter: Option<String>,
    pub native_query: Option<String>,
    pub variables: BTreeMap<String, String>,
    /// Extra search templates merged after the context's own inheritance.
    pub inherits: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub result_count: usize,
    pub context_id: String,
    pub query_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub entries: Vec<LogEntry>,
    pub meta: QueryMeta,
}

/// Structured error payload with a stable code, JSON-encodable for any
/// transport.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_contexts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    fn new(code: &'static str, error: impl Into<String>) -> Self {
        ErrorEnvelope {
            code,
            error: error.into(),
            invalid_context: None,
            available_contexts: None,
            suggestions: None,
            hint: None,
        }
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.error)
    }
}

impl std::error::Error for ErrorEnvelope {}

/// Map a backend-layer error to its envelope. Context-not-found grows the
/// available list and nearest-neighbor suggestions.
fn envelope(err: BackendError, snapshot: &EngineSnapshot) -> ErrorEnvelope {
    match err {
        BackendError::Config(ConfigError::ContextNotFound { id }) => {
            let available = snapshot.config.context_ids();
            let suggestions = suggest::suggest(&id, &available, SUGGESTION_COUNT);
            let hint = if suggestions.is_empty() {
                format!("context '{id}' not found")
            } else {
                format!(
                    "context '{id}' not found; did you mean {}?",
                    suggestions.join(", ")
                )
            };
            ErrorEnvelope {
                invalid_context: Some(id.clone()),
                available_contexts: Some(available),
                suggestions: Some(suggestions),
                hint: Some(hint),
                ..ErrorEnvelope::new(
                    "CONTEXT_NOT_FOUND",
                    ConfigError::ContextNotFound { id }.to_string(),
                )
            }
        }
        BackendError::Config(e @ ConfigError::MissingRequiredVariable { .. }) => {
            ErrorEnvelope::new("MISSING_REQUIRED_VARIABLE", e.to_string())
        }
        BackendError::Config(e) => ErrorEnvelope::new("CONFIG_ERROR", e.to_string()),
        BackendError::Search(e @ SearchError::InvalidSearch(_)) => {
            ErrorEnvelope::new("INVALID_SEARCH", e.to_string())
        }
        BackendError::Search(e @ SearchError::InvalidPageToken(_)) => {
            ErrorEnvelope::new("VALIDATION_ERROR", e.to_string())
        }
        e => ErrorEnvelope::new("BACKEND_ERROR", e.to_string()),
    }
}

fn timeout_envelope() -> ErrorEnvelope {
    ErrorEnvelope::new("BACKEND_ERROR", "backend request deadline exceeded")
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

impl QueryArgs {
    /// The override search merged on top of the resolved context.
    fn to_override(&self) -> Result<LogSearch, SearchError> {
        let mut over = LogSearch {
            size: self.size,
            page_token: self.page_token.clone(),
            native_query: self.native_query.clone(),
            fields: self.fields.clone(),
            ..Default::default()
        };
        over.range.last = self.last.clone();
        over.range.gte = self.start_time.clone();
        over.range.lte = self.end_time.clone();
        if let Some(expr) = &self.filter {
            over.filter = Some(parse_filter(expr)?);
        }
        Ok(over)
    }
}

impl Engine {
    /// Sorted context ids from the current snapshot.
    pub async fn list_contexts(&self) -> Vec<String> {
        self.snapshot().await.config.context_ids()
    }

    /// The resolved context, variable schema included. Missing required
    /// variables do not fail inspection.
    pub async fn get_context_details(
        &self,
        context_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<SearchContext, ErrorEnvelope> {
        let snapshot = self.snapshot().await;
        resolve_context_lenient(&snapshot.config, context_id, variables, &process_env)
            .map_err(|e| envelope(e.into(), &snapshot))
    }

    /// Resolve a context and open the search against its backend.
    async fn open_search(
        &self,
        snapshot: &EngineSnapshot,
        context_id: &str,
        args: &QueryArgs,
    ) -> Result<(Box<dyn LogSearchResult>, LogSearch), BackendError> {
        let over = args.to_override()?;
        let resolved = resolve_context(
            &snapshot.config,
            context_id,
            &args.inherits,
            Some(&over),
            &args.variables,
            &process_env,
        )?;

        let mut search = resolved.search;
        // handlers are one-shot; follow is a CLI/TUI concern
        search.follow = false;
        search.refresh.follow = Some(false);
        if search.range.is_empty() {
            search.range.last = Some(DEFAULT_LAST.to_string());
        }
        search
            .options
            .insert(CONTEXT_ID_OPTION, serde_json::Value::from(context_id));

        debug!(context = context_id, client = %resolved.client, "dispatching query");
        let client = snapshot.factory.get(&resolved.client).await?;
        let result = tokio::time::timeout(REQUEST_TIMEOUT, client.get(&search))
            .await
            .map_err(|_| BackendError::Timeout("backend request deadline exceeded".into()))??;
        Ok((result, search))
    }

    /// One-shot query: initial batch plus pagination metadata.
    pub async fn query_logs(
        &self,
        context_id: &str,
        args: &QueryArgs,
    ) -> Result<QueryResponse, ErrorEnvelope> {
        let snapshot = self.snapshot().await;
        let (mut result, search) = self
            .open_search(&snapshot, context_id, args)
            .await
            .map_err(|e| envelope(e, &snapshot))?;

        let batch = match tokio::time::timeout(REQUEST_TIMEOUT, result.entries()).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                result.close().await;
                return Err(envelope(e, &snapshot));
            }
            Err(_) => {
                result.close().await;
                return Err(timeout_envelope());
            }
        };

        let mut entries = batch.entries;
        drop(batch.live);
        if let Some(size) = search.size {
            entries.truncate(size);
        }

        let next_page_token = result
            .pagination()
            .filter(|p| p.has_more)
            .map(|p| p.next_page_token);
        result.close().await;

        let hints = entries.is_empty().then(|| {
            vec!["no entries matched; consider widening the time range".to_string()]
        });

        Ok(QueryResponse {
            meta: QueryMeta {
                result_count: entries.len(),
                context_id: context_id.to_string(),
                query_time: Utc::now().to_rfc3339(),
                next_page_token,
                hints,
            },
            entries,
        })
    }

    /// Fan out one query over several contexts and merge the results.
    /// Partial success is allowed; per-child failures become hints.
    pub async fn query_contexts(
        &self,
        context_ids: &[String],
        args: &QueryArgs,
    ) -> Result<QueryResponse, ErrorEnvelope> {
        let snapshot = self.snapshot().await;

        let opened = futures_util::future::join_all(
            context_ids
                .iter()
                .map(|id| self.open_search(&snapshot, id, args)),
        )
        .await;

        let mut children = Vec::new();
        let mut hints = Vec::new();
        for (id, outcome) in context_ids.iter().zip(opened) {
            match outcome {
                Ok((result, _)) => children.push(result),
                Err(e) => hints.push(format!("{id}: {}", envelope(e, &snapshot))),
            }
        }
        if children.is_empty() {
            return Err(ErrorEnvelope {
                hint: (!hints.is_empty()).then(|| hints.join("; ")),
                ..ErrorEnvelope::new("BACKEND_ERROR", "every context failed")
            });
        }

        let mut multi = MultiSearchResult::new(LogSearch::default(), children);
        let batch = match tokio::time::timeout(REQUEST_TIMEOUT, multi.entries()).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                multi.close().await;
                return Err(envelope(e, &snapshot));
            }
            Err(_) => {
                multi.close().await;
                return Err(timeout_envelope());
            }
        };
        hints.extend(multi.errors().iter().map(|e| e.to_string()));
        multi.close().await;

        let entries = batch.entries;
        Ok(QueryResponse {
            meta: QueryMeta {
                result_count: entries.len(),
                context_id: context_ids.join(","),
                query_time: Utc::now().to_rfc3339(),
                next_page_token: None,
                hints: (!hints.is_empty()).then_some(hints),
            },
            entries,
        })
    }

    /// Discover fields and their distinct values from a bounded sample.
    pub async fn get_fields(
        &self,
        context_id: &str,
        args: &QueryArgs,
    ) -> Result<BTreeMap<String, Vec<String>>, ErrorEnvelope> {
        let snapshot = self.snapshot().await;
        let mut args = args.clone();
        if args.size.is_none() {
            args.size = Some(fields::FIELD_SCAN_CAP);
        }

        let (mut result, _) = self
            .open_search(&snapshot, context_id, &args)
            .await
            .map_err(|e| envelope(e, &snapshot))?;
        let batch = match tokio::time::timeout(REQUEST_TIMEOUT, result.entries()).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                result.close().await;
                return Err(envelope(e, &snapshot));
            }
            Err(_) => {
                result.close().await;
                return Err(timeout_envelope());
            }
        };
        result.close().await;

        // every observed field participates, plus the synthetic level
        let mut names: Vec<String> = batch
            .entries
            .iter()
            .flat_map(|e| e.fields.0.keys().cloned())
            .collect();
        names.push("level".to_string());
        names.sort();
        names.dedup();

        let mut values = FieldValues::new();
        fields::accumulate(&mut values, &batch.entries, &names);
        Ok(fields::into_sorted(values, &names))
    }

    /// Distinct values for the requested fields.
    pub async fn get_field_values(
        &self,
        context_id: &str,
        field_names: &[String],
        args: &QueryArgs,
    ) -> Result<BTreeMap<String, Vec<String>>, ErrorEnvelope> {
        let snapshot = self.snapshot().await;
        let over = args.to_override().map_err(|e| envelope(e.into(), &snapshot))?;
        let resolved = resolve_context(
            &snapshot.config,
            context_id,
            &args.inherits,
            Some(&over),
            &args.variables,
            &process_env,
        )
        .map_err(|e| envelope(e.into(), &snapshot))?;

        let mut search = resolved.search;
        if search.range.is_empty() {
            search.range.last = Some(DEFAULT_LAST.to_string());
        }
        search
            .options
            .insert(CONTEXT_ID_OPTION, serde_json::Value::from(context_id));

        let client = snapshot
            .factory
            .get(&resolved.client)
            .await
            .map_err(|e| envelope(e, &snapshot))?;
        tokio::time::timeout(REQUEST_TIMEOUT, client.field_values(&search, field_names))
            .await
            .map_err(|_| timeout_envelope())?
            .map_err(|e| envelope(e, &snapshot))
    }

    /// Trigger the hot-reload path on demand.
    pub async fn reload_config(&self) -> Result<(), ErrorEnvelope> {
        let snapshot = self.snapshot().await;
        self.reload()
            .await
            .map_err(|e| envelope(e.into(), &snapshot))
    }
}

/// Render an entry through a `printerOptions.template`: `{{ field }}`
/// references resolve against the entry's fields plus the synthetic
/// `timestamp`, `level`, and `message`.
pub fn render_entry(entry: &LogEntry, template: &str) -> String {
    let mut vars: std::collections::HashMap<String, String> = entry
        .fields
        .0
        .keys()
        .filter_map(|k| entry.field_value(k).map(|v| (k.clone(), v)))
        .collect();
    for key in ["timestamp", "level", "message"] {
        if let Some(value) = entry.field_value(key) {
            vars.insert(key.to_string(), value);
        }
    }
    crate::backend::command::expand_template(template, &vars)
}
