use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::value::OptionMap;

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            "fatal" | "critical" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static LOG_LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(trace|debug|info|warn(?:ing)?|error|err|fatal|critical)\b"#).unwrap()
});

/// Best-effort log level detection from a line of text.
pub fn detect_log_level(text: &str) -> Option<LogLevel> {
    LOG_LEVEL_RE
        .find(text)
        .and_then(|m| LogLevel::parse(m.as_str()))
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// One normalized log record. Created by an adapter from a backend row or
/// line, optionally enriched with fields extracted from the message, never
/// mutated after delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    pub message: String,
    #[serde(default)]
    pub context_id: String,
    #[serde(default, skip_serializing_if = "OptionMap::is_empty")]
    pub fields: OptionMap,
}

impl LogEntry {
    /// A new entry from raw message text, with the level detected from it.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        LogEntry {
            level: detect_log_level(&message),
            message,
            ..Default::default()
        }
    }

    /// The entry's value for a named field, including the synthetic `level`
    /// and `message` fields.
    pub fn field_value(&self, field: &str) -> Option<String> {
        match field {
            "message" => Some(self.message.clone()),
            "level" => self.level.map(|l| l.as_str().to_string()),
            "timestamp" => self.timestamp.map(|t| t.to_rfc3339()),
            _ => self.fields.get_str(field),
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination + field values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub has_more: bool,
    pub next_page_token: String,
}

/// Distinct values observed per field, both levels sorted for deterministic
/// output.
pub type FieldValues = BTreeMap<String, BTreeSet<String>>;
