use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::model::{FieldExtraction, LogEntry, LogLevel};

/// Field extraction compiled once per search and applied to every entry an
/// adapter emits: JSON messages are parsed and their keys hoisted into
/// `fields`, and the group/kv regexes pull structure out of plain text.
pub struct FieldExtractor {
    json: bool,
    json_level_key: Option<String>,
    json_message_key: Option<String>,
    json_timestamp_key: Option<String>,
    group_regex: Option<Regex>,
    kv_regex: Option<Regex>,
}

impl FieldExtractor {
    pub fn new(extraction: &FieldExtraction) -> Self {
        let compile = |name: &str, pattern: &Option<String>| -> Option<Regex> {
            pattern.as_deref().and_then(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!(pattern = p, error = %e, "ignoring invalid {name} pattern");
                    None
                }
            })
        };

        FieldExtractor {
            json: extraction.json.unwrap_or(false),
            json_level_key: extraction.json_level_key.clone(),
            json_message_key: extraction.json_message_key.clone(),
            json_timestamp_key: extraction.json_timestamp_key.clone(),
            group_regex: compile("groupRegex", &extraction.group_regex),
            kv_regex: compile("kvRegex", &extraction.kv_regex),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.json && self.group_regex.is_none() && self.kv_regex.is_none()
    }

    /// Enrich one entry in place. The original message is preserved unless
    /// a JSON message key re-points it.
    pub fn apply(&self, entry: &mut LogEntry) {
        if self.json {
            self.apply_json(entry);
        }
        if let Some(re) = &self.group_regex {
            if let Some(caps) = re.captures(&entry.message) {
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        entry.fields.insert(name, Value::from(m.as_str()));
                    }
                }
            }
        }
        if let Some(re) = &self.kv_regex {
            let message = entry.message.clone();
            for caps in re.captures_iter(&message) {
                if let (Some(k), Some(v)) = (caps.get(1), caps.get(2)) {
                    entry.fields.insert(k.as_str(), Value::from(v.as_str()));
                }
            }
        }
    }

    fn apply_json(&self, entry: &mut LogEntry) {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(entry.message.trim()) else {
            return;
        };

        for (key, value) in &obj {
            entry.fields.insert(key.clone(), value.clone());
        }

        if let Some(key) = &self.json_level_key {
            if let Some(level) = obj.get(key).and_then(Value::as_str).and_then(LogLevel::parse)
            {
                entry.level = Some(level);
            }
        }
        if let Some(key) = &self.json_timestamp_key {
            if let Some(ts) = obj.get(key).and_then(parse_timestamp) {
                entry.timestamp = Some(ts);
            }
        }
        if let Some(key) = &self.json_message_key {
            if let Some(msg) = obj.get(key).and_then(Value::as_str) {
                entry.message = msg.to_string();
            }
        }
    }
}

/// Timestamps arrive as RFC3339 strings or epoch millis/seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n > 1_000_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_extraction_hoists_fields() {
        let spec = FieldExtraction {
            json: Some(true),
            json_level_key: Some("severity".into()),
            json_message_key: Some("msg".into()),
            json_timestamp_key: Some("ts".into()),
            ..Default::default()
        };
        let extractor = FieldExtractor::new(&spec);

        let mut entry = LogEntry::from_message(
            r#"{"severity": "error", "msg": "boom", "ts": "2024-05-01T12:00:00Z", "svc": "auth"}"#,
        );
        extractor.apply(&mut entry);

        assert_eq!(entry.level, Some(LogLevel::Error));
        assert_eq!(entry.message, "boom");
        assert_eq!(entry.fields.get_str("svc").as_deref(), Some("auth"));
        assert_eq!(
            entry.timestamp.unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }

    #[test]
    fn non_json_message_untouched() {
        let spec = FieldExtraction {
            json: Some(true),
            ..Default::default()
        };
        let extractor = FieldExtractor::new(&spec);

        let mut entry = LogEntry::from_message("plain ERROR line");
        extractor.apply(&mut entry);
        assert_eq!(entry.message, "plain ERROR line");
        assert!(entry.fields.is_empty());
    }

    #[test]
    fn group_regex_named_captures() {
        let spec = FieldExtraction {
            group_regex: Some(r"(?P<method>[A-Z]+) (?P<path>/\S*)".into()),
            ..Default::default()
        };
        let extractor = FieldExtractor::new(&spec);

        let mut entry = LogEntry::from_message("GET /api/users 200");
        extractor.apply(&mut entry);
        assert_eq!(entry.fields.get_str("method").as_deref(), Some("GET"));
        assert_eq!(entry.fields.get_str("path").as_deref(), Some("/api/users"));
    }

    #[test]
    fn kv_regex_pairs() {
        let spec = FieldExtraction {
            kv_regex: Some(r"(\w+)=(\S+)".into()),
            ..Default::default()
        };
        let extractor = FieldExtractor::new(&spec);

        let mut entry = LogEntry::from_message("request done status=200 latency=12ms");
        extractor.apply(&mut entry);
        assert_eq!(entry.fields.get_str("status").as_deref(), Some("200"));
        assert_eq!(entry.fields.get_str("latency").as_deref(), Some("12ms"));
    }

    #[test]
    fn invalid_pattern_is_ignored() {
        let spec = FieldExtraction {
            group_regex: Some("(unclosed".into()),
            ..Default::default()
        };
        let extractor = FieldExtractor::new(&spec);
        assert!(extractor.is_noop());
    }

    #[test]
    fn epoch_timestamps() {
        assert_eq!(
            parse_timestamp(&serde_json::json!(1714564800)).unwrap().timestamp(),
            1714564800
        );
        assert_eq!(
            parse_timestamp(&serde_json::json!(1714564800123i64))
                .unwrap()
                .timestamp_millis(),
            1714564800123
        );
    }
}
