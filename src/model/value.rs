use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend-specific option bag: string keys to tagged values.
///
/// Every adapter has a different configuration surface (index name, log
/// group, namespace, cmd template, ...), so options stay dynamic. Values are
/// `serde_json::Value` and reads go through presence-aware accessors instead
/// of raw map lookups. `BTreeMap` keeps merges and iteration deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionMap(pub BTreeMap<String, Value>);

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// String value for `key`. Numbers and booleans coerce to their display
    /// form so `port: 9200` still reads as a string where one is expected.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A list of strings, accepting either a JSON array or a single string.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            Value::String(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }

    /// A nested string map (e.g. the `headers` option).
    pub fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>> {
        match self.0.get(key)? {
            Value::Object(obj) => Some(
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Key-wise merge: entries from `other` override existing keys.
    pub fn merge(&mut self, other: &OptionMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<const N: usize> From<[(&str, Value); N]> for OptionMap {
    fn from(pairs: [(&str, Value); N]) -> Self {
        OptionMap(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_coercion() {
        let mut opts = OptionMap::new();
        opts.insert("url", json!("http://localhost"));
        opts.insert("port", json!(9200));
        opts.insert("secure", json!(true));

        assert_eq!(opts.get_str("url").as_deref(), Some("http://localhost"));
        assert_eq!(opts.get_str("port").as_deref(), Some("9200"));
        assert_eq!(opts.get_str("secure").as_deref(), Some("true"));
        assert_eq!(opts.get_str("missing"), None);
    }

    #[test]
    fn bool_accepts_string_form() {
        let mut opts = OptionMap::new();
        opts.insert("useInsights", json!("false"));
        assert_eq!(opts.get_bool("useInsights"), Some(false));
        opts.insert("useInsights", json!(true));
        assert_eq!(opts.get_bool("useInsights"), Some(true));
    }

    #[test]
    fn string_list_accepts_scalar() {
        let mut opts = OptionMap::new();
        opts.insert("groups", json!(["a", "b"]));
        assert_eq!(opts.get_string_list("groups").unwrap(), vec!["a", "b"]);
        opts.insert("groups", json!("single"));
        assert_eq!(opts.get_string_list("groups").unwrap(), vec!["single"]);
    }

    #[test]
    fn merge_later_wins() {
        let mut base = OptionMap::new();
        base.insert("index", json!("logs-*"));
        base.insert("keep", json!(1));

        let mut over = OptionMap::new();
        over.insert("index", json!("other-*"));

        base.merge(&over);
        assert_eq!(base.get_str("index").as_deref(), Some("other-*"));
        assert_eq!(base.get_i64("keep"), Some(1));
    }

    #[test]
    fn nested_string_map() {
        let mut opts = OptionMap::new();
        opts.insert("headers", json!({"Authorization": "Bearer x", "n": 1}));
        let headers = opts.get_string_map("headers").unwrap();
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer x"));
        // non-string values are skipped
        assert!(!headers.contains_key("n"));
    }
}
