use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{LogSearch, OptionMap};

/// One backend client definition: the adapter type plus its options
/// (endpoint URL, credentials passthrough, namespace, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(skip_serializing_if = "OptionMap::is_empty")]
    pub options: OptionMap,
}

/// A named binding of client + search template + inheritance list: the
/// user-facing unit of "where and what to query".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchContext {
    pub client: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_inherit: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "search_is_empty")]
    pub search: LogSearch,
}

fn search_is_empty(s: &LogSearch) -> bool {
    *s == LogSearch::default()
}

/// Top-level config shape, merged across every discovered file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub clients: BTreeMap<String, ClientConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub searches: BTreeMap<String, LogSearch>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, SearchContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

impl ContextConfig {
    /// Key-wise merge: entries from `other` override same-keyed entries;
    /// a non-empty `current_context` from `other` wins.
    pub fn merge(&mut self, other: ContextConfig) {
        self.clients.extend(other.clients);
        self.searches.extend(other.searches);
        self.contexts.extend(other.contexts);
        if other
            .current_context
            .as_deref()
            .is_some_and(|c| !c.is_empty())
        {
            self.current_context = other.current_context;
        }
    }

    /// Sorted context ids (BTreeMap keys are already ordered).
    pub fn context_ids(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_same_keys() {
        let mut a: ContextConfig = serde_yaml::from_str(
            r#"
clients:
  c1: {type: local}
contexts:
  ctx1: {client: c1}
currentContext: ctx1
"#,
        )
        .unwrap();
        let b: ContextConfig = serde_yaml::from_str(
            r#"
clients:
  c1: {type: docker}
contexts:
  ctx2: {client: c1}
"#,
        )
        .unwrap();

        a.merge(b);
        assert_eq!(a.clients["c1"].client_type, "docker");
        assert_eq!(a.context_ids(), vec!["ctx1", "ctx2"]);
        // empty currentContext from the later file does not clobber
        assert_eq!(a.current_context.as_deref(), Some("ctx1"));
    }
}
