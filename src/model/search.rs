use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::filter::FilterNode;
use super::value::OptionMap;

// ---------------------------------------------------------------------------
// Sub-structures
// ---------------------------------------------------------------------------

/// Query time window. `last` is a relative duration ("15m"); `gte`/`lte` are
/// absolute bounds. Both forms may be set; `last` wins when an adapter must
/// pick one. When neither is set the adapter applies its own default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

impl TimeRange {
    pub fn is_empty(&self) -> bool {
        self.gte.is_none() && self.lte.is_none() && self.last.is_none()
    }

    /// Parse `last` as a duration ("30m", "2h 15m").
    pub fn last_duration(&self) -> Option<Duration> {
        self.last
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    fn merge(&mut self, other: &TimeRange) {
        merge_opt(&mut self.gte, &other.gte);
        merge_opt(&mut self.lte, &other.lte);
        merge_opt(&mut self.last, &other.last);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow: Option<bool>,
}

impl RefreshOptions {
    pub fn duration_parsed(&self) -> Option<Duration> {
        self.duration
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    fn merge(&mut self, other: &RefreshOptions) {
        merge_opt(&mut self.duration, &other.duration);
        merge_opt(&mut self.follow, &other.follow);
    }
}

/// How to pull structured fields out of raw message text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldExtraction {
    /// Regex whose named capture groups become fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_regex: Option<String>,
    /// Regex matching `key=value` pairs to hoist into fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_regex: Option<String>,
    /// Parse the message as JSON and hoist its keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_level_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_message_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_timestamp_key: Option<String>,
}

impl FieldExtraction {
    pub fn is_empty(&self) -> bool {
        self == &FieldExtraction::default()
    }

    fn merge(&mut self, other: &FieldExtraction) {
        merge_opt(&mut self.group_regex, &other.group_regex);
        merge_opt(&mut self.kv_regex, &other.kv_regex);
        merge_opt(&mut self.json, &other.json);
        merge_opt(&mut self.json_level_key, &other.json_level_key);
        merge_opt(&mut self.json_message_key, &other.json_message_key);
        merge_opt(&mut self.json_timestamp_key, &other.json_timestamp_key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrinterOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<bool>,
}

impl PrinterOptions {
    fn merge(&mut self, other: &PrinterOptions) {
        merge_opt(&mut self.template, &other.template);
        merge_opt(&mut self.color, &other.color);
    }
}

/// Declared variable schema for a search template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableDefinition {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// LogSearch
// ---------------------------------------------------------------------------

/// The composable query intent. Templates merge into each other during
/// context resolution; every string value may carry `${var}` references
/// until substitution runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSearch {
    /// Legacy equality predicates: field name to expected value.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// Operator per field name for `fields` (default `equals`).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields_condition: BTreeMap<String, String>,
    /// Richer predicate AST; preferred over `fields` for new configs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterNode>,
    #[serde(skip_serializing_if = "TimeRange::is_empty")]
    pub range: TimeRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    #[serde(skip_serializing_if = "OptionMap::is_empty")]
    pub options: OptionMap,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub follow: bool,
    #[serde(skip_serializing_if = "refresh_is_empty")]
    pub refresh: RefreshOptions,
    #[serde(skip_serializing_if = "FieldExtraction::is_empty")]
    pub field_extraction: FieldExtraction,
    /// Raw backend-dialect query, used as the base expression and ANDed
    /// with compiled predicates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_query: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableDefinition>,
    #[serde(skip_serializing_if = "printer_is_empty")]
    pub printer_options: PrinterOptions,
}

fn refresh_is_empty(r: &RefreshOptions) -> bool {
    *r == RefreshOptions::default()
}

fn printer_is_empty(p: &PrinterOptions) -> bool {
    *p == PrinterOptions::default()
}

impl LogSearch {
    /// Merge `other` on top of `self`.
    ///
    /// Maps merge key-wise with `other` winning on collisions; scalars take
    /// `other`'s value when set; `filter` combines by AND when both sides
    /// are present; `follow` is sticky once enabled.
    pub fn merge(&mut self, other: &LogSearch) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.fields_condition {
            self.fields_condition.insert(k.clone(), v.clone());
        }
        self.filter = FilterNode::merge_and(self.filter.take(), other.filter.clone());
        self.range.merge(&other.range);
        merge_opt(&mut self.size, &other.size);
        merge_opt(&mut self.page_token, &other.page_token);
        self.options.merge(&other.options);
        self.follow = self.follow || other.follow;
        self.refresh.merge(&other.refresh);
        self.field_extraction.merge(&other.field_extraction);
        merge_opt(&mut self.native_query, &other.native_query);
        for (k, v) in &other.variables {
            self.variables.insert(k.clone(), v.clone());
        }
        self.printer_options.merge(&other.printer_options);
    }

    /// Effective follow intent: the flat flag or `refresh.follow`.
    pub fn wants_follow(&self) -> bool {
        self.follow || self.refresh.follow.unwrap_or(false)
    }

    /// One predicate tree over both query forms: the legacy `fields` map
    /// (operators from `fields_condition`, default equality) ANDed with the
    /// `filter` AST. Adapters compile or post-filter against this.
    pub fn combined_filter(&self) -> Option<FilterNode> {
        use super::filter::FilterOp;

        let leaves: Vec<FilterNode> = self
            .fields
            .iter()
            .map(|(field, value)| {
                let op = self
                    .fields_condition
                    .get(field)
                    .map(|c| FilterOp::from_condition(c))
                    .unwrap_or_default();
                FilterNode::leaf(field.clone(), op, value.clone())
            })
            .collect();

        let fields_node = match leaves.len() {
            0 => None,
            1 => leaves.into_iter().next(),
            _ => Some(FilterNode::and(leaves)),
        };

        FilterNode::merge_and(fields_node, self.filter.clone())
    }

    /// The unconditionally-true equality predicates of this search: the
    /// equality entries of `fields` plus top-level AND-composed equality
    /// leaves of the filter. Dialects that can only express conjunctive
    /// equality (CloudWatch filter patterns, `hl -f`) compile from these.
    pub fn equality_pairs(&self) -> Vec<(String, String)> {
        use super::filter::{FilterLogic, FilterOp};

        let mut pairs: Vec<(String, String)> = self
            .fields
            .iter()
            .filter(|(name, _)| {
                self.fields_condition
                    .get(*name)
                    .map(|c| c == "equals")
                    .unwrap_or(true)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        fn walk(node: &FilterNode, pairs: &mut Vec<(String, String)>) {
            match node {
                FilterNode::Leaf {
                    field,
                    op: FilterOp::Equals,
                    value,
                    negate: false,
                } => pairs.push((field.clone(), value.clone())),
                FilterNode::Branch {
                    logic: FilterLogic::And,
                    filters,
                } => {
                    for child in filters {
                        walk(child, pairs);
                    }
                }
                _ => {}
            }
        }
        if let Some(filter) = &self.filter {
            walk(filter, &mut pairs);
        }

        pairs
    }
}

fn merge_opt<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(v) = src {
        *dst = Some(v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filter::FilterNode;
    use serde_json::json;

    #[test]
    fn merge_set_wins_unset_preserves() {
        let mut base = LogSearch {
            size: Some(100),
            native_query: Some("index=main".into()),
            ..Default::default()
        };
        let over = LogSearch {
            size: Some(10),
            ..Default::default()
        };
        base.merge(&over);
        assert_eq!(base.size, Some(10));
        assert_eq!(base.native_query.as_deref(), Some("index=main"));
    }

    #[test]
    fn merge_maps_key_wise() {
        let mut base = LogSearch::default();
        base.fields.insert("region".into(), "us".into());
        base.fields.insert("service".into(), "auth".into());
        base.options.insert("index", json!("logs-*"));

        let mut over = LogSearch::default();
        over.fields.insert("region".into(), "eu".into());
        over.options.insert("cluster", json!("c2"));

        base.merge(&over);
        assert_eq!(base.fields["region"], "eu");
        assert_eq!(base.fields["service"], "auth");
        assert_eq!(base.options.get_str("index").as_deref(), Some("logs-*"));
        assert_eq!(base.options.get_str("cluster").as_deref(), Some("c2"));
    }

    #[test]
    fn merge_filters_combine_with_and() {
        let mut base = LogSearch {
            filter: Some(FilterNode::equals("level", "ERROR")),
            ..Default::default()
        };
        let over = LogSearch {
            filter: Some(FilterNode::equals("service", "auth")),
            ..Default::default()
        };
        base.merge(&over);
        match base.filter.unwrap() {
            FilterNode::Branch { filters, .. } => assert_eq!(filters.len(), 2),
            other => panic!("expected AND branch, got {other:?}"),
        }
    }

    #[test]
    fn merge_one_sided_filter_passes_through() {
        let mut base = LogSearch::default();
        let over = LogSearch {
            filter: Some(FilterNode::equals("a", "1")),
            ..Default::default()
        };
        base.merge(&over);
        assert_eq!(base.filter, Some(FilterNode::equals("a", "1")));
    }

    #[test]
    fn range_last_parses_humantime() {
        let range = TimeRange {
            last: Some("30m".into()),
            ..Default::default()
        };
        assert_eq!(range.last_duration(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
fields:
  level: ERROR
range:
  last: 15m
size: 50
options:
  index: "logs-*"
variables:
  region:
    description: target region
    default: us-west-1
"#;
        let search: LogSearch = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(search.fields["level"], "ERROR");
        assert_eq!(search.range.last.as_deref(), Some("15m"));
        assert_eq!(search.variables["region"].default.as_deref(), Some("us-west-1"));

        let emitted = serde_yaml::to_string(&search).unwrap();
        let reparsed: LogSearch = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(reparsed, search);
    }
}
