use serde_json::{json, Value};

use crate::error::SearchError;
use crate::model::{FilterLogic, FilterNode, FilterOp, LogSearch};

/// Compile one AST node into an Elasticsearch/OpenSearch query clause.
pub fn filter_to_dsl(node: &FilterNode) -> Value {
    match node {
        FilterNode::Leaf {
            field,
            op,
            value,
            negate,
        } => {
            let field = field.as_str();
            let clause = match op {
                FilterOp::Equals => json!({"term": {field: {"value": value}}}),
                FilterOp::Match => json!({"match": {field: value}}),
                FilterOp::Regex => json!({"regexp": {field: {"value": value}}}),
                FilterOp::Wildcard => json!({"wildcard": {field: {"value": value}}}),
                FilterOp::Exists => json!({"exists": {"field": field}}),
                FilterOp::Gt => json!({"range": {field: {"gt": value}}}),
                FilterOp::Gte => json!({"range": {field: {"gte": value}}}),
                FilterOp::Lt => json!({"range": {field: {"lt": value}}}),
                FilterOp::Lte => json!({"range": {field: {"lte": value}}}),
            };
            if *negate {
                json!({"bool": {"must_not": [clause]}})
            } else {
                clause
            }
        }
        FilterNode::Branch { logic, filters } => {
            let clauses: Vec<Value> = filters.iter().map(filter_to_dsl).collect();
            match logic {
                FilterLogic::And => json!({"bool": {"must": clauses}}),
                FilterLogic::Or => {
                    json!({"bool": {"should": clauses, "minimum_should_match": 1}})
                }
                FilterLogic::Not => json!({"bool": {"must_not": [{"bool": {"must": clauses}}]}}),
            }
        }
    }
}

/// The time-range clause on the timestamp field. `last` compiles to date
/// math (`now-30m`); absolute bounds pass through for the server to parse.
fn range_clause(search: &LogSearch, timestamp_field: &str) -> Option<Value> {
    let range = &search.range;
    if let Some(last) = &range.last {
        let compact: String = last.chars().filter(|c| !c.is_whitespace()).collect();
        return Some(json!({"range": {timestamp_field: {"gte": format!("now-{compact}")}}}));
    }
    if range.gte.is_none() && range.lte.is_none() {
        return None;
    }
    let mut bounds = serde_json::Map::new();
    if let Some(gte) = &range.gte {
        bounds.insert("gte".into(), json!(gte));
    }
    if let Some(lte) = &range.lte {
        bounds.insert("lte".into(), json!(lte));
    }
    Some(json!({"range": {timestamp_field: Value::Object(bounds)}}))
}

/// Build the `_search` request body: compiled predicates plus the native
/// query as a base expression, the time range as a filter, newest-first
/// sort with a tiebreak, and paging via `size`/`search_after`.
pub fn build_request_body(
    search: &LogSearch,
    timestamp_field: &str,
    size: usize,
) -> Result<Value, SearchError> {
    let mut must: Vec<Value> = Vec::new();
    if let Some(native) = &search.native_query {
        must.push(json!({"query_string": {"query": native}}));
    }
    if let Some(filter) = search.combined_filter() {
        must.push(filter_to_dsl(&filter));
    }

    let mut filter_clauses: Vec<Value> = Vec::new();
    if let Some(range) = range_clause(search, timestamp_field) {
        filter_clauses.push(range);
    }

    let query = if must.is_empty() && filter_clauses.is_empty() {
        json!({"match_all": {}})
    } else {
        json!({"bool": {"must": must, "filter": filter_clauses}})
    };

    let mut body = json!({
        "query": query,
        "sort": [
            {timestamp_field: {"order": "desc"}},
            {"_id": {"order": "desc"}}
        ],
        "size": size,
    });

    if let Some(token) = &search.page_token {
        let after = decode_page_token(token)?;
        body["search_after"] = after;
    }

    Ok(body)
}

/// Page tokens are the last hit's sort key, JSON-encoded. Opaque to
/// callers.
pub fn encode_page_token(sort: &Value) -> String {
    sort.to_string()
}

pub fn decode_page_token(token: &str) -> Result<Value, SearchError> {
    match serde_json::from_str::<Value>(token) {
        Ok(Value::Array(items)) => Ok(Value::Array(items)),
        _ => Err(SearchError::InvalidPageToken(token.to_string())),
    }
}
