use serde::{Deserialize, Serialize};

use crate::error::SearchError;

use super::entry::LogEntry;

/// Parser and compiler recursion guard. The UI collapses anything deeper
/// than a handful of levels anyway.
const MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[default]
    Equals,
    Match,
    Regex,
    Wildcard,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLogic {
    And,
    Or,
    Not,
}

/// A filter expression: either a leaf predicate on one field, or a boolean
/// group over child filters. A node is one or the other, never both.
///
/// Empty AND is true, empty OR is false, and NOT over several children is
/// NOT(AND(children)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Branch {
        logic: FilterLogic,
        #[serde(default)]
        filters: Vec<FilterNode>,
    },
    Leaf {
        field: String,
        #[serde(default)]
        op: FilterOp,
        #[serde(default)]
        value: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        negate: bool,
    },
}

impl FilterOp {
    /// Operator named by a `fieldsCondition` entry; anything unrecognized
    /// falls back to equality.
    pub fn from_condition(condition: &str) -> FilterOp {
        match condition {
            "match" => FilterOp::Match,
            "regex" => FilterOp::Regex,
            "wildcard" => FilterOp::Wildcard,
            "exists" => FilterOp::Exists,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            _ => FilterOp::Equals,
        }
    }
}

impl FilterNode {
    pub fn leaf(field: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        FilterNode::Leaf {
            field: field.into(),
            op,
            value: value.into(),
            negate: false,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(field, FilterOp::Equals, value)
    }

    pub fn and(filters: Vec<FilterNode>) -> Self {
        FilterNode::Branch {
            logic: FilterLogic::And,
            filters,
        }
    }

    pub fn or(filters: Vec<FilterNode>) -> Self {
        FilterNode::Branch {
            logic: FilterLogic::Or,
            filters,
        }
    }

    /// Combine two optional filters with AND; either side may be absent.
    pub fn merge_and(a: Option<FilterNode>, b: Option<FilterNode>) -> Option<FilterNode> {
        match (a, b) {
            (Some(a), Some(b)) => Some(FilterNode::and(vec![a, b])),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Walk every leaf value mutably (variable substitution hook).
    pub fn visit_values<F: FnMut(&mut String)>(&mut self, f: &mut F) {
        match self {
            FilterNode::Leaf { value, .. } => f(value),
            FilterNode::Branch { filters, .. } => {
                for child in filters {
                    child.visit_values(f);
                }
            }
        }
    }

    /// Evaluate against an entry. Used by adapters that cannot push the
    /// predicate server-side (k8s, docker, command streams) to post-filter.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.matches_depth(entry, 0)
    }

    fn matches_depth(&self, entry: &LogEntry, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        match self {
            FilterNode::Branch { logic, filters } => match logic {
                FilterLogic::And => filters.iter().all(|f| f.matches_depth(entry, depth + 1)),
                FilterLogic::Or => filters.iter().any(|f| f.matches_depth(entry, depth + 1)),
                FilterLogic::Not => !filters.iter().all(|f| f.matches_depth(entry, depth + 1)),
            },
            FilterNode::Leaf {
                field,
                op,
                value,
                negate,
            } => {
                let actual = entry.field_value(field);
                let hit = match op {
                    FilterOp::Exists => actual.is_some(),
                    FilterOp::Equals => actual.as_deref() == Some(value.as_str()),
                    FilterOp::Match => actual
                        .map(|a| a.to_lowercase().contains(&value.to_lowercase()))
                        .unwrap_or(false),
                    FilterOp::Regex => match regex::Regex::new(value) {
                        Ok(re) => actual.map(|a| re.is_match(&a)).unwrap_or(false),
                        Err(_) => false,
                    },
                    FilterOp::Wildcard => match wildcard_to_regex(value) {
                        Ok(re) => actual.map(|a| re.is_match(&a)).unwrap_or(false),
                        Err(_) => false,
                    },
                    FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                        compare(actual.as_deref(), value, *op)
                    }
                };
                hit != *negate
            }
        }
    }
}

/// Translate a `*`/`?` wildcard pattern into an anchored regex.
fn wildcard_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out)
}

/// Numeric comparison when both sides parse as numbers, lexical otherwise.
fn compare(actual: Option<&str>, value: &str, op: FilterOp) -> bool {
    let Some(actual) = actual else { return false };
    let ord = match (actual.parse::<f64>(), value.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(value)),
    };
    let Some(ord) = ord else { return false };
    match op {
        FilterOp::Gt => ord.is_gt(),
        FilterOp::Gte => ord.is_ge(),
        FilterOp::Lt => ord.is_lt(),
        FilterOp::Lte => ord.is_le(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Canonical rendering
// ---------------------------------------------------------------------------

impl FilterOp {
    fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Equals => "=",
            FilterOp::Match => "~",
            FilterOp::Regex => "=~",
            FilterOp::Wildcard => "*=",
            FilterOp::Exists => "exists",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }
}

impl std::fmt::Display for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterNode::Leaf {
                field,
                op,
                value,
                negate,
            } => {
                if *negate {
                    write!(f, "NOT ")?;
                }
                if *op == FilterOp::Exists {
                    write!(f, "{field} exists")
                } else {
                    write!(f, "{field} {} {}", op.symbol(), quote(value))
                }
            }
            FilterNode::Branch { logic, filters } => match logic {
                FilterLogic::Not => {
                    write!(f, "NOT (")?;
                    join(f, filters, " AND ")?;
                    write!(f, ")")
                }
                FilterLogic::And => {
                    write!(f, "(")?;
                    join(f, filters, " AND ")?;
                    write!(f, ")")
                }
                FilterLogic::Or => {
                    write!(f, "(")?;
                    join(f, filters, " OR ")?;
                    write!(f, ")")
                }
            },
        }
    }
}

fn join(
    f: &mut std::fmt::Formatter<'_>,
    filters: &[FilterNode],
    sep: &str,
) -> std::fmt::Result {
    for (i, node) in filters.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{node}")?;
    }
    Ok(())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

// ---------------------------------------------------------------------------
// Surface syntax parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Op(FilterOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SearchError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(esc) => s.push(esc),
                            None => {
                                return Err(SearchError::InvalidSearch(
                                    "unterminated escape in filter string".into(),
                                ))
                            }
                        },
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => {
                            return Err(SearchError::InvalidSearch(
                                "unterminated string in filter".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' | '~' | '*' | '>' | '<' | '!' => {
                let mut op = String::new();
                op.push(ch);
                chars.next();
                if let Some(&next) = chars.peek() {
                    if matches!(next, '=' | '~') {
                        op.push(next);
                        chars.next();
                    }
                }
                match op.as_str() {
                    "=" => tokens.push(Token::Op(FilterOp::Equals)),
                    "~" => tokens.push(Token::Op(FilterOp::Match)),
                    "=~" => tokens.push(Token::Op(FilterOp::Regex)),
                    "*=" => tokens.push(Token::Op(FilterOp::Wildcard)),
                    ">" => tokens.push(Token::Op(FilterOp::Gt)),
                    ">=" => tokens.push(Token::Op(FilterOp::Gte)),
                    "<" => tokens.push(Token::Op(FilterOp::Lt)),
                    "<=" => tokens.push(Token::Op(FilterOp::Lte)),
                    "!=" => {
                        tokens.push(Token::Not);
                        tokens.push(Token::Op(FilterOp::Equals));
                    }
                    "!~" => {
                        tokens.push(Token::Not);
                        tokens.push(Token::Op(FilterOp::Match));
                    }
                    other => {
                        return Err(SearchError::InvalidSearch(format!(
                            "unknown operator '{other}' in filter"
                        )))
                    }
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' || c == '@' || c == '-' || c == '/' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric()
                        || matches!(c, '_' | '.' | '@' | '-' | '/' | ':' | '*' | '?')
                    {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    "EXISTS" => tokens.push(Token::Op(FilterOp::Exists)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(SearchError::InvalidSearch(format!(
                    "unexpected character '{other}' in filter"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self, depth: usize) -> Result<FilterNode, SearchError> {
        if depth > MAX_DEPTH {
            return Err(SearchError::InvalidSearch("filter nesting too deep".into()));
        }
        let mut node = self.and_expr(depth)?;
        let mut others = Vec::new();
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            others.push(self.and_expr(depth)?);
        }
        if !others.is_empty() {
            let mut filters = vec![node];
            filters.extend(others);
            node = FilterNode::or(filters);
        }
        Ok(node)
    }

    fn and_expr(&mut self, depth: usize) -> Result<FilterNode, SearchError> {
        let mut node = self.unary(depth)?;
        let mut others = Vec::new();
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            others.push(self.unary(depth)?);
        }
        if !others.is_empty() {
            let mut filters = vec![node];
            filters.extend(others);
            node = FilterNode::and(filters);
        }
        Ok(node)
    }

    fn unary(&mut self, depth: usize) -> Result<FilterNode, SearchError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.unary(depth + 1)?;
            return Ok(match inner {
                FilterNode::Leaf {
                    field,
                    op,
                    value,
                    negate,
                } => FilterNode::Leaf {
                    field,
                    op,
                    value,
                    negate: !negate,
                },
                branch => FilterNode::Branch {
                    logic: FilterLogic::Not,
                    filters: vec![branch],
                },
            });
        }
        self.primary(depth)
    }

    fn primary(&mut self, depth: usize) -> Result<FilterNode, SearchError> {
        match self.next() {
            Some(Token::LParen) => {
                let node = self.expr(depth + 1)?;
                match self.next() {
                    Some(Token::RParen) => Ok(node),
                    _ => Err(SearchError::InvalidSearch("expected ')' in filter".into())),
                }
            }
            Some(Token::Ident(field)) => match self.next() {
                Some(Token::Op(FilterOp::Exists)) => {
                    Ok(FilterNode::leaf(field, FilterOp::Exists, ""))
                }
                Some(Token::Op(op)) => {
                    let value = match self.next() {
                        Some(Token::Ident(v)) | Some(Token::Str(v)) => v,
                        _ => {
                            return Err(SearchError::InvalidSearch(format!(
                                "expected value after '{field} {}'",
                                op.symbol()
                            )))
                        }
                    };
                    Ok(FilterNode::leaf(field, op, value))
                }
                _ => Err(SearchError::InvalidSearch(format!(
                    "expected operator after field '{field}'"
                ))),
            },
            other => Err(SearchError::InvalidSearch(format!(
                "unexpected token in filter: {other:?}"
            ))),
        }
    }
}

/// Parse the surface filter syntax (`level = "ERROR" AND service ~ auth`)
/// into the canonical AST.
pub fn parse_filter(input: &str) -> Result<FilterNode, SearchError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SearchError::InvalidSearch("empty filter expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(SearchError::InvalidSearch(
            "trailing tokens in filter expression".into(),
        ));
    }
    Ok(node)
}
