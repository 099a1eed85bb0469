use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SearchError;
use crate::model::{FilterNode, FilterOp, LogSearch};

/// Compiled pattern matching `{{ path.to.value }}` template expressions in
/// `cmd` options.
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("template regex must compile"));

/// Marker emitted on stderr so callers can tell which engine produced the
/// stream.
pub const ENGINE_MARKER: &str = "HL_ENGINE";

/// Build the lookup table a `cmd` template sees, keyed by the same paths
/// authored templates use: `size`, `range.last`, `range.gte`, `range.lte`,
/// `follow`, `fields.<name>`, `options.<name>`.
pub fn build_template_vars(search: &LogSearch) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    if let Some(size) = search.size {
        vars.insert("size".to_string(), size.to_string());
    }
    if let Some(last) = &search.range.last {
        vars.insert("range.last".to_string(), last.clone());
    }
    if let Some(gte) = &search.range.gte {
        vars.insert("range.gte".to_string(), gte.clone());
    }
    if let Some(lte) = &search.range.lte {
        vars.insert("range.lte".to_string(), lte.clone());
    }
    vars.insert("follow".to_string(), search.wants_follow().to_string());

    for (name, value) in &search.fields {
        vars.insert(format!("fields.{name}"), value.clone());
    }
    for key in search.options.0.keys() {
        if let Some(value) = search.options.get_str(key) {
            vars.insert(format!("options.{key}"), value);
        }
    }

    vars
}

/// Expand `{{ var }}` expressions; unknown references stay literal.
pub fn expand_template(template: &str, vars: &HashMap<String, String>) -> String {
    TEMPLATE_RE
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            vars.get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Single-quote a value for the remote/local shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Message-match patterns (match/regex leaves) applied as a grep stage on
/// both engine paths.
fn grep_patterns(search: &LogSearch) -> Vec<String> {
    let mut patterns = Vec::new();
    fn walk(node: &FilterNode, patterns: &mut Vec<String>) {
        match node {
            FilterNode::Leaf {
                field,
                op: FilterOp::Match | FilterOp::Regex,
                value,
                negate: false,
            } if field == "message" => patterns.push(value.clone()),
            FilterNode::Branch {
                logic: crate::model::FilterLogic::And,
                filters,
            } => {
                for child in filters {
                    walk(child, patterns);
                }
            }
            _ => {}
        }
    }
    if let Some(filter) = &search.filter {
        walk(filter, &mut patterns);
    }
    patterns
}

/// Build the shell command for a command-stream backend.
///
/// A `cmd` option wins and is expanded as a template over the search.
/// Otherwise a hybrid command is produced: it prefers a remote `hl` with
/// the filters pushed down, and falls back to `cat`/`tail -F`. Either path
/// reports its engine with an `HL_ENGINE=` marker on stderr.
pub fn build_command(search: &LogSearch) -> Result<String, SearchError> {
    if let Some(cmd) = search.options.get_str("cmd") {
        let vars = build_template_vars(search);
        return Ok(expand_template(&cmd, &vars));
    }

    let files = search
        .options
        .get_string_list("file")
        .or_else(|| search.options.get_string_list("files"))
        .ok_or_else(|| {
            SearchError::InvalidSearch("command backend needs a 'cmd' or 'file' option".into())
        })?;
    if files.is_empty() {
        return Err(SearchError::InvalidSearch("empty 'file' option".into()));
    }
    let files_quoted = files
        .iter()
        .map(|f| shell_quote(f))
        .collect::<Vec<_>>()
        .join(" ");

    let follow = search.wants_follow();
    let grep_stage = grep_patterns(search)
        .iter()
        .map(|p| format!(" | grep -E {}", shell_quote(p)))
        .collect::<String>();

    let use_hl = !search.options.get_bool("disableHl").unwrap_or(false);
    if !use_hl {
        let base = if follow {
            format!("tail -F -n +1 {files_quoted}")
        } else {
            format!("cat {files_quoted}")
        };
        return Ok(format!(
            "echo '{ENGINE_MARKER}=fallback' 1>&2; {base}{grep_stage}"
        ));
    }

    let mut hl_args = vec!["--color".to_string(), "never".to_string()];
    if follow {
        hl_args.push("--follow".to_string());
    }
    if let Some(last) = &search.range.last {
        hl_args.push("--last".to_string());
        hl_args.push(shell_quote(last));
    }
    for (field, value) in search.equality_pairs() {
        if field == "level" {
            hl_args.push("-l".to_string());
            hl_args.push(shell_quote(&value.to_lowercase()));
        } else {
            hl_args.push("-f".to_string());
            hl_args.push(shell_quote(&format!("{field}={value}")));
        }
    }
    let hl_cmd = format!("hl {} {files_quoted}", hl_args.join(" "));

    let fallback = if follow {
        format!("tail -F -n +1 {files_quoted}")
    } else {
        format!("cat {files_quoted}")
    };

    Ok(format!(
        "if command -v hl >/dev/null 2>&1; then echo '{ENGINE_MARKER}=hl' 1>&2; {hl_cmd}{grep_stage}; else echo '{ENGINE_MARKER}=fallback' 1>&2; {fallback}{grep_stage}; fi"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_expansion_over_search() {
        let mut search = LogSearch {
            size: Some(50),
            ..Default::default()
        };
        search.range.last = Some("30m".into());
        search.fields.insert("service".into(), "auth".into());
        search.options.insert("cmd", json!("journalctl -u {{ fields.service }} -n {{ size }} --since '-{{ range.last }}'"));

        let cmd = build_command(&search).unwrap();
        assert_eq!(cmd, "journalctl -u auth -n 50 --since '-30m'");
    }

    #[test]
    fn unknown_template_key_stays_literal() {
        let vars = HashMap::new();
        assert_eq!(expand_template("x {{ nope }} y", &vars), "x {{ nope }} y");
    }

    #[test]
    fn hybrid_prefers_hl_with_marker() {
        let mut search = LogSearch::default();
        search.options.insert("file", json!("/var/log/app.log"));
        search.fields.insert("level".into(), "ERROR".into());
        search.range.last = Some("15m".into());

        let cmd = build_command(&search).unwrap();
        assert!(cmd.starts_with("if command -v hl"));
        assert!(cmd.contains("HL_ENGINE=hl"));
        assert!(cmd.contains("HL_ENGINE=fallback"));
        assert!(cmd.contains("-l 'error'"));
        assert!(cmd.contains("--last '15m'"));
        assert!(cmd.contains("cat '/var/log/app.log'"));
    }

    #[test]
    fn follow_falls_back_to_tail() {
        let mut search = LogSearch {
            follow: true,
            ..Default::default()
        };
        search.options.insert("file", json!("/var/log/app.log"));
        search.options.insert("disableHl", json!(true));

        let cmd = build_command(&search).unwrap();
        assert!(cmd.contains("tail -F -n +1 '/var/log/app.log'"));
        assert!(cmd.contains("HL_ENGINE=fallback"));
    }

    #[test]
    fn message_match_becomes_grep() {
        let mut search = LogSearch::default();
        search.options.insert("file", json!("/tmp/x.log"));
        search.filter = Some(crate::model::FilterNode::leaf(
            "message",
            FilterOp::Match,
            "timeout",
        ));
        let cmd = build_command(&search).unwrap();
        assert!(cmd.contains("grep -E 'timeout'"));
    }

    #[test]
    fn missing_cmd_and_file_rejected() {
        let search = LogSearch::default();
        assert!(build_command(&search).is_err());
    }

    #[test]
    fn shell_quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
