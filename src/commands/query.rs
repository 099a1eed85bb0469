use std::sync::Arc;

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::cli::{parse_pairs, QueryOpts};
use crate::engine::Engine;
use crate::handlers::{render_entry, QueryArgs};
use crate::model::{LogEntry, LogLevel};
use crate::state::State;

fn to_args(opts: &QueryOpts) -> anyhow::Result<QueryArgs> {
    Ok(QueryArgs {
        last: opts.last.clone(),
        start_time: opts.from.clone(),
        end_time: opts.to.clone(),
        size: opts.size,
        page_token: opts.page_token.clone(),
        fields: parse_pairs(&opts.fields)?,
        filter: opts.filter.clone(),
        native_query: opts.native_query.clone(),
        variables: parse_pairs(&opts.variables)?,
        inherits: opts.inherits.clone(),
    })
}

/// The context ids to run against: explicit arguments, then the persisted
/// current context, then the config's `currentContext`.
async fn target_contexts(engine: &Engine, explicit: &[String]) -> anyhow::Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    let state = State::load().unwrap_or_default();
    if !state.current_context.is_empty() {
        return Ok(vec![state.current_context]);
    }
    let snapshot = engine.snapshot().await;
    if let Some(current) = &snapshot.config.current_context {
        return Ok(vec![current.clone()]);
    }
    anyhow::bail!("no context selected; pass one or run 'logviewer context use <id>'");
}

fn format_level(level: LogLevel, color: bool) -> String {
    if !color {
        return format!("{:>5}", level.as_str());
    }
    match level {
        LogLevel::Trace => format!("{}", level.as_str().dimmed()),
        LogLevel::Debug => format!("{}", level.as_str().blue()),
        LogLevel::Info => format!("{}", level.as_str().green()),
        LogLevel::Warn => format!("{}", level.as_str().yellow()),
        LogLevel::Error | LogLevel::Fatal => format!("{}", level.as_str().red()),
    }
}

fn print_entry(entry: &LogEntry, template: Option<&str>, color: bool) {
    if let Some(template) = template {
        println!("{}", render_entry(entry, template));
        return;
    }

    let mut line = String::new();
    if let Some(ts) = entry.timestamp {
        line.push_str(&ts.to_rfc3339());
        line.push(' ');
    }
    if let Some(level) = entry.level {
        line.push_str(&format_level(level, color));
        line.push(' ');
    }
    if !entry.context_id.is_empty() {
        line.push_str(&format!("[{}] ", entry.context_id));
    }
    line.push_str(&entry.message);
    println!("{line}");
}

pub async fn run_log(
    engine: Arc<Engine>,
    contexts: &[String],
    opts: &QueryOpts,
) -> anyhow::Result<()> {
    let args = to_args(opts)?;
    let contexts = target_contexts(&engine, contexts).await?;

    let response = if contexts.len() == 1 {
        engine.query_logs(&contexts[0], &args).await
    } else {
        engine.query_contexts(&contexts, &args).await
    }
    .map_err(|e| anyhow::anyhow!(serde_json::to_string(&e).unwrap_or_else(|_| e.to_string())))?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    // printer options come from the first context's resolved search
    let details = engine
        .get_context_details(&contexts[0], &args.variables)
        .await
        .ok();
    let template = details
        .as_ref()
        .and_then(|d| d.search.printer_options.template.clone());
    let color = details
        .as_ref()
        .and_then(|d| d.search.printer_options.color)
        .unwrap_or_else(|| std::io::stdout().is_terminal());

    for entry in &response.entries {
        print_entry(entry, template.as_deref(), color);
    }
    if let Some(token) = &response.meta.next_page_token {
        eprintln!("next page: --page-token {token}");
    }
    Ok(())
}

pub async fn run_fields(
    engine: Arc<Engine>,
    context: Option<&str>,
    opts: &QueryOpts,
) -> anyhow::Result<()> {
    let args = to_args(opts)?;
    let explicit: Vec<String> = context.map(str::to_string).into_iter().collect();
    let contexts = target_contexts(&engine, &explicit).await?;
    let fields = engine
        .get_fields(&contexts[0], &args)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&fields)?);
        return Ok(());
    }
    for (field, values) in fields {
        println!("{field}: {}", values.join(", "));
    }
    Ok(())
}

pub async fn run_values(
    engine: Arc<Engine>,
    context: Option<&str>,
    names: &[String],
    opts: &QueryOpts,
) -> anyhow::Result<()> {
    let args = to_args(opts)?;
    let explicit: Vec<String> = context.map(str::to_string).into_iter().collect();
    let contexts = target_contexts(&engine, &explicit).await?;
    let values = engine
        .get_field_values(&contexts[0], names, &args)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }
    for (field, values) in values {
        println!("{field}: {}", values.join(", "));
    }
    Ok(())
}
