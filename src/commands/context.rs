use std::sync::Arc;

use comfy_table::{presets, Table};

use crate::engine::Engine;
use crate::state::State;

pub async fn run_list(engine: Arc<Engine>) -> anyhow::Result<()> {
    let snapshot = engine.snapshot().await;
    let state = State::load().unwrap_or_default();
    let current = if state.current_context.is_empty() {
        snapshot.config.current_context.clone().unwrap_or_default()
    } else {
        state.current_context
    };

    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.set_header(vec!["", "CONTEXT", "CLIENT", "DESCRIPTION"]);
    for (id, context) in &snapshot.config.contexts {
        let marker = if *id == current { "*" } else { "" };
        table.add_row(vec![
            marker,
            id,
            &context.client,
            context.description.as_deref().unwrap_or(""),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn run_use(engine: Arc<Engine>, context_id: &str) -> anyhow::Result<()> {
    let snapshot = engine.snapshot().await;
    if !snapshot.config.contexts.contains_key(context_id) {
        anyhow::bail!(
            "context '{}' not found; available: {}",
            context_id,
            snapshot.config.context_ids().join(", ")
        );
    }

    let state = State {
        current_context: context_id.to_string(),
    };
    state.save()?;
    println!("current context set to '{context_id}'");
    Ok(())
}
