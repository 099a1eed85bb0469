use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "logviewer", version, about = "Multi-backend log query engine")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true, env = "LOGVIEWER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Args, Default)]
pub struct QueryOpts {
    /// Relative time range (e.g. "15m", "2h")
    #[arg(long)]
    pub last: Option<String>,

    /// Absolute range start (RFC3339)
    #[arg(long)]
    pub from: Option<String>,

    /// Absolute range end (RFC3339)
    #[arg(long)]
    pub to: Option<String>,

    /// Maximum entries to fetch
    #[arg(short = 'n', long)]
    pub size: Option<usize>,

    /// Resume from a pagination token
    #[arg(long)]
    pub page_token: Option<String>,

    /// Field equality predicate, repeatable (name=value)
    #[arg(short = 'F', long = "field")]
    pub fields: Vec<String>,

    /// Filter expression (e.g. 'level = "ERROR" AND service ~ auth')
    #[arg(short = 'q', long)]
    pub filter: Option<String>,

    /// Raw backend-dialect query merged as the base expression
    #[arg(long)]
    pub native_query: Option<String>,

    /// Variable override, repeatable (name=value)
    #[arg(short = 'V', long = "var")]
    pub variables: Vec<String>,

    /// Extra search templates to inherit, repeatable
    #[arg(short = 'i', long = "inherit")]
    pub inherits: Vec<String>,

    /// Output JSON instead of rendered lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run queries against a context
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },
    /// Manage the current context
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueryCommands {
    /// Fetch log entries
    Log {
        /// Context ids to query (current context if empty)
        contexts: Vec<String>,

        #[command(flatten)]
        opts: QueryOpts,
    },
    /// Discover fields and their values
    Field {
        /// Context id to query (current context if empty)
        context: Option<String>,

        #[command(flatten)]
        opts: QueryOpts,
    },
    /// Distinct values for specific fields
    Values {
        /// Field names to collect
        #[arg(required = true)]
        names: Vec<String>,

        /// Context id to query (current context if empty)
        #[arg(short = 'c', long = "context")]
        context: Option<String>,

        #[command(flatten)]
        opts: QueryOpts,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContextCommands {
    /// List available contexts
    List,
    /// Select the current context
    Use {
        /// Context id to select
        context: String,
    },
}

/// Parse repeated `name=value` flags into a map.
pub fn parse_pairs(pairs: &[String]) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("expected name=value, got '{pair}'"))
        })
        .collect()
}
