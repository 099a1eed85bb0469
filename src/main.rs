use clap::Parser;
use logviewer::cli::{Cli, Commands, ContextCommands, QueryCommands};
use logviewer::commands;
use logviewer::engine::Engine;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let engine = match Engine::discover(cli.global.config_file.as_deref()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Query { command } => match command {
            QueryCommands::Log { contexts, opts } => {
                commands::query::run_log(engine, &contexts, &opts).await
            }
            QueryCommands::Field { context, opts } => {
                commands::query::run_fields(engine, context.as_deref(), &opts).await
            }
            QueryCommands::Values {
                names,
                context,
                opts,
            } => commands::query::run_values(engine, context.as_deref(), &names, &opts).await,
        },
        Commands::Context { command } => match command {
            ContextCommands::List => commands::context::run_list(engine).await,
            ContextCommands::Use { context } => commands::context::run_use(engine, &context).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
