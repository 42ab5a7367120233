//! agent-cache - node-local agent binary cache
//!
//! CLI entry point that dispatches to subcommands.

use agent_cache::cli::{commands, Cli, Commands};
use agent_cache::config::ConfigManager;
use agent_cache::error::AgentCacheResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AgentCacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("agent_cache=warn"),
        1 => EnvFilter::new("agent_cache=info"),
        _ => EnvFilter::new("agent_cache=debug"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Data directory: {}", config.storage.data_dir.display());

    match cli.command {
        Commands::Check(args) => commands::check(args, &config).await,
        Commands::Gc(args) => commands::gc(args, &config).await,
        Commands::Install(args) => commands::install(args, &config).await,
        Commands::Publish(args) => commands::publish(args, &config).await,
        Commands::Unpublish(args) => commands::unpublish(args, &config).await,
        Commands::List(args) => commands::list(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, config_manager.path()).await,
    }
}
