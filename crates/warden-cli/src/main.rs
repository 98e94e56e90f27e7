mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, ConfigsCommand};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; the fallback comes from the config file (serve) or is
/// "info" for client commands.
fn init_tracing(fallback: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => commands::serve(config).await,
        Command::Ping => {
            init_tracing("info");
            commands::ping(cli.remote).await
        }
        Command::Configs { command } => {
            init_tracing("info");
            match command {
                ConfigsCommand::List => commands::configs_list(cli.remote).await,
                ConfigsCommand::Show { uuid } => commands::configs_show(cli.remote, uuid).await,
            }
        }
        Command::Tokens => {
            init_tracing("info");
            commands::tokens(cli.remote).await
        }
    }
}
