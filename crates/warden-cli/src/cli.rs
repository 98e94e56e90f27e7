use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    about = "Fleet PIV-token and recovery-configuration lifecycle service",
    version
)]
pub struct Cli {
    /// Warden server URL for client commands.
    #[arg(long, env = "WARDEN_URL", global = true, default_value = "http://127.0.0.1:8080")]
    pub remote: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the API server and the transition orchestrator.
    Serve {
        /// Path to the YAML config file.
        #[arg(long, env = "WARDEN_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Check service health.
    Ping,

    /// Inspect recovery configurations.
    Configs {
        #[command(subcommand)]
        command: ConfigsCommand,
    },

    /// List PIV tokens.
    Tokens,
}

#[derive(Debug, Subcommand)]
pub enum ConfigsCommand {
    /// List all recovery configurations.
    List,
    /// Show one configuration, including transition progress.
    Show { uuid: String },
}
