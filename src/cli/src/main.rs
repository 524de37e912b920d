//! Causeway CLI - Command-line interface for the Causeway analysis platform.
//!
//! Provides commands for event submission, analysis jobs, the model catalog,
//! health checks, and client configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, events, health, jobs, models};
use output::OutputFormat;

/// Causeway - Causal Analysis Platform CLI
#[derive(Parser)]
#[command(
    name = "causeway",
    version = "0.1.0",
    about = "Causeway - Causal Analysis Platform",
    long_about = "CLI tool for submitting events, running analysis jobs, and inspecting the Causeway platform.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "CAUSEWAY_API_URL")]
    api_url: Option<String>,

    /// Bearer token for authenticated endpoints
    #[arg(long, global = true, env = "CAUSEWAY_TOKEN")]
    token: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Event ingestion operations
    #[command(subcommand)]
    Events(events::EventCommands),

    /// Analysis job operations
    #[command(subcommand)]
    Jobs(jobs::JobCommands),

    /// Model catalog operations
    #[command(subcommand)]
    Models(models::ModelCommands),

    /// Check server health
    Health(health::HealthArgs),

    /// Client configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file_config = config::load_config();
    let api_url = cli
        .api_url
        .or_else(|| file_config.api_url.clone())
        .unwrap_or_else(|| "http://localhost:8082".to_string());
    let token = cli.token.or_else(|| file_config.token.clone());

    let client = client::ApiClient::new(&api_url, token)?;

    match cli.command {
        Commands::Events(cmd) => events::execute(cmd, &client, cli.output).await,
        Commands::Jobs(cmd) => jobs::execute(cmd, &client, cli.output).await,
        Commands::Models(cmd) => models::execute(cmd, &client, cli.output).await,
        Commands::Health(args) => health::execute(args, &client, cli.output).await,
        Commands::Config(cmd) => config::execute(cmd),
    }
}
