//! Client configuration management.
//!
//! Reads and writes `~/.causeway/config.toml` with the API URL and bearer
//! token, so they do not have to be passed on every invocation.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the current configuration
    Show,

    /// Set a configuration value (api_url or token)
    Set {
        /// Key to set
        key: String,
        /// Value to store
        value: String,
    },

    /// Print the configuration file path
    Path,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    pub api_url: Option<String>,
    pub token: Option<String>,
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".causeway").join("config.toml"))
}

/// Load the config file, falling back to defaults when absent or invalid.
pub fn load_config() -> CliConfig {
    let Some(path) = config_path() else {
        return CliConfig::default();
    };
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str(&content).ok())
        .unwrap_or_default()
}

fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_path().context("Could not determine home directory")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn execute(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = load_config();
            output::print_detail(
                "api_url",
                config.api_url.as_deref().unwrap_or("(default) http://localhost:8082"),
            );
            output::print_detail(
                "token",
                if config.token.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                },
            );
        }

        ConfigCommands::Set { key, value } => {
            let mut config = load_config();
            match key.as_str() {
                "api_url" => config.api_url = Some(value),
                "token" => config.token = Some(value),
                other => anyhow::bail!("Unknown config key: {other} (expected api_url or token)"),
            }
            save_config(&config)?;
            output::print_success(&format!("Updated {key}"));
        }

        ConfigCommands::Path => match config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine home directory"),
        },
    }

    Ok(())
}
