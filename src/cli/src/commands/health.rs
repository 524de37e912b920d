//! Server health check.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {}

pub async fn execute(_args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: Value = client.get("/health").await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Server at {} is reachable", client.base_url()));
            if let Some(status) = health["status"].as_str() {
                output::print_detail("status", status);
            }
            if let Some(version) = health["version"].as_str() {
                output::print_detail("version", version);
            }
        }
        OutputFormat::Json => output::print_item(&health, format),
    }

    Ok(())
}
