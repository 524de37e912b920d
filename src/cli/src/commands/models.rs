//! Model catalog commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List registered analysis models
    List,
}

#[derive(Debug, Deserialize, Serialize)]
struct ModelInfo {
    name: String,
    version: String,
    registered_at: String,
}

#[derive(Deserialize)]
struct ModelListResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize, Tabled)]
struct ModelRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Registered")]
    registered_at: String,
}

pub async fn execute(cmd: ModelCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ModelCommands::List => {
            let response: ModelListResponse = client.get("/v1/models").await?;

            match format {
                OutputFormat::Table => {
                    let rows: Vec<ModelRow> = response
                        .models
                        .into_iter()
                        .map(|m| ModelRow {
                            name: m.name,
                            version: m.version,
                            registered_at: m.registered_at,
                        })
                        .collect();
                    output::print_list(&rows, format);
                }
                OutputFormat::Json => output::print_item(&response.models, format),
            }
        }
    }

    Ok(())
}
