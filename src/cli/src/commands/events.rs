//! Event ingestion commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EventCommands {
    /// Send a single event
    Send {
        /// Event payload as inline JSON, or @path to a JSON file
        payload: String,

        /// Idempotency key; derived server-side when omitted
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Upload a batch file through a signed URL
    Upload {
        /// Path to the file to upload
        file: String,
    },
}

#[derive(Deserialize)]
struct SubmitResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct UploadTicket {
    url: String,
    object: String,
}

fn parse_payload(raw: &str) -> Result<Value> {
    let content = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&content).context("payload must be valid JSON")
}

pub async fn execute(cmd: EventCommands, client: &ApiClient, _format: OutputFormat) -> Result<()> {
    match cmd {
        EventCommands::Send { payload, key } => {
            let body = json!({
                "idempotency_key": key,
                "payload": parse_payload(&payload)?,
            });
            let response: SubmitResponse = client.post("/v1/events", &body).await?;
            output::print_success(&format!("Event accepted: {}", response.event_id));
        }

        EventCommands::Upload { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read upload file {file}"))?;

            let ticket: UploadTicket = client.post_empty("/v1/uploads/url").await?;
            output::print_info(&format!("Uploading {} bytes to {}", bytes.len(), ticket.object));

            client.put_bytes(&ticket.url, bytes).await?;
            output::print_success(&format!("Uploaded: {}", ticket.object));
        }
    }

    Ok(())
}
