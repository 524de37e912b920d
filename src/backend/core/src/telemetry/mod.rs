//! Telemetry infrastructure: structured logging and Prometheus metrics.
//!
//! Logging supports JSON output for production and pretty/compact output for
//! development, selected through [`crate::config::ObservabilityConfig`].

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{CausewayError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Initialize the global tracing subscriber.
///
/// `level` accepts anything `EnvFilter` understands, so per-module overrides
/// like `"info,causeway_core::worker=debug"` work. `RUST_LOG` wins when set.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CausewayError::configuration(format!("invalid log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };

    // A second init in the same process (tests) is not an error worth failing on.
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
    Ok(())
}

/// Install the Prometheus metrics recorder and return the render handle
/// backing the `/metrics` endpoint.
pub fn install_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CausewayError::configuration(format!("failed to install recorder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_lowercase() {
        let format: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(format, LogFormat::Pretty);
        assert_eq!(LogFormat::default(), LogFormat::Json);
    }

    #[test]
    fn test_init_logging_accepts_module_filters() {
        init_logging("info,causeway_core=debug", LogFormat::Compact).unwrap();
        // Second call must not fail once a subscriber exists.
        init_logging("warn", LogFormat::Compact).unwrap();
    }
}
