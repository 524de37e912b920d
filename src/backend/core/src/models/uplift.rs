//! Channel uplift comparison.
//!
//! A deliberately small second model: mean outcome for one marketing channel
//! against the mean of every other channel, with a two-sample normal
//! interval. Exists to keep the registry honest about supporting more than
//! one implementation behind the same contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{payload_f64, payload_str, two_sided_p, Cell};
use crate::error::{CausewayError, Result};
use crate::registry::{AnalysisOutput, CausalModel, Dataset, ModelContext};

#[derive(Debug, Deserialize)]
struct UpliftParams {
    channel: String,
    #[serde(default)]
    campaign_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpliftPrep {
    channel: String,
}

#[derive(Debug, Default)]
pub struct ChannelUplift;

#[async_trait]
impl CausalModel for ChannelUplift {
    fn name(&self) -> &'static str {
        "channel_uplift"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn param_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "required": ["channel"],
            "properties": {
                "channel": {"type": "string"},
                "campaign_id": {"type": "string"}
            }
        }))
    }

    async fn load_data(
        &self,
        ctx: &ModelContext,
        params: &serde_json::Value,
    ) -> Result<Dataset> {
        let params: UpliftParams = serde_json::from_value(params.clone()).map_err(|e| {
            CausewayError::validation(format!("invalid channel_uplift parameters: {e}"))
        })?;

        let filter = match &params.campaign_id {
            Some(campaign_id) => json!({"campaign_id": campaign_id}),
            None => json!({}),
        };
        let events = ctx.events.find_by_payload(&filter).await?;

        let prep = UpliftPrep {
            channel: params.channel,
        };
        Ok(Dataset::new(events).with_meta(serde_json::to_value(prep)?))
    }

    async fn run_analysis(&self, dataset: Dataset) -> Result<AnalysisOutput> {
        let prep: UpliftPrep = serde_json::from_value(dataset.meta.clone())?;

        let mut channel = Cell::default();
        let mut rest = Cell::default();
        for event in &dataset.events {
            let revenue = payload_f64(event, "revenue_usd").unwrap_or(0.0);
            if payload_str(event, "marketing_channel") == Some(prep.channel.as_str()) {
                channel.add(revenue);
            } else {
                rest.add(revenue);
            }
        }

        if channel.n == 0 || rest.n == 0 {
            return Err(CausewayError::plugin_failed(format!(
                "channel_uplift needs events both on and off channel {:?}",
                prep.channel
            )));
        }

        let uplift = channel.mean() - rest.mean();
        let se = (channel.se_sq() + rest.se_sq()).sqrt();
        let (z, p_value) = if se > 0.0 {
            let z = uplift / se;
            (z, two_sided_p(z))
        } else {
            (0.0, 1.0)
        };

        Ok(AnalysisOutput {
            effect_estimates: json!({ "uplift": uplift }),
            confidence_intervals: json!({
                "uplift": {
                    "lower": uplift - 1.96 * se,
                    "upper": uplift + 1.96 * se,
                    "level": 0.95
                }
            }),
            diagnostics: json!({
                "channel": prep.channel,
                "n_channel": channel.n,
                "n_baseline": rest.n,
                "channel_mean": channel.mean(),
                "baseline_mean": rest.mean(),
                "standard_error": se,
                "z_score": z,
                "p_value": p_value
            }),
        })
    }
}
