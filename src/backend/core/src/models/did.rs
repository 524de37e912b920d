//! Difference-in-differences analysis.
//!
//! Estimates the causal effect of a campaign by comparing treatment and
//! control channels before and after an intervention date. Events are
//! bucketed into the 2x2 treatment/post grid; the effect is the interaction
//! of the two contrasts, with a normal-approximation interval from the
//! pooled cell standard errors.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{payload_f64, payload_str, two_sided_p, Cell};
use crate::error::{CausewayError, Result};
use crate::registry::{AnalysisOutput, CausalModel, Dataset, ModelContext};

/// Outcome variable computed per event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeMetric {
    /// 1 when `event_type == "conversion"`, else 0
    #[default]
    Conversion,
    /// `revenue_usd`, missing treated as 0
    Revenue,
    /// Every event counts 1
    Count,
}

#[derive(Debug, Deserialize)]
struct DidParams {
    campaign_id: String,
    #[serde(default)]
    split_date: Option<String>,
    #[serde(default = "default_treatment_channel")]
    treatment_channel: String,
    #[serde(default)]
    outcome_metric: OutcomeMetric,
}

fn default_treatment_channel() -> String {
    "paid_search".to_string()
}

/// Prepared context carried from `load_data` to `run_analysis`.
#[derive(Debug, Serialize, Deserialize)]
struct DidPrep {
    campaign_id: String,
    treatment_channel: String,
    outcome_metric: OutcomeMetric,
    split_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct DifferenceInDifferences;

impl DifferenceInDifferences {
    fn parse_split(raw: &str) -> Result<DateTime<Utc>> {
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Ok(at.with_timezone(&Utc));
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(DateTime::from_naive_utc_and_offset(
                date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
                Utc,
            ));
        }
        Err(CausewayError::validation(format!(
            "split_date must be RFC 3339 or YYYY-MM-DD, got {raw:?}"
        )))
    }

    fn outcome(metric: OutcomeMetric, event: &crate::events::Event) -> f64 {
        match metric {
            OutcomeMetric::Conversion => {
                if payload_str(event, "event_type") == Some("conversion") {
                    1.0
                } else {
                    0.0
                }
            }
            OutcomeMetric::Revenue => payload_f64(event, "revenue_usd").unwrap_or(0.0),
            OutcomeMetric::Count => 1.0,
        }
    }
}

#[async_trait]
impl CausalModel for DifferenceInDifferences {
    fn name(&self) -> &'static str {
        "did"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn param_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "required": ["campaign_id"],
            "properties": {
                "campaign_id": {"type": "string"},
                "split_date": {"type": "string"},
                "treatment_channel": {"type": "string", "default": "paid_search"},
                "outcome_metric": {
                    "type": "string",
                    "enum": ["conversion", "revenue", "count"],
                    "default": "conversion"
                }
            }
        }))
    }

    async fn load_data(
        &self,
        ctx: &ModelContext,
        params: &serde_json::Value,
    ) -> Result<Dataset> {
        let params: DidParams = serde_json::from_value(params.clone())
            .map_err(|e| CausewayError::validation(format!("invalid did parameters: {e}")))?;

        let events = ctx
            .events
            .find_by_payload(&json!({"campaign_id": params.campaign_id}))
            .await?;

        // Explicit split date wins; otherwise split at the median timestamp.
        let split_at = match &params.split_date {
            Some(raw) => Some(Self::parse_split(raw)?),
            None => {
                let mid = events.len() / 2;
                events.get(mid).map(|e| e.occurred_at)
            }
        };

        let prep = DidPrep {
            campaign_id: params.campaign_id,
            treatment_channel: params.treatment_channel,
            outcome_metric: params.outcome_metric,
            split_at,
        };

        tracing::debug!(
            campaign_id = %prep.campaign_id,
            rows = events.len(),
            "Loaded events for did analysis"
        );
        Ok(Dataset::new(events).with_meta(serde_json::to_value(prep)?))
    }

    async fn run_analysis(&self, dataset: Dataset) -> Result<AnalysisOutput> {
        let prep: DidPrep = serde_json::from_value(dataset.meta.clone())?;

        if dataset.is_empty() {
            return Err(CausewayError::plugin_failed(format!(
                "no events for campaign {}",
                prep.campaign_id
            )));
        }
        let split_at = prep.split_at.ok_or_else(|| {
            CausewayError::plugin_failed("could not resolve a split date for the dataset")
        })?;

        // 2x2 grid: [treatment][post]
        let mut cells = [[Cell::default(); 2]; 2];
        for event in &dataset.events {
            let treatment =
                payload_str(event, "marketing_channel") == Some(prep.treatment_channel.as_str());
            let post = event.occurred_at >= split_at;
            let outcome = Self::outcome(prep.outcome_metric, event);
            cells[treatment as usize][post as usize].add(outcome);
        }

        if cells.iter().flatten().any(|cell| cell.n == 0) {
            return Err(CausewayError::plugin_failed(
                "insufficient data for difference-in-differences \
                 (need observations in every treatment/control x pre/post cell)",
            ));
        }

        let [[control_pre, control_post], [treat_pre, treat_post]] = cells;
        let effect =
            (treat_post.mean() - treat_pre.mean()) - (control_post.mean() - control_pre.mean());
        let se = (treat_post.se_sq()
            + treat_pre.se_sq()
            + control_post.se_sq()
            + control_pre.se_sq())
        .sqrt();

        let (z, p_value) = if se > 0.0 {
            let z = effect / se;
            (z, two_sided_p(z))
        } else {
            (0.0, 1.0)
        };

        let cell_json = |cell: &Cell| json!({"n": cell.n, "mean": cell.mean()});

        Ok(AnalysisOutput {
            effect_estimates: json!({ "did": effect }),
            confidence_intervals: json!({
                "did": {
                    "lower": effect - 1.96 * se,
                    "upper": effect + 1.96 * se,
                    "level": 0.95
                }
            }),
            diagnostics: json!({
                "campaign_id": prep.campaign_id,
                "n_observations": dataset.len(),
                "standard_error": se,
                "z_score": z,
                "p_value": p_value,
                "split_at": split_at,
                "outcome_metric": prep.outcome_metric,
                "cells": {
                    "treatment_pre": cell_json(&treat_pre),
                    "treatment_post": cell_json(&treat_post),
                    "control_pre": cell_json(&control_pre),
                    "control_post": cell_json(&control_post)
                }
            }),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::Event;
    use crate::storage::{EventStore, MemoryStorage};
    use std::sync::Arc;

    fn event(key: &str, channel: &str, days_ago: i64, converted: bool) -> Event {
        Event {
            idempotency_key: key.to_string(),
            occurred_at: Utc::now() - chrono::Duration::days(days_ago),
            source: "shop".to_string(),
            payload: json!({
                "campaign_id": "c1",
                "marketing_channel": channel,
                "event_type": if converted { "conversion" } else { "page_view" },
            }),
        }
    }

    async fn context_with(events: Vec<Event>) -> ModelContext {
        let storage = Arc::new(MemoryStorage::new());
        for e in &events {
            storage.write_if_absent(e).await.unwrap();
        }
        ModelContext { events: storage }
    }

    fn split_days_ago(days: i64) -> String {
        (Utc::now() - chrono::Duration::days(days)).to_rfc3339()
    }

    #[tokio::test]
    async fn test_did_estimates_lift() {
        // Treatment conversion rate rises post-split, control stays flat.
        let mut events = Vec::new();
        let mut n = 0;
        let mut push = |channel: &str, days_ago: i64, converted: bool| {
            n += 1;
            events.push(event(&format!("e{n}"), channel, days_ago, converted));
        };
        for i in 0..10 {
            push("paid_search", 10, i < 2); // pre: 20%
            push("paid_search", 1, i < 8); // post: 80%
            push("email", 10, i < 3); // pre: 30%
            push("email", 1, i < 3); // post: 30%
        }

        let model = DifferenceInDifferences::default();
        let ctx = context_with(events).await;
        let params = json!({"campaign_id": "c1", "split_date": split_days_ago(5)});

        let dataset = model.load_data(&ctx, &params).await.unwrap();
        assert_eq!(dataset.len(), 40);

        let output = model.run_analysis(dataset).await.unwrap();
        let effect = output.effect_estimates["did"].as_f64().unwrap();
        assert!((effect - 0.6).abs() < 1e-9);

        let ci = &output.confidence_intervals["did"];
        assert!(ci["lower"].as_f64().unwrap() < effect);
        assert!(ci["upper"].as_f64().unwrap() > effect);
        assert!(output.diagnostics["p_value"].as_f64().unwrap() < 0.05);
    }

    #[tokio::test]
    async fn test_did_requires_campaign_id() {
        let model = DifferenceInDifferences::default();
        let ctx = context_with(vec![]).await;
        let err = model.load_data(&ctx, &json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_did_rejects_bad_split_date() {
        let model = DifferenceInDifferences::default();
        let ctx = context_with(vec![]).await;
        let err = model
            .load_data(
                &ctx,
                &json!({"campaign_id": "c1", "split_date": "Jan 15th"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_did_fails_on_empty_dataset() {
        let model = DifferenceInDifferences::default();
        let ctx = context_with(vec![]).await;
        let dataset = model
            .load_data(&ctx, &json!({"campaign_id": "c1"}))
            .await
            .unwrap();

        let err = model.run_analysis(dataset).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginExecutionFailed);
    }

    #[tokio::test]
    async fn test_did_fails_without_all_four_cells() {
        // Only treatment events, no control group.
        let events = vec![
            event("e1", "paid_search", 10, true),
            event("e2", "paid_search", 1, true),
        ];
        let model = DifferenceInDifferences::default();
        let ctx = context_with(events).await;
        let dataset = model
            .load_data(
                &ctx,
                &json!({"campaign_id": "c1", "split_date": split_days_ago(5)}),
            )
            .await
            .unwrap();

        let err = model.run_analysis(dataset).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginExecutionFailed);
        assert!(err.user_message().contains("insufficient data"));
    }

    #[tokio::test]
    async fn test_did_median_split_fallback() {
        let mut events = Vec::new();
        for (i, days_ago) in [20, 15, 10, 5].into_iter().enumerate() {
            events.push(event(&format!("t{i}"), "paid_search", days_ago, true));
            events.push(event(&format!("c{i}"), "email", days_ago, false));
        }

        let model = DifferenceInDifferences::default();
        let ctx = context_with(events).await;
        let dataset = model
            .load_data(&ctx, &json!({"campaign_id": "c1"}))
            .await
            .unwrap();

        // A split was resolved from the data and the analysis completes.
        let output = model.run_analysis(dataset).await.unwrap();
        assert!(output.effect_estimates["did"].is_number());
    }
}
