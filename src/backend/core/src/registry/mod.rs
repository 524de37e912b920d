//! Model registry and the plugin contract.
//!
//! Every analysis technique plugs in through [`CausalModel`], a fixed
//! two-stage capability: load a dataset for the requested parameters, then
//! analyze it. The [`ModelRegistry`] is a name-keyed table of registered
//! implementations, built once at process start and passed by handle into the
//! control plane and the workers. There is no ambient global registry; tests
//! construct isolated registries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{CausewayError, Result};
use crate::events::Event;
use crate::storage::EventStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-side context handed to models during data loading.
#[derive(Clone)]
pub struct ModelContext {
    pub events: Arc<dyn EventStore>,
}

/// The rows a model loaded for one analysis run.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub events: Vec<Event>,
    /// Model-specific prepared context, produced by `load_data` and consumed
    /// by `run_analysis` (resolved split points, group labels, and the like).
    pub meta: serde_json::Value,
}

impl Dataset {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Output of one analysis run, in the standardized result shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    /// Point estimates keyed by effect name
    pub effect_estimates: serde_json::Value,
    /// Interval bounds keyed by effect name
    pub confidence_intervals: serde_json::Value,
    /// Model-specific diagnostics
    pub diagnostics: serde_json::Value,
}

/// A pluggable analysis implementation.
///
/// Implementations are independently developed; the worker invokes them only
/// through this two-stage contract and never inspects what is behind it.
#[async_trait]
pub trait CausalModel: Send + Sync {
    /// Unique registry name, e.g. `"did"`.
    fn name(&self) -> &'static str;

    /// Implementation version reported in the model catalog.
    fn version(&self) -> &'static str;

    /// Optional JSON schema describing the accepted parameters.
    fn param_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Load and prepare the data the analysis needs.
    async fn load_data(
        &self,
        ctx: &ModelContext,
        params: &serde_json::Value,
    ) -> Result<Dataset>;

    /// Perform the analysis on the loaded dataset.
    async fn run_analysis(&self, dataset: Dataset) -> Result<AnalysisOutput>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Catalog metadata for one registered model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_schema: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

struct Registration {
    model: Arc<dyn CausalModel>,
    registered_at: DateTime<Utc>,
}

/// Name-keyed lookup table of analysis implementations.
///
/// Cheaply cloneable; clones share the same underlying table.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<String, Registration>>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in models registered.
    pub fn with_builtin_models() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(crate::models::DifferenceInDifferences::default()));
        registry.register(Arc::new(crate::models::ChannelUplift::default()));
        registry
    }

    /// Register a model under its own name. Re-registering a name replaces
    /// the previous implementation (last registration wins, which tests use
    /// for hot-swapping).
    pub fn register(&self, model: Arc<dyn CausalModel>) {
        let name = model.name().to_string();
        let replaced = self
            .models
            .write()
            .insert(
                name.clone(),
                Registration {
                    model,
                    registered_at: Utc::now(),
                },
            )
            .is_some();
        info!(model = %name, replaced, "Model registered");
    }

    /// Resolve a model by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CausalModel>> {
        self.models
            .read()
            .get(name)
            .map(|r| r.model.clone())
            .ok_or_else(|| CausewayError::unknown_model(name))
    }

    /// Whether a model name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    /// Catalog metadata for every registered model, sorted by name.
    pub fn list(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self
            .models
            .read()
            .values()
            .map(|r| ModelInfo {
                name: r.model.name().to_string(),
                version: r.model.version().to_string(),
                param_schema: r.model.param_schema(),
                registered_at: r.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubModel {
        name: &'static str,
        version: &'static str,
    }

    #[async_trait]
    impl CausalModel for StubModel {
        fn name(&self) -> &'static str {
            self.name
        }

        fn version(&self) -> &'static str {
            self.version
        }

        async fn load_data(
            &self,
            _ctx: &ModelContext,
            _params: &serde_json::Value,
        ) -> Result<Dataset> {
            Ok(Dataset::default())
        }

        async fn run_analysis(&self, _dataset: Dataset) -> Result<AnalysisOutput> {
            Ok(AnalysisOutput {
                effect_estimates: json!({}),
                confidence_intervals: json!({}),
                diagnostics: json!({}),
            })
        }
    }

    #[test]
    fn test_resolve_unknown_model() {
        let registry = ModelRegistry::new();
        let err = match registry.resolve("nope") {
            Ok(_) => panic!("expected resolve to fail"),
            Err(e) => e,
        };
        assert_eq!(err.code(), crate::error::ErrorCode::UnknownModel);
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ModelRegistry::new();
        registry.register(Arc::new(StubModel {
            name: "stub",
            version: "1.0.0",
        }));

        assert!(registry.contains("stub"));
        let resolved = registry.resolve("stub").unwrap();
        assert_eq!(resolved.version(), "1.0.0");
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = ModelRegistry::new();
        registry.register(Arc::new(StubModel {
            name: "stub",
            version: "1.0.0",
        }));
        registry.register(Arc::new(StubModel {
            name: "stub",
            version: "2.0.0",
        }));

        assert_eq!(registry.resolve("stub").unwrap().version(), "2.0.0");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_builtin_models_present() {
        let registry = ModelRegistry::with_builtin_models();
        let names: Vec<String> = registry.list().into_iter().map(|m| m.name).collect();
        assert!(names.contains(&"did".to_string()));
        assert!(names.contains(&"channel_uplift".to_string()));
    }
}
