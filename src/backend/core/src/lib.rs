//! # Causeway Core
//!
//! Event ingestion and causal analysis orchestration engine.
//!
//! ## Architecture
//!
//! - **Ingestion Gateway**: idempotent event intake published through the broker
//! - **Event Writer**: deduplicated, append-only persistence of canonical events
//! - **Control Plane**: job submission, status tracking, and reconciliation
//! - **Model Registry**: name-keyed catalog of pluggable analysis implementations
//! - **Analysis Worker**: CAS-claimed, timeout-bounded job execution
//! - **Broker**: at-least-once pub/sub connecting producers to consumers
//! - **Storage**: trait seams over Postgres with in-memory backends for tests

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod uploads;
pub mod worker;

pub use error::{CausewayError, ErrorCode, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{Principal, StaticTokenVerifier, TokenVerifier};
    pub use crate::broker::{Broker, BrokerMessage, Delivery, InMemoryBroker, RedisBroker};
    pub use crate::control::{ControlPlane, JobDetails};
    pub use crate::error::{CausewayError, ErrorCode, Result};
    pub use crate::events::Event;
    pub use crate::ingest::{EventWriter, IngestionGateway};
    pub use crate::jobs::{Job, JobId, JobMessage, JobStatus};
    pub use crate::registry::{AnalysisOutput, CausalModel, Dataset, ModelContext, ModelRegistry};
    pub use crate::storage::{
        DedupStore, EventStore, JobStore, MemoryStorage, PgStorage, ResultRecord, ResultStore,
    };
    pub use crate::worker::AnalysisWorker;
}
