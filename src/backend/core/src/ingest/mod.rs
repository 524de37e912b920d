//! Event ingestion: the gateway that accepts and publishes events, and the
//! writer that drains the broker into the event store.

mod gateway;
mod writer;

pub use gateway::{EventSubmission, IngestionGateway, SubmittedEvent};
pub use writer::{EventWriter, WriterHandle, WriterStats};
