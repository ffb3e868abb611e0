//! Runtime aggregation: the source contract, the in-memory source used
//! by tests and wiring seams, and the processor that folds per-kind
//! event streams into published snapshots.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use bosun_core::Event;

mod inmemory;
mod processor;

pub use inmemory::InMemorySource;
pub use processor::{KindSnapshot, Precedence, Processor, ProcessorHandle, SnapshotSink};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source already started")]
    AlreadyStarted,
    #[error("invalid source configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A backend-specific watcher producing an ordered event stream for one
/// or more kinds.
///
/// Guarantees required of implementations:
/// - events for a single kind arrive in backend observation order;
/// - `start` either fully starts the source or leaves nothing running;
/// - `stop` releases watch handles exactly once and further calls are
///   no-ops;
/// - transient backend errors are retried internally, never surfaced as
///   stream termination.
#[async_trait]
pub trait Source: Send + Sync {
    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<(), SourceError>;
    async fn stop(&self);
}
