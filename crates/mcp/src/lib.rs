//! Snapshot distribution: wire messages, the per-kind snapshot cache,
//! the ack-gated push server, and a small subscriber client.
//!
//! Protocol shape: a subscriber opens a TCP connection and sends a
//! request naming a collection with empty version and nonce; the server
//! replies immediately with the current snapshot and a fresh nonce.
//! Further snapshots for that collection are pushed only after the
//! subscriber acknowledges the outstanding nonce, so at most one
//! unacknowledged snapshot is in flight per subscriber per collection.
//! Frames are length-delimited protobuf messages.

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod client;
pub mod monitoring;
pub mod proto;
mod server;
mod snapshot;

pub use server::{McpServer, McpServerConfig};
pub use snapshot::SnapshotCache;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("request nonce {got:?} does not match outstanding nonce {want:?}")]
    NonceMismatch { got: String, want: Option<String> },
    #[error("connection closed by peer")]
    Closed,
}
