//! Distribution server monitoring: a reporter the server calls on
//! protocol events, with a metrics-backed implementation for production
//! and an in-memory one for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};

pub trait Reporter: Send + Sync {
    fn set_clients_total(&self, n: usize);
    fn record_request_ack(&self, collection: &str);
    fn record_request_nack(&self, collection: &str);
    fn record_send_error(&self, collection: &str);
}

/// Reporter wired to the process metrics recorder.
#[derive(Default)]
pub struct MetricsReporter;

impl MetricsReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for MetricsReporter {
    fn set_clients_total(&self, n: usize) {
        gauge!("bosun_mcp_clients_total", n as f64);
    }

    fn record_request_ack(&self, _collection: &str) {
        counter!("bosun_mcp_request_acks_total", 1u64);
    }

    fn record_request_nack(&self, _collection: &str) {
        counter!("bosun_mcp_request_nacks_total", 1u64);
    }

    fn record_send_error(&self, _collection: &str) {
        counter!("bosun_mcp_send_errors_total", 1u64);
    }
}

/// Counting reporter for tests and constrained environments.
#[derive(Default)]
pub struct InMemoryStats {
    clients: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
    send_errors: AtomicUsize,
}

impl InMemoryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }

    pub fn send_errors(&self) -> usize {
        self.send_errors.load(Ordering::SeqCst)
    }
}

impl Reporter for InMemoryStats {
    fn set_clients_total(&self, n: usize) {
        self.clients.store(n, Ordering::SeqCst);
    }

    fn record_request_ack(&self, _collection: &str) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn record_request_nack(&self, _collection: &str) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }

    fn record_send_error(&self, _collection: &str) {
        self.send_errors.fetch_add(1, Ordering::SeqCst);
    }
}
