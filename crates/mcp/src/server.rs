//! The distribution server: accept loop plus one ack-gated send loop
//! per subscriber connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use prost::Message;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::monitoring::Reporter;
use crate::proto::{self, Envelope, McpRequest, McpResponse};
use crate::snapshot::SnapshotCache;
use crate::McpError;

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Identifier presented in logs; also the default sink id peers see.
    pub server_id: String,
    /// Upper bound on a single wire frame.
    pub max_frame_bytes: usize,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self { server_id: "bosun-mcp-server".to_string(), max_frame_bytes: 4 * 1024 * 1024 }
    }
}

/// Serves snapshots from a [`SnapshotCache`] to any number of
/// subscribers. One logical channel per collection per connection, each
/// with single-outstanding-snapshot flow control.
pub struct McpServer {
    config: McpServerConfig,
    cache: Arc<SnapshotCache>,
    reporter: Arc<dyn Reporter>,
    subscribers: DashMap<u64, String>,
    next_conn: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl McpServer {
    pub fn new(
        config: McpServerConfig,
        cache: Arc<SnapshotCache>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            cache,
            reporter,
            subscribers: DashMap::new(),
            next_conn: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }

    /// Number of active per-collection channels.
    pub fn channel_count(&self) -> usize {
        self.cache.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop accepting, and tell every connection loop to wind down with
    /// a clean end-of-stream. Safe to call more than once, and before
    /// [`McpServer::serve`] was ever started.
    pub fn shutdown(&self) {
        // send_replace stores the value even with no receivers yet, so
        // a serve() started later still sees the shutdown.
        self.shutdown.send_replace(true);
    }

    /// Accept loop. Blocks until [`McpServer::shutdown`] and returns
    /// promptly afterwards.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "distribution listener ready");
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            server.subscribers.insert(conn_id, String::new());
                            server.reporter.set_clients_total(server.subscribers.len());
                            let conn = Connection::new(Arc::clone(&server), conn_id);
                            match conn.run(stream).await {
                                Ok(()) | Err(McpError::Closed) => {
                                    debug!(peer = %peer, "subscriber disconnected");
                                }
                                Err(e) => {
                                    debug!(peer = %peer, error = %e, "subscriber connection ended");
                                }
                            }
                            server.subscribers.remove(&conn_id);
                            server.reporter.set_clients_total(server.subscribers.len());
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        info!("distribution listener stopped");
    }
}

#[derive(Default)]
struct Subscription {
    pending_nonce: Option<String>,
    last_sent_version: Option<String>,
}

struct Connection {
    server: Arc<McpServer>,
    conn_id: u64,
    subs: FxHashMap<String, Subscription>,
}

impl Connection {
    fn new(server: Arc<McpServer>, conn_id: u64) -> Self {
        Self { server, conn_id, subs: FxHashMap::default() }
    }

    async fn run(mut self, stream: TcpStream) -> Result<(), McpError> {
        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(self.server.config.max_frame_bytes);
        let mut framed = Framed::new(stream, codec);
        let mut shutdown = self.server.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        // One tagged change stream per subscribed collection.
        let mut changes: SelectAll<BoxStream<'static, String>> = SelectAll::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let eos = McpResponse { end_of_stream: true, ..Default::default() };
                    if let Err(e) = framed.send(proto::encode(&eos)).await {
                        // Shutdown mid-write: surfaced to this
                        // subscriber only.
                        debug!(error = %e, "end-of-stream send failed");
                    }
                    return Ok(());
                }
                frame = framed.next() => match frame {
                    None => return Err(McpError::Closed),
                    Some(Err(e)) => return Err(McpError::Io(e)),
                    Some(Ok(bytes)) => {
                        let req = McpRequest::decode(bytes.freeze())?;
                        self.handle_request(req, &mut framed, &mut changes).await?;
                    }
                },
                Some(collection) = changes.next(), if !changes.is_empty() => {
                    self.maybe_push(&collection, &mut framed).await?;
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        req: McpRequest,
        framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
        changes: &mut SelectAll<BoxStream<'static, String>>,
    ) -> Result<(), McpError> {
        let collection = req.collection.clone();
        if !req.sink_id.is_empty() {
            self.server.subscribers.insert(self.conn_id, req.sink_id.clone());
        }

        if !self.subs.contains_key(&collection) {
            // Fresh subscription: no nonce may be outstanding.
            if !req.response_nonce.is_empty() {
                return Err(McpError::NonceMismatch { got: req.response_nonce, want: None });
            }
            let (snapshot, signal) = self
                .server
                .cache
                .subscribe(&collection)
                .ok_or_else(|| McpError::UnknownCollection(collection.clone()))?;
            let tag = collection.clone();
            changes.push(WatchStream::from_changes(signal).map(move |_| tag.clone()).boxed());

            let mut sub = Subscription::default();
            debug!(collection = %collection, sink = %req.sink_id, "subscription opened");
            send_snapshot(framed, &snapshot, &mut sub, self.server.reporter.as_ref()).await?;
            self.subs.insert(collection, sub);
            return Ok(());
        }

        let Some(sub) = self.subs.get_mut(&collection) else {
            return Ok(());
        };
        match &sub.pending_nonce {
            Some(want) if *want == req.response_nonce => {}
            want => {
                return Err(McpError::NonceMismatch {
                    got: req.response_nonce,
                    want: want.clone(),
                });
            }
        }
        sub.pending_nonce = None;

        if let Some(detail) = &req.error_detail {
            warn!(
                collection = %collection,
                code = detail.code,
                message = %detail.message,
                "subscriber rejected snapshot"
            );
            self.server.reporter.record_request_nack(&collection);
        } else {
            self.server.reporter.record_request_ack(&collection);
        }

        // The collection may have moved on while the ack was in flight.
        self.maybe_push(&collection, framed).await
    }

    async fn maybe_push(
        &mut self,
        collection: &str,
        framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    ) -> Result<(), McpError> {
        let Some(sub) = self.subs.get_mut(collection) else {
            return Ok(());
        };
        if sub.pending_nonce.is_some() {
            // Single outstanding snapshot: wait for the ack.
            return Ok(());
        }
        let Some(snapshot) = self.server.cache.get(collection) else {
            return Ok(());
        };
        if sub.last_sent_version.as_deref() == Some(snapshot.version.as_str()) {
            return Ok(());
        }
        send_snapshot(framed, &snapshot, sub, self.server.reporter.as_ref()).await
    }
}

async fn send_snapshot(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    snapshot: &bosun_runtime::KindSnapshot,
    sub: &mut Subscription,
    reporter: &dyn Reporter,
) -> Result<(), McpError> {
    let nonce = Uuid::new_v4().to_string();
    let envelopes: Vec<Envelope> = snapshot
        .resources
        .iter()
        .map(|r| Envelope {
            name: r.key.name.to_string(),
            version: r.version.as_str().to_string(),
            created_at_unix: r.created_at,
            body: serde_json::to_vec(&r.body).unwrap_or_default(),
        })
        .collect();
    let response = McpResponse {
        collection: snapshot.collection.clone(),
        version_info: snapshot.version.clone(),
        nonce: nonce.clone(),
        envelopes,
        end_of_stream: false,
    };
    if let Err(e) = framed.send(proto::encode(&response)).await {
        reporter.record_send_error(&snapshot.collection);
        return Err(McpError::Io(e));
    }
    sub.pending_nonce = Some(nonce);
    sub.last_sent_version = Some(snapshot.version.clone());
    Ok(())
}
