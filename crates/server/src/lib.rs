//! Server lifecycle: validate configuration, construct every subsystem
//! fail-fast, and own start/stop.
//!
//! Construction is all-or-nothing: nothing is started while building,
//! so a failure at any step needs no rollback and no partial server
//! ever escapes.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bosun_convert as convert;
use bosun_core::{Event, FullName, Key, Resource, Version};
use bosun_mcp::{McpServer, McpServerConfig, SnapshotCache};
use bosun_meshconfig::{Cache, MeshConfig};
use bosun_runtime::{KindSnapshot, Precedence, Processor, ProcessorHandle, SnapshotSink, Source};
use bosun_schema::{default_registry, Registry, MESH_CONFIG_COLLECTION};

mod args;
mod patch;

pub use args::{Args, LoggingOptions};
pub use patch::PatchTable;

const MESH_CONFIG_POLL: Duration = Duration::from_secs(5);

/// Build a server from configuration. Steps run in a fixed order and
/// the first failure aborts the whole construction with context naming
/// the step.
pub async fn new_server(
    args: &Args,
    table: &PatchTable,
    convert_k8s_service: bool,
) -> Result<Server> {
    (table.configure_logging)(&args.logging).context("configuring logging")?;

    let interfaces =
        (table.new_interfaces)(&args.kube_config).context("connecting to the cluster")?;

    let registry = default_registry();
    if !args.disable_resource_ready_check {
        (table.verify_resource_types_presence)(interfaces.clone(), registry)
            .await
            .context("verifying upstream resource kinds")?;
    }

    let convert_cfg = convert::Config { convert_k8s_service };
    let cluster_source =
        (table.new_source)(interfaces, args.resync_period, registry, &convert_cfg)
            .context("constructing the cluster source")?;

    let listener = bind_listener(args, table).context("binding the distribution listener")?;

    let mesh_cache = (table.new_mesh_config_cache)(&args.mesh_config_path)
        .context("constructing the mesh config cache")?;

    let mut sources = vec![cluster_source];
    if let Some(path) = &args.config_path {
        sources.push(
            (table.fs_new)(path, registry, &convert_cfg)
                .context("constructing the filesystem source")?,
        );
    }

    let reporter = (table.mcp_metric_reporter)("bosun_mcp");

    let collections = registry
        .kinds()
        .iter()
        .filter(|s| convert_cfg.serves(s))
        .map(|s| s.collection.clone());
    let cache = Arc::new(SnapshotCache::new(collections));
    let mcp = Arc::new(McpServer::new(
        McpServerConfig { max_frame_bytes: args.max_frame_bytes, ..Default::default() },
        cache.clone(),
        reporter,
    ));

    let (shutdown, _) = watch::channel(false);
    Ok(Server {
        registry,
        convert_cfg,
        precedence: args.precedence,
        event_buffer: args.event_buffer,
        grace: args.shutdown_grace,
        sources,
        mesh_cache,
        cache,
        mcp,
        listener: Mutex::new(Some(listener)),
        running: Mutex::new(None),
        shutdown,
        closed: AtomicBool::new(false),
    })
}

fn bind_listener(args: &Args, table: &PatchTable) -> Result<std::net::TcpListener> {
    let address = args
        .api_address
        .strip_prefix("tcp://")
        .with_context(|| format!("unsupported address scheme: {}", args.api_address))?;
    if !args.insecure {
        bail!("secure transport requires credential material; none is configured");
    }
    let listener =
        (table.net_listen)(address).with_context(|| format!("binding {address}"))?;
    listener.set_nonblocking(true).context("setting the listener non-blocking")?;
    Ok(listener)
}

struct Running {
    event_tx: mpsc::Sender<Event>,
    processor: ProcessorHandle,
    mesh_task: JoinHandle<()>,
}

/// The assembled aggregation and distribution server.
pub struct Server {
    registry: &'static Registry,
    convert_cfg: convert::Config,
    precedence: Precedence,
    event_buffer: usize,
    grace: Duration,
    sources: Vec<Arc<dyn Source>>,
    mesh_cache: Arc<dyn Cache>,
    cache: Arc<SnapshotCache>,
    mcp: Arc<McpServer>,
    listener: Mutex<Option<std::net::TcpListener>>,
    running: Mutex<Option<Running>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("event_buffer", &self.event_buffer)
            .field("grace", &self.grace)
            .field("sources", &self.sources.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Number of active per-kind distribution channels.
    pub fn channel_count(&self) -> usize {
        self.mcp.channel_count()
    }

    /// Local address of the distribution listener, until `run` consumes
    /// it. Useful with an ephemeral bind.
    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().await.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Start every source and serve subscribers. Blocks until
    /// [`Server::close`] and returns promptly afterwards.
    pub async fn run(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.start().await?;
        let Some(std_listener) = self.listener.lock().await.take() else {
            bail!("server is already running");
        };
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .context("registering the listener with the runtime")?;
        Arc::clone(&self.mcp).serve(listener).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            bail!("server is already running");
        }
        // close() may have won the race since run()'s entry check.
        if self.closed.load(Ordering::SeqCst) {
            bail!("server is closed");
        }

        let (event_tx, processor) = Processor::spawn(
            self.registry,
            &self.convert_cfg,
            self.precedence,
            self.cache.clone() as Arc<dyn SnapshotSink>,
            self.event_buffer,
        );

        let mut started: Vec<&Arc<dyn Source>> = Vec::new();
        for source in &self.sources {
            if let Err(e) = source.start(event_tx.clone()).await {
                for s in started {
                    s.stop().await;
                }
                return Err(e).context("starting sources");
            }
            started.push(source);
        }

        let mesh_task = tokio::spawn(publish_mesh_config(
            self.mesh_cache.clone(),
            self.cache.clone(),
            self.shutdown.subscribe(),
        ));

        *running = Some(Running { event_tx, processor, mesh_task });
        info!(channels = self.mcp.channel_count(), "server started");
        Ok(())
    }

    /// Stop accepting subscribers, close existing connections with a
    /// clean end-of-stream, stop every source, then release the
    /// listener. Idempotent; safe before or after `run`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("close called again; nothing to do");
            return;
        }
        info!("shutting down");
        self.mcp.shutdown();
        self.shutdown.send_replace(true);

        for source in &self.sources {
            source.stop().await;
        }

        if let Some(running) = self.running.lock().await.take() {
            drop(running.event_tx);
            running.processor.join(self.grace).await;
            let mut mesh_task = running.mesh_task;
            if tokio::time::timeout(self.grace, &mut mesh_task).await.is_err() {
                warn!("mesh config task did not stop in time; aborting");
                mesh_task.abort();
            }
        }

        // Release the socket if `run` never consumed it.
        *self.listener.lock().await = None;
        info!("shutdown complete");
    }
}

/// Feed the mesh configuration value into its distribution channel,
/// re-publishing whenever the cache's value changes.
async fn publish_mesh_config(
    cache: Arc<dyn Cache>,
    sink: Arc<SnapshotCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut version = 0u64;
    let mut last: Option<Arc<MeshConfig>> = None;
    loop {
        let current = cache.get();
        let changed = match &last {
            Some(prev) => **prev != *current,
            None => true,
        };
        if changed {
            match serde_json::to_value(current.as_ref()) {
                Ok(body) => {
                    version += 1;
                    let resource = Resource::new(
                        Key::new("MeshConfig", FullName::cluster_scoped("default")),
                        Version(version.to_string()),
                        body,
                    );
                    sink.set(KindSnapshot {
                        collection: MESH_CONFIG_COLLECTION.to_string(),
                        version: version.to_string(),
                        resources: vec![resource],
                    });
                    last = Some(current);
                }
                Err(e) => warn!(error = %e, "mesh config not serializable; skipping publish"),
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(MESH_CONFIG_POLL) => {}
        }
    }
    debug!("mesh config publisher stopped");
}
