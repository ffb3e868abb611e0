//! Per-kind event folding and snapshot publication.
//!
//! One router task fans the shared source stream out to one fold task
//! per served kind. Each fold task is the sole writer of its
//! collection; readers only ever see the immutable snapshots it hands
//! to the sink.

use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bosun_core::{Change, Event, FullName, Resource, SourceOrigin};
use bosun_schema::Registry;

/// Immutable point-in-time copy of one kind's collection.
#[derive(Debug, Clone)]
pub struct KindSnapshot {
    pub collection: String,
    pub version: String,
    /// Sorted by qualified name for deterministic wire output.
    pub resources: Vec<Resource>,
}

/// Where minted snapshots go; implemented by the distribution layer.
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: KindSnapshot);
}

/// Policy when two sources disagree about one resource identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    /// Whichever source spoke last wins.
    #[default]
    LastWriter,
    /// A file-origin event never replaces or deletes a live
    /// cluster-origin entry.
    PreferCluster,
}

impl Precedence {
    fn blocks(self, current: SourceOrigin, incoming: SourceOrigin) -> bool {
        matches!(self, Precedence::PreferCluster)
            && current == SourceOrigin::Cluster
            && incoming != SourceOrigin::Cluster
    }
}

/// Handle over the router and fold tasks; joined at shutdown.
pub struct ProcessorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Wait for all tasks to drain, aborting stragglers once the grace
    /// period runs out. Tasks end on their own when every event sender
    /// is dropped.
    pub async fn join(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for task in &mut self.tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut *task).await.is_err() {
                warn!("processor task did not drain in time; aborting");
                task.abort();
            }
        }
    }
}

pub struct Processor;

impl Processor {
    /// Spawn the router and one fold task per served kind. Returns the
    /// event sender to hand to sources and the join handle.
    pub fn spawn(
        registry: &Registry,
        convert_cfg: &bosun_convert::Config,
        precedence: Precedence,
        sink: std::sync::Arc<dyn SnapshotSink>,
        buffer: usize,
    ) -> (mpsc::Sender<Event>, ProcessorHandle) {
        let (tx, mut rx) = mpsc::channel::<Event>(buffer);

        let mut tasks = Vec::new();
        let mut routes: FxHashMap<String, mpsc::Sender<Event>> = FxHashMap::default();
        for spec in registry.kinds() {
            if !convert_cfg.serves(spec) {
                continue;
            }
            let (kind_tx, kind_rx) = mpsc::channel::<Event>(buffer);
            routes.insert(spec.kind.clone(), kind_tx);
            let fold = Fold::new(spec.kind.clone(), spec.collection.clone(), precedence, sink.clone());
            tasks.push(tokio::spawn(fold.run(kind_rx)));
        }

        tasks.push(tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match routes.get(ev.change.kind()) {
                    Some(kind_tx) => {
                        if kind_tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!(kind = %ev.change.kind(), "dropping event for unserved kind");
                    }
                }
            }
            // Dropping `routes` closes every per-kind channel.
            info!("event router stopped");
        }));

        (tx, ProcessorHandle { tasks })
    }
}

struct Entry {
    resource: Resource,
    origin: SourceOrigin,
}

struct Fold {
    kind: String,
    collection: String,
    precedence: Precedence,
    sink: std::sync::Arc<dyn SnapshotSink>,
    items: FxHashMap<FullName, Entry>,
    version: u64,
    synced: bool,
}

impl Fold {
    fn new(
        kind: String,
        collection: String,
        precedence: Precedence,
        sink: std::sync::Arc<dyn SnapshotSink>,
    ) -> Self {
        Self {
            kind,
            collection,
            precedence,
            sink,
            items: FxHashMap::default(),
            version: 0,
            synced: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(ev) = rx.recv().await {
            counter!("bosun_events_processed_total", 1u64);
            match ev.change {
                Change::FullSync { .. } => {
                    self.synced = true;
                    self.publish();
                }
                change => {
                    if self.apply(change, ev.origin) && self.synced {
                        self.publish();
                    }
                }
            }
        }
        debug!(kind = %self.kind, "fold task stopped");
    }

    /// Mutate the collection; returns whether anything changed.
    fn apply(&mut self, change: Change, origin: SourceOrigin) -> bool {
        match change {
            Change::Added(r) | Change::Updated(r) => {
                if let Some(cur) = self.items.get(&r.key.name) {
                    if self.precedence.blocks(cur.origin, origin) {
                        debug!(key = %r.key, origin = %origin, "precedence policy ignored event");
                        return false;
                    }
                }
                self.items.insert(r.key.name.clone(), Entry { resource: r, origin });
                true
            }
            Change::Deleted(k) => match self.items.get(&k.name) {
                Some(cur) if self.precedence.blocks(cur.origin, origin) => {
                    debug!(key = %k, origin = %origin, "precedence policy ignored delete");
                    false
                }
                Some(_) => {
                    self.items.remove(&k.name);
                    true
                }
                None => false,
            },
            Change::FullSync { .. } => unreachable!("handled by run"),
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let mut resources: Vec<Resource> =
            self.items.values().map(|e| e.resource.clone()).collect();
        resources.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        counter!("bosun_snapshots_published_total", 1u64);
        self.sink.publish(KindSnapshot {
            collection: self.collection.clone(),
            version: self.version.to_string(),
            resources,
        });
    }
}
