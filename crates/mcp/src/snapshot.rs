//! Per-collection snapshot cache: the seam between the aggregation
//! processor (writer) and subscriber send loops (readers).

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

use bosun_runtime::{KindSnapshot, SnapshotSink};

struct Channel {
    current: ArcSwap<KindSnapshot>,
    // Bumped on every publish; send loops wake on it.
    signal: watch::Sender<u64>,
}

/// Holds the latest snapshot per collection. The channel set is fixed
/// at construction; publishes to unknown collections are dropped.
pub struct SnapshotCache {
    channels: FxHashMap<String, Channel>,
}

impl SnapshotCache {
    pub fn new(collections: impl IntoIterator<Item = String>) -> Self {
        let mut channels = FxHashMap::default();
        for collection in collections {
            let empty = KindSnapshot {
                collection: collection.clone(),
                version: "0".to_string(),
                resources: Vec::new(),
            };
            let (signal, _) = watch::channel(0u64);
            channels.insert(
                collection,
                Channel { current: ArcSwap::from_pointee(empty), signal },
            );
        }
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Active collection names, sorted for stable output.
    pub fn collections(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    pub fn get(&self, collection: &str) -> Option<Arc<KindSnapshot>> {
        self.channels.get(collection).map(|c| c.current.load_full())
    }

    /// Current snapshot plus a change signal for one collection.
    pub fn subscribe(
        &self,
        collection: &str,
    ) -> Option<(Arc<KindSnapshot>, watch::Receiver<u64>)> {
        self.channels
            .get(collection)
            .map(|c| (c.current.load_full(), c.signal.subscribe()))
    }

    /// Replace a collection's snapshot and wake its subscribers.
    pub fn set(&self, snapshot: KindSnapshot) {
        match self.channels.get(&snapshot.collection) {
            Some(channel) => {
                channel.current.store(Arc::new(snapshot));
                channel.signal.send_modify(|n| *n += 1);
            }
            None => {
                debug!(collection = %snapshot.collection, "dropping snapshot for unknown collection");
            }
        }
    }
}

impl SnapshotSink for SnapshotCache {
    fn publish(&self, snapshot: KindSnapshot) {
        self.set(snapshot);
    }
}
