//! In-memory source: the substitutable seam lifecycle tests patch in,
//! and a convenient feeder for local experiments.

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use async_trait::async_trait;
use bosun_core::{Change, Event, Key, Resource, SourceOrigin};

use crate::{Source, SourceError};

#[derive(Default)]
struct State {
    started: bool,
    tx: Option<mpsc::Sender<Event>>,
    items: FxHashMap<Key, Resource>,
    seq: FxHashMap<String, u64>,
    synced: FxHashSet<String>,
}

impl State {
    fn next_seq(&mut self, kind: &str) -> u64 {
        let n = self.seq.entry(kind.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

/// Source fed by explicit `set`/`delete` calls instead of a backend.
///
/// Items applied before `start` are replayed as `Added` events followed
/// by a `FullSync` per kind, matching what a backend's initial listing
/// produces.
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<State>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a resource, emitting `Added`/`Updated` when
    /// started.
    pub async fn set(&self, resource: Resource) {
        let mut st = self.state.lock().await;
        let kind = resource.key.kind.clone();
        let existed = st.items.insert(resource.key.clone(), resource.clone()).is_some();
        if !st.started {
            return;
        }
        let change = if existed {
            Change::Updated(resource)
        } else {
            Change::Added(resource)
        };
        Self::emit(&mut st, &kind, change).await;
        if !st.synced.contains(&kind) {
            st.synced.insert(kind.clone());
            Self::emit(&mut st, &kind, Change::FullSync { kind: kind.clone() }).await;
        }
    }

    /// Remove a resource, emitting `Deleted` when started and present.
    pub async fn delete(&self, key: Key) {
        let mut st = self.state.lock().await;
        if st.items.remove(&key).is_none() {
            return;
        }
        if st.started {
            let kind = key.kind.clone();
            Self::emit(&mut st, &kind, Change::Deleted(key)).await;
        }
    }

    async fn emit(st: &mut State, kind: &str, change: Change) {
        let seq = st.next_seq(kind);
        if let Some(tx) = &st.tx {
            let _ = tx.send(Event::new(seq, SourceOrigin::InMemory, change)).await;
        }
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<(), SourceError> {
        let mut st = self.state.lock().await;
        if st.started {
            return Err(SourceError::AlreadyStarted);
        }
        st.started = true;
        st.tx = Some(tx);

        // Replay current contents as the initial listing.
        let items: Vec<Resource> = st.items.values().cloned().collect();
        let kinds: FxHashSet<String> =
            items.iter().map(|r| r.key.kind.clone()).collect();
        for r in items {
            let kind = r.key.kind.clone();
            Self::emit(&mut st, &kind, Change::Added(r)).await;
        }
        for kind in kinds {
            st.synced.insert(kind.clone());
            Self::emit(&mut st, &kind, Change::FullSync { kind: kind.clone() }).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        let mut st = self.state.lock().await;
        if st.tx.take().is_some() {
            debug!("in-memory source stopped");
        }
        st.started = false;
        st.synced.clear();
        st.seq.clear();
    }
}
