//! In-process fake of the interface-provider contract, for tests and
//! constrained environments.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use bosun_schema::{default_registry, Gvk};

use crate::{Interfaces, RawEvent};

/// Fake cluster handle: serves a fixed kind list, listings set by the
/// test, and watch streams fed through [`MockInterfaces::push`].
pub struct MockInterfaces {
    served: Vec<Gvk>,
    items: Mutex<FxHashMap<Gvk, Vec<serde_json::Value>>>,
    watchers: Mutex<FxHashMap<Gvk, Vec<mpsc::UnboundedSender<RawEvent>>>>,
}

impl MockInterfaces {
    pub fn new(served: Vec<Gvk>) -> Self {
        Self {
            served,
            items: Mutex::new(FxHashMap::default()),
            watchers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fake that serves every origin kind in the default registry, so
    /// presence verification passes.
    pub fn serving_default_registry() -> Self {
        let served = default_registry()
            .watched()
            .filter_map(|s| s.origin.clone())
            .collect();
        Self::new(served)
    }

    /// Replace the listing returned for one origin kind.
    pub fn set_list(&self, origin: Gvk, items: Vec<serde_json::Value>) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).insert(origin, items);
    }

    /// Feed an event to every open watch stream for `origin`.
    pub fn push(&self, origin: &Gvk, event: RawEvent) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = watchers.get_mut(origin) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl Interfaces for MockInterfaces {
    async fn served_kinds(&self) -> Result<Vec<Gvk>> {
        Ok(self.served.clone())
    }

    async fn list(&self, origin: &Gvk) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(origin)
            .cloned()
            .unwrap_or_default())
    }

    async fn watch(&self, origin: &Gvk) -> Result<BoxStream<'static, RawEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(origin.clone())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
