//! Cluster-backed source: one watch loop per origin kind, raw objects
//! normalized through the converter before they reach the processor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bosun_convert as convert;
use bosun_core::{Change, Event, FullName, SourceOrigin, Version};
use bosun_runtime::{Source, SourceError};
use bosun_schema::{Gvk, KindSpec, Registry};

use crate::{Interfaces, RawEvent};

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Watches every served origin kind through the interface provider with
/// a configurable resync interval.
pub struct ClusterSource {
    interfaces: Arc<dyn Interfaces>,
    specs: Vec<KindSpec>,
    convert_cfg: convert::Config,
    resync: Duration,
    running: Mutex<Option<Running>>,
}

impl ClusterSource {
    pub fn new(
        interfaces: Arc<dyn Interfaces>,
        resync: Duration,
        registry: &Registry,
        convert_cfg: &convert::Config,
    ) -> Result<Self, SourceError> {
        let specs: Vec<KindSpec> = registry
            .watched()
            .filter(|s| convert_cfg.serves(s))
            .cloned()
            .collect();
        if specs.is_empty() {
            return Err(SourceError::Config("registry has no watched kinds to serve".into()));
        }
        Ok(Self {
            interfaces,
            specs,
            convert_cfg: convert_cfg.clone(),
            resync,
            running: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Source for ClusterSource {
    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<(), SourceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SourceError::AlreadyStarted);
        }
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let loop_ = KindLoop {
                interfaces: self.interfaces.clone(),
                spec: spec.clone(),
                convert_cfg: self.convert_cfg.clone(),
                resync: self.resync,
                tx: tx.clone(),
                shutdown: shutdown.subscribe(),
                known: FxHashMap::default(),
                seq: 0,
            };
            tasks.push(tokio::spawn(loop_.run()));
        }
        info!(kinds = self.specs.len(), "cluster source started");
        *running = Some(Running { shutdown, tasks });
        Ok(())
    }

    async fn stop(&self) {
        let mut guard = self.running.lock().await;
        let Some(mut running) = guard.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in &mut running.tasks {
            if tokio::time::timeout(STOP_GRACE, &mut *task).await.is_err() {
                warn!("cluster watch loop did not stop in time; aborting");
                task.abort();
            }
        }
        info!("cluster source stopped");
    }
}

struct KindLoop {
    interfaces: Arc<dyn Interfaces>,
    spec: KindSpec,
    convert_cfg: convert::Config,
    resync: Duration,
    tx: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
    known: FxHashMap<FullName, Version>,
    seq: u64,
}

impl KindLoop {
    async fn run(mut self) {
        let Some(origin) = self.spec.origin.clone() else {
            return;
        };
        // Polled alongside handler bodies that borrow `self`.
        let mut shutdown = self.shutdown.clone();

        // Watch before list, so nothing slips between the seed listing
        // and the first watch event. Early events buffer in the stream.
        let mut stream = match self.open_watch(&origin).await {
            Some(s) => s,
            None => return,
        };
        let Some(items) = self.list_with_retry(&origin).await else {
            return;
        };
        if !self.apply_listing(items, true).await {
            return;
        }
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync,
            self.resync,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                ev = stream.next() => match ev {
                    Some(RawEvent::Applied(raw)) => {
                        if !self.apply_one(&raw).await {
                            break;
                        }
                    }
                    Some(RawEvent::Deleted(raw)) => {
                        if !self.delete_one(&raw).await {
                            break;
                        }
                    }
                    Some(RawEvent::Restarted(list)) => {
                        if !self.apply_listing(list, false).await {
                            break;
                        }
                    }
                    None => {
                        // Backend stream ended; re-open after a pause.
                        warn!(origin = %origin, "watch stream ended; reopening");
                        match self.open_watch(&origin).await {
                            Some(s) => stream = s,
                            None => break,
                        }
                    }
                },
                _ = ticker.tick() => {
                    match self.interfaces.list(&origin).await {
                        Ok(items) => {
                            if !self.apply_listing(items, false).await {
                                break;
                            }
                        }
                        Err(e) => warn!(origin = %origin, error = %e, "resync listing failed"),
                    }
                }
            }
        }
        debug!(kind = %self.spec.kind, "cluster watch loop stopped");
    }

    async fn list_with_retry(&mut self, origin: &Gvk) -> Option<Vec<serde_json::Value>> {
        let mut backoff = Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                res = self.interfaces.list(origin) => match res {
                    Ok(items) => return Some(items),
                    Err(e) => {
                        warn!(origin = %origin, error = %e, "initial listing failed; retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                },
            }
        }
    }

    async fn open_watch(&mut self, origin: &Gvk) -> Option<BoxStream<'static, RawEvent>> {
        let mut backoff = Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                res = self.interfaces.watch(origin) => match res {
                    Ok(stream) => return Some(stream),
                    Err(e) => {
                        warn!(origin = %origin, error = %e, "opening watch failed; retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                },
            }
        }
    }

    /// Diff a full listing against the known set. `initial` additionally
    /// emits the end-of-listing marker.
    async fn apply_listing(&mut self, items: Vec<serde_json::Value>, initial: bool) -> bool {
        let mut seen: FxHashMap<FullName, Version> = FxHashMap::default();
        for raw in &items {
            match convert::convert(&self.spec, raw, &self.convert_cfg) {
                Ok(resources) => {
                    for r in resources {
                        seen.insert(r.key.name.clone(), r.version.clone());
                        match self.known.get(&r.key.name) {
                            None => {
                                if !self.emit(Change::Added(r)).await {
                                    return false;
                                }
                            }
                            Some(v) if *v != r.version => {
                                if !self.emit(Change::Updated(r)).await {
                                    return false;
                                }
                            }
                            Some(_) => {}
                        }
                    }
                }
                Err(e) => convert::report_failure(&self.spec.kind, raw_name(raw), &e),
            }
        }
        let gone: Vec<FullName> =
            self.known.keys().filter(|n| !seen.contains_key(n)).cloned().collect();
        for name in gone {
            let key = bosun_core::Key::new(&self.spec.kind, name);
            if !self.emit(Change::Deleted(key)).await {
                return false;
            }
        }
        self.known = seen;
        if initial && !self.emit(Change::FullSync { kind: self.spec.kind.clone() }).await {
            return false;
        }
        true
    }

    async fn apply_one(&mut self, raw: &serde_json::Value) -> bool {
        match convert::convert(&self.spec, raw, &self.convert_cfg) {
            Ok(resources) => {
                for r in resources {
                    let change = match self.known.get(&r.key.name) {
                        None => Change::Added(r.clone()),
                        Some(v) if *v != r.version => Change::Updated(r.clone()),
                        Some(_) => continue,
                    };
                    self.known.insert(r.key.name.clone(), r.version.clone());
                    if !self.emit(change).await {
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                convert::report_failure(&self.spec.kind, raw_name(raw), &e);
                true
            }
        }
    }

    async fn delete_one(&mut self, raw: &serde_json::Value) -> bool {
        match convert::key_of(&self.spec, raw) {
            Ok(key) => {
                if self.known.remove(&key.name).is_some() {
                    return self.emit(Change::Deleted(key)).await;
                }
                true
            }
            Err(e) => {
                convert::report_failure(&self.spec.kind, raw_name(raw), &e);
                true
            }
        }
    }

    async fn emit(&mut self, change: Change) -> bool {
        self.seq += 1;
        self.tx
            .send(Event::new(self.seq, SourceOrigin::Cluster, change))
            .await
            .is_ok()
    }
}

fn raw_name(raw: &serde_json::Value) -> Option<&str> {
    raw.get("metadata").and_then(|m| m.get("name")).and_then(|n| n.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInterfaces;
    use bosun_schema::default_registry;
    use std::time::Duration;

    fn gateway(name: &str, version: &str) -> serde_json::Value {
        serde_json::json!({
            "metadata": {
                "name": name,
                "namespace": "default",
                "resourceVersion": version,
            },
            "spec": { "selector": {} },
        })
    }

    fn gateway_origin() -> Gvk {
        "networking.istio.io/v1alpha3/Gateway".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeds_then_follows_watch_events() {
        let mock = Arc::new(MockInterfaces::serving_default_registry());
        mock.set_list(gateway_origin(), vec![gateway("gw", "1")]);

        let source = ClusterSource::new(
            mock.clone(),
            Duration::from_secs(3600),
            default_registry(),
            &convert::Config::default(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx).await.unwrap();

        // Gateway kind: one seeded add, then its full-sync marker.
        let mut saw_add = false;
        let mut saw_sync = false;
        while !(saw_add && saw_sync) {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            match ev.change {
                Change::Added(r) if r.key.kind == "Gateway" => saw_add = true,
                Change::FullSync { ref kind } if kind == "Gateway" => {
                    assert!(saw_add, "full sync must follow the seed listing");
                    saw_sync = true;
                }
                _ => {}
            }
        }

        mock.push(&gateway_origin(), RawEvent::Applied(gateway("gw", "2")));
        mock.push(&gateway_origin(), RawEvent::Deleted(gateway("gw", "2")));

        let mut updated = false;
        let mut deleted = false;
        while !(updated && deleted) {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            match ev.change {
                Change::Updated(r) if r.key.kind == "Gateway" => updated = true,
                Change::Deleted(k) if k.kind == "Gateway" => deleted = true,
                _ => {}
            }
        }

        source.stop().await;
        source.stop().await; // idempotent
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_sibling_does_not_block_the_batch() {
        let mock = Arc::new(MockInterfaces::serving_default_registry());
        mock.set_list(
            gateway_origin(),
            vec![
                gateway("good-a", "1"),
                serde_json::json!({ "metadata": {}, "spec": {} }),
                gateway("good-b", "1"),
            ],
        );

        let source = ClusterSource::new(
            mock.clone(),
            Duration::from_secs(3600),
            default_registry(),
            &convert::Config::default(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx).await.unwrap();

        let mut names = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            match ev.change {
                Change::Added(r) if r.key.kind == "Gateway" => names.push(r.key.name.name.clone()),
                Change::FullSync { ref kind } if kind == "Gateway" => break,
                _ => {}
            }
        }
        names.sort();
        assert_eq!(names, vec!["good-a", "good-b"]);

        source.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mock = Arc::new(MockInterfaces::serving_default_registry());
        let source = ClusterSource::new(
            mock,
            Duration::from_secs(3600),
            default_registry(),
            &convert::Config::default(),
        )
        .unwrap();
        let (tx, _rx) = mpsc::channel(8);
        source.start(tx.clone()).await.unwrap();
        assert!(matches!(source.start(tx).await, Err(SourceError::AlreadyStarted)));
        source.stop().await;
    }
}
