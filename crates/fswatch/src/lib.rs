//! Filesystem-backed source: a directory tree of YAML documents watched
//! for changes. Each rescan is diffed against the previous view, so
//! subscribers see the same add/update/delete stream the cluster source
//! produces.

#![forbid(unsafe_code)]

use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::{FxHashMap, FxHasher};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bosun_convert as convert;
use bosun_core::{Change, Event, Key, Resource, SourceOrigin};
use bosun_runtime::{Source, SourceError};
use bosun_schema::{Gvk, KindSpec, Registry};

const DEBOUNCE: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Source over a static configuration directory.
pub struct FsSource {
    dir: PathBuf,
    specs: Vec<KindSpec>,
    convert_cfg: convert::Config,
    running: Mutex<Option<Running>>,
}

impl FsSource {
    pub fn new(
        dir: impl AsRef<Path>,
        registry: &Registry,
        convert_cfg: &convert::Config,
    ) -> Result<Self, SourceError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(SourceError::Config(format!(
                "config path is not a directory: {}",
                dir.display()
            )));
        }
        let specs: Vec<KindSpec> = registry
            .watched()
            .filter(|s| convert_cfg.serves(s))
            .cloned()
            .collect();
        Ok(Self { dir, specs, convert_cfg: convert_cfg.clone(), running: Mutex::new(None) })
    }
}

#[async_trait]
impl Source for FsSource {
    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<(), SourceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SourceError::AlreadyStarted);
        }

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| SourceError::Backend(e.into()))?;
        watcher
            .watch(&self.dir, RecursiveMode::Recursive)
            .map_err(|e| SourceError::Backend(e.into()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scanner = Scanner {
            dir: self.dir.clone(),
            specs: self.specs.clone(),
            convert_cfg: self.convert_cfg.clone(),
            tx,
            known: FxHashMap::default(),
            seq: FxHashMap::default(),
            next_version: 0,
        };
        let task = tokio::spawn(run(scanner, watcher, notify_rx, shutdown_rx));
        info!(dir = %self.dir.display(), "filesystem source started");
        *running = Some(Running { shutdown, task });
        Ok(())
    }

    async fn stop(&self) {
        let mut guard = self.running.lock().await;
        let Some(mut running) = guard.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut running.task).await.is_err() {
            warn!("filesystem scan task did not stop in time; aborting");
            running.task.abort();
        }
        info!("filesystem source stopped");
    }
}

async fn run(
    mut scanner: Scanner,
    watcher: RecommendedWatcher,
    mut notify_rx: mpsc::UnboundedReceiver<notify::Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The watcher must stay alive as long as this task runs.
    let _watcher = watcher;

    if !scanner.rescan(true).await {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            ev = notify_rx.recv() => {
                if ev.is_none() {
                    break;
                }
                // Collapse bursts of events into one rescan.
                tokio::time::sleep(DEBOUNCE).await;
                while notify_rx.try_recv().is_ok() {}
                if !scanner.rescan(false).await {
                    break;
                }
            }
        }
    }
    debug!("filesystem source loop stopped");
}

struct Scanner {
    dir: PathBuf,
    specs: Vec<KindSpec>,
    convert_cfg: convert::Config,
    tx: mpsc::Sender<Event>,
    /// Content hash and minted version per live identity.
    known: FxHashMap<Key, (u64, String)>,
    seq: FxHashMap<String, u64>,
    next_version: u64,
}

impl Scanner {
    /// Walk the tree, convert every recognized document, and emit the
    /// diff against the previous scan. Returns false when the event
    /// channel is gone.
    async fn rescan(&mut self, initial: bool) -> bool {
        let mut files = Vec::new();
        collect_yaml_files(&self.dir, &mut files);
        files.sort();

        let mut seen: FxHashMap<Key, (u64, String, Resource)> = FxHashMap::default();
        for path in &files {
            let text = match std::fs::read_to_string(path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            for doc in split_documents(&text, path) {
                self.convert_document(doc, &mut seen);
            }
        }

        // Adds and updates, then deletes for identities that vanished.
        for (key, (hash, version, mut resource)) in seen.iter().map(|(k, v)| (k.clone(), v.clone()))
        {
            resource.version = bosun_core::Version(version.clone());
            match self.known.get(&key) {
                None => {
                    self.known.insert(key, (hash, version));
                    if !self.emit(Change::Added(resource)).await {
                        return false;
                    }
                }
                Some((old_hash, _)) if *old_hash != hash => {
                    self.known.insert(key, (hash, version));
                    if !self.emit(Change::Updated(resource)).await {
                        return false;
                    }
                }
                Some(_) => {}
            }
        }
        let gone: Vec<Key> =
            self.known.keys().filter(|k| !seen.contains_key(k)).cloned().collect();
        for key in gone {
            self.known.remove(&key);
            if !self.emit(Change::Deleted(key)).await {
                return false;
            }
        }

        if initial {
            for spec in self.specs.clone() {
                if !self.emit(Change::FullSync { kind: spec.kind.clone() }).await {
                    return false;
                }
            }
        }
        true
    }

    fn convert_document(
        &mut self,
        doc: serde_json::Value,
        seen: &mut FxHashMap<Key, (u64, String, Resource)>,
    ) {
        let Some(spec) = self.spec_for(&doc) else {
            return;
        };
        let hash = content_hash(&doc);
        match convert::convert(&spec, &doc, &self.convert_cfg) {
            Ok(resources) => {
                for r in resources {
                    let version = match self.known.get(&r.key) {
                        // Unchanged content keeps its minted version.
                        Some((old_hash, v)) if *old_hash == hash => v.clone(),
                        _ => {
                            self.next_version += 1;
                            self.next_version.to_string()
                        }
                    };
                    seen.insert(r.key.clone(), (hash, version, r));
                }
            }
            Err(e) => {
                convert::report_failure(
                    &spec.kind,
                    doc.get("metadata")
                        .and_then(|m| m.get("name"))
                        .and_then(|n| n.as_str()),
                    &e,
                );
            }
        }
    }

    /// Match a document's apiVersion/kind against the served specs.
    fn spec_for(&self, doc: &serde_json::Value) -> Option<KindSpec> {
        let api_version = doc.get("apiVersion")?.as_str()?;
        let kind = doc.get("kind")?.as_str()?;
        let origin: Gvk = format!("{api_version}/{kind}").parse().ok()?;
        self.specs.iter().find(|s| s.origin.as_ref() == Some(&origin)).cloned()
    }

    async fn emit(&mut self, change: Change) -> bool {
        let seq = {
            let n = self.seq.entry(change.kind().to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.tx.send(Event::new(seq, SourceOrigin::File, change)).await.is_ok()
    }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}

/// Split a multi-document YAML file on `---` separators, isolating
/// per-document parse failures.
fn split_documents(text: &str, path: &Path) -> Vec<serde_json::Value> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            chunks.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    chunks.push(current);

    let mut out = Vec::new();
    for chunk in chunks {
        if chunk.trim().is_empty() {
            continue;
        }
        match serde_yaml::from_str::<serde_yaml::Value>(&chunk) {
            Ok(serde_yaml::Value::Null) => {}
            Ok(value) => match serde_json::to_value(value) {
                Ok(json) => out.push(json),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping non-JSON-representable document");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping malformed document");
            }
        }
    }
    out
}

fn content_hash(doc: &serde_json::Value) -> u64 {
    let mut hasher = FxHasher::default();
    if let Ok(text) = serde_json::to_string(doc) {
        hasher.write(text.as_bytes());
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_schema::default_registry;

    const GATEWAY_DOC: &str = "\
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
  namespace: edge
spec:
  selector:
    istio: ingressgateway
";

    async fn next_change(rx: &mut mpsc::Receiver<Event>) -> Change {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .change
    }

    async fn wait_for(
        rx: &mut mpsc::Receiver<Event>,
        mut pred: impl FnMut(&Change) -> bool,
    ) -> Change {
        loop {
            let change = next_change(rx).await;
            if pred(&change) {
                return change;
            }
        }
    }

    #[test]
    fn construction_requires_a_directory() {
        let err = FsSource::new("/no/such/dir", default_registry(), &convert::Config::default());
        assert!(matches!(err, Err(SourceError::Config(_))));
    }

    #[test]
    fn multi_document_files_split_and_isolate_failures() {
        let text = format!("{GATEWAY_DOC}---\n:[ broken\n---\n{GATEWAY_DOC}");
        let docs = split_documents(&text, Path::new("x.yaml"));
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initial_scan_then_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gw.yaml"), GATEWAY_DOC).unwrap();

        let source =
            FsSource::new(dir.path(), default_registry(), &convert::Config::default()).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx).await.unwrap();

        let added = wait_for(&mut rx, |c| matches!(c, Change::Added(_))).await;
        let Change::Added(r) = added else { unreachable!() };
        assert_eq!(r.key.kind, "Gateway");
        assert_eq!(r.key.name.to_string(), "edge/gw");
        let first_version = r.version.clone();

        // Every served kind gets its end-of-listing marker.
        let mut synced = 0;
        while synced < 6 {
            if matches!(next_change(&mut rx).await, Change::FullSync { .. }) {
                synced += 1;
            }
        }

        // Modify: same identity, new content, new version.
        std::fs::write(
            dir.path().join("gw.yaml"),
            GATEWAY_DOC.replace("ingressgateway", "egressgateway"),
        )
        .unwrap();
        let updated = wait_for(&mut rx, |c| matches!(c, Change::Updated(_))).await;
        let Change::Updated(r) = updated else { unreachable!() };
        assert_ne!(r.version, first_version);

        // Delete the file: the identity disappears.
        std::fs::remove_file(dir.path().join("gw.yaml")).unwrap();
        let deleted = wait_for(&mut rx, |c| matches!(c, Change::Deleted(_))).await;
        let Change::Deleted(key) = deleted else { unreachable!() };
        assert_eq!(key.name.to_string(), "edge/gw");

        source.stop().await;
        source.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_kinds_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cm.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: junk\n",
        )
        .unwrap();

        let source =
            FsSource::new(dir.path(), default_registry(), &convert::Config::default()).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx).await.unwrap();

        // Only full-sync markers; the ConfigMap never surfaces.
        let mut synced = 0;
        while synced < 6 {
            match next_change(&mut rx).await {
                Change::FullSync { .. } => synced += 1,
                other => panic!("unexpected change: {other:?}"),
            }
        }
        source.stop().await;
    }
}
