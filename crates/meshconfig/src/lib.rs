//! Mesh-wide configuration cache.
//!
//! One always-current value, replaced wholesale on refresh; never an
//! event stream. The file-backed cache reloads when the file changes
//! and keeps the last good value when a reload fails to parse.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading mesh config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing mesh config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("watching mesh config: {0}")]
    Watch(#[from] notify::Error),
}

/// How ingress resources are claimed by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngressControllerMode {
    Off,
    #[default]
    Default,
    Strict,
}

/// Mesh-wide settings served to subscribers alongside the resource
/// collections. Unknown fields in the file are ignored; absent fields
/// take these defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub ingress_class: String,
    pub ingress_controller_mode: IngressControllerMode,
    pub trust_domain: String,
    pub root_namespace: String,
    pub connect_timeout_ms: u64,
    pub disable_policy_checks: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ingress_class: "istio".to_string(),
            ingress_controller_mode: IngressControllerMode::Default,
            trust_domain: "cluster.local".to_string(),
            root_namespace: "istio-system".to_string(),
            connect_timeout_ms: 10_000,
            disable_policy_checks: false,
        }
    }
}

/// Read access to the current mesh configuration.
pub trait Cache: Send + Sync {
    fn get(&self) -> Arc<MeshConfig>;
}

/// Fixed-value cache for tests and wiring without a config file.
#[derive(Default)]
pub struct InMemory {
    value: RwLock<Arc<MeshConfig>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cfg: MeshConfig) {
        let mut guard = self.value.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(cfg);
    }
}

impl Cache for InMemory {
    fn get(&self) -> Arc<MeshConfig> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// File-backed cache. Construction fails if the file cannot be read or
/// parsed; afterwards the value refreshes whenever the file changes.
pub struct FsCache {
    value: Arc<RwLock<Arc<MeshConfig>>>,
    // Held for its side effect: dropping it stops the watch and lets the
    // reload task drain out.
    _watcher: RecommendedWatcher,
}

impl FsCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let initial = load(&path)?;
        let value = Arc::new(RwLock::new(Arc::new(initial)));

        // Watch the parent directory: editors and config reloaders tend
        // to replace the file rather than write it in place.
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let reload_value = Arc::clone(&value);
        let reload_path = path.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !event.paths.iter().any(|p| p.file_name() == reload_path.file_name()) {
                    continue;
                }
                match load(&reload_path) {
                    Ok(cfg) => {
                        let mut guard = reload_value.write().unwrap_or_else(|e| e.into_inner());
                        if **guard != cfg {
                            info!(path = %reload_path.display(), "mesh config reloaded");
                            *guard = Arc::new(cfg);
                        }
                    }
                    Err(e) => {
                        warn!(path = %reload_path.display(), error = %e, "mesh config reload failed; keeping last good value");
                    }
                }
            }
            debug!("mesh config watch ended");
        });

        Ok(Self { value, _watcher: watcher })
    }
}

impl Cache for FsCache {
    fn get(&self) -> Arc<MeshConfig> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn load(path: &Path) -> Result<MeshConfig, CacheError> {
    let text = std::fs::read_to_string(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| CacheError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
