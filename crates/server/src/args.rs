//! Startup configuration for the server.

use std::path::PathBuf;
use std::time::Duration;

use bosun_runtime::Precedence;

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter directive, same grammar as `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Everything the lifecycle controller needs to build a server.
#[derive(Debug, Clone)]
pub struct Args {
    /// Path to a kubeconfig file; empty means the ambient environment
    /// (in-cluster config or `KUBECONFIG`).
    pub kube_config: String,
    /// Full relisting interval for the cluster source.
    pub resync_period: Duration,
    /// Distribution listener address, `tcp://host:port`. Port 0 binds
    /// an ephemeral port.
    pub api_address: String,
    /// Plaintext transport. Secure mode needs credential material this
    /// build does not carry, so construction fails when this is false.
    pub insecure: bool,
    /// Optional directory of YAML documents served as an additional
    /// source.
    pub config_path: Option<PathBuf>,
    /// Mesh configuration file.
    pub mesh_config_path: PathBuf,
    /// Skip the upstream kind presence check (constrained clusters).
    pub disable_resource_ready_check: bool,
    /// Conflict policy when cluster and file sources disagree.
    pub precedence: Precedence,
    /// Source event channel capacity.
    pub event_buffer: usize,
    /// Largest wire frame the distribution server accepts.
    pub max_frame_bytes: usize,
    /// Bound on shutdown, per task group.
    pub shutdown_grace: Duration,
    pub logging: LoggingOptions,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            kube_config: String::new(),
            resync_period: Duration::from_secs(900),
            api_address: "tcp://0.0.0.0:9901".to_string(),
            insecure: false,
            config_path: None,
            mesh_config_path: PathBuf::from("/etc/bosun/meshconfig.yaml"),
            disable_resource_ready_check: false,
            precedence: Precedence::LastWriter,
            event_buffer: 2048,
            max_frame_bytes: 4 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
            logging: LoggingOptions::default(),
        }
    }
}
