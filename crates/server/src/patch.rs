//! Constructor injection table.
//!
//! Every external side-effecting dependency of server construction is a
//! factory closure here, so tests can substitute fakes without touching
//! the wiring logic itself. Production code uses `PatchTable::default`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;

use bosun_convert as convert;
use bosun_fswatch::FsSource;
use bosun_kubehub::{ClusterSource, Interfaces, KubeInterfaces};
use bosun_mcp::monitoring::{MetricsReporter, Reporter};
use bosun_meshconfig::{Cache, FsCache};
use bosun_runtime::Source;
use bosun_schema::Registry;

use crate::args::LoggingOptions;

pub type ConfigureLogging = Box<dyn Fn(&LoggingOptions) -> Result<()> + Send + Sync>;
pub type NewInterfaces = Box<dyn Fn(&str) -> Result<Arc<dyn Interfaces>> + Send + Sync>;
pub type VerifyResourceTypesPresence = Box<
    dyn Fn(Arc<dyn Interfaces>, &'static Registry) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;
pub type NewSource = Box<
    dyn Fn(Arc<dyn Interfaces>, Duration, &'static Registry, &convert::Config) -> Result<Arc<dyn Source>>
        + Send
        + Sync,
>;
pub type NetListen = Box<dyn Fn(&str) -> std::io::Result<std::net::TcpListener> + Send + Sync>;
pub type NewMeshConfigCache = Box<dyn Fn(&Path) -> Result<Arc<dyn Cache>> + Send + Sync>;
pub type FsNew = Box<
    dyn Fn(&Path, &'static Registry, &convert::Config) -> Result<Arc<dyn Source>> + Send + Sync,
>;
pub type McpMetricReporter = Box<dyn Fn(&str) -> Arc<dyn Reporter> + Send + Sync>;

pub struct PatchTable {
    pub configure_logging: ConfigureLogging,
    pub new_interfaces: NewInterfaces,
    pub verify_resource_types_presence: VerifyResourceTypesPresence,
    pub new_source: NewSource,
    pub net_listen: NetListen,
    pub new_mesh_config_cache: NewMeshConfigCache,
    pub fs_new: FsNew,
    pub mcp_metric_reporter: McpMetricReporter,
}

impl Default for PatchTable {
    fn default() -> Self {
        Self {
            configure_logging: Box::new(configure_logging),
            new_interfaces: Box::new(|path| {
                Ok(Arc::new(KubeInterfaces::from_config_file(path)?) as Arc<dyn Interfaces>)
            }),
            verify_resource_types_presence: Box::new(|interfaces, registry| {
                async move {
                    bosun_kubehub::verify_resource_types_presence(interfaces.as_ref(), registry)
                        .await
                }
                .boxed()
            }),
            new_source: Box::new(|interfaces, resync, registry, cfg| {
                Ok(Arc::new(ClusterSource::new(interfaces, resync, registry, cfg)?)
                    as Arc<dyn Source>)
            }),
            net_listen: Box::new(|address: &str| std::net::TcpListener::bind(address)),
            new_mesh_config_cache: Box::new(|path| {
                Ok(Arc::new(FsCache::new(path)?) as Arc<dyn Cache>)
            }),
            fs_new: Box::new(|path, registry, cfg| {
                Ok(Arc::new(FsSource::new(path, registry, cfg)?) as Arc<dyn Source>)
            }),
            mcp_metric_reporter: Box::new(|_prefix| Arc::new(MetricsReporter::new())),
        }
    }
}

fn configure_logging(opts: &LoggingOptions) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&opts.level)
        .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {e}", opts.level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))
}
