use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info, warn};

use bosun_runtime::Precedence;
use bosun_server::{new_server, Args, LoggingOptions, PatchTable};

#[derive(Parser, Debug)]
#[command(name = "bosund", version, about = "Mesh configuration aggregation server")]
struct Cli {
    /// Path to a kubeconfig file (default: ambient environment)
    #[arg(long = "kubeconfig", default_value = "")]
    kubeconfig: String,

    /// Cluster relist interval in seconds
    #[arg(long = "resync-period", default_value_t = 900)]
    resync_period_secs: u64,

    /// Distribution listener address
    #[arg(long = "address", default_value = "tcp://0.0.0.0:9901")]
    address: String,

    /// Serve plaintext instead of TLS
    #[arg(long = "insecure", action = ArgAction::SetTrue)]
    insecure: bool,

    /// Directory of YAML documents served as an additional source
    #[arg(long = "config-path")]
    config_path: Option<PathBuf>,

    /// Mesh configuration file
    #[arg(long = "meshconfig", default_value = "/etc/bosun/meshconfig.yaml")]
    meshconfig: PathBuf,

    /// Synthesize the service model from native v1/Service objects
    #[arg(long = "convert-k8s-service", action = ArgAction::SetTrue)]
    convert_k8s_service: bool,

    /// Conflict policy when cluster and file sources disagree
    #[arg(long = "precedence", value_enum, default_value_t = PrecedenceArg::LastWriter)]
    precedence: PrecedenceArg,

    /// Skip the upstream kind presence check
    #[arg(long = "disable-resource-ready-check", action = ArgAction::SetTrue)]
    disable_resource_ready_check: bool,

    /// Log filter (RUST_LOG grammar)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Shutdown grace period in seconds
    #[arg(long = "shutdown-grace", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PrecedenceArg {
    LastWriter,
    PreferCluster,
}

impl From<PrecedenceArg> for Precedence {
    fn from(v: PrecedenceArg) -> Self {
        match v {
            PrecedenceArg::LastWriter => Precedence::LastWriter,
            PrecedenceArg::PreferCluster => Precedence::PreferCluster,
        }
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BOSUN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BOSUN_METRICS_ADDR; expected host:port");
        }
    }
}

fn server_args(cli: &Cli) -> Args {
    Args {
        kube_config: cli.kubeconfig.clone(),
        resync_period: Duration::from_secs(cli.resync_period_secs),
        api_address: cli.address.clone(),
        insecure: cli.insecure,
        config_path: cli.config_path.clone(),
        mesh_config_path: cli.meshconfig.clone(),
        disable_resource_ready_check: cli.disable_resource_ready_check,
        precedence: cli.precedence.into(),
        shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        logging: LoggingOptions { level: cli.log_level.clone() },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = server_args(&cli);

    // Logging is configured by the first construction step.
    let server = Arc::new(new_server(&args, &PatchTable::default(), cli.convert_k8s_service).await?);
    init_metrics();

    let mut run = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    #[cfg(unix)]
    let terminated = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = terminated => info!("termination signal received"),
        res = &mut run => {
            match res {
                Ok(Ok(())) => info!("server stopped"),
                Ok(Err(e)) => error!(error = %e, "server failed"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
            return Ok(());
        }
    }

    server.close().await;
    match run.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "server task panicked during shutdown");
            Ok(())
        }
    }
}
