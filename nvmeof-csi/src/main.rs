//! NVMe-oF CSI Node Plugin
//!
//! Serves the CSI Identity and Node services on a unix socket.

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use nvmeof_csi::config::{NodeConfig, parse_endpoint};
use nvmeof_csi::csi::identity_server::IdentityServer;
use nvmeof_csi::csi::node_server::NodeServer;
use nvmeof_csi::identity::{DRIVER_NAME, DRIVER_VERSION};
use nvmeof_csi::{IdentityService, NodeService, metrics};

/// CLI arguments for the node plugin
#[derive(Parser, Debug)]
#[command(name = "nvmeof-csi")]
#[command(about = "NVMe-oF CSI node plugin for Kubernetes")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Driver name
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(flatten)]
    node: NodeConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    // Determine node_id
    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.driver_name,
        version = %DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %node_id,
        "Starting NVMe-oF CSI node plugin"
    );
    info!(config = ?args.node, "Node configuration");

    let socket_path = parse_endpoint(&args.endpoint)?;
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // A previous instance may have left its socket behind
    match tokio::fs::remove_file(&socket_path).await {
        Ok(()) => info!(path = %socket_path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "gRPC server listening");

    let identity = IdentityService::new(args.driver_name);
    let node = NodeService::new(node_id, &args.node);

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    info!("NVMe-oF CSI node plugin shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed to listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
    }
}
