use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use taskherd::config::{NodeConfig, PortRange, TlsConfig};
use taskherd::node::Node;
use taskherd::shutdown::drain_on_signal;

#[derive(Parser, Debug)]
#[command(name = "taskherd")]
#[command(about = "Distributed job execution control plane worker")]
struct Args {
    /// Stable host identity; leader and sub-leader prefer different nodes
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Coordination store URL ("memory://" for a single-process setup)
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Run database URL
    #[arg(long, default_value = "sqlite://taskherd.db")]
    database_url: String,

    /// Host advertised to peers for control-plane RPC
    #[arg(long, default_value = "127.0.0.1")]
    rpc_host: String,

    /// Fixed RPC port; 0 probes the range below
    #[arg(long, default_value = "0")]
    rpc_port: u16,

    #[arg(long, default_value = "50051")]
    rpc_port_range_start: u16,

    #[arg(long, default_value = "50150")]
    rpc_port_range_end: u16,

    /// Port for the HTTP ingestion/status API (optional)
    #[arg(long)]
    http_port: Option<u16>,

    /// Bundle directory with ca.pem, worker.pem, and worker.key; enables
    /// mutual TLS
    #[arg(long)]
    tls_dir: Option<PathBuf>,

    /// Override the CA certificate path from the bundle
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// Override the worker certificate path from the bundle
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Override the private key path from the bundle
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Directory for per-run log files
    #[arg(long, default_value = ".taskherd-logs")]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tls_configured = args.tls_dir.is_some()
        || (args.tls_ca_cert.is_some() && args.tls_cert.is_some() && args.tls_key.is_some());
    let tls = TlsConfig {
        enabled: tls_configured,
        bundle_dir: args.tls_dir,
        ca_cert_path: args.tls_ca_cert,
        cert_path: args.tls_cert,
        key_path: args.tls_key,
    };

    let http_addr: Option<SocketAddr> = match args.http_port {
        Some(port) => Some(format!("0.0.0.0:{port}").parse()?),
        None => None,
    };

    let config = NodeConfig {
        node_id: args.node_id,
        redis_url: args.redis_url,
        database_url: args.database_url,
        rpc_host: args.rpc_host,
        rpc_port: args.rpc_port,
        rpc_port_range: PortRange {
            start: args.rpc_port_range_start,
            end: args.rpc_port_range_end,
        },
        http_addr,
        tls,
    };

    tracing::info!(
        node_id = %config.node_id,
        redis_url = %config.redis_url,
        database_url = %config.database_url,
        http_addr = ?config.http_addr,
        tls = config.tls.enabled,
        "Starting taskherd worker"
    );

    let shutdown = drain_on_signal();
    let node = Node::bootstrap(config, args.logs_dir).await?;
    node.run(shutdown).await?;

    Ok(())
}
