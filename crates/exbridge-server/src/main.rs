//! exbridge binary

use clap::Parser;
use exbridge_common::BridgeConfig;
use exbridge_forwarder::{FlightSink, StreamSink};
use exbridge_server::BridgeServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// exbridge CLI
#[derive(Parser, Debug)]
#[command(name = "exbridge")]
#[command(version = "0.1.0")]
#[command(about = "Bridge database export streams into an Arrow Flight sink")]
struct Args {
    /// Port the export client connects to
    #[arg(long)]
    listen_port: Option<u16>,

    /// Interface to listen on
    #[arg(long)]
    listen_host: Option<String>,

    /// Arrow Flight sink host
    #[arg(long)]
    sink_host: Option<String>,

    /// Arrow Flight sink port
    #[arg(long)]
    sink_port: Option<u16>,

    /// Config file (TOML); flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Largest accepted frame in bytes, 0 for no limit
    #[arg(long)]
    max_frame_bytes: Option<u32>,

    /// Per-frame read timeout in seconds
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Sink connect timeout in seconds
    #[arg(long)]
    sink_timeout_secs: Option<u64>,

    /// Max concurrent sessions
    #[arg(long)]
    max_connections: Option<usize>,

    /// Fail sessions whose schema uses an unknown type tag
    #[arg(long)]
    strict_types: bool,

    /// Expect a compression code (0 none, 1 zlib, 2 lz4) after the query id
    #[arg(long)]
    negotiate_compression: bool,

    /// Shared secret expected as the first frame
    #[arg(long, env = "EXBRIDGE_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

fn build_config(args: Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(host) = args.listen_host {
        config.listen_addr.host = host;
    }
    if let Some(port) = args.listen_port {
        config.listen_addr.port = port;
    }
    if let Some(host) = args.sink_host {
        config.sink_addr.host = host;
    }
    if let Some(port) = args.sink_port {
        config.sink_addr.port = port;
    }
    if let Some(max) = args.max_frame_bytes {
        config.max_frame_bytes = max;
    }
    if args.read_timeout_secs.is_some() {
        config.read_timeout_secs = args.read_timeout_secs;
    }
    if args.sink_timeout_secs.is_some() {
        config.sink_timeout_secs = args.sink_timeout_secs;
    }
    if args.max_connections.is_some() {
        config.max_connections = args.max_connections;
    }
    if args.strict_types {
        config.strict_types = true;
    }
    if args.negotiate_compression {
        config.negotiate_compression = true;
    }
    if args.auth_token.is_some() {
        config.auth_token = args.auth_token;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let config = build_config(args)?;

    tracing::info!("Starting exbridge on {}", config.listen_addr);
    tracing::info!("Forwarding to Flight sink at {}", config.sink_addr);
    if config.auth_token.is_some() {
        tracing::info!("Token authentication enabled");
    }
    if config.negotiate_compression {
        tracing::info!("Batch compression negotiated per connection");
    }

    let sink: Arc<dyn StreamSink> = Arc::new(FlightSink::from_config(&config));
    let server = BridgeServer::new(config, sink)?;
    let listener = server.bind().await?;

    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down bridge");
        })
        .await
}
