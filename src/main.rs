//! peer-exchange - TCP relay that swaps node metadata with its peers
//!
//! Each relayed connection can run the metadata exchange on the accepted
//! (downstream) leg, the upstream leg, or both.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{build_proxy_config, load_config_file, merge, ConfigFile, Overrides};
use peer_exchange_proxy::ExchangeProxy;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// peer-exchange - Relay TCP traffic and exchange node metadata with peers
#[derive(Parser, Debug)]
#[command(name = "peer-exchange")]
#[command(about = "Relay TCP traffic and exchange node metadata with peers")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "PEER_EXCHANGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Config file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "PEER_EXCHANGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:15001)
    #[arg(long, env = "PEER_EXCHANGE_BIND")]
    bind: Option<SocketAddr>,

    /// Upstream address to relay to (e.g., 127.0.0.1:8080)
    #[arg(long, env = "PEER_EXCHANGE_UPSTREAM")]
    upstream: Option<String>,

    /// Node id advertised to peers
    #[arg(long, env = "PEER_EXCHANGE_NODE_ID")]
    node_id: Option<String>,

    /// Cluster advertised to peers
    #[arg(long, env = "PEER_EXCHANGE_CLUSTER")]
    cluster: Option<String>,

    /// Identity label (key=value), can be repeated
    #[arg(long = "label", value_name = "KEY=VALUE")]
    labels: Vec<String>,

    /// Run the exchange on accepted connections with this protocol
    #[arg(long)]
    downstream_protocol: Option<String>,

    /// Run the exchange on upstream connections with this protocol
    #[arg(long)]
    upstream_protocol: Option<String>,

    /// Treat the protocols given on the command line as negotiated
    #[arg(long)]
    assume_negotiated: bool,
}

impl ProxyArgs {
    fn resolve(self) -> Result<ConfigFile> {
        let file = match &self.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        merge(
            file,
            Overrides {
                bind: self.bind,
                upstream: self.upstream,
                node_id: self.node_id,
                cluster: self.cluster,
                labels: self.labels,
                downstream_protocol: self.downstream_protocol,
                upstream_protocol: self.upstream_protocol,
                assume_negotiated: self.assume_negotiated,
            },
        )
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay
    #[command(long_about = r#"
Listen for TCP connections and relay each one to the upstream, exchanging
node metadata on the legs that have it configured.

EXAMPLES:
  # Run from a config file
  peer-exchange run --config peer-exchange.yaml

  # Client-side proxy that advertises itself to the upstream proxy
  peer-exchange run --bind 127.0.0.1:15001 --upstream 10.0.0.2:15006 \
    --node-id sidecar~10.0.0.1~web.default --cluster web.default \
    --label app=web --upstream-protocol istio-peer-exchange --assume-negotiated

ENVIRONMENT VARIABLES:
  PEER_EXCHANGE_CONFIG     Config file path
  PEER_EXCHANGE_BIND       Listen address
  PEER_EXCHANGE_UPSTREAM   Upstream address
  PEER_EXCHANGE_NODE_ID    Node id advertised to peers
  PEER_EXCHANGE_CLUSTER    Cluster advertised to peers
    "#)]
    Run(ProxyArgs),

    /// Validate configuration and print the effective settings
    Check(ProxyArgs),
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run(args: ProxyArgs) -> Result<()> {
    let (proxy_config, counters) = build_proxy_config(args.resolve()?)?;
    let proxy = ExchangeProxy::new(proxy_config);

    info!("peer-exchange {} ({}) starting...", env!("GIT_TAG"), env!("GIT_HASH"));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = proxy.start() => {
            if let Err(e) = result {
                error!("Proxy error: {}", e);
                return Err(e).context("Exchange proxy stopped");
            }
        }
    }

    info!(
        "Exchange counters: {}",
        serde_json::to_string(&counters.snapshot()).context("Failed to format counters")?
    );
    info!("peer-exchange stopped");
    Ok(())
}

fn check(args: ProxyArgs) -> Result<()> {
    let effective = args.resolve()?;
    let rendered = serde_yaml::to_string(&effective).context("Failed to render config")?;

    // Building the relay config is what validates it
    build_proxy_config(effective)?;

    println!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args),
    }
}
