//! Reporting indexer daemon
//!
//! Connects to an upstream node, brings up the ingestion pipeline against
//! the selected backend, and runs until interrupted.

use anyhow::{Context, Result};
use chainreport::config::{load_address_file, TuningConfig};
use chainreport::database::Database;
use chainreport::elasticsearch::ElasticsearchDatabase;
use chainreport::memorydb::MemoryDatabase;
use chainreport::rpc::{ChainClient, HttpChainClient};
use chainreport::service::{MonitorService, ServiceState};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Elasticsearch,
}

/// Blockchain reporting indexer
#[derive(Parser)]
#[command(name = "reportd")]
#[command(about = "Index transactions, events, and storage for registered contracts")]
struct Args {
    /// JSON-RPC endpoint of the upstream node
    #[arg(long, default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// GraphQL endpoint of the upstream node
    #[arg(long, default_value = "http://127.0.0.1:8547/graphql")]
    graphql_url: String,

    /// WebSocket endpoint for the newHeads subscription
    #[arg(long, default_value = "ws://127.0.0.1:8546")]
    ws_url: String,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Backend::Memory)]
    backend: Backend,

    /// Document-index URL (elasticsearch backend)
    #[arg(long, default_value = "http://127.0.0.1:9200")]
    index_url: String,

    /// File of contract addresses to register at startup, one per line
    #[arg(long)]
    addresses: Option<PathBuf>,

    /// Bound of the block-processing queue
    #[arg(long, default_value_t = 64)]
    queue_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    info!("starting reporting indexer");
    info!(rpc = %args.rpc_url, graphql = %args.graphql_url, ws = %args.ws_url, "upstream node");

    let client: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(
        args.rpc_url,
        args.graphql_url,
        args.ws_url,
    ));

    // Startup handshake: a node we cannot reach is fatal
    let head = client
        .current_block_number()
        .await
        .context("cannot contact upstream node")?;
    info!(head, "upstream node reachable");

    let db: Arc<dyn Database> = match args.backend {
        Backend::Memory => Arc::new(MemoryDatabase::new()),
        Backend::Elasticsearch => Arc::new(
            ElasticsearchDatabase::connect(args.index_url)
                .await
                .context("cannot initialise document store")?,
        ),
    };

    if let Some(path) = &args.addresses {
        let addresses = load_address_file(path)?;
        info!(count = addresses.len(), "registering contract addresses");
        db.add_addresses(addresses)
            .await
            .context("failed to register addresses")?;
    }

    let tuning = TuningConfig {
        block_processing_queue_size: args.queue_size,
    };
    let service = Arc::new(MonitorService::new(db, client, tuning));
    service.clone().start()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received, shutting down");
    service.stop();

    // Give in-flight work a moment to drain
    for _ in 0..50 {
        if service.state() == ServiceState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("reporting indexer stopped");
    Ok(())
}
