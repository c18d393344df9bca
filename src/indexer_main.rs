//! Ethereum ledger indexer binary
//!
//! Follows the canonical chain, persists blocks and maintains per-subscriber
//! and per-group balances of the native coin and registered ERC20 tokens.

use anyhow::{Context, Result};
use clap::Parser;
use ethledger::cache::CachedNodeClient;
use ethledger::cli::register_subscriptions;
use ethledger::config::{load_subscriptions, ConfigArgs};
use ethledger::manager::Manager;
use ethledger::rpc::RpcClient;
use ethledger::store::RocksStore;
use ethledger::watcher::Watcher;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ethereum ledger indexer
#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Index Ethereum blocks and track balances of subscribed addresses")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    /// Subscription file to register on startup (address[,group] per line)
    #[arg(short, long, env = "INDEXER_SUBSCRIPTIONS")]
    subscriptions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config.resolve().context("Invalid configuration")?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Ethereum ledger indexer");
    info!("RPC URL: {}", config.rpc_url);
    info!("Database: {:?}", config.db_path);

    // Open store
    let store = RocksStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database at {:?}", config.db_path))?;

    if let Some(path) = &args.subscriptions {
        let subs = load_subscriptions(path).context("Failed to load subscriptions")?;
        let (added, existing) =
            register_subscriptions(&store, &subs).context("Failed to register subscriptions")?;
        info!("Registered {} subscriptions ({} already present)", added, existing);
    }

    // Node client behind the response cache
    let rpc = RpcClient::new(config.rpc_url.clone()).with_batch_size(config.rpc_batch_size);
    let node = CachedNodeClient::with_capacity(rpc, config.cache_capacity);

    let manager = Manager::new(store, node)
        .with_sub_limit(config.sub_limit)
        .with_new_subscription_limit(config.new_subscription_limit);
    let watcher = Watcher::new(manager, config.start_block)
        .with_batch_size(config.batch_size)
        .with_poll_interval(config.poll_interval());

    // Handle Ctrl+C gracefully
    tokio::select! {
        result = watcher.run() => {
            result.context("Indexer error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    info!("Indexer stopped");
    Ok(())
}
