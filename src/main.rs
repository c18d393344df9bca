//! indexctl - index database CLI tool
//!
//! Operator command-line interface for managing subscriptions and tokens and
//! querying balances in the indexer's RocksDB store.

use ethledger::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
