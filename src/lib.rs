//! Ethledger - Ethereum chain indexer and subscription balance ledger
//!
//! This library follows the canonical chain, persists headers, transactions,
//! receipts and value transfers in RocksDB, and maintains per-subscriber and
//! per-group balances of the native coin and ERC20 tokens that stay
//! consistent across chain reorganizations.

pub mod error;
pub mod keys;
pub mod records;
pub mod store;
pub mod types;

// Node access
pub mod cache;
pub mod node;
pub mod rpc;

// Ledger pipeline
pub mod bootstrap;
pub mod decoder;
pub mod fee;
pub mod manager;
pub mod processor;
pub mod watcher;

// Queries
pub mod api;
pub mod evaluator;

pub mod cli;
pub mod config;

// Re-export the main types for convenience
pub use error::{Error, Result};
pub use node::NodeClient;
pub use records::{
    AccountSnapshot, Erc20Record, HeaderRecord, ReorgRecord, Subscription, TotalBalance,
    TransferRecord,
};
pub use store::{BlockBatch, RocksStore, Store};
