//! Error types for indexing and balance operations
//!
//! `NotFound` and `Duplicate` are recoverable signals that callers branch on;
//! every other variant aborts the block being processed.

use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Errors produced by the store, the node client and the block pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The store has no row for the requested key.
    #[error("record not found")]
    NotFound,

    /// A write would violate a uniqueness constraint.
    #[error("duplicate record")]
    Duplicate,

    /// A persisted balance could not be parsed as a decimal integer.
    #[error("invalid balance: {0:?}")]
    InvalidBalance(String),

    /// The sender of a transaction could not be determined.
    #[error("cannot determine signer of transaction {0}")]
    WrongSigner(B256),

    /// The upstream node could not produce a requested block, header or receipt.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// More than one distinct miner received a block reward.
    #[error("too many miners in block reward transfers")]
    TooManyMiners,

    /// More uncle rewards than the protocol allows.
    #[error("too many uncles in block reward transfers")]
    TooManyUncles,

    /// A new subscription already has a balance snapshot.
    #[error("new subscription {address} already has a {token} balance")]
    HasPrevBalance { token: Address, address: Address },

    /// An existing subscription is missing its previous balance snapshot.
    #[error("subscription {address} has no previous {token} balance")]
    MissingPrevBalance { token: Address, address: Address },

    /// The state-backed evaluator was asked about an account other than the contract.
    #[error("state query for an address other than the evaluated contract")]
    NotSelf,

    /// Transport or JSON-RPC level failure talking to the node.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// RocksDB failure.
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Record (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// EVM setup or execution failure.
    #[error("evm error: {0}")]
    Evm(String),

    /// Structurally invalid input (malformed logs, inconsistent chain data).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// True for the store's "no row" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True when a write collided with an existing row.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate)
    }

    /// True for upstream failures worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Rpc(_) | Error::BlockNotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Rpc(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Rpc(format!("malformed response: {}", err))
    }
}

/// Result type for indexer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for turning `NotFound` into `None`.
pub trait OptionalExt<T> {
    /// Map a `NotFound` error to `Ok(None)`, passing every other outcome through.
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
