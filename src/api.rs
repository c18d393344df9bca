//! Balance query adapter
//!
//! Thin layer over the store and the evaluator that answers balance queries
//! and turns crate errors into structured error codes. Internal failures are
//! reported as [`ErrorCode::Internal`] with a generic message; the original
//! error only goes to the log.

use crate::error::Error;
use crate::evaluator::BalanceEvaluator;
use crate::records::{parse_address, parse_balance, AccountSnapshot, TotalBalance};
use crate::store::Store;
use alloy_primitives::Address;
use serde::Serialize;
use std::fmt;
use tracing::error;

/// Machine-readable error kind of a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    AlreadyExists,
    InvalidBalance,
    WrongSigner,
    BlockNotFound,
    TooManyMiners,
    TooManyUncles,
    HasPrevBalance,
    MissingPrevBalance,
    NotSelf,
    Unavailable,
    Internal,
}

/// A failed query as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidArgument,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::NotFound => ErrorCode::NotFound,
            Error::Duplicate => ErrorCode::AlreadyExists,
            Error::InvalidBalance(_) => ErrorCode::InvalidBalance,
            Error::WrongSigner(_) => ErrorCode::WrongSigner,
            Error::BlockNotFound(_) => ErrorCode::BlockNotFound,
            Error::TooManyMiners => ErrorCode::TooManyMiners,
            Error::TooManyUncles => ErrorCode::TooManyUncles,
            Error::HasPrevBalance { .. } => ErrorCode::HasPrevBalance,
            Error::MissingPrevBalance { .. } => ErrorCode::MissingPrevBalance,
            Error::NotSelf => ErrorCode::NotSelf,
            Error::Rpc(_) => ErrorCode::Unavailable,
            Error::Storage(_) | Error::Codec(_) | Error::Evm(_) | Error::InvalidData(_) => {
                ErrorCode::Internal
            }
        };

        if code == ErrorCode::Internal {
            error!(error = %err, "Internal error serving balance query");
            return Self {
                code,
                message: "internal error".to_string(),
            };
        }
        if code == ErrorCode::InvalidBalance {
            error!(error = %err, "Stored balance is corrupt");
        }

        Self {
            code,
            message: err.to_string(),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Balance of one address in one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceResponse {
    pub token: Address,
    pub address: Address,
    /// Height the query was made at
    pub block_number: u64,
    /// Height of the snapshot that answered it
    pub snapshot_block: u64,
    pub balance: String,
}

/// Running total of one group in one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalResponse {
    pub token: Address,
    pub group: u64,
    pub block_number: u64,
    pub snapshot_block: u64,
    pub balance: String,
    pub tx_fee: String,
    pub miner_reward: String,
    pub uncles_reward: String,
}

fn argument(name: &str, value: &str) -> ApiResult<Address> {
    parse_address(value).map_err(|_| ApiError::invalid_argument(format!("invalid {name}: {value:?}")))
}

/// Balance queries over a store.
pub struct BalanceApi<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> BalanceApi<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Latest indexed block, the default height of queries.
    pub fn latest_block(&self) -> ApiResult<u64> {
        Ok(self.store.find_latest_header()?.number)
    }

    fn resolve_block(&self, block: Option<u64>) -> ApiResult<u64> {
        match block {
            Some(block) => Ok(block),
            None => self.latest_block(),
        }
    }

    /// Indexed balance of `address` in `token` at `block` (latest if `None`).
    pub fn balance(&self, token: &str, address: &str, block: Option<u64>) -> ApiResult<BalanceResponse> {
        let token = argument("token", token)?;
        let address = argument("address", address)?;
        let block_number = self.resolve_block(block)?;

        let AccountSnapshot {
            block_number: snapshot_block,
            balance,
            ..
        } = self.store.find_account(token, address, block_number)?;
        // Round-trip to reject corrupt rows
        let balance = parse_balance(&balance)?.to_string();

        Ok(BalanceResponse {
            token,
            address,
            block_number,
            snapshot_block,
            balance,
        })
    }

    /// Per-group total of `token` at `block` (latest if `None`).
    pub fn total(&self, token: &str, group: u64, block: Option<u64>) -> ApiResult<TotalResponse> {
        let token = argument("token", token)?;
        let block_number = self.resolve_block(block)?;

        let total: TotalBalance = self.store.find_total_balance(block_number, token, group)?;
        for value in [&total.balance, &total.tx_fee, &total.miner_reward, &total.uncles_reward] {
            parse_balance(value)?;
        }

        Ok(TotalResponse {
            token,
            group,
            block_number,
            snapshot_block: total.block_number,
            balance: total.balance,
            tx_fee: total.tx_fee,
            miner_reward: total.miner_reward,
            uncles_reward: total.uncles_reward,
        })
    }

    /// `contract.balanceOf(holder)` evaluated over persisted contract state.
    pub fn eval_balance(&self, contract: &str, holder: &str, block: Option<u64>) -> ApiResult<BalanceResponse> {
        let contract = argument("contract", contract)?;
        let holder = argument("holder", holder)?;
        let block_number = self.resolve_block(block)?;

        let balance = BalanceEvaluator::new(self.store).balance_of(contract, holder, block_number)?;
        Ok(BalanceResponse {
            token: contract,
            address: holder,
            block_number,
            snapshot_block: block_number,
            balance: balance.to_string(),
        })
    }
}
