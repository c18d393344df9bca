//! Record types for indexed chain data and ledger balances
//!
//! These structs represent the rows stored in the store. They use postcard
//! for binary serialization. Balances are kept as decimal strings at rest and
//! converted to `U256` at the boundary with [`parse_balance`].

use crate::error::{Error, Result};
use crate::types::{Block, Header, Log, Receipt, Transaction};
use alloy_primitives::{Address, Bloom, Bytes, B256, B64, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Token identifier used for the native coin.
pub const NATIVE_TOKEN: Address = Address::ZERO;

/// `from` sentinel of a block reward paid to the miner.
///
/// Left-padded bytes of `"MINER_REWARD"`.
pub const MINER_REWARD: Address = Address::new([
    0, 0, 0, 0, 0, 0, 0, 0, b'M', b'I', b'N', b'E', b'R', b'_', b'R', b'E', b'W', b'A', b'R', b'D',
]);

/// `from` sentinel of a reward paid to an uncle miner.
///
/// Left-padded bytes of `"UNCLE_REWARD"`.
pub const UNCLE_REWARD: Address = Address::new([
    0, 0, 0, 0, 0, 0, 0, 0, b'U', b'N', b'C', b'L', b'E', b'_', b'R', b'E', b'W', b'A', b'R', b'D',
]);

/// Maximum number of uncles a block may reference.
pub const MAX_UNCLES: usize = 2;

/// True if `addr` is one of the reward sentinels.
pub fn is_reward_sentinel(addr: Address) -> bool {
    addr == MINER_REWARD || addr == UNCLE_REWARD
}

/// Parse a decimal balance string.
pub fn parse_balance(s: &str) -> Result<U256> {
    U256::from_str_radix(s, 10).map_err(|_| Error::InvalidBalance(s.to_string()))
}

/// Render a balance as a decimal string.
pub fn format_balance(value: U256) -> String {
    value.to_string()
}

/// Block header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub miner: Address,
    pub timestamp: u64,
    pub nonce: B64,
    pub difficulty: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub base_fee: Option<U256>,
    pub uncles: Vec<B256>,
}

impl HeaderRecord {
    pub fn from_block(block: &Block) -> Self {
        let mut record = Self::from_header(&block.header);
        record.uncles = block.uncles.clone();
        record
    }

    pub fn from_header(h: &Header) -> Self {
        Self {
            number: h.number,
            hash: h.hash,
            parent_hash: h.parent_hash,
            miner: h.miner,
            timestamp: h.timestamp,
            nonce: h.nonce,
            difficulty: h.difficulty,
            gas_limit: h.gas_limit,
            gas_used: h.gas_used,
            extra_data: h.extra_data.clone(),
            mix_hash: h.mix_hash,
            state_root: h.state_root,
            transactions_root: h.transactions_root,
            receipts_root: h.receipts_root,
            base_fee: h.base_fee_per_gas,
            uncles: Vec::new(),
        }
    }
}

/// Transaction row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub index: u32,
    pub from: Address,
    /// None for contract creation
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_price: String,
    pub gas_limit: u64,
    pub value: String,
    pub payload: Bytes,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl TransactionRecord {
    /// Build a row for `tx` at position `index` of `block`.
    ///
    /// A transaction without a sender is rejected with `WrongSigner`.
    pub fn from_transaction(block: &Block, index: u32, tx: &Transaction) -> Result<Self> {
        let from = tx.from.ok_or(Error::WrongSigner(tx.hash))?;
        let gas_price = tx
            .gas_price
            .or(tx.max_fee_per_gas)
            .unwrap_or(U256::ZERO);
        Ok(Self {
            hash: tx.hash,
            block_hash: block.hash(),
            block_number: block.number(),
            index,
            from,
            to: tx.to,
            nonce: tx.nonce,
            gas_price: format_balance(gas_price),
            gas_limit: tx.gas,
            value: format_balance(tx.value),
            payload: tx.input.clone(),
            v: tx.v,
            r: tx.r,
            s: tx.s,
        })
    }
}

/// Receipt row. Logs are stored separately as [`LogRecord`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub tx_hash: B256,
    pub block_number: u64,
    pub index: u32,
    pub cumulative_gas_used: u64,
    pub gas_used: String,
    pub logs_bloom: Bloom,
    pub contract_address: Option<Address>,
    pub status: u64,
}

impl ReceiptRecord {
    pub fn from_receipt(block_number: u64, index: u32, r: &Receipt) -> Self {
        Self {
            tx_hash: r.transaction_hash,
            block_number,
            index,
            cumulative_gas_used: r.cumulative_gas_used,
            gas_used: format_balance(r.gas_used),
            logs_bloom: r.logs_bloom,
            contract_address: r.contract_address,
            status: r.status,
        }
    }
}

/// Log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub tx_hash: B256,
    pub block_number: u64,
    pub log_index: u32,
    pub contract_address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl LogRecord {
    pub fn from_log(block_number: u64, tx_hash: B256, log_index: u32, log: &Log) -> Self {
        Self {
            tx_hash,
            block_number,
            log_index,
            contract_address: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
        }
    }
}

/// Value transfer observed in a block.
///
/// `address` is the token contract, or [`NATIVE_TOKEN`] for the native coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub address: Address,
    pub block_number: u64,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub value: String,
}

/// Registered ERC20 token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Erc20Record {
    pub address: Address,
    /// First block at which the token is active; 0 until bootstrapped
    pub block_number: u64,
    pub total_supply: String,
    pub decimals: Option<u8>,
    pub name: Option<String>,
}

impl Erc20Record {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            block_number: 0,
            total_supply: "0".to_string(),
            decimals: None,
            name: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.block_number > 0
    }
}

/// Historical value of one contract storage slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Erc20StorageRecord {
    pub address: Address,
    pub key: B256,
    pub block_number: u64,
    pub value: B256,
}

/// Persisted runtime bytecode of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCodeRecord {
    pub address: Address,
    pub block_number: u64,
    pub code: Bytes,
}

/// Account metadata of a contract at a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub address: Address,
    pub block_number: u64,
    pub balance: String,
    pub nonce: u64,
}

/// Balance of `address` in `token` effective as of `block_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub token: Address,
    pub address: Address,
    pub block_number: u64,
    pub balance: String,
}

impl AccountSnapshot {
    pub fn new(token: Address, address: Address, block_number: u64, balance: U256) -> Self {
        Self {
            token,
            address,
            block_number,
            balance: format_balance(balance),
        }
    }

    pub fn balance(&self) -> Result<U256> {
        parse_balance(&self.balance)
    }
}

/// Tracked address and the group its balances aggregate into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub address: Address,
    pub group: u64,
    /// Block at which the subscription was first processed; 0 while new
    pub block_number: u64,
}

impl Subscription {
    pub fn new(address: Address, group: u64) -> Self {
        Self {
            address,
            group,
            block_number: 0,
        }
    }

    pub fn is_new(&self) -> bool {
        self.block_number == 0
    }
}

/// Per-group total of one token at a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalBalance {
    pub token: Address,
    pub group: u64,
    pub block_number: u64,
    pub balance: String,
    pub tx_fee: String,
    pub miner_reward: String,
    pub uncles_reward: String,
}

impl TotalBalance {
    /// All-zero total, the value of an absent carry-forward row.
    pub fn zero(token: Address, group: u64, block_number: u64) -> Self {
        Self {
            token,
            group,
            block_number,
            balance: "0".to_string(),
            tx_fee: "0".to_string(),
            miner_reward: "0".to_string(),
            uncles_reward: "0".to_string(),
        }
    }

    pub fn balance(&self) -> Result<U256> {
        parse_balance(&self.balance)
    }

    pub fn tx_fee(&self) -> Result<U256> {
        parse_balance(&self.tx_fee)
    }

    pub fn miner_reward(&self) -> Result<U256> {
        parse_balance(&self.miner_reward)
    }

    pub fn uncles_reward(&self) -> Result<U256> {
        parse_balance(&self.uncles_reward)
    }
}

/// Audit row for a replaced block range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgRecord {
    pub from: u64,
    pub to: u64,
    pub from_hash: B256,
    pub to_hash: B256,
}

/// Parse a hex string (with or without 0x) into an address.
pub fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s.trim()).map_err(|e| Error::InvalidData(format!("invalid address {s:?}: {e}")))
}
