//! Ethereum JSON-RPC types
//!
//! Type definitions for blocks, headers, transactions, receipts, logs and
//! node-reported transfer logs as returned from JSON-RPC endpoints.

use alloy_primitives::{Address, Bloom, Bytes, B256, B64, U256};
use serde::{Deserialize, Deserializer};

/// Block header fields.
///
/// Uncle queries return this shape; full blocks flatten it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Header {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash
    #[serde(rename = "hash")]
    pub hash: B256,

    /// Parent block hash
    #[serde(rename = "parentHash")]
    pub parent_hash: B256,

    /// Block beneficiary
    #[serde(rename = "miner")]
    pub miner: Address,

    /// Unix timestamp (hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// Proof-of-work nonce (zero after the merge)
    #[serde(rename = "nonce", default)]
    pub nonce: B64,

    /// Difficulty (hex string in JSON)
    #[serde(rename = "difficulty", default, deserialize_with = "deserialize_hex_u256")]
    pub difficulty: U256,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gasLimit", deserialize_with = "deserialize_hex_u64")]
    pub gas_limit: u64,

    /// Gas used (hex string in JSON)
    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u64")]
    pub gas_used: u64,

    /// Extra data
    #[serde(rename = "extraData", default)]
    pub extra_data: Bytes,

    /// Mix hash / prevrandao
    #[serde(rename = "mixHash", default)]
    pub mix_hash: B256,

    /// State root
    #[serde(rename = "stateRoot", default)]
    pub state_root: B256,

    /// Transactions root
    #[serde(rename = "transactionsRoot", default)]
    pub transactions_root: B256,

    /// Receipts root
    #[serde(rename = "receiptsRoot", default)]
    pub receipts_root: B256,

    /// Base fee per gas (EIP-1559, hex string in JSON)
    #[serde(rename = "baseFeePerGas", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub base_fee_per_gas: Option<U256>,
}

/// Ethereum block with full transaction details.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: Header,

    /// Hashes of the uncle headers
    #[serde(rename = "uncles", default)]
    pub uncles: Vec<B256>,

    /// List of transactions in the block
    #[serde(rename = "transactions", default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash
    }
}

/// Ethereum transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Transaction {
    /// Transaction hash
    #[serde(rename = "hash")]
    pub hash: B256,

    /// Containing block hash (None while pending)
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<B256>,

    /// Position in the block (None while pending)
    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub transaction_index: Option<u64>,

    /// Sender address as reported by the node
    #[serde(rename = "from", default)]
    pub from: Option<Address>,

    /// Recipient address (None for contract creation)
    #[serde(rename = "to", default)]
    pub to: Option<Address>,

    /// Value transferred in wei (hex string in JSON)
    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Gas price (legacy transactions, hex string in JSON)
    #[serde(rename = "gasPrice", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub gas_price: Option<U256>,

    /// Max fee per gas (EIP-1559, hex string in JSON)
    #[serde(rename = "maxFeePerGas", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub max_fee_per_gas: Option<U256>,

    /// Max priority fee per gas (EIP-1559, hex string in JSON)
    #[serde(rename = "maxPriorityFeePerGas", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub max_priority_fee_per_gas: Option<U256>,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u64")]
    pub gas: u64,

    /// Transaction input data ("0x" for simple transfers)
    #[serde(rename = "input", default)]
    pub input: Bytes,

    /// Transaction nonce (hex string in JSON)
    #[serde(rename = "nonce", deserialize_with = "deserialize_hex_u64")]
    pub nonce: u64,

    /// Signature recovery id
    #[serde(rename = "v", default, deserialize_with = "deserialize_hex_u256")]
    pub v: U256,

    /// Signature r
    #[serde(rename = "r", default, deserialize_with = "deserialize_hex_u256")]
    pub r: U256,

    /// Signature s
    #[serde(rename = "s", default, deserialize_with = "deserialize_hex_u256")]
    pub s: U256,
}

impl Transaction {
    /// Check if this is a legacy transaction (has gasPrice, no maxFeePerGas).
    pub fn is_legacy(&self) -> bool {
        self.gas_price.is_some() && self.max_fee_per_gas.is_none()
    }

    /// Check if this is an EIP-1559 transaction (has maxFeePerGas).
    pub fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }

    /// Check if this is a contract creation transaction (to is None).
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Log entry emitted by a contract during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Log {
    /// Address of the contract that emitted the log
    #[serde(rename = "address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default)]
    pub topics: Vec<B256>,

    /// Non-indexed event data
    #[serde(rename = "data", default)]
    pub data: Bytes,

    /// Hash of the emitting transaction
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<B256>,

    /// Block number (hex string in JSON)
    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    /// Index of the log within the block (hex string in JSON)
    #[serde(rename = "logIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub log_index: Option<u64>,
}

/// Transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Receipt {
    /// Hash of the transaction this receipt belongs to
    #[serde(rename = "transactionHash")]
    pub transaction_hash: B256,

    /// Position of the transaction in the block (hex string in JSON)
    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64")]
    pub transaction_index: u64,

    /// Transaction status: 1 = success, 0 = failure (hex string in JSON)
    #[serde(rename = "status", default, deserialize_with = "deserialize_hex_u64")]
    pub status: u64,

    /// Cumulative gas used in the block up to and including this transaction
    #[serde(rename = "cumulativeGasUsed", deserialize_with = "deserialize_hex_u64")]
    pub cumulative_gas_used: u64,

    /// Gas used (hex string in JSON)
    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u256")]
    pub gas_used: U256,

    /// Effective gas price (post-London, hex string in JSON)
    #[serde(rename = "effectiveGasPrice", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub effective_gas_price: Option<U256>,

    /// Bloom filter over the receipt's logs
    #[serde(rename = "logsBloom", default)]
    pub logs_bloom: Bloom,

    /// Created contract address for creation transactions
    #[serde(rename = "contractAddress", default)]
    pub contract_address: Option<Address>,

    /// Logs emitted during transaction execution (empty for reverted txs)
    #[serde(rename = "logs", default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Check if the transaction succeeded.
    pub fn is_success(&self) -> bool {
        self.status == 1
    }
}

/// Value movement reported by the node outside of contract logs.
///
/// Covers native-coin transfers (including internal calls) and the
/// miner/uncle reward pseudo-transfers whose `from` is a reward sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferLog {
    #[serde(rename = "from")]
    pub from: Address,

    #[serde(rename = "to")]
    pub to: Address,

    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Originating transaction, zero for rewards
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: B256,
}

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16)
}

pub(crate) fn parse_hex_u256(s: &str) -> Result<U256, hex::FromHexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let bytes = hex::decode(pad_hex_string(s))?;
    if bytes.len() > 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    Ok(U256::from_be_slice(&bytes))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_u64(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to U256.
fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to U256.
fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_u256(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use serde_json::json;

    #[test]
    fn test_parse_hex_helpers() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("0x").unwrap(), 0);
        assert_eq!(parse_hex_u256("0xabc").unwrap(), U256::from(0xabcu64));
        assert!(parse_hex_u256("0xzz").is_err());
    }

    #[test]
    fn test_deserialize_block_with_transactions() {
        let raw = json!({
            "number": "0x64",
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000099",
            "miner": "0x00000000000000000000000000000000000000a1",
            "timestamp": "0x5f5e100",
            "nonce": "0x0000000000000000",
            "difficulty": "0x1",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0xa410",
            "extraData": "0x",
            "baseFeePerGas": "0x7",
            "uncles": [],
            "transactions": [{
                "hash": "0x00000000000000000000000000000000000000000000000000000000000000f1",
                "blockHash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
                "transactionIndex": "0x0",
                "from": "0x00000000000000000000000000000000000000a1",
                "to": "0x00000000000000000000000000000000000000b2",
                "value": "0x1",
                "gasPrice": "0x1",
                "gas": "0x5208",
                "input": "0x",
                "nonce": "0x3",
                "v": "0x1b",
                "r": "0x1",
                "s": "0x2"
            }]
        });

        let block: Block = serde_json::from_value(raw).unwrap();
        assert_eq!(block.number(), 100);
        assert_eq!(
            block.hash(),
            b256!("00000000000000000000000000000000000000000000000000000000000000aa")
        );
        assert_eq!(block.header.miner, address!("00000000000000000000000000000000000000a1"));
        assert_eq!(block.header.base_fee_per_gas, Some(U256::from(7u64)));
        assert_eq!(block.transactions.len(), 1);

        let tx = &block.transactions[0];
        assert_eq!(tx.from, Some(address!("00000000000000000000000000000000000000a1")));
        assert_eq!(tx.gas, 21000);
        assert_eq!(tx.nonce, 3);
        assert!(tx.is_legacy());
        assert!(!tx.is_contract_creation());
    }

    #[test]
    fn test_deserialize_receipt_with_logs() {
        let raw = json!({
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000f1",
            "transactionIndex": "0x0",
            "status": "0x1",
            "cumulativeGasUsed": "0x5208",
            "gasUsed": "0x5208",
            "contractAddress": null,
            "logs": [{
                "address": "0x00000000000000000000000000000000000000c3",
                "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
                "data": "0x01",
                "logIndex": "0x2"
            }]
        });

        let receipt: Receipt = serde_json::from_value(raw).unwrap();
        assert!(receipt.is_success());
        assert_eq!(receipt.gas_used, U256::from(21000u64));
        assert_eq!(receipt.contract_address, None);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].log_index, Some(2));
    }
}
