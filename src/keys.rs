//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data. Block numbers
//! are big-endian and always the last component of history keys, so a
//! reverse seek from `(prefix, n)` lands on the newest row at or before `n`.

use alloy_primitives::{Address, B256};

/// Encode a header key.
///
/// Format: byte 'H' + block_number (8 bytes, big-endian)
pub fn encode_header_key(number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'H');
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode a header-by-hash index key.
///
/// Format: byte 'h' + block_hash (32 bytes)
pub fn encode_header_hash_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'h');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode a key positioned within a block.
///
/// Format: prefix + block_number (8 bytes) + index (4 bytes)
/// Used for transactions ('T'), receipts ('R') and transfers ('X').
pub fn encode_block_item_key(prefix: u8, number: u64, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(13);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Encode a log key.
///
/// Format: byte 'L' + block_number (8 bytes) + tx_index (4 bytes) + log_index (4 bytes)
pub fn encode_log_key(number: u64, tx_index: u32, log_index: u32) -> Vec<u8> {
    let mut key = encode_block_item_key(b'L', number, tx_index);
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Encode a block-number range prefix for any block-positioned key family.
pub fn encode_block_prefix(prefix: u8, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Decode the block number of a block-positioned key.
pub fn decode_block_number(key: &[u8]) -> Option<u64> {
    if key.len() < 9 {
        return None;
    }
    Some(u64::from_be_bytes(key[1..9].try_into().ok()?))
}

/// Encode a transaction-hash index key.
///
/// Format: byte 't' + tx_hash (32 bytes)
pub fn encode_tx_hash_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b't');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode an address-keyed row.
///
/// Format: prefix + address (20 bytes)
/// Used for ERC20 descriptors ('E'), contract code ('C') and subscriptions ('S').
pub fn encode_address_key(prefix: u8, addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(prefix);
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode an ERC20 storage cell key.
///
/// Format: byte 'W' + address (20 bytes) + slot (32 bytes) + block_number (8 bytes)
pub fn encode_storage_key(addr: Address, slot: B256, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(61);
    key.push(b'W');
    key.extend_from_slice(addr.as_slice());
    key.extend_from_slice(slot.as_slice());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode a contract metadata key.
///
/// Format: byte 'K' + address (20 bytes) + block_number (8 bytes)
pub fn encode_contract_key(addr: Address, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(29);
    key.push(b'K');
    key.extend_from_slice(addr.as_slice());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode an account snapshot key.
///
/// Format: byte 'A' + token (20 bytes) + address (20 bytes) + block_number (8 bytes)
pub fn encode_account_key(token: Address, addr: Address, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(49);
    key.push(b'A');
    key.extend_from_slice(token.as_slice());
    key.extend_from_slice(addr.as_slice());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode a total balance key.
///
/// Format: byte 'G' + token (20 bytes) + group (8 bytes) + block_number (8 bytes)
pub fn encode_total_key(token: Address, group: u64, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b'G');
    key.extend_from_slice(token.as_slice());
    key.extend_from_slice(&group.to_be_bytes());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode a reorg audit key.
///
/// Format: byte 'O' + from (8 bytes) + to (8 bytes)
pub fn encode_reorg_key(from: u64, to: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'O');
    key.extend_from_slice(&from.to_be_bytes());
    key.extend_from_slice(&to.to_be_bytes());
    key
}

/// Decode the trailing big-endian block number of a history key.
pub fn decode_trailing_block(key: &[u8]) -> Option<u64> {
    if key.len() < 9 {
        return None;
    }
    let start = key.len() - 8;
    Some(u64::from_be_bytes(key[start..].try_into().ok()?))
}

/// Split a history key into its entity prefix and trailing block number.
pub fn split_history_key(key: &[u8]) -> Option<(&[u8], u64)> {
    let block = decode_trailing_block(key)?;
    Some((&key[..key.len() - 8], block))
}

/// Encode the block index entry of a history key.
///
/// Format: family prefix + block_number (8 bytes) + history key
/// Rows of one family written in `[from, to]` form one contiguous range.
pub fn encode_block_index_key(key: &[u8]) -> Option<Vec<u8>> {
    let (_, number) = split_history_key(key)?;
    let mut index = encode_block_prefix(key[0], number);
    index.extend_from_slice(key);
    Some(index)
}

/// Recover the history key from a block index entry.
pub fn decode_block_index_key(index: &[u8]) -> Option<&[u8]> {
    index.get(9..).filter(|key| !key.is_empty())
}

/// Encode a subscription's processed-up-to index key.
///
/// Format: byte 'P' + block_number (8 bytes) + address (20 bytes)
/// New subscriptions (block 0) sort first.
pub fn encode_subscription_block_key(number: u64, addr: Address) -> Vec<u8> {
    let mut key = encode_block_prefix(b'P', number);
    key.extend_from_slice(addr.as_slice());
    key
}

/// Decode the address of a processed-up-to index key.
pub fn decode_subscription_block_key(key: &[u8]) -> Option<Address> {
    if key.len() != 29 {
        return None;
    }
    Some(Address::from_slice(&key[9..]))
}
