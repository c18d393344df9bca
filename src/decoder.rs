//! ERC20 Transfer event decoder
//!
//! Turns receipt logs into structured [`Transfer`]s for the tokens active at a
//! block, and merges them with the native-coin and reward transfers reported
//! by the node.

use crate::error::{Error, Result};
use crate::records::{format_balance, Erc20Record, TransferRecord, NATIVE_TOKEN};
use crate::types::{Log, Receipt, TransferLog};
use alloy_primitives::{b256, Address, B256, U256};
use std::collections::BTreeSet;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// A value movement of one token within a block.
///
/// `token` is the emitting contract, or [`NATIVE_TOKEN`] for native-coin and
/// reward transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub token: Address,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl Transfer {
    /// Native-coin transfer reported by the node.
    pub fn from_transfer_log(log: &TransferLog) -> Self {
        Self {
            token: NATIVE_TOKEN,
            tx_hash: log.transaction_hash,
            from: log.from,
            to: log.to,
            value: log.value,
        }
    }

    pub fn to_record(&self, block_number: u64) -> TransferRecord {
        TransferRecord {
            address: self.token,
            block_number,
            tx_hash: self.tx_hash,
            from: self.from,
            to: self.to,
            value: format_balance(self.value),
        }
    }
}

/// Tokens whose Transfer events are decoded at `block_number`.
///
/// A token is active once bootstrapped and from its registered-at block on.
pub fn active_tokens(erc20s: &[Erc20Record], block_number: u64) -> BTreeSet<Address> {
    erc20s
        .iter()
        .filter(|e| e.is_initialized() && e.block_number <= block_number)
        .map(|e| e.address)
        .collect()
}

/// Check if a log is a Transfer event of an active token.
fn is_tracked_transfer(log: &Log, active: &BTreeSet<Address>) -> bool {
    active.contains(&log.address) && log.topics.first() == Some(&TRANSFER_TOPIC)
}

/// Parse an address from an indexed topic (left-padded to 32 bytes).
fn address_from_topic(topic: &B256) -> Result<Address> {
    if topic[..12].iter().any(|b| *b != 0) {
        return Err(Error::InvalidData(format!(
            "Transfer topic {} is not a padded address",
            topic
        )));
    }
    Ok(Address::from_slice(&topic[12..]))
}

/// Decode one Transfer log: topics[1] = from, topics[2] = to, data = value.
fn decode_transfer(tx_hash: B256, log: &Log) -> Result<Transfer> {
    if log.topics.len() != 3 {
        return Err(Error::InvalidData(format!(
            "Transfer log of {} in tx {} has {} topics",
            log.address,
            tx_hash,
            log.topics.len()
        )));
    }
    if log.data.len() != 32 {
        return Err(Error::InvalidData(format!(
            "Transfer log of {} in tx {} has {} data bytes",
            log.address,
            tx_hash,
            log.data.len()
        )));
    }

    Ok(Transfer {
        token: log.address,
        tx_hash,
        from: address_from_topic(&log.topics[1])?,
        to: address_from_topic(&log.topics[2])?,
        value: U256::from_be_slice(&log.data),
    })
}

/// Decode the Transfer events of one transaction, in log order.
///
/// Logs of inactive contracts and other events are skipped; a malformed
/// Transfer log of an active token is an error.
pub fn decode_transfers(
    tx_hash: B256,
    logs: &[Log],
    active: &BTreeSet<Address>,
) -> Result<Vec<Transfer>> {
    logs.iter()
        .filter(|log| is_tracked_transfer(log, active))
        .map(|log| decode_transfer(tx_hash, log))
        .collect()
}

/// All transfers of a block: token events in receipt order, then the
/// node-reported native and reward transfers.
pub fn decode_block_transfers(
    receipts: &[Receipt],
    transfer_logs: &[TransferLog],
    active: &BTreeSet<Address>,
) -> Result<Vec<Transfer>> {
    let mut events = Vec::new();
    for receipt in receipts {
        // Reverted transactions move no tokens
        if !receipt.is_success() {
            continue;
        }
        events.extend(decode_transfers(receipt.transaction_hash, &receipt.logs, active)?);
    }
    events.extend(transfer_logs.iter().map(Transfer::from_transfer_log));
    Ok(events)
}
