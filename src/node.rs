//! Upstream node interface
//!
//! [`NodeClient`] is the capability the indexer consumes from an Ethereum
//! node: blocks, receipts, node-reported transfer logs and batched balance
//! queries. The JSON-RPC implementation lives in [`crate::rpc`] and the
//! caching middleware in [`crate::cache`].

use crate::error::{Error, Result};
use crate::records::{MAX_UNCLES, NATIVE_TOKEN};
use crate::types::{Block, Header, Receipt, Transaction, TransferLog};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Selector of `balanceOf(address)`.
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Balances to fetch: token -> set of holder addresses.
///
/// [`NATIVE_TOKEN`] selects the native coin.
pub type BalancePlan = BTreeMap<Address, BTreeSet<Address>>;

/// Fetched balances: token -> holder -> balance.
pub type Balances = BTreeMap<Address, BTreeMap<Address, U256>>;

/// A read-only contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    pub data: Bytes,
}

impl ContractCall {
    /// `token.balanceOf(holder)`.
    pub fn balance_of(token: Address, holder: Address) -> Self {
        Self {
            to: token,
            data: encode_balance_of(holder),
        }
    }
}

/// ABI-encode a `balanceOf(holder)` call.
pub fn encode_balance_of(holder: Address) -> Bytes {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(holder.as_slice());
    Bytes::from(data)
}

/// Decode a single ABI `uint256` return value.
pub fn decode_uint256(output: &[u8]) -> Result<U256> {
    if output.len() < 32 {
        return Err(Error::InvalidData(format!(
            "expected 32-byte uint256 return, got {} bytes",
            output.len()
        )));
    }
    Ok(U256::from_be_slice(&output[..32]))
}

/// Ethereum node operations consumed by the indexer.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Get a block with full transactions by hash.
    async fn block_by_hash(&self, hash: B256) -> Result<Block>;

    /// Get a block with full transactions by number; `None` selects the latest block.
    async fn block_by_number(&self, number: Option<u64>) -> Result<Block>;

    /// Get a transaction and whether it is still pending.
    async fn transaction_by_hash(&self, hash: B256) -> Result<(Transaction, bool)>;

    /// Get the uncle header at `index` of the block `hash`.
    async fn uncle_by_block_hash_and_position(&self, hash: B256, index: u64) -> Result<Header>;

    /// Get all uncle headers of a block, stopping at the first missing position.
    async fn uncles_by_block_hash(&self, hash: B256) -> Result<Vec<Header>> {
        let mut uncles = Vec::new();
        for index in 0..MAX_UNCLES as u64 {
            match self.uncle_by_block_hash_and_position(hash, index).await {
                Ok(header) => uncles.push(header),
                Err(Error::NotFound) | Err(Error::BlockNotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(uncles)
    }

    /// Publish the number of each new chain head into `heads` until every
    /// receiver is gone.
    ///
    /// The default polls the latest block every `interval`. Heads may repeat,
    /// skip or go backwards; consumers de-gap by number. Transient failures
    /// are logged and retried on the next tick.
    async fn subscribe_new_heads(
        &self,
        heads: watch::Sender<Option<u64>>,
        interval: Duration,
    ) -> Result<()> {
        loop {
            match self.block_by_number(None).await {
                Ok(block) => {
                    let number = block.number();
                    debug!(head = number, "Polled head");
                    heads.send_if_modified(|current| {
                        let changed = *current != Some(number);
                        *current = Some(number);
                        changed
                    });
                }
                Err(e) if e.is_transient() => warn!(error = %e, "Failed to poll head"),
                Err(e) => return Err(e),
            }
            if heads.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Get all receipts of a block in transaction order.
    async fn get_block_receipts(&self, hash: B256) -> Result<Vec<Receipt>>;

    /// Get the total difficulty at a block.
    async fn get_total_difficulty(&self, hash: B256) -> Result<U256>;

    /// Get native-coin transfers and reward pseudo-transfers of a block.
    async fn get_transfer_logs(&self, hash: B256) -> Result<Vec<TransferLog>>;

    /// Get native-coin balances at a block, one per address in order.
    async fn batch_balance_at(&self, addrs: &[Address], block_hash: B256) -> Result<Vec<U256>>;

    /// Execute read-only calls at a block, one output per call in order.
    async fn batch_call_contract(&self, calls: &[ContractCall], block_hash: B256)
        -> Result<Vec<Bytes>>;

    /// Fetch every balance named by `plan` at a block.
    ///
    /// Native-coin entries go through [`NodeClient::batch_balance_at`]; every
    /// other token is fanned out as `balanceOf` calls in one batch.
    async fn balance_of(&self, plan: &BalancePlan, block_hash: B256) -> Result<Balances> {
        let mut balances = Balances::new();

        if let Some(holders) = plan.get(&NATIVE_TOKEN) {
            let addrs = holders.iter().copied().collect::<Vec<_>>();
            if !addrs.is_empty() {
                let values = self.batch_balance_at(&addrs, block_hash).await?;
                if values.len() != addrs.len() {
                    return Err(Error::Rpc(format!(
                        "expected {} native balances, got {}",
                        addrs.len(),
                        values.len()
                    )));
                }
                balances
                    .entry(NATIVE_TOKEN)
                    .or_default()
                    .extend(addrs.into_iter().zip(values));
            }
        }

        let mut keys = Vec::new();
        let mut calls = Vec::new();
        for (token, holders) in plan.iter().filter(|(token, _)| **token != NATIVE_TOKEN) {
            for holder in holders {
                keys.push((*token, *holder));
                calls.push(ContractCall::balance_of(*token, *holder));
            }
        }

        if !calls.is_empty() {
            let outputs = self.batch_call_contract(&calls, block_hash).await?;
            if outputs.len() != calls.len() {
                return Err(Error::Rpc(format!(
                    "expected {} call results, got {}",
                    calls.len(),
                    outputs.len()
                )));
            }
            for ((token, holder), output) in keys.into_iter().zip(outputs) {
                balances
                    .entry(token)
                    .or_default()
                    .insert(holder, decode_uint256(&output)?);
            }
        }

        debug!(
            tokens = balances.len(),
            block_hash = %block_hash,
            "Fetched balances"
        );
        Ok(balances)
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted in-memory node for tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory [`NodeClient`] with programmable responses and call counting.
    #[derive(Default)]
    pub struct MockNode {
        blocks: Mutex<HashMap<B256, Block>>,
        canonical: Mutex<BTreeMap<u64, B256>>,
        receipts: Mutex<HashMap<B256, Vec<Receipt>>>,
        transfer_logs: Mutex<HashMap<B256, Vec<TransferLog>>>,
        uncles: Mutex<HashMap<B256, Vec<Header>>>,
        transactions: Mutex<HashMap<B256, Transaction>>,
        difficulty: Mutex<HashMap<B256, U256>>,
        /// (block hash, token, holder) -> balance
        balances: Mutex<HashMap<(B256, Address, Address), U256>>,
        failures: Mutex<HashMap<&'static str, usize>>,
        calls: Mutex<HashMap<&'static str, usize>>,
    }

    impl MockNode {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a block and make it canonical at its height.
        pub fn add_block(&self, block: Block) {
            self.canonical.lock().insert(block.number(), block.hash());
            for tx in &block.transactions {
                self.transactions.lock().insert(tx.hash, tx.clone());
            }
            self.blocks.lock().insert(block.hash(), block);
        }

        pub fn set_receipts(&self, block_hash: B256, receipts: Vec<Receipt>) {
            self.receipts.lock().insert(block_hash, receipts);
        }

        pub fn set_transfer_logs(&self, block_hash: B256, logs: Vec<TransferLog>) {
            self.transfer_logs.lock().insert(block_hash, logs);
        }

        pub fn set_uncles(&self, block_hash: B256, uncles: Vec<Header>) {
            self.uncles.lock().insert(block_hash, uncles);
        }

        pub fn set_total_difficulty(&self, block_hash: B256, td: U256) {
            self.difficulty.lock().insert(block_hash, td);
        }

        pub fn set_balance(&self, block_hash: B256, token: Address, holder: Address, value: u128) {
            self.balances
                .lock()
                .insert((block_hash, token, holder), U256::from(value));
        }

        /// Make the next `times` calls of `method` fail with an RPC error.
        pub fn fail_next(&self, method: &'static str, times: usize) {
            self.failures.lock().insert(method, times);
        }

        /// Number of calls that reached `method`, failed ones included.
        pub fn calls(&self, method: &'static str) -> usize {
            self.calls.lock().get(method).copied().unwrap_or(0)
        }

        fn enter(&self, method: &'static str) -> Result<()> {
            *self.calls.lock().entry(method).or_default() += 1;
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(method) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::Rpc(format!("{method}: injected failure")));
                }
            }
            Ok(())
        }

        fn balance(&self, block_hash: B256, token: Address, holder: Address) -> U256 {
            self.balances
                .lock()
                .get(&(block_hash, token, holder))
                .copied()
                .unwrap_or(U256::ZERO)
        }
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn block_by_hash(&self, hash: B256) -> Result<Block> {
            self.enter("block_by_hash")?;
            self.blocks
                .lock()
                .get(&hash)
                .cloned()
                .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
        }

        async fn block_by_number(&self, number: Option<u64>) -> Result<Block> {
            self.enter("block_by_number")?;
            let canonical = self.canonical.lock();
            let hash = match number {
                Some(n) => canonical.get(&n).copied(),
                None => canonical.values().next_back().copied(),
            }
            .ok_or_else(|| Error::BlockNotFound(format!("{number:?}")))?;
            self.blocks
                .lock()
                .get(&hash)
                .cloned()
                .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
        }

        async fn transaction_by_hash(&self, hash: B256) -> Result<(Transaction, bool)> {
            self.enter("transaction_by_hash")?;
            let tx = self.transactions.lock().get(&hash).cloned().ok_or(Error::NotFound)?;
            let pending = tx.block_hash.is_none();
            Ok((tx, pending))
        }

        async fn uncle_by_block_hash_and_position(&self, hash: B256, index: u64) -> Result<Header> {
            self.enter("uncle_by_block_hash_and_position")?;
            self.uncles
                .lock()
                .get(&hash)
                .and_then(|uncles| uncles.get(index as usize).cloned())
                .ok_or_else(|| Error::BlockNotFound(format!("uncle {index} of {hash}")))
        }

        async fn get_block_receipts(&self, hash: B256) -> Result<Vec<Receipt>> {
            self.enter("get_block_receipts")?;
            Ok(self.receipts.lock().get(&hash).cloned().unwrap_or_default())
        }

        async fn get_total_difficulty(&self, hash: B256) -> Result<U256> {
            self.enter("get_total_difficulty")?;
            self.difficulty
                .lock()
                .get(&hash)
                .copied()
                .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
        }

        async fn get_transfer_logs(&self, hash: B256) -> Result<Vec<TransferLog>> {
            self.enter("get_transfer_logs")?;
            Ok(self.transfer_logs.lock().get(&hash).cloned().unwrap_or_default())
        }

        async fn batch_balance_at(&self, addrs: &[Address], block_hash: B256) -> Result<Vec<U256>> {
            self.enter("batch_balance_at")?;
            Ok(addrs
                .iter()
                .map(|addr| self.balance(block_hash, NATIVE_TOKEN, *addr))
                .collect())
        }

        async fn batch_call_contract(
            &self,
            calls: &[ContractCall],
            block_hash: B256,
        ) -> Result<Vec<Bytes>> {
            self.enter("batch_call_contract")?;
            calls
                .iter()
                .map(|call| {
                    if call.data.len() != 36 || call.data[..4] != BALANCE_OF_SELECTOR {
                        return Err(Error::Rpc("mock only answers balanceOf".to_string()));
                    }
                    let holder = Address::from_slice(&call.data[16..36]);
                    let value = self.balance(block_hash, call.to, holder);
                    Ok(Bytes::from(value.to_be_bytes::<32>().to_vec()))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockNode;
    use super::*;
    use alloy_primitives::address;

    const TOKEN: Address = address!("00000000000000000000000000000000000000c3");
    const ALICE: Address = address!("00000000000000000000000000000000000000a1");
    const BOB: Address = address!("00000000000000000000000000000000000000b2");

    #[test]
    fn test_encode_balance_of() {
        let data = encode_balance_of(ALICE);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &BALANCE_OF_SELECTOR);
        assert!(data[4..16].iter().all(|b| *b == 0));
        assert_eq!(&data[16..], ALICE.as_slice());
    }

    #[test]
    fn test_decode_uint256() {
        let mut word = [0u8; 32];
        word[31] = 7;
        assert_eq!(decode_uint256(&word).unwrap(), U256::from(7u64));
        assert!(decode_uint256(&word[..31]).is_err());
    }

    #[tokio::test]
    async fn test_balance_of_mixes_native_and_erc20() {
        let node = MockNode::new();
        let block = B256::with_last_byte(1);
        node.set_balance(block, NATIVE_TOKEN, ALICE, 999);
        node.set_balance(block, TOKEN, ALICE, 2000);
        node.set_balance(block, TOKEN, BOB, 150);

        let mut plan = BalancePlan::new();
        plan.entry(NATIVE_TOKEN).or_default().insert(ALICE);
        plan.entry(TOKEN).or_default().extend([ALICE, BOB]);

        let balances = node.balance_of(&plan, block).await.unwrap();
        assert_eq!(balances[&NATIVE_TOKEN][&ALICE], U256::from(999u64));
        assert_eq!(balances[&TOKEN][&ALICE], U256::from(2000u64));
        assert_eq!(balances[&TOKEN][&BOB], U256::from(150u64));
        assert_eq!(node.calls("batch_balance_at"), 1);
        assert_eq!(node.calls("batch_call_contract"), 1);
    }

    #[tokio::test]
    async fn test_balance_of_empty_plan_makes_no_calls() {
        let node = MockNode::new();
        let balances = node.balance_of(&BalancePlan::new(), B256::ZERO).await.unwrap();
        assert!(balances.is_empty());
        assert_eq!(node.calls("batch_balance_at"), 0);
        assert_eq!(node.calls("batch_call_contract"), 0);
    }

    #[tokio::test]
    async fn test_balance_of_propagates_node_error() {
        let node = MockNode::new();
        node.fail_next("batch_call_contract", 1);
        let mut plan = BalancePlan::new();
        plan.entry(TOKEN).or_default().insert(ALICE);
        assert!(matches!(
            node.balance_of(&plan, B256::ZERO).await,
            Err(Error::Rpc(_))
        ));
    }

    #[tokio::test]
    async fn test_head_polling_stops_without_receivers() {
        let node = MockNode::new();
        let (heads, latest) = watch::channel(None);
        drop(latest);

        // Empty chain is a transient miss, then the closed channel ends the loop
        node.subscribe_new_heads(heads, Duration::ZERO).await.unwrap();
        assert_eq!(node.calls("block_by_number"), 1);
    }

    #[tokio::test]
    async fn test_uncles_stop_at_first_missing_position() {
        let node = MockNode::new();
        let hash = B256::with_last_byte(9);
        assert!(node.uncles_by_block_hash(hash).await.unwrap().is_empty());
        assert_eq!(node.calls("uncle_by_block_hash_and_position"), 1);
    }
}
