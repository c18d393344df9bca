//! Caching middleware for the node client
//!
//! Memoizes immutable upstream responses (blocks, confirmed transactions,
//! total difficulty, receipts and transfer logs) for the lifetime of the
//! process. Failures are never cached: an error from the wrapped client is
//! returned as-is and the next call goes upstream again.
//!
//! Each cache is an adaptive replacement cache ([`ArcCache`]) keyed by the
//! lower-case hex content hash.

use crate::error::Result;
use crate::node::{Balances, BalancePlan, ContractCall, NodeClient};
use crate::types::{Block, Header, Receipt, Transaction, TransferLog};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of entries per cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

struct ArcState<K: Hash + Eq, V> {
    capacity: usize,
    /// Target size of `recent`
    p: usize,
    /// Seen once recently
    recent: LruCache<K, V>,
    /// Seen at least twice recently
    frequent: LruCache<K, V>,
    /// Keys evicted from `recent`
    recent_ghost: LruCache<K, ()>,
    /// Keys evicted from `frequent`
    frequent_ghost: LruCache<K, ()>,
}

impl<K: Hash + Eq + Clone, V> ArcState<K, V> {
    fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }

    /// Evict one resident entry into its ghost list.
    fn replace(&mut self, in_frequent_ghost: bool) {
        let recent_len = self.recent.len();
        if recent_len > 0 && (recent_len > self.p || (recent_len == self.p && in_frequent_ghost)) {
            if let Some((key, _)) = self.recent.pop_lru() {
                self.recent_ghost.put(key, ());
            }
        } else if let Some((key, _)) = self.frequent.pop_lru() {
            self.frequent_ghost.put(key, ());
        }
    }
}

/// Thread-safe adaptive replacement cache.
///
/// Balances recency and frequency: entries hit twice move to a protected
/// list, and hits on recently evicted keys shift the split between the two.
pub struct ArcCache<K: Hash + Eq, V> {
    state: Mutex<ArcState<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ArcCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(ArcState {
                capacity: cap.get(),
                p: 0,
                recent: LruCache::new(cap),
                frequent: LruCache::new(cap),
                recent_ghost: LruCache::new(cap),
                frequent_ghost: LruCache::new(cap),
            }),
        }
    }

    /// Look up a key, promoting it to the frequent list on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        if let Some(value) = state.recent.pop(key) {
            state.frequent.put(key.clone(), value.clone());
            return Some(value);
        }
        state.frequent.get(key).cloned()
    }

    /// Insert or update a key.
    pub fn put(&self, key: K, value: V) {
        let mut state = self.state.lock();
        let capacity = state.capacity;

        if state.recent.pop(&key).is_some() || state.frequent.contains(&key) {
            state.frequent.put(key, value);
            return;
        }

        if state.recent_ghost.contains(&key) {
            let delta = if state.frequent_ghost.len() > state.recent_ghost.len() {
                state.frequent_ghost.len() / state.recent_ghost.len()
            } else {
                1
            };
            state.p = (state.p + delta).min(capacity);
            if state.len() >= capacity {
                state.replace(false);
            }
            state.recent_ghost.pop(&key);
            state.frequent.put(key, value);
            return;
        }

        if state.frequent_ghost.contains(&key) {
            let delta = if state.recent_ghost.len() > state.frequent_ghost.len() {
                state.recent_ghost.len() / state.frequent_ghost.len()
            } else {
                1
            };
            state.p = state.p.saturating_sub(delta);
            if state.len() >= capacity {
                state.replace(true);
            }
            state.frequent_ghost.pop(&key);
            state.frequent.put(key, value);
            return;
        }

        if state.len() >= capacity {
            state.replace(false);
        }
        if state.recent_ghost.len() > capacity - state.p {
            state.recent_ghost.pop_lru();
        }
        if state.frequent_ghost.len() > state.p {
            state.frequent_ghost.pop_lru();
        }
        state.recent.put(key, value);
    }

    /// Drop a key from the cache and its ghost lists.
    pub fn remove(&self, key: &K) {
        let mut state = self.state.lock();
        state.recent.pop(key);
        state.frequent.pop(key);
        state.recent_ghost.pop(key);
        state.frequent_ghost.pop(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.recent.contains(key) || state.frequent.contains(key)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for a content hash.
pub fn cache_key(hash: B256) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Per-block artifacts sharing one cache.
#[derive(Debug, Clone)]
enum BlockArtifact {
    Receipts(Arc<Vec<Receipt>>),
    TransferLogs(Arc<Vec<TransferLog>>),
}

/// [`NodeClient`] middleware memoizing immutable responses.
pub struct CachedNodeClient<C> {
    inner: C,
    blocks: ArcCache<String, Arc<Block>>,
    transactions: ArcCache<String, Arc<Transaction>>,
    difficulty: ArcCache<String, U256>,
    artifacts: ArcCache<String, BlockArtifact>,
}

impl<C: NodeClient> CachedNodeClient<C> {
    /// Wrap `inner` with caches of [`DEFAULT_CACHE_CAPACITY`] entries.
    pub fn new(inner: C) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: C, capacity: usize) -> Self {
        Self {
            inner,
            blocks: ArcCache::new(capacity),
            transactions: ArcCache::new(capacity),
            difficulty: ArcCache::new(capacity),
            artifacts: ArcCache::new(capacity),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: NodeClient> NodeClient for CachedNodeClient<C> {
    async fn block_by_hash(&self, hash: B256) -> Result<Block> {
        let key = cache_key(hash);
        if let Some(block) = self.blocks.get(&key) {
            trace!(%key, "block cache hit");
            return Ok(block.as_ref().clone());
        }

        let block = self.inner.block_by_hash(hash).await?;
        self.blocks.put(key, Arc::new(block.clone()));
        Ok(block)
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block> {
        let block = self.inner.block_by_number(number).await?;
        self.blocks.put(cache_key(block.hash()), Arc::new(block.clone()));
        Ok(block)
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<(Transaction, bool)> {
        let key = cache_key(hash);
        if let Some(tx) = self.transactions.get(&key) {
            return Ok((tx.as_ref().clone(), false));
        }

        let (tx, pending) = self.inner.transaction_by_hash(hash).await?;
        if !pending {
            self.transactions.put(key, Arc::new(tx.clone()));
        }
        Ok((tx, pending))
    }

    async fn uncle_by_block_hash_and_position(&self, hash: B256, index: u64) -> Result<Header> {
        self.inner.uncle_by_block_hash_and_position(hash, index).await
    }

    async fn get_block_receipts(&self, hash: B256) -> Result<Vec<Receipt>> {
        let key = cache_key(hash);
        match self.artifacts.get(&key) {
            Some(BlockArtifact::Receipts(receipts)) => return Ok(receipts.as_ref().clone()),
            Some(_) => {
                debug!(%key, "cached artifact is not a receipt list, refetching");
                self.artifacts.remove(&key);
            }
            None => {}
        }

        let receipts = self.inner.get_block_receipts(hash).await?;
        self.artifacts
            .put(key, BlockArtifact::Receipts(Arc::new(receipts.clone())));
        Ok(receipts)
    }

    async fn get_total_difficulty(&self, hash: B256) -> Result<U256> {
        let key = cache_key(hash);
        if let Some(td) = self.difficulty.get(&key) {
            return Ok(td);
        }

        let td = self.inner.get_total_difficulty(hash).await?;
        self.difficulty.put(key, td);
        Ok(td)
    }

    async fn get_transfer_logs(&self, hash: B256) -> Result<Vec<TransferLog>> {
        let key = cache_key(hash);
        match self.artifacts.get(&key) {
            Some(BlockArtifact::TransferLogs(logs)) => return Ok(logs.as_ref().clone()),
            Some(_) => {
                debug!(%key, "cached artifact is not a transfer log list, refetching");
                self.artifacts.remove(&key);
            }
            None => {}
        }

        let logs = self.inner.get_transfer_logs(hash).await?;
        self.artifacts
            .put(key, BlockArtifact::TransferLogs(Arc::new(logs.clone())));
        Ok(logs)
    }

    async fn batch_balance_at(&self, addrs: &[Address], block_hash: B256) -> Result<Vec<U256>> {
        self.inner.batch_balance_at(addrs, block_hash).await
    }

    async fn batch_call_contract(
        &self,
        calls: &[ContractCall],
        block_hash: B256,
    ) -> Result<Vec<Bytes>> {
        self.inner.batch_call_contract(calls, block_hash).await
    }

    async fn balance_of(&self, plan: &BalancePlan, block_hash: B256) -> Result<Balances> {
        self.inner.balance_of(plan, block_hash).await
    }
}
