//! New-ERC20 bootstrap
//!
//! A token registered after subscriptions already exist has no balance
//! history. Before the first block that sees it, every subscriber's balance
//! of the token is fetched from the node and recorded as a snapshot, and the
//! per-group sums become the token's first totals. The token then becomes
//! active for the following block.
//!
//! Subscribers are the processed subscriptions plus the page of new ones the
//! transfer processor picks up at the same block. New subscriptions left for
//! later blocks are seeded by the processor once the token is active.

use crate::error::Result;
use crate::node::{BalancePlan, NodeClient};
use crate::records::{format_balance, AccountSnapshot, Erc20Record, Subscription, TotalBalance};
use crate::store::{BlockBatch, Store};
use alloy_primitives::{Address, B256, U256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Default number of subscriptions per bootstrap page.
pub const DEFAULT_SUB_LIMIT: u64 = 1000;

/// Finite pager over all subscriptions.
///
/// Pages are read lazily; the total is taken from the first page so the
/// sequence ends even while rows are added concurrently.
pub struct SubscriptionPager<'a, S: ?Sized> {
    store: &'a S,
    limit: u64,
    page: u64,
    total: Option<u64>,
}

impl<'a, S: Store + ?Sized> SubscriptionPager<'a, S> {
    pub fn new(store: &'a S, limit: u64) -> Self {
        Self {
            store,
            limit: limit.max(1),
            page: 0,
            total: None,
        }
    }

    /// Start over from the first page.
    pub fn reset(&mut self) {
        self.page = 0;
        self.total = None;
    }

    /// Total number of subscriptions, once the first page is read.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    fn exhausted(&self) -> bool {
        matches!(self.total, Some(total) if self.page.saturating_mul(self.limit) >= total)
    }
}

impl<S: Store + ?Sized> Iterator for SubscriptionPager<'_, S> {
    type Item = Result<Vec<Subscription>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted() {
            return None;
        }
        match self.store.find_subscriptions(self.page, self.limit) {
            Ok((subs, total)) => {
                self.total.get_or_insert(total);
                self.page += 1;
                if subs.is_empty() {
                    self.total = Some(0);
                    return None;
                }
                Some(Ok(subs))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Page sizes of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapLimits {
    /// Subscriptions per balance page
    pub sub_limit: u64,
    /// New subscriptions the processor takes at the same block
    pub new_subscription_limit: u64,
}

/// Seed every uninitialized token at block `number`.
///
/// Stages one snapshot per (token, subscriber) and one total per
/// (group, token) at `number`, then marks each token active from
/// `number + 1`. Returns the bootstrapped tokens.
pub async fn bootstrap_new_tokens<S, N>(
    store: &S,
    node: &N,
    number: u64,
    block_hash: B256,
    limits: BootstrapLimits,
    batch: &mut BlockBatch,
) -> Result<Vec<Address>>
where
    S: Store + ?Sized,
    N: NodeClient + ?Sized,
{
    let pending = store
        .list_erc20()?
        .into_iter()
        .filter(|e| !e.is_initialized())
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let tokens = pending.iter().map(|e| e.address).collect::<Vec<_>>();
    info!(block = number, tokens = ?tokens, "Bootstrapping new ERC20 tokens");

    // Same page the processor reads before this block commits
    let (first_new, _) = store.find_new_subscriptions(0, limits.new_subscription_limit)?;
    let taken = first_new.iter().map(|s| s.address).collect::<BTreeSet<_>>();

    let mut sums: BTreeMap<(u64, Address), U256> = BTreeMap::new();
    let mut snapshots = 0usize;

    for page in SubscriptionPager::new(store, limits.sub_limit) {
        let page = page?;
        let groups = page
            .iter()
            .filter(|s| !s.is_new() || taken.contains(&s.address))
            .map(|s| (s.address, s.group))
            .collect::<BTreeMap<_, _>>();
        if groups.is_empty() {
            continue;
        }

        let mut plan = BalancePlan::new();
        for token in &tokens {
            plan.insert(*token, groups.keys().copied().collect());
        }

        let balances = node.balance_of(&plan, block_hash).await?;
        for (token, holders) in balances {
            for (holder, balance) in holders {
                let Some(group) = groups.get(&holder) else {
                    continue;
                };
                batch.insert_account(AccountSnapshot::new(token, holder, number, balance));
                let sum = sums.entry((*group, token)).or_default();
                *sum = sum.saturating_add(balance);
                snapshots += 1;
            }
        }
        debug!(block = number, page_size = page.len(), "Bootstrapped subscription page");
    }

    for ((group, token), sum) in sums {
        batch.insert_total_balance(TotalBalance {
            balance: format_balance(sum),
            ..TotalBalance::zero(token, group, number)
        });
    }

    for erc20 in pending {
        batch.put_erc20(Erc20Record {
            block_number: number + 1,
            ..erc20
        });
    }

    info!(block = number, snapshots, "Bootstrap staged");
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::MockNode;
    use crate::store::RocksStore;
    use alloy_primitives::address;
    use tempfile::TempDir;

    const T2: Address = address!("00000000000000000000000000000000000000d2");
    const S1: Address = address!("0000000000000000000000000000000000000051");
    const S2: Address = address!("0000000000000000000000000000000000000052");
    const S3: Address = address!("0000000000000000000000000000000000000053");

    fn create_test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn limits(sub_limit: u64, new_subscription_limit: u64) -> BootstrapLimits {
        BootstrapLimits { sub_limit, new_subscription_limit }
    }

    #[test]
    fn test_pager_is_finite() {
        let (store, _temp_dir) = create_test_store();
        store
            .insert_subscriptions(&[
                Subscription::new(S1, 1),
                Subscription::new(S2, 1),
                Subscription::new(S3, 2),
            ])
            .unwrap();

        let mut pager = SubscriptionPager::new(&store, 2);
        let sizes = pager
            .by_ref()
            .map(|page| page.unwrap().len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(pager.total(), Some(3));
        assert!(pager.next().is_none());

        pager.reset();
        assert_eq!(pager.count(), 2);
    }

    #[test]
    fn test_pager_on_empty_store() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(SubscriptionPager::new(&store, 10).count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_new_token_mid_chain() {
        let (store, _temp_dir) = create_test_store();
        store.insert_erc20(&Erc20Record::new(T2)).unwrap();
        store
            .insert_subscriptions(&[
                Subscription::new(S1, 1),
                Subscription::new(S2, 1),
                Subscription::new(S3, 2),
            ])
            .unwrap();
        let mut processed = BlockBatch::new();
        processed.update_subscription_block(vec![S1, S2, S3], 100);
        store.commit(processed).unwrap();

        let hash = B256::with_last_byte(100);
        let node = MockNode::new();
        node.set_balance(hash, T2, S1, 10);
        node.set_balance(hash, T2, S2, 20);
        node.set_balance(hash, T2, S3, 7);

        let mut batch = BlockBatch::new();
        let tokens = bootstrap_new_tokens(&store, &node, 100, hash, limits(1, 10), &mut batch)
            .await
            .unwrap();
        assert_eq!(tokens, vec![T2]);
        assert_eq!(node.calls("batch_call_contract"), 3);

        // Nothing is visible before commit
        assert!(!store.find_erc20(T2).unwrap().is_initialized());
        store.commit(batch).unwrap();

        for (holder, balance) in [(S1, 10u64), (S2, 20), (S3, 7)] {
            let snapshot = store.find_account(T2, holder, 100).unwrap();
            assert_eq!(snapshot.block_number, 100);
            assert_eq!(snapshot.balance().unwrap(), U256::from(balance));
        }

        let g1 = store.find_total_balance(100, T2, 1).unwrap();
        assert_eq!(g1.block_number, 100);
        assert_eq!(g1.balance().unwrap(), U256::from(30u64));
        assert_eq!(g1.tx_fee, "0");
        assert_eq!(store.find_total_balance(100, T2, 2).unwrap().balance, "7");
        assert_eq!(store.find_erc20(T2).unwrap().block_number, 101);
    }

    #[tokio::test]
    async fn test_bootstrap_without_pending_tokens_is_noop() {
        let (store, _temp_dir) = create_test_store();
        let mut active = Erc20Record::new(T2);
        active.block_number = 5;
        store.insert_erc20(&active).unwrap();
        store.insert_subscriptions(&[Subscription::new(S1, 1)]).unwrap();

        let node = MockNode::new();
        let mut batch = BlockBatch::new();
        let tokens = bootstrap_new_tokens(&store, &node, 100, B256::ZERO, limits(10, 10), &mut batch)
            .await
            .unwrap();
        assert!(tokens.is_empty());
        assert!(batch.is_empty());
        assert_eq!(node.calls("batch_call_contract"), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_node_error_aborts() {
        let (store, _temp_dir) = create_test_store();
        store.insert_erc20(&Erc20Record::new(T2)).unwrap();
        store.insert_subscriptions(&[Subscription::new(S1, 1)]).unwrap();

        let node = MockNode::new();
        node.fail_next("batch_call_contract", 1);
        let mut batch = BlockBatch::new();
        assert!(bootstrap_new_tokens(&store, &node, 100, B256::ZERO, limits(10, 10), &mut batch)
            .await
            .is_err());
        assert!(!store.find_erc20(T2).unwrap().is_initialized());
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_only_new_subscriptions_taken_this_block() {
        let (store, _temp_dir) = create_test_store();
        store.insert_erc20(&Erc20Record::new(T2)).unwrap();
        store
            .insert_subscriptions(&[
                Subscription::new(S1, 1),
                Subscription::new(S2, 1),
                Subscription::new(S3, 1),
            ])
            .unwrap();
        let mut processed = BlockBatch::new();
        processed.update_subscription_block(vec![S1], 90);
        store.commit(processed).unwrap();

        let hash = B256::with_last_byte(100);
        let node = MockNode::new();
        node.set_balance(hash, T2, S1, 10);
        node.set_balance(hash, T2, S2, 20);
        node.set_balance(hash, T2, S3, 7);

        let mut batch = BlockBatch::new();
        bootstrap_new_tokens(&store, &node, 100, hash, limits(10, 1), &mut batch)
            .await
            .unwrap();
        store.commit(batch).unwrap();

        assert_eq!(store.find_account(T2, S1, 100).unwrap().balance, "10");
        assert_eq!(store.find_account(T2, S2, 100).unwrap().balance, "20");
        // S3 is beyond this block's new-subscription page
        assert!(store.find_account(T2, S3, 100).unwrap_err().is_not_found());
        assert_eq!(store.find_total_balance(100, T2, 1).unwrap().balance, "30");
    }
}
