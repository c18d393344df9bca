//! Transfer processor
//!
//! Applies one block to the subscription ledger. For every subscribed address
//! the block touches (or that is newly subscribed) the authoritative balance
//! is fetched from the node, snapshotted, and diffed against the previous
//! snapshot. Diffs are folded into per-group totals together with the fees
//! paid and the rewards received by subscribers.
//!
//! All writes go to the block's [`BlockBatch`]; nothing is visible until the
//! caller commits it.

use crate::decoder::Transfer;
use crate::error::{Error, OptionalExt, Result};
use crate::fee::transaction_fee;
use crate::node::{BalancePlan, NodeClient};
use crate::records::{
    format_balance, is_reward_sentinel, AccountSnapshot, Subscription, TotalBalance, MAX_UNCLES,
    MINER_REWARD, NATIVE_TOKEN, UNCLE_REWARD,
};
use crate::store::{BlockBatch, Store};
use crate::types::{Block, Receipt};
use alloy_primitives::{Address, I256, U256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Default cap on new subscriptions picked up per block.
///
/// Chunk size of a balance batch minus the expected number of touched
/// subscribers, so a block's balance query stays within one batch.
pub const DEFAULT_NEW_SUBSCRIPTION_LIMIT: u64 = 1000 - 100;

/// One block and the transfers decoded from it.
pub struct BlockInput<'a> {
    pub block: &'a Block,
    pub receipts: &'a [Receipt],
    /// Token transfers followed by native and reward transfers
    pub events: &'a [Transfer],
    /// Tokens active at this block
    pub active: &'a BTreeSet<Address>,
}

/// What a processed block wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub subscribers: usize,
    pub new_subscriptions: usize,
    pub snapshots: usize,
    pub transfers: usize,
    pub totals: usize,
}

/// Fee and reward diffs of one block.
#[derive(Debug, Default)]
struct RewardDiffs {
    miner: Option<(Address, U256)>,
    uncles: BTreeMap<Address, U256>,
    fees: BTreeMap<Address, U256>,
}

/// Running total of one (group, token).
#[derive(Debug)]
struct GroupTotal {
    balance: I256,
    tx_fee: U256,
    miner_reward: Option<U256>,
    uncles_reward: U256,
}

fn to_signed(value: U256) -> Result<I256> {
    I256::try_from(value).map_err(|_| Error::InvalidBalance(value.to_string()))
}

fn to_unsigned(value: I256) -> Result<U256> {
    U256::try_from(value).map_err(|_| Error::InvalidBalance(value.to_string()))
}

/// Applies blocks to the subscription ledger.
pub struct TransferProcessor<'a, S: ?Sized, N: ?Sized> {
    store: &'a S,
    node: &'a N,
    new_subscription_limit: u64,
}

impl<'a, S, N> TransferProcessor<'a, S, N>
where
    S: Store + ?Sized,
    N: NodeClient + ?Sized,
{
    pub fn new(store: &'a S, node: &'a N) -> Self {
        Self {
            store,
            node,
            new_subscription_limit: DEFAULT_NEW_SUBSCRIPTION_LIMIT,
        }
    }

    pub fn with_new_subscription_limit(mut self, limit: u64) -> Self {
        self.new_subscription_limit = limit;
        self
    }

    /// Stage the ledger writes of one block into `batch`.
    pub async fn process(&self, input: &BlockInput<'_>, batch: &mut BlockBatch) -> Result<ProcessSummary> {
        let number = input.block.number();
        let mut summary = ProcessSummary::default();
        let mut rewards = collect_rewards(input.events)?;

        // Senders pay gas even for zero-value transactions
        let mut senders = Vec::with_capacity(input.block.transactions.len());
        for tx in &input.block.transactions {
            senders.push(tx.from.ok_or(Error::WrongSigner(tx.hash))?);
        }

        let mut touched = senders.iter().copied().collect::<BTreeSet<_>>();
        for event in input.events {
            if !is_reward_sentinel(event.from) {
                touched.insert(event.from);
            }
            touched.insert(event.to);
        }

        let (new_subs, _) = self
            .store
            .find_new_subscriptions(0, self.new_subscription_limit)?;
        let touched = touched.into_iter().collect::<Vec<_>>();
        let old_subs = self.store.find_old_subscriptions(&touched)?;

        let new_addrs = new_subs.iter().map(|s| s.address).collect::<BTreeSet<_>>();
        let subs = old_subs
            .into_iter()
            .chain(new_subs)
            .map(|s| (s.address, s))
            .collect::<BTreeMap<Address, Subscription>>();
        summary.subscribers = subs.len();
        summary.new_subscriptions = new_addrs.len();

        if subs.is_empty() {
            debug!(block = number, "No subscribers touched");
            return Ok(summary);
        }

        // Balance fetch plan
        let mut plan = BalancePlan::new();
        for addr in &new_addrs {
            plan.entry(NATIVE_TOKEN).or_default().insert(*addr);
            for token in input.active {
                plan.entry(*token).or_default().insert(*addr);
            }
        }
        for event in input.events {
            for addr in [event.from, event.to] {
                if subs.contains_key(&addr) {
                    plan.entry(event.token).or_default().insert(addr);
                }
            }
        }

        // Transfer rows for subscribed parties
        for (seq, event) in input.events.iter().enumerate() {
            if subs.contains_key(&event.from) || subs.contains_key(&event.to) {
                batch.insert_transfer(seq as u32, event.to_record(number));
                summary.transfers += 1;
            }
        }

        // Fees of subscribed senders
        if input.receipts.len() != input.block.transactions.len() {
            return Err(Error::InvalidData(format!(
                "block {} has {} transactions but {} receipts",
                number,
                input.block.transactions.len(),
                input.receipts.len()
            )));
        }
        let base_fee = input.block.header.base_fee_per_gas;
        for ((tx, receipt), sender) in input
            .block
            .transactions
            .iter()
            .zip(input.receipts)
            .zip(&senders)
        {
            if !subs.contains_key(sender) {
                continue;
            }
            let fee = transaction_fee(tx, receipt, base_fee)?;
            let total = rewards.fees.entry(*sender).or_default();
            *total = total.saturating_add(fee);
            plan.entry(NATIVE_TOKEN).or_default().insert(*sender);
        }

        let balances = self.node.balance_of(&plan, input.block.hash()).await?;

        // Snapshots and diffs
        let mut diffs: Vec<(Address, Address, I256)> = Vec::new();
        for (token, holders) in &balances {
            let addrs = holders.keys().copied().collect::<Vec<_>>();
            let previous = self
                .store
                .find_latest_accounts(*token, &addrs, number)?
                .into_iter()
                .map(|s| (s.address, s))
                .collect::<BTreeMap<_, _>>();

            for (addr, balance) in holders {
                batch.insert_account(AccountSnapshot::new(*token, *addr, number, *balance));
                summary.snapshots += 1;

                let diff = match (new_addrs.contains(addr), previous.get(addr)) {
                    (true, Some(_)) => {
                        return Err(Error::HasPrevBalance { token: *token, address: *addr })
                    }
                    (true, None) => to_signed(*balance)?,
                    (false, None) => {
                        return Err(Error::MissingPrevBalance { token: *token, address: *addr })
                    }
                    (false, Some(prev)) => to_signed(*balance)?
                        .checked_sub(to_signed(prev.balance()?)?)
                        .ok_or_else(|| Error::InvalidBalance(balance.to_string()))?,
                };
                debug!(block = number, %token, %addr, %diff, "Balance diff");
                diffs.push((*token, *addr, diff));
            }
        }

        batch.update_subscription_block(new_addrs.iter().copied().collect(), number);

        // Group totals
        let mut totals: BTreeMap<(u64, Address), GroupTotal> = BTreeMap::new();
        for (token, addr, diff) in diffs {
            let Some(sub) = subs.get(&addr) else {
                warn!(block = number, %addr, "Balance diff for unsubscribed address");
                continue;
            };
            let total = self.group_total(&mut totals, number, sub.group, token)?;
            total.balance = total
                .balance
                .checked_add(diff)
                .ok_or_else(|| Error::InvalidBalance(diff.to_string()))?;
        }

        for (sender, fee) in std::mem::take(&mut rewards.fees) {
            if let Some(sub) = subs.get(&sender) {
                let total = self.group_total(&mut totals, number, sub.group, NATIVE_TOKEN)?;
                total.tx_fee = total.tx_fee.saturating_add(fee);
            }
        }
        if let Some((miner, reward)) = rewards.miner {
            if let Some(sub) = subs.get(&miner) {
                let total = self.group_total(&mut totals, number, sub.group, NATIVE_TOKEN)?;
                total.miner_reward.get_or_insert(reward);
            }
        }
        for (uncle, reward) in rewards.uncles {
            if let Some(sub) = subs.get(&uncle) {
                let total = self.group_total(&mut totals, number, sub.group, NATIVE_TOKEN)?;
                total.uncles_reward = total.uncles_reward.saturating_add(reward);
            }
        }

        for ((group, token), total) in totals {
            let mut row = TotalBalance::zero(token, group, number);
            row.balance = format_balance(to_unsigned(total.balance)?);
            if token == NATIVE_TOKEN {
                row.tx_fee = format_balance(total.tx_fee);
                row.miner_reward = format_balance(total.miner_reward.unwrap_or_default());
                row.uncles_reward = format_balance(total.uncles_reward);
            }
            batch.insert_total_balance(row);
            summary.totals += 1;
        }

        debug!(
            block = number,
            subscribers = summary.subscribers,
            snapshots = summary.snapshots,
            totals = summary.totals,
            "Processed block transfers"
        );
        Ok(summary)
    }

    /// Running total of (group, token), seeded once from the carry-forward
    /// total before `number`.
    fn group_total<'t>(
        &self,
        totals: &'t mut BTreeMap<(u64, Address), GroupTotal>,
        number: u64,
        group: u64,
        token: Address,
    ) -> Result<&'t mut GroupTotal> {
        if !totals.contains_key(&(group, token)) {
            let prev = match number.checked_sub(1) {
                Some(before) => self
                    .store
                    .find_total_balance(before, token, group)
                    .optional()?,
                None => None,
            };
            let balance = match prev {
                Some(prev) => to_signed(prev.balance()?)?,
                None => I256::ZERO,
            };
            totals.insert(
                (group, token),
                GroupTotal {
                    balance,
                    tx_fee: U256::ZERO,
                    miner_reward: None,
                    uncles_reward: U256::ZERO,
                },
            );
        }
        totals
            .get_mut(&(group, token))
            .ok_or_else(|| Error::InvalidData("group total vanished".to_string()))
    }
}

/// Validate and collect the reward pseudo-transfers of a block.
fn collect_rewards(events: &[Transfer]) -> Result<RewardDiffs> {
    let mut rewards = RewardDiffs::default();
    let mut uncle_events = 0usize;

    for event in events {
        if event.from == MINER_REWARD {
            match rewards.miner {
                Some((miner, _)) if miner != event.to => return Err(Error::TooManyMiners),
                _ => rewards.miner = Some((event.to, event.value)),
            }
        } else if event.from == UNCLE_REWARD {
            uncle_events += 1;
            if uncle_events > MAX_UNCLES {
                return Err(Error::TooManyUncles);
            }
            let reward = rewards.uncles.entry(event.to).or_default();
            *reward = reward.saturating_add(event.value);
        }
    }

    Ok(rewards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode_block_transfers, TRANSFER_TOPIC};
    use crate::node::testing::MockNode;
    use crate::records::Erc20Record;
    use crate::store::RocksStore;
    use crate::types::{Header, Log, Transaction, TransferLog};
    use alloy_primitives::{address, Bloom, Bytes, B256, B64};
    use tempfile::TempDir;

    const TOKEN: Address = address!("00000000000000000000000000000000000000c3");
    const A: Address = address!("00000000000000000000000000000000000000a1");
    const B: Address = address!("00000000000000000000000000000000000000b2");
    const C: Address = address!("00000000000000000000000000000000000000c1");
    const MINER_VALUE: u128 = 5_000_000_000_000_000_040;

    fn create_test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn tx(index: u8, from: Address, to: Address) -> Transaction {
        Transaction {
            hash: B256::with_last_byte(0xf0 + index),
            block_hash: Some(B256::with_last_byte(100)),
            transaction_index: Some(index as u64),
            from: Some(from),
            to: Some(to),
            value: U256::from(1u64),
            gas_price: Some(U256::from(1u64)),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            gas: 21000,
            input: Bytes::new(),
            nonce: 0,
            v: U256::ZERO,
            r: U256::ZERO,
            s: U256::ZERO,
        }
    }

    fn block(number: u64, miner: Address, transactions: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                number,
                hash: B256::with_last_byte(number as u8),
                parent_hash: B256::with_last_byte(number as u8 - 1),
                miner,
                timestamp: number,
                nonce: B64::ZERO,
                difficulty: U256::ZERO,
                gas_limit: 30_000_000,
                gas_used: 40,
                extra_data: Bytes::new(),
                mix_hash: B256::ZERO,
                state_root: B256::ZERO,
                transactions_root: B256::ZERO,
                receipts_root: B256::ZERO,
                base_fee_per_gas: None,
            },
            uncles: vec![],
            transactions,
        }
    }

    fn token_log(from: Address, to: Address, value: u64) -> Log {
        Log {
            address: TOKEN,
            topics: vec![
                TRANSFER_TOPIC,
                B256::left_padding_from(from.as_slice()),
                B256::left_padding_from(to.as_slice()),
            ],
            data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
            transaction_hash: None,
            block_number: None,
            log_index: None,
        }
    }

    fn receipt(tx: &Transaction, gas_used: u64, logs: Vec<Log>) -> Receipt {
        Receipt {
            transaction_hash: tx.hash,
            transaction_index: tx.transaction_index.unwrap_or_default(),
            status: 1,
            cumulative_gas_used: gas_used,
            gas_used: U256::from(gas_used),
            effective_gas_price: Some(U256::from(1u64)),
            logs_bloom: Bloom::ZERO,
            contract_address: None,
            logs,
        }
    }

    fn native(from: Address, to: Address, value: u128, tx_hash: B256) -> TransferLog {
        TransferLog {
            from,
            to,
            value: U256::from(value),
            transaction_hash: tx_hash,
        }
    }

    fn reward(from: Address, to: Address, value: u128) -> Transfer {
        Transfer {
            token: NATIVE_TOKEN,
            tx_hash: B256::ZERO,
            from,
            to,
            value: U256::from(value),
        }
    }

    /// Subscriptions A (g1, processed at 90), B (g1, new), C (g2, new); token
    /// active since block 1; A's balances and the group 1 totals carried from before.
    fn seed_normal_append(store: &RocksStore) {
        let mut token = Erc20Record::new(TOKEN);
        token.block_number = 1;
        store.insert_erc20(&token).unwrap();
        store
            .insert_subscriptions(&[
                Subscription::new(A, 1),
                Subscription::new(B, 1),
                Subscription::new(C, 2),
            ])
            .unwrap();

        let mut batch = BlockBatch::new();
        batch.update_subscription_block(vec![A], 90);
        batch.insert_account(AccountSnapshot::new(NATIVE_TOKEN, A, 90, U256::from(1000u64)));
        batch.insert_account(AccountSnapshot::new(TOKEN, A, 90, U256::from(2000u64)));
        batch.insert_total_balance(TotalBalance {
            balance: "2000".to_string(),
            ..TotalBalance::zero(TOKEN, 1, 99)
        });
        batch.insert_total_balance(TotalBalance {
            balance: "1000".to_string(),
            ..TotalBalance::zero(NATIVE_TOKEN, 1, 99)
        });
        store.commit(batch).unwrap();
    }

    #[tokio::test]
    async fn test_normal_append() {
        let (store, _temp_dir) = create_test_store();
        seed_normal_append(&store);

        let tx1 = tx(1, A, B);
        let tx2 = tx(2, B, C);
        let b = block(100, A, vec![tx1.clone(), tx2.clone()]);
        let receipts = vec![
            receipt(&tx1, 20, vec![token_log(A, B, 1)]),
            receipt(&tx2, 20, vec![token_log(C, A, 1)]),
        ];
        let transfer_logs = vec![
            native(A, B, 1, tx1.hash),
            native(B, C, 1, tx2.hash),
            native(MINER_REWARD, A, MINER_VALUE, B256::ZERO),
        ];
        let active = BTreeSet::from([TOKEN]);
        let events = decode_block_transfers(&receipts, &transfer_logs, &active).unwrap();

        let node = MockNode::new();
        let hash = b.hash();
        for (addr, native_balance, token_balance) in [(A, 999, 2000), (B, 100, 150), (C, 500, 1000)] {
            node.set_balance(hash, NATIVE_TOKEN, addr, native_balance);
            node.set_balance(hash, TOKEN, addr, token_balance);
        }

        let processor = TransferProcessor::new(&store, &node);
        let input = BlockInput {
            block: &b,
            receipts: &receipts,
            events: &events,
            active: &active,
        };
        let mut batch = BlockBatch::new();
        let summary = processor.process(&input, &mut batch).await.unwrap();
        store.commit(batch).unwrap();

        assert_eq!(summary.subscribers, 3);
        assert_eq!(summary.new_subscriptions, 2);
        assert_eq!(summary.snapshots, 6);
        assert_eq!(summary.transfers, 5);
        assert_eq!(node.calls("batch_balance_at"), 1);
        assert_eq!(node.calls("batch_call_contract"), 1);

        let t1 = store.find_total_balance(100, TOKEN, 1).unwrap();
        assert_eq!(t1.block_number, 100);
        assert_eq!(t1.balance, "2150");
        assert_eq!(t1.tx_fee, "0");
        assert_eq!(t1.miner_reward, "0");

        let n1 = store.find_total_balance(100, NATIVE_TOKEN, 1).unwrap();
        assert_eq!(n1.balance, "1099");
        assert_eq!(n1.tx_fee, "40");
        assert_eq!(n1.miner_reward, MINER_VALUE.to_string());
        assert_eq!(n1.uncles_reward, "0");

        assert_eq!(store.find_total_balance(100, TOKEN, 2).unwrap().balance, "1000");
        let n2 = store.find_total_balance(100, NATIVE_TOKEN, 2).unwrap();
        assert_eq!(n2.balance, "500");
        assert_eq!(n2.tx_fee, "0");

        // New subscriptions are now processed; A keeps its original block
        let old = store.find_old_subscriptions(&[A, B, C]).unwrap();
        let blocks = old.iter().map(|s| (s.address, s.block_number)).collect::<BTreeMap<_, _>>();
        assert_eq!(blocks[&A], 90);
        assert_eq!(blocks[&B], 100);
        assert_eq!(blocks[&C], 100);

        assert_eq!(store.find_account(TOKEN, B, 100).unwrap().balance, "150");
        assert_eq!(store.find_transfers_by_block(100).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_two_miners_is_error() {
        let (store, _temp_dir) = create_test_store();
        store.insert_subscriptions(&[Subscription::new(A, 1)]).unwrap();

        let b = block(100, A, vec![]);
        let events = vec![reward(MINER_REWARD, A, 1), reward(MINER_REWARD, B, 1)];
        let node = MockNode::new();
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &[], events: &events, active: &active };

        let mut batch = BlockBatch::new();
        let result = TransferProcessor::new(&store, &node).process(&input, &mut batch).await;
        assert!(matches!(result, Err(Error::TooManyMiners)));
        assert!(batch.is_empty());
        assert_eq!(node.calls("batch_balance_at"), 0);
    }

    #[test]
    fn test_reward_collection() {
        let events = vec![
            reward(MINER_REWARD, A, 5),
            reward(MINER_REWARD, A, 5),
            reward(UNCLE_REWARD, B, 2),
            reward(UNCLE_REWARD, B, 3),
        ];
        let rewards = collect_rewards(&events).unwrap();
        assert_eq!(rewards.miner, Some((A, U256::from(5u64))));
        assert_eq!(rewards.uncles[&B], U256::from(5u64));

        let too_many = vec![
            reward(UNCLE_REWARD, A, 1),
            reward(UNCLE_REWARD, B, 1),
            reward(UNCLE_REWARD, C, 1),
        ];
        assert!(matches!(collect_rewards(&too_many), Err(Error::TooManyUncles)));
    }

    #[tokio::test]
    async fn test_uncle_reward_total() {
        let (store, _temp_dir) = create_test_store();
        store.insert_subscriptions(&[Subscription::new(B, 3)]).unwrap();

        let b = block(50, A, vec![]);
        let events = vec![reward(MINER_REWARD, A, 9), reward(UNCLE_REWARD, B, 4)];
        let node = MockNode::new();
        node.set_balance(b.hash(), NATIVE_TOKEN, B, 4);
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &[], events: &events, active: &active };

        let mut batch = BlockBatch::new();
        TransferProcessor::new(&store, &node).process(&input, &mut batch).await.unwrap();
        store.commit(batch).unwrap();

        let total = store.find_total_balance(50, NATIVE_TOKEN, 3).unwrap();
        assert_eq!(total.balance, "4");
        assert_eq!(total.uncles_reward, "4");
        assert_eq!(total.miner_reward, "0");
    }

    #[tokio::test]
    async fn test_new_subscription_with_prior_snapshot_is_error() {
        let (store, _temp_dir) = create_test_store();
        store.insert_subscriptions(&[Subscription::new(A, 1)]).unwrap();
        let mut seed = BlockBatch::new();
        seed.insert_account(AccountSnapshot::new(NATIVE_TOKEN, A, 10, U256::from(1u64)));
        store.commit(seed).unwrap();

        let b = block(20, B, vec![]);
        let node = MockNode::new();
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &[], events: &[], active: &active };

        let mut batch = BlockBatch::new();
        let result = TransferProcessor::new(&store, &node).process(&input, &mut batch).await;
        assert!(matches!(result, Err(Error::HasPrevBalance { address, .. }) if address == A));
    }

    #[tokio::test]
    async fn test_old_subscription_without_snapshot_is_error() {
        let (store, _temp_dir) = create_test_store();
        store.insert_subscriptions(&[Subscription::new(A, 1)]).unwrap();
        let mut seed = BlockBatch::new();
        seed.update_subscription_block(vec![A], 10);
        store.commit(seed).unwrap();

        let b = block(20, B, vec![]);
        let events = vec![reward(B, A, 1)];
        let node = MockNode::new();
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &[], events: &events, active: &active };

        let mut batch = BlockBatch::new();
        let result = TransferProcessor::new(&store, &node).process(&input, &mut batch).await;
        assert!(matches!(result, Err(Error::MissingPrevBalance { address, .. }) if address == A));
    }

    #[tokio::test]
    async fn test_untouched_block_writes_nothing() {
        let (store, _temp_dir) = create_test_store();
        let b = block(20, B, vec![tx(1, A, B)]);
        let receipts = vec![receipt(&b.transactions[0], 21000, vec![])];
        let node = MockNode::new();
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &receipts, events: &[], active: &active };

        let mut batch = BlockBatch::new();
        let summary = TransferProcessor::new(&store, &node).process(&input, &mut batch).await.unwrap();
        assert_eq!(summary, ProcessSummary::default());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sender_is_wrong_signer() {
        let (store, _temp_dir) = create_test_store();
        let mut unsigned = tx(1, A, B);
        unsigned.from = None;
        let b = block(20, B, vec![unsigned]);
        let node = MockNode::new();
        let active = BTreeSet::new();
        let input = BlockInput { block: &b, receipts: &[], events: &[], active: &active };

        let mut batch = BlockBatch::new();
        let result = TransferProcessor::new(&store, &node).process(&input, &mut batch).await;
        assert!(matches!(result, Err(Error::WrongSigner(_))));
    }
}
