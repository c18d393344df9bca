//! Store trait and RocksDB implementation
//!
//! Provides persistent storage for indexed chain data, ERC20 artifacts,
//! per-account balance snapshots, subscriptions and per-group totals.
//! Uses RocksDB with column families for efficient organization.
//!
//! Reads go straight to committed state. Everything a block writes is staged
//! in a [`BlockBatch`] and applied with [`Store::commit`] as one atomic
//! RocksDB write batch, so a block is either fully persisted or not at all.

use crate::error::{Error, Result};
use crate::keys::{
    decode_block_index_key, decode_block_number, decode_subscription_block_key, encode_account_key,
    encode_address_key, encode_block_index_key, encode_block_item_key, encode_block_prefix,
    encode_contract_key, encode_header_hash_key, encode_header_key, encode_log_key,
    encode_reorg_key, encode_storage_key, encode_subscription_block_key, encode_total_key,
    encode_tx_hash_key, split_history_key,
};
use crate::records::{
    AccountSnapshot, ContractCodeRecord, ContractRecord, Erc20Record, Erc20StorageRecord,
    HeaderRecord, LogRecord, ReceiptRecord, ReorgRecord, Subscription, TotalBalance,
    TransactionRecord, TransferRecord,
};
use alloy_primitives::{Address, B256};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const CF_HEADERS: &str = "headers";
const CF_HEADER_HASHES: &str = "header_hashes";
const CF_TRANSACTIONS: &str = "transactions";
const CF_TX_HASHES: &str = "tx_hashes";
const CF_RECEIPTS: &str = "receipts";
const CF_LOGS: &str = "logs";
const CF_TRANSFERS: &str = "transfers";
const CF_ERC20: &str = "erc20";
const CF_ERC20_STORAGE: &str = "erc20_storage";
const CF_CONTRACT_CODE: &str = "contract_code";
const CF_CONTRACTS: &str = "contracts";
const CF_ACCOUNTS: &str = "accounts";
const CF_SUBSCRIPTIONS: &str = "subscriptions";
const CF_TOTALS: &str = "totals";
const CF_REORGS: &str = "reorgs";
/// Block-ordered index over history rows and subscription processed-up-to
const CF_BLOCK_INDEX: &str = "block_index";

const COLUMN_FAMILIES: [&str; 16] = [
    CF_HEADERS,
    CF_HEADER_HASHES,
    CF_TRANSACTIONS,
    CF_TX_HASHES,
    CF_RECEIPTS,
    CF_LOGS,
    CF_TRANSFERS,
    CF_ERC20,
    CF_ERC20_STORAGE,
    CF_CONTRACT_CODE,
    CF_CONTRACTS,
    CF_ACCOUNTS,
    CF_SUBSCRIPTIONS,
    CF_TOTALS,
    CF_REORGS,
    CF_BLOCK_INDEX,
];

fn header_index_key(header: &HeaderRecord) -> Vec<u8> {
    encode_header_hash_key(header.hash)
}

fn tx_index_key(tx: &TransactionRecord) -> Vec<u8> {
    encode_tx_hash_key(tx.hash)
}

/// One staged write of a [`BlockBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Header(HeaderRecord),
    Transaction(TransactionRecord),
    Receipt(ReceiptRecord),
    Log { tx_index: u32, record: LogRecord },
    Transfer { seq: u32, record: TransferRecord },
    Account(AccountSnapshot),
    Total(TotalBalance),
    Erc20(Erc20Record),
    SubscriptionBlock { addresses: Vec<Address>, block_number: u64 },
    Reorg(ReorgRecord),
    /// Remove every block-scoped row in `[from, to]` and reset subscriptions
    /// first processed in that range back to new.
    ResetRange { from: u64, to: u64 },
    DeleteErc20Storage { from: u64, to: u64 },
}

/// Writes of one block, applied atomically by [`Store::commit`].
#[derive(Debug, Default, Clone)]
pub struct BlockBatch {
    ops: Vec<BatchOp>,
}

impl BlockBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn insert_header(&mut self, header: HeaderRecord) {
        self.ops.push(BatchOp::Header(header));
    }

    pub fn insert_transaction(&mut self, tx: TransactionRecord) {
        self.ops.push(BatchOp::Transaction(tx));
    }

    pub fn insert_receipt(&mut self, receipt: ReceiptRecord) {
        self.ops.push(BatchOp::Receipt(receipt));
    }

    pub fn insert_log(&mut self, tx_index: u32, log: LogRecord) {
        self.ops.push(BatchOp::Log { tx_index, record: log });
    }

    /// Stage a transfer row; `seq` is the position of the event within its block.
    pub fn insert_transfer(&mut self, seq: u32, transfer: TransferRecord) {
        self.ops.push(BatchOp::Transfer { seq, record: transfer });
    }

    pub fn insert_account(&mut self, snapshot: AccountSnapshot) {
        self.ops.push(BatchOp::Account(snapshot));
    }

    pub fn insert_total_balance(&mut self, total: TotalBalance) {
        self.ops.push(BatchOp::Total(total));
    }

    /// Stage an ERC20 descriptor upsert (used to set its registered-at block).
    pub fn put_erc20(&mut self, erc20: Erc20Record) {
        self.ops.push(BatchOp::Erc20(erc20));
    }

    /// Stage the processed-up-to update of a set of subscriptions.
    pub fn update_subscription_block(&mut self, addresses: Vec<Address>, block_number: u64) {
        if addresses.is_empty() {
            return;
        }
        self.ops.push(BatchOp::SubscriptionBlock { addresses, block_number });
    }

    pub fn insert_reorg(&mut self, reorg: ReorgRecord) {
        self.ops.push(BatchOp::Reorg(reorg));
    }

    pub fn reset_range(&mut self, from: u64, to: u64) {
        self.ops.push(BatchOp::ResetRange { from, to });
    }

    pub fn delete_erc20_storage(&mut self, from: u64, to: u64) {
        self.ops.push(BatchOp::DeleteErc20Storage { from, to });
    }
}

/// Trait defining the persistence interface of the indexer.
///
/// Lookups of a single row return `Error::NotFound` when the row is absent.
pub trait Store: Send + Sync {
    /// Apply all staged writes of a block atomically.
    fn commit(&self, batch: BlockBatch) -> Result<()>;

    /// Get a header by block hash.
    fn find_header_by_hash(&self, hash: B256) -> Result<HeaderRecord>;

    /// Get the canonical header at a block number.
    fn find_header_by_number(&self, number: u64) -> Result<HeaderRecord>;

    /// Get the highest stored header.
    fn find_latest_header(&self) -> Result<HeaderRecord>;

    /// Get a transaction by hash.
    fn find_transaction(&self, hash: B256) -> Result<TransactionRecord>;

    /// Get all transactions of a block, in block order.
    fn find_transactions_by_block_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>>;

    /// Get a receipt by transaction hash.
    fn find_receipt(&self, tx_hash: B256) -> Result<ReceiptRecord>;

    /// Get all logs of a block, in block order.
    fn find_logs_by_block(&self, number: u64) -> Result<Vec<LogRecord>>;

    /// Get all recorded transfers of a block, in event order.
    fn find_transfers_by_block(&self, number: u64) -> Result<Vec<TransferRecord>>;

    /// Register an ERC20 token. Fails with `Duplicate` if already registered.
    fn insert_erc20(&self, erc20: &Erc20Record) -> Result<()>;

    /// Get an ERC20 descriptor.
    fn find_erc20(&self, addr: Address) -> Result<Erc20Record>;

    /// List all registered ERC20 descriptors ordered by address.
    fn list_erc20(&self) -> Result<Vec<Erc20Record>>;

    /// Store historical storage cells.
    fn insert_erc20_storage(&self, cells: &[Erc20StorageRecord]) -> Result<()>;

    /// Get the most recent value of a storage slot at or before `block`.
    fn find_erc20_storage(&self, addr: Address, key: B256, block: u64) -> Result<Erc20StorageRecord>;

    /// Store contract runtime code.
    fn insert_contract_code(&self, code: &ContractCodeRecord) -> Result<()>;

    /// Get contract runtime code.
    fn find_contract_code(&self, addr: Address) -> Result<ContractCodeRecord>;

    /// Store contract account metadata at a block.
    fn insert_contract(&self, contract: &ContractRecord) -> Result<()>;

    /// Get contract account metadata at or before `block`.
    fn find_contract(&self, addr: Address, block: u64) -> Result<ContractRecord>;

    /// Get the newest snapshot strictly before `before` for each address that has one.
    fn find_latest_accounts(
        &self,
        token: Address,
        addrs: &[Address],
        before: u64,
    ) -> Result<Vec<AccountSnapshot>>;

    /// Get the newest snapshot at or before `block`.
    fn find_account(&self, token: Address, addr: Address, block: u64) -> Result<AccountSnapshot>;

    /// Create subscriptions. Fails with `Duplicate` if any address is already subscribed.
    fn insert_subscriptions(&self, subs: &[Subscription]) -> Result<()>;

    /// Page through all subscriptions. Returns the page and the total count.
    fn find_subscriptions(&self, page: u64, limit: u64) -> Result<(Vec<Subscription>, u64)>;

    /// Page through the subscriptions of a group.
    fn find_subscriptions_by_group(
        &self,
        group: u64,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<Subscription>, u64)>;

    /// Get the already-processed subscriptions among `addrs`.
    fn find_old_subscriptions(&self, addrs: &[Address]) -> Result<Vec<Subscription>>;

    /// Page through subscriptions that have never been processed.
    fn find_new_subscriptions(&self, page: u64, limit: u64) -> Result<(Vec<Subscription>, u64)>;

    /// Get the carry-forward total at or before `block`.
    fn find_total_balance(&self, block: u64, token: Address, group: u64) -> Result<TotalBalance>;

    /// List reorg audit records.
    fn find_reorgs(&self) -> Result<Vec<ReorgRecord>>;
}

/// RocksDB-backed implementation of [`Store`].
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, column_families)?;
        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::InvalidData(format!("column family '{}' not found", name)))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<T> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Err(Error::NotFound),
        }
    }

    fn exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_cf(self.cf(cf)?, key)?.is_some())
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = postcard::to_allocvec(value)?;
        self.db.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    /// Newest row of a history key family at or before the block encoded in `key`.
    ///
    /// `key` must end with the big-endian block number; rows of other entities
    /// (a different prefix) are never returned.
    fn latest_at_or_before<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<T> {
        let (prefix, _) = split_history_key(key)
            .ok_or_else(|| Error::InvalidData("history key too short".to_string()))?;
        let mut iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(key, Direction::Reverse));

        if let Some(item) = iter.next() {
            let (found, value) = item?;
            if found.len() == key.len() && found.starts_with(prefix) {
                return Ok(postcard::from_bytes(&value)?);
            }
        }
        Err(Error::NotFound)
    }

    /// All rows whose key lies in `[start, end)`, in key order.
    fn scan_range<T: DeserializeOwned>(&self, cf: &str, start: &[u8], end: &[u8]) -> Result<Vec<T>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(start, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if &*key >= end {
                break;
            }
            rows.push(postcard::from_bytes(&value)?);
        }
        Ok(rows)
    }

    /// All rows of a column family, in key order.
    fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Box<[u8]>, T)>> {
        let iter = self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start);
        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            rows.push((key, postcard::from_bytes(&value)?));
        }
        Ok(rows)
    }

    fn paginate(
        &self,
        page: u64,
        limit: u64,
        filter: impl Fn(&Subscription) -> bool,
    ) -> Result<(Vec<Subscription>, u64)> {
        let all = self.scan_all::<Subscription>(CF_SUBSCRIPTIONS)?;
        let matching = all
            .into_iter()
            .map(|(_, sub)| sub)
            .filter(|sub| filter(sub))
            .collect::<Vec<_>>();
        let total = matching.len() as u64;
        let offset = page.saturating_mul(limit) as usize;
        let rows = matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect();
        Ok((rows, total))
    }

    /// Index keys of one block-indexed family in `[from, to]`, in key order.
    fn block_index_range(&self, prefix: u8, from: u64, to: u64) -> Result<Vec<Box<[u8]>>> {
        let start = encode_block_prefix(prefix, from);
        let iter = self
            .db
            .iterator_cf(self.cf(CF_BLOCK_INDEX)?, IteratorMode::From(&start, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            match decode_block_number(&key) {
                Some(block) if key[0] == prefix && block <= to => keys.push(key),
                _ => break,
            }
        }
        Ok(keys)
    }

    /// New subscriptions in address order, read through the processed-up-to index.
    fn paginate_new(&self, page: u64, limit: u64) -> Result<(Vec<Subscription>, u64)> {
        let offset = page.saturating_mul(limit);
        let end = offset.saturating_add(limit);
        let mut rows = Vec::new();
        let mut total = 0u64;
        for key in self.block_index_range(b'P', 0, 0)? {
            if total >= offset && total < end {
                let addr = decode_subscription_block_key(&key)
                    .ok_or_else(|| Error::InvalidData("malformed subscription index key".to_string()))?;
                rows.push(self.get(CF_SUBSCRIPTIONS, &encode_address_key(b'S', addr))?);
            }
            total += 1;
        }
        Ok((rows, total))
    }

    /// Stage a history row together with its block index entry.
    fn stage_history_put<T: Serialize>(
        &self,
        wb: &mut WriteBatch,
        cf: &str,
        key: Vec<u8>,
        value: &T,
    ) -> Result<()> {
        let index = encode_block_index_key(&key)
            .ok_or_else(|| Error::InvalidData("history key too short".to_string()))?;
        wb.put_cf(self.cf(CF_BLOCK_INDEX)?, index, b"");
        wb.put_cf(self.cf(cf)?, key, postcard::to_allocvec(value)?);
        Ok(())
    }

    /// Stage deletes for every row of `cf` written in `[from, to]`.
    ///
    /// `prefix` is the family's key prefix; rows are found through the block
    /// index, so the cost follows the size of the range.
    fn stage_history_delete(
        &self,
        wb: &mut WriteBatch,
        cf: &str,
        prefix: u8,
        from: u64,
        to: u64,
    ) -> Result<usize> {
        let handle = self.cf(cf)?;
        let index = self.cf(CF_BLOCK_INDEX)?;
        let keys = self.block_index_range(prefix, from, to)?;
        for index_key in &keys {
            let key = decode_block_index_key(index_key)
                .ok_or_else(|| Error::InvalidData("malformed block index key".to_string()))?;
            wb.delete_cf(handle, key);
            wb.delete_cf(index, index_key);
        }
        Ok(keys.len())
    }

    /// Stage a subscription row and move its processed-up-to index entry.
    fn stage_subscription_put(
        &self,
        wb: &mut WriteBatch,
        previous_block: Option<u64>,
        sub: &Subscription,
    ) -> Result<()> {
        let index = self.cf(CF_BLOCK_INDEX)?;
        if let Some(previous) = previous_block {
            wb.delete_cf(index, encode_subscription_block_key(previous, sub.address));
        }
        wb.put_cf(index, encode_subscription_block_key(sub.block_number, sub.address), b"");
        wb.put_cf(
            self.cf(CF_SUBSCRIPTIONS)?,
            encode_address_key(b'S', sub.address),
            postcard::to_allocvec(sub)?,
        );
        Ok(())
    }

    /// Stage deletes for a block-positioned family and its hash index.
    fn stage_block_items_delete<T: DeserializeOwned>(
        &self,
        wb: &mut WriteBatch,
        cf: &str,
        prefix: u8,
        from: u64,
        to: u64,
        index: Option<(&str, fn(&T) -> Vec<u8>)>,
    ) -> Result<()> {
        let handle = self.cf(cf)?;
        let start = encode_block_prefix(prefix, from);
        for item in self.db.iterator_cf(handle, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            match decode_block_number(&key) {
                Some(block) if key[0] == prefix && block <= to => {}
                _ => break,
            }
            if let Some((index_cf, index_key)) = &index {
                let record: T = postcard::from_bytes(&value)?;
                wb.delete_cf(self.cf(index_cf)?, index_key(&record));
            }
            wb.delete_cf(handle, &key);
        }
        Ok(())
    }

    fn stage_reset_range(&self, wb: &mut WriteBatch, from: u64, to: u64) -> Result<()> {
        self.stage_block_items_delete::<HeaderRecord>(
            wb,
            CF_HEADERS,
            b'H',
            from,
            to,
            Some((CF_HEADER_HASHES, header_index_key)),
        )?;
        self.stage_block_items_delete::<TransactionRecord>(
            wb,
            CF_TRANSACTIONS,
            b'T',
            from,
            to,
            Some((CF_TX_HASHES, tx_index_key)),
        )?;
        self.stage_block_items_delete::<ReceiptRecord>(wb, CF_RECEIPTS, b'R', from, to, None)?;
        self.stage_block_items_delete::<LogRecord>(wb, CF_LOGS, b'L', from, to, None)?;
        self.stage_block_items_delete::<TransferRecord>(wb, CF_TRANSFERS, b'X', from, to, None)?;

        let accounts = self.stage_history_delete(wb, CF_ACCOUNTS, b'A', from, to)?;
        let totals = self.stage_history_delete(wb, CF_TOTALS, b'G', from, to)?;

        // New subscriptions sit at block 0 and need no reset
        let processed = self.block_index_range(b'P', from.max(1), to)?;
        for key in &processed {
            let addr = decode_subscription_block_key(key)
                .ok_or_else(|| Error::InvalidData("malformed subscription index key".to_string()))?;
            let mut sub: Subscription = self.get(CF_SUBSCRIPTIONS, &encode_address_key(b'S', addr))?;
            let previous = sub.block_number;
            sub.block_number = 0;
            self.stage_subscription_put(wb, Some(previous), &sub)?;
        }

        // Tokens bootstrapped in the range are seeded again on the new branch
        let erc20 = self.cf(CF_ERC20)?;
        let mut tokens = 0;
        for mut token in self.list_erc20()? {
            let seeded_at = token.block_number.checked_sub(1);
            if matches!(seeded_at, Some(block) if block >= from && block <= to) {
                token.block_number = 0;
                wb.put_cf(erc20, encode_address_key(b'E', token.address), postcard::to_allocvec(&token)?);
                tokens += 1;
            }
        }

        debug!(
            from,
            to,
            accounts,
            totals,
            subscriptions = processed.len(),
            tokens,
            "Staged reset of block range"
        );
        Ok(())
    }

    fn stage_subscription_block(
        &self,
        wb: &mut WriteBatch,
        addresses: &[Address],
        block_number: u64,
    ) -> Result<()> {
        for addr in addresses {
            let mut sub: Subscription = self.get(CF_SUBSCRIPTIONS, &encode_address_key(b'S', *addr))?;
            let previous = sub.block_number;
            sub.block_number = block_number;
            self.stage_subscription_put(wb, Some(previous), &sub)?;
        }
        Ok(())
    }

    fn stage_op(&self, wb: &mut WriteBatch, op: &BatchOp) -> Result<()> {
        match op {
            BatchOp::Header(h) => {
                wb.put_cf(self.cf(CF_HEADERS)?, encode_header_key(h.number), postcard::to_allocvec(h)?);
                wb.put_cf(
                    self.cf(CF_HEADER_HASHES)?,
                    encode_header_hash_key(h.hash),
                    h.number.to_be_bytes(),
                );
            }
            BatchOp::Transaction(tx) => {
                let key = encode_block_item_key(b'T', tx.block_number, tx.index);
                wb.put_cf(self.cf(CF_TRANSACTIONS)?, &key, postcard::to_allocvec(tx)?);
                wb.put_cf(self.cf(CF_TX_HASHES)?, encode_tx_hash_key(tx.hash), &key[1..]);
            }
            BatchOp::Receipt(r) => {
                let key = encode_block_item_key(b'R', r.block_number, r.index);
                wb.put_cf(self.cf(CF_RECEIPTS)?, key, postcard::to_allocvec(r)?);
            }
            BatchOp::Log { tx_index, record } => {
                let key = encode_log_key(record.block_number, *tx_index, record.log_index);
                wb.put_cf(self.cf(CF_LOGS)?, key, postcard::to_allocvec(record)?);
            }
            BatchOp::Transfer { seq, record } => {
                let key = encode_block_item_key(b'X', record.block_number, *seq);
                wb.put_cf(self.cf(CF_TRANSFERS)?, key, postcard::to_allocvec(record)?);
            }
            BatchOp::Account(a) => {
                let key = encode_account_key(a.token, a.address, a.block_number);
                self.stage_history_put(wb, CF_ACCOUNTS, key, a)?;
            }
            BatchOp::Total(t) => {
                let key = encode_total_key(t.token, t.group, t.block_number);
                self.stage_history_put(wb, CF_TOTALS, key, t)?;
            }
            BatchOp::Erc20(e) => {
                let key = encode_address_key(b'E', e.address);
                wb.put_cf(self.cf(CF_ERC20)?, key, postcard::to_allocvec(e)?);
            }
            BatchOp::SubscriptionBlock { addresses, block_number } => {
                self.stage_subscription_block(wb, addresses, *block_number)?;
            }
            BatchOp::Reorg(r) => {
                wb.put_cf(self.cf(CF_REORGS)?, encode_reorg_key(r.from, r.to), postcard::to_allocvec(r)?);
            }
            BatchOp::ResetRange { from, to } => self.stage_reset_range(wb, *from, *to)?,
            BatchOp::DeleteErc20Storage { from, to } => {
                self.stage_history_delete(wb, CF_ERC20_STORAGE, b'W', *from, *to)?;
            }
        }
        Ok(())
    }
}

impl Store for RocksStore {
    fn commit(&self, batch: BlockBatch) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch.ops() {
            self.stage_op(&mut wb, op)?;
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn find_header_by_hash(&self, hash: B256) -> Result<HeaderRecord> {
        let raw = self
            .db
            .get_cf(self.cf(CF_HEADER_HASHES)?, encode_header_hash_key(hash))?
            .ok_or(Error::NotFound)?;
        let number = u64::from_be_bytes(
            raw.as_slice()
                .try_into()
                .map_err(|_| Error::InvalidData("header index must be 8 bytes".to_string()))?,
        );
        self.find_header_by_number(number)
    }

    fn find_header_by_number(&self, number: u64) -> Result<HeaderRecord> {
        self.get(CF_HEADERS, &encode_header_key(number))
    }

    fn find_latest_header(&self) -> Result<HeaderRecord> {
        let mut iter = self.db.iterator_cf(self.cf(CF_HEADERS)?, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(postcard::from_bytes(&value)?)
            }
            None => Err(Error::NotFound),
        }
    }

    fn find_transaction(&self, hash: B256) -> Result<TransactionRecord> {
        let location = self
            .db
            .get_cf(self.cf(CF_TX_HASHES)?, encode_tx_hash_key(hash))?
            .ok_or(Error::NotFound)?;
        let mut key = vec![b'T'];
        key.extend_from_slice(&location);
        self.get(CF_TRANSACTIONS, &key)
    }

    fn find_transactions_by_block_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>> {
        let header = self.find_header_by_hash(hash)?;
        let txs: Vec<TransactionRecord> = self.scan_range(
            CF_TRANSACTIONS,
            &encode_block_prefix(b'T', header.number),
            &encode_block_prefix(b'T', header.number.saturating_add(1)),
        )?;
        Ok(txs.into_iter().filter(|tx| tx.block_hash == hash).collect())
    }

    fn find_receipt(&self, tx_hash: B256) -> Result<ReceiptRecord> {
        let location = self
            .db
            .get_cf(self.cf(CF_TX_HASHES)?, encode_tx_hash_key(tx_hash))?
            .ok_or(Error::NotFound)?;
        let mut key = vec![b'R'];
        key.extend_from_slice(&location);
        self.get(CF_RECEIPTS, &key)
    }

    fn find_logs_by_block(&self, number: u64) -> Result<Vec<LogRecord>> {
        self.scan_range(
            CF_LOGS,
            &encode_block_prefix(b'L', number),
            &encode_block_prefix(b'L', number.saturating_add(1)),
        )
    }

    fn find_transfers_by_block(&self, number: u64) -> Result<Vec<TransferRecord>> {
        self.scan_range(
            CF_TRANSFERS,
            &encode_block_prefix(b'X', number),
            &encode_block_prefix(b'X', number.saturating_add(1)),
        )
    }

    fn insert_erc20(&self, erc20: &Erc20Record) -> Result<()> {
        let key = encode_address_key(b'E', erc20.address);
        if self.exists(CF_ERC20, &key)? {
            return Err(Error::Duplicate);
        }
        self.put(CF_ERC20, &key, erc20)
    }

    fn find_erc20(&self, addr: Address) -> Result<Erc20Record> {
        self.get(CF_ERC20, &encode_address_key(b'E', addr))
    }

    fn list_erc20(&self) -> Result<Vec<Erc20Record>> {
        Ok(self
            .scan_all::<Erc20Record>(CF_ERC20)?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    fn insert_erc20_storage(&self, cells: &[Erc20StorageRecord]) -> Result<()> {
        let mut wb = WriteBatch::default();
        for cell in cells {
            let key = encode_storage_key(cell.address, cell.key, cell.block_number);
            self.stage_history_put(&mut wb, CF_ERC20_STORAGE, key, cell)?;
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn find_erc20_storage(&self, addr: Address, key: B256, block: u64) -> Result<Erc20StorageRecord> {
        self.latest_at_or_before(CF_ERC20_STORAGE, &encode_storage_key(addr, key, block))
    }

    fn insert_contract_code(&self, code: &ContractCodeRecord) -> Result<()> {
        self.put(CF_CONTRACT_CODE, &encode_address_key(b'C', code.address), code)
    }

    fn find_contract_code(&self, addr: Address) -> Result<ContractCodeRecord> {
        self.get(CF_CONTRACT_CODE, &encode_address_key(b'C', addr))
    }

    fn insert_contract(&self, contract: &ContractRecord) -> Result<()> {
        let key = encode_contract_key(contract.address, contract.block_number);
        self.put(CF_CONTRACTS, &key, contract)
    }

    fn find_contract(&self, addr: Address, block: u64) -> Result<ContractRecord> {
        self.latest_at_or_before(CF_CONTRACTS, &encode_contract_key(addr, block))
    }

    fn find_latest_accounts(
        &self,
        token: Address,
        addrs: &[Address],
        before: u64,
    ) -> Result<Vec<AccountSnapshot>> {
        if before == 0 {
            return Ok(Vec::new());
        }
        let mut found = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let key = encode_account_key(token, *addr, before - 1);
            match self.latest_at_or_before::<AccountSnapshot>(CF_ACCOUNTS, &key) {
                Ok(snapshot) => found.push(snapshot),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn find_account(&self, token: Address, addr: Address, block: u64) -> Result<AccountSnapshot> {
        self.latest_at_or_before(CF_ACCOUNTS, &encode_account_key(token, addr, block))
    }

    fn insert_subscriptions(&self, subs: &[Subscription]) -> Result<()> {
        let mut wb = WriteBatch::default();
        let mut seen = HashSet::with_capacity(subs.len());
        for sub in subs {
            let key = encode_address_key(b'S', sub.address);
            if self.exists(CF_SUBSCRIPTIONS, &key)? || !seen.insert(sub.address) {
                return Err(Error::Duplicate);
            }
            self.stage_subscription_put(&mut wb, None, sub)?;
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn find_subscriptions(&self, page: u64, limit: u64) -> Result<(Vec<Subscription>, u64)> {
        self.paginate(page, limit, |_| true)
    }

    fn find_subscriptions_by_group(
        &self,
        group: u64,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<Subscription>, u64)> {
        self.paginate(page, limit, |sub| sub.group == group)
    }

    fn find_old_subscriptions(&self, addrs: &[Address]) -> Result<Vec<Subscription>> {
        let mut subs = Vec::new();
        for addr in addrs {
            match self.get::<Subscription>(CF_SUBSCRIPTIONS, &encode_address_key(b'S', *addr)) {
                Ok(sub) if !sub.is_new() => subs.push(sub),
                Ok(_) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(subs)
    }

    fn find_new_subscriptions(&self, page: u64, limit: u64) -> Result<(Vec<Subscription>, u64)> {
        self.paginate_new(page, limit)
    }

    fn find_total_balance(&self, block: u64, token: Address, group: u64) -> Result<TotalBalance> {
        self.latest_at_or_before(CF_TOTALS, &encode_total_key(token, group, block))
    }

    fn find_reorgs(&self) -> Result<Vec<ReorgRecord>> {
        Ok(self
            .scan_all::<ReorgRecord>(CF_REORGS)?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }
}
