//! Block pipeline
//!
//! Persists canonical blocks and drives the ledger: for each block the
//! header, transactions, receipts and logs are staged together with any
//! new-token bootstrap and the transfer processor's writes, and the whole
//! block is committed atomically. Blocks are applied strictly in order; the
//! first failure stops the batch and leaves earlier blocks committed.

use crate::bootstrap::{bootstrap_new_tokens, BootstrapLimits, DEFAULT_SUB_LIMIT};
use crate::decoder::{active_tokens, decode_block_transfers};
use crate::error::{Error, OptionalExt, Result};
use crate::node::NodeClient;
use crate::processor::{BlockInput, TransferProcessor, DEFAULT_NEW_SUBSCRIPTION_LIMIT};
use crate::records::{HeaderRecord, LogRecord, ReceiptRecord, ReorgRecord, TransactionRecord};
use crate::store::{BlockBatch, Store};
use crate::types::{Block, Receipt, TransferLog};
use tracing::{debug, info, warn};

/// A canonical block with everything needed to index it.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Block,
    pub receipts: Vec<Receipt>,
    pub transfer_logs: Vec<TransferLog>,
}

/// Outcome of one `update_blocks` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Blocks committed by this call
    pub processed: usize,
    /// Blocks already indexed with the same hash
    pub skipped: usize,
    pub last_block: Option<u64>,
}

/// Owns the store and node client and applies block batches.
pub struct Manager<S, N> {
    store: S,
    node: N,
    sub_limit: u64,
    new_subscription_limit: u64,
}

impl<S: Store, N: NodeClient> Manager<S, N> {
    pub fn new(store: S, node: N) -> Self {
        Self {
            store,
            node,
            sub_limit: DEFAULT_SUB_LIMIT,
            new_subscription_limit: DEFAULT_NEW_SUBSCRIPTION_LIMIT,
        }
    }

    /// Page size of the new-token bootstrap.
    pub fn with_sub_limit(mut self, sub_limit: u64) -> Self {
        self.sub_limit = sub_limit;
        self
    }

    /// Cap on new subscriptions picked up per block.
    pub fn with_new_subscription_limit(mut self, limit: u64) -> Self {
        self.new_subscription_limit = limit;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    /// Apply `blocks` in order, after undoing `reorg` if given.
    ///
    /// The reorg reset commits on its own before the first block. A block
    /// whose header is already stored with the same hash is skipped.
    pub async fn update_blocks(
        &self,
        blocks: &[BlockData],
        reorg: Option<&ReorgRecord>,
    ) -> Result<UpdateSummary> {
        if let Some(reorg) = reorg {
            self.reset(reorg)?;
        }

        let mut summary = UpdateSummary::default();
        for data in blocks {
            let number = data.block.number();
            if self.is_indexed(&data.block)? {
                debug!(block = number, "Block already indexed, skipping");
                summary.skipped += 1;
                continue;
            }

            let batch = self.stage_block(data).await.map_err(|e| {
                warn!(block = number, error = %e, "Block processing failed");
                e
            })?;
            let ops = batch.len();
            self.store.commit(batch)?;

            info!(
                block = number,
                hash = %data.block.hash(),
                transactions = data.block.transactions.len(),
                ops,
                "Committed block"
            );
            summary.processed += 1;
            summary.last_block = Some(number);
        }

        Ok(summary)
    }

    /// Remove everything indexed in the reorged range and record it.
    fn reset(&self, reorg: &ReorgRecord) -> Result<()> {
        if reorg.from > reorg.to {
            return Err(Error::InvalidData(format!(
                "reorg range {}..={} is empty",
                reorg.from, reorg.to
            )));
        }

        let mut batch = BlockBatch::new();
        batch.reset_range(reorg.from, reorg.to);
        batch.delete_erc20_storage(reorg.from, reorg.to);
        batch.insert_reorg(reorg.clone());
        self.store.commit(batch)?;

        info!(
            from = reorg.from,
            to = reorg.to,
            from_hash = %reorg.from_hash,
            to_hash = %reorg.to_hash,
            "Reset reorged block range"
        );
        Ok(())
    }

    /// True if this exact block is already stored.
    fn is_indexed(&self, block: &Block) -> Result<bool> {
        match self.store.find_header_by_number(block.number()).optional()? {
            Some(stored) if stored.hash == block.hash() => Ok(true),
            Some(stored) => Err(Error::InvalidData(format!(
                "block {} already indexed as {}, got {} without a reorg",
                block.number(),
                stored.hash,
                block.hash()
            ))),
            None => Ok(false),
        }
    }

    /// Stage all writes of one block.
    async fn stage_block(&self, data: &BlockData) -> Result<BlockBatch> {
        let block = &data.block;
        let number = block.number();
        let mut batch = BlockBatch::new();

        if data.receipts.len() != block.transactions.len() {
            return Err(Error::InvalidData(format!(
                "block {} has {} transactions but {} receipts",
                number,
                block.transactions.len(),
                data.receipts.len()
            )));
        }

        let erc20s = self.store.list_erc20()?;
        let bootstrapped = bootstrap_new_tokens(
            &self.store,
            &self.node,
            number,
            block.hash(),
            BootstrapLimits {
                sub_limit: self.sub_limit,
                new_subscription_limit: self.new_subscription_limit,
            },
            &mut batch,
        )
        .await?;
        if !bootstrapped.is_empty() {
            info!(block = number, tokens = bootstrapped.len(), "Bootstrapped tokens");
        }

        batch.insert_header(HeaderRecord::from_block(block));
        let mut log_index = 0u32;
        for (index, (tx, receipt)) in block.transactions.iter().zip(&data.receipts).enumerate() {
            let index = index as u32;
            batch.insert_transaction(TransactionRecord::from_transaction(block, index, tx)?);
            batch.insert_receipt(ReceiptRecord::from_receipt(number, index, receipt));
            for log in &receipt.logs {
                let position = match log.log_index {
                    Some(i) => u32::try_from(i).map_err(|_| {
                        Error::InvalidData(format!("log index {} of block {} out of range", i, number))
                    })?,
                    None => log_index,
                };
                batch.insert_log(index, LogRecord::from_log(number, tx.hash, position, log));
                log_index = position + 1;
            }
        }

        let active = active_tokens(&erc20s, number);
        let events = decode_block_transfers(&data.receipts, &data.transfer_logs, &active)?;

        let processor = TransferProcessor::new(&self.store, &self.node)
            .with_new_subscription_limit(self.new_subscription_limit);
        let input = BlockInput {
            block,
            receipts: &data.receipts,
            events: &events,
            active: &active,
        };
        let summary = processor.process(&input, &mut batch).await?;
        debug!(
            block = number,
            events = events.len(),
            snapshots = summary.snapshots,
            totals = summary.totals,
            "Staged block"
        );

        Ok(batch)
    }
}
