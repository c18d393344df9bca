//! Chain follower
//!
//! Polls the node for the chain head, fetches every block between the last
//! indexed header and the head by number, and hands them to the block
//! pipeline in batches. A new block whose parent does not match the stored
//! header below it starts a reorg: the follower walks back to the fork point
//! and resubmits the replaced range together with the new blocks.
//!
//! Head polling and indexing run side by side. The head is published through
//! a `watch` channel, so an indexer that falls behind only ever sees the most
//! recent head; intermediate blocks are re-derived by number.

use crate::error::{Error, OptionalExt, Result};
use crate::manager::{BlockData, Manager, UpdateSummary};
use crate::node::NodeClient;
use crate::records::ReorgRecord;
use crate::store::Store;
use crate::types::Block;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default number of blocks per `update_blocks` call.
pub const DEFAULT_BATCH_SIZE: u64 = 10;

/// Default head polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);

/// Follows the canonical chain and feeds the block pipeline.
pub struct Watcher<S, N> {
    manager: Manager<S, N>,
    start_block: u64,
    batch_size: u64,
    poll_interval: Duration,
}

impl<S: Store, N: NodeClient> Watcher<S, N> {
    /// Create a watcher that starts at `start_block` on an empty store.
    pub fn new(manager: Manager<S, N>, start_block: u64) -> Self {
        Self {
            manager,
            start_block,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn manager(&self) -> &Manager<S, N> {
        &self.manager
    }

    /// First block not yet indexed.
    pub fn next_block(&self) -> Result<u64> {
        Ok(match self.manager.store().find_latest_header().optional()? {
            Some(head) => head.number + 1,
            None => self.start_block,
        })
    }

    /// Run until the head poller or the indexer fails with a non-transient error.
    pub async fn run(&self) -> Result<()> {
        info!(
            start = self.next_block()?,
            batch_size = self.batch_size,
            interval = ?self.poll_interval,
            "Starting chain follower"
        );

        let (heads, latest) = watch::channel(None);
        let node = self.manager.node();
        tokio::try_join!(
            node.subscribe_new_heads(heads, self.poll_interval),
            self.follow(latest)
        )?;
        Ok(())
    }

    /// Index up to each published head.
    async fn follow(&self, mut latest: watch::Receiver<Option<u64>>) -> Result<()> {
        while latest.changed().await.is_ok() {
            let Some(head) = *latest.borrow_and_update() else {
                continue;
            };
            match self.sync_to(head).await {
                Ok(summary) if summary.processed > 0 => info!(
                    head,
                    processed = summary.processed,
                    last = ?summary.last_block,
                    "Caught up"
                ),
                Ok(_) => debug!(head, "Up to date"),
                Err(e) if e.is_transient() => {
                    warn!(head, error = %e, "Sync interrupted, retrying on next head");
                    // Retry the same head after the poll interval
                    tokio::time::sleep(self.poll_interval).await;
                    latest.mark_changed();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Index every block up to and including `head`.
    pub async fn sync_to(&self, head: u64) -> Result<UpdateSummary> {
        let mut total = UpdateSummary::default();
        let mut next = self.next_block()?;

        while next <= head {
            let to = head.min(next.saturating_add(self.batch_size - 1));
            let mut blocks = self.fetch_range(next, to).await?;
            let Some(first) = blocks.first() else {
                break;
            };

            let mut reorg = None;
            if let Some(fork) = self.fork_point(&first.block).await? {
                let last = blocks.last().map(|b| b.block.number()).unwrap_or(to);
                let record = ReorgRecord {
                    from: fork,
                    to: last,
                    from_hash: self.manager.store().find_header_by_number(fork)?.hash,
                    to_hash: blocks.last().map(|b| b.block.hash()).unwrap_or_default(),
                };
                warn!(
                    from = record.from,
                    to = record.to,
                    depth = next - fork,
                    "Chain reorganization detected"
                );

                let mut replaced = self.fetch_range(fork, next - 1).await?;
                replaced.append(&mut blocks);
                blocks = replaced;
                reorg = Some(record);
            }

            let summary = self.manager.update_blocks(&blocks, reorg.as_ref()).await?;
            total.processed += summary.processed;
            total.skipped += summary.skipped;
            if summary.last_block.is_some() {
                total.last_block = summary.last_block;
            }

            next = match blocks.last() {
                Some(data) => data.block.number() + 1,
                None => break,
            };
        }

        Ok(total)
    }

    /// Fetch blocks `from..=to` with their receipts and transfer logs.
    ///
    /// Stops early if the chain changes under the fetch, so the returned
    /// blocks always link by parent hash.
    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<BlockData>> {
        let node = self.manager.node();
        let mut blocks: Vec<BlockData> = Vec::new();

        for number in from..=to {
            let block = node.block_by_number(Some(number)).await?;
            if let Some(prev) = blocks.last() {
                if block.header.parent_hash != prev.block.hash() {
                    debug!(block = number, "Chain moved during fetch, truncating batch");
                    break;
                }
            }

            let hash = block.hash();
            let receipts = node.get_block_receipts(hash).await?;
            let transfer_logs = node.get_transfer_logs(hash).await?;
            blocks.push(BlockData {
                block,
                receipts,
                transfer_logs,
            });
        }

        Ok(blocks)
    }

    /// Lowest stored height replaced by the branch `block` is on, if any.
    async fn fork_point(&self, block: &Block) -> Result<Option<u64>> {
        let Some(parent_number) = block.number().checked_sub(1) else {
            return Ok(None);
        };
        let store = self.manager.store();
        let mut parent_hash = block.header.parent_hash;
        let mut height = parent_number;

        loop {
            let Some(stored) = store.find_header_by_number(height).optional()? else {
                return Ok((height != parent_number).then_some(height + 1));
            };
            if stored.hash == parent_hash {
                return Ok((height != parent_number).then_some(height + 1));
            }
            if height == 0 {
                return Err(Error::InvalidData(format!(
                    "genesis mismatch: stored {}, node {}",
                    stored.hash, parent_hash
                )));
            }

            let canonical = self.manager.node().block_by_number(Some(height)).await?;
            parent_hash = canonical.header.parent_hash;
            height -= 1;
        }
    }
}
