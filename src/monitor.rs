//! Block ingestion: worker pool and batch writer
//!
//! The [`BlockMonitor`] keeps a queue of block numbers to process. Workers
//! pull numbers off the queue, fetch and enrich the block, and hand a
//! [`BlockAndTransactions`] record to the single [`BatchWriter`], which
//! commits it and lets the database advance the gap-free watermark.
//!
//! Workers treat every upstream failure as transient: the block number goes
//! back on the queue and the worker moves on.

use crate::database::Database;
use crate::enricher::TransactionEnricher;
use crate::rpc::ChainClient;
use crate::types::{Block, Header, RawAccountState, Transaction};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Bound of the pending-block queue feeding the workers.
const PENDING_QUEUE_SIZE: usize = 256;

/// Pause before a failed block is re-enqueued.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// A fully fetched block ready to be committed.
pub struct BlockAndTransactions {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    /// Storage snapshots for registered addresses that have a layout.
    pub storage: HashMap<Address, RawAccountState>,
}

/// Feeds block numbers to a pool of fetch-and-enrich workers.
pub struct BlockMonitor {
    db: Arc<dyn Database>,
    client: Arc<dyn ChainClient>,
    enricher: TransactionEnricher,
    pending_tx: mpsc::Sender<u64>,
    pending_rx: Mutex<mpsc::Receiver<u64>>,
    batch_out: mpsc::Sender<BlockAndTransactions>,
}

impl BlockMonitor {
    pub fn new(
        db: Arc<dyn Database>,
        client: Arc<dyn ChainClient>,
        batch_out: mpsc::Sender<BlockAndTransactions>,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(PENDING_QUEUE_SIZE);
        Self {
            db,
            enricher: TransactionEnricher::new(Arc::clone(&client)),
            client,
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            batch_out,
        }
    }

    /// Enqueue a chain-head notification.
    pub async fn process_chain_head(&self, header: Header) {
        debug!(number = header.number, "chain head received");
        if self.pending_tx.send(header.number).await.is_err() {
            error!("pending-block queue closed while processing chain head");
        }
    }

    /// Enqueue the historical range `from..=to`, giving up promptly when
    /// `cancel` fires. The workers pick the numbers up concurrently.
    pub async fn sync_blocks(
        &self,
        from: u64,
        to: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if from > to {
            return Ok(());
        }
        info!(from, to, "syncing historical blocks");
        for number in from..=to {
            if *cancel.borrow() {
                info!(at = number, "historical sync cancelled");
                return Ok(());
            }
            tokio::select! {
                _ = cancel.changed() => {
                    info!(at = number, "historical sync cancelled");
                    return Ok(());
                }
                sent = self.pending_tx.send(number) => {
                    sent.context("pending-block queue closed during sync")?;
                }
            }
        }
        Ok(())
    }

    /// Worker loop: dequeue, process, hand off to the batch writer. Exits at
    /// the next suspension point once `stop` fires.
    pub async fn run_worker(&self, mut stop: broadcast::Receiver<()>) {
        loop {
            let number = tokio::select! {
                _ = stop.recv() => return,
                received = async { self.pending_rx.lock().await.recv().await } => {
                    match received {
                        Some(number) => number,
                        None => return,
                    }
                }
            };

            match self.process_block(number).await {
                Ok(record) => {
                    tokio::select! {
                        _ = stop.recv() => return,
                        sent = self.batch_out.send(record) => {
                            if sent.is_err() {
                                return; // batch writer gone, shutting down
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(number, error = %e, "block processing failed, re-enqueueing");
                    tokio::select! {
                        _ = stop.recv() => return,
                        _ = tokio::time::sleep(REQUEUE_DELAY) => {}
                    }
                    tokio::select! {
                        _ = stop.recv() => return,
                        sent = self.pending_tx.send(number) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fetch the block, enrich every transaction, and collect storage
    /// snapshots for registered addresses that carry a layout.
    async fn process_block(&self, number: u64) -> Result<BlockAndTransactions> {
        let block = self
            .client
            .block_by_number(number)
            .await
            .with_context(|| format!("failed to fetch block {}", number))?;

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for hash in &block.transactions {
            transactions.push(self.enricher.enrich(*hash).await?);
        }

        let mut storage = HashMap::new();
        let addresses = self
            .db
            .get_addresses()
            .await
            .context("failed to load registered addresses")?;
        for address in addresses {
            let layout = self
                .db
                .get_storage_layout(address)
                .await
                .unwrap_or_default();
            if layout.is_empty() {
                continue;
            }
            if let Some(dump) = self.client.dump_account(address, number).await? {
                storage.insert(address, dump);
            }
        }

        Ok(BlockAndTransactions {
            block,
            transactions,
            storage,
        })
    }
}

/// Single consumer of the batch channel: commits blocks in arrival order and
/// drives the per-address indices.
pub struct BatchWriter {
    rx: mpsc::Receiver<BlockAndTransactions>,
    db: Arc<dyn Database>,
}

impl BatchWriter {
    pub fn new(rx: mpsc::Receiver<BlockAndTransactions>, db: Arc<dyn Database>) -> Self {
        Self { rx, db }
    }

    pub async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        info!("batch writer started");
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("batch writer stopped");
                    return;
                }
                item = self.rx.recv() => {
                    let item = match item {
                        Some(item) => item,
                        None => return,
                    };
                    let number = item.block.number;
                    if let Err(e) = self.write(item).await {
                        // The watermark has not moved past this block; the
                        // next supervisor pass re-syncs it.
                        error!(number, error = %e, "failed to commit block");
                    }
                }
            }
        }
    }

    async fn write(&self, item: BlockAndTransactions) -> Result<()> {
        let number = item.block.number;
        self.db
            .write_transactions(item.transactions)
            .await
            .context("failed to write transactions")?;
        self.db
            .write_block(item.block.clone())
            .await
            .context("failed to write block")?;

        let addresses = self
            .db
            .get_addresses()
            .await
            .context("failed to load registered addresses")?;
        let mut eligible = Vec::new();
        for address in addresses {
            let last_filtered = self
                .db
                .get_last_filtered(address)
                .await
                .context("failed to read watermark")?;
            if last_filtered < number {
                eligible.push(address);
            }
        }
        if !eligible.is_empty() {
            self.db
                .index_blocks(eligible, vec![item.block])
                .await
                .context("failed to index block")?;
        }

        if !item.storage.is_empty() {
            self.db
                .index_storage(item.storage, number)
                .await
                .context("failed to index storage")?;
        }

        debug!(number, "block committed");
        Ok(())
    }
}
