//! Monitor service supervisor
//!
//! Brings up the worker pool and batch writer once, then runs the
//! supervision loop: subscribe to chain-head notifications, backfill from
//! the persisted watermark to the current head, and wait for either an
//! external stop or a subscription failure. A failed subscription tears the
//! iteration down, sleeps a second, and starts over; the fresh backfill
//! covers whatever gap opened during the outage.

use crate::config::TuningConfig;
use crate::database::Database;
use crate::monitor::{BatchWriter, BlockAndTransactions, BlockMonitor};
use crate::rpc::ChainClient;
use crate::types::Header;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Backoff between supervision-loop retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where the supervisor currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Bootstrapping,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Running => write!(f, "running"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Top-level coordinator for ingestion.
pub struct MonitorService {
    db: Arc<dyn Database>,
    client: Arc<dyn ChainClient>,
    monitor: Arc<BlockMonitor>,
    writer: std::sync::Mutex<Option<BatchWriter>>,
    stop_tx: broadcast::Sender<()>,
    state: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    worker_count: usize,
}

impl MonitorService {
    pub fn new(
        db: Arc<dyn Database>,
        client: Arc<dyn ChainClient>,
        tuning: TuningConfig,
    ) -> Self {
        let (batch_tx, batch_rx) =
            mpsc::channel::<BlockAndTransactions>(tuning.block_processing_queue_size);
        let monitor = Arc::new(BlockMonitor::new(
            Arc::clone(&db),
            Arc::clone(&client),
            batch_tx,
        ));
        let writer = BatchWriter::new(batch_rx, Arc::clone(&db));
        let (stop_tx, _) = broadcast::channel(1);
        let (state, state_rx) = watch::channel(ServiceState::Bootstrapping);
        let worker_count = 3 * std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            db,
            client,
            monitor,
            writer: std::sync::Mutex::new(Some(writer)),
            stop_tx,
            state,
            state_rx,
            worker_count,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    fn set_state(&self, next: ServiceState) {
        if *self.state_rx.borrow() != next {
            info!(state = %next, "monitor service state");
            let _ = self.state.send(next);
        }
    }

    /// Spawn workers, the batch writer, and the supervision loop.
    pub fn start(self: Arc<Self>) -> Result<()> {
        info!(workers = self.worker_count, "starting monitor service");

        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .take()
            .context("monitor service already started")?;
        tokio::spawn(writer.run(self.stop_tx.subscribe()));

        for _ in 0..self.worker_count {
            let monitor = Arc::clone(&self.monitor);
            let stop = self.stop_tx.subscribe();
            tokio::spawn(async move { monitor.run_worker(stop).await });
        }

        let stop = self.stop_tx.subscribe();
        tokio::spawn(async move { self.run(stop).await });
        Ok(())
    }

    /// Request a cooperative shutdown. Tasks exit at their next suspension
    /// point.
    pub fn stop(&self) {
        info!("stopping monitor service");
        let _ = self.stop_tx.send(());
    }

    async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut first = true;
        loop {
            self.set_state(if first {
                ServiceState::Bootstrapping
            } else {
                ServiceState::Reconnecting
            });

            // (a) chain-head subscription
            let heads = match self.client.subscribe_new_heads().await {
                Ok(heads) => heads,
                Err(e) => {
                    warn!(error = %e, "chain-head subscription failed, retrying");
                    if self.wait_or_stop(&mut stop).await {
                        self.set_state(ServiceState::Stopped);
                        return;
                    }
                    continue;
                }
            };
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (head_stop_tx, head_stop_rx) = watch::channel(false);
            let listener = tokio::spawn(chain_head_loop(
                Arc::clone(&self.monitor),
                heads,
                cancel_tx,
                head_stop_rx,
            ));

            // (b) historical backfill from the watermark to the current head
            let backfill = match self.start_backfill(cancel_rx.clone()).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(error = %e, "historical sync setup failed, retrying");
                    let _ = head_stop_tx.send(true);
                    let _ = listener.await;
                    if self.wait_or_stop(&mut stop).await {
                        self.set_state(ServiceState::Stopped);
                        return;
                    }
                    continue;
                }
            };

            self.set_state(ServiceState::Running);

            // (c) wait for shutdown or a dead subscription
            let mut cancelled = cancel_rx.clone();
            tokio::select! {
                _ = stop.recv() => {
                    self.set_state(ServiceState::Stopping);
                    let _ = head_stop_tx.send(true);
                    let _ = listener.await;
                    let _ = backfill.await;
                    self.set_state(ServiceState::Stopped);
                    return;
                }
                _ = cancelled.changed() => {
                    let _ = listener.await;
                    let _ = backfill.await;
                    warn!("chain-head subscription lost, retrying in 1s");
                    if self.wait_or_stop(&mut stop).await {
                        self.set_state(ServiceState::Stopped);
                        return;
                    }
                }
            }
            first = false;
        }
    }

    /// Sleep through the retry backoff; returns true if a stop arrived
    /// instead.
    async fn wait_or_stop(&self, stop: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = stop.recv() => true,
            _ = tokio::time::sleep(RETRY_DELAY) => false,
        }
    }

    async fn start_backfill(&self, cancel: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let head = self
            .client
            .current_block_number()
            .await
            .context("failed to fetch current head")?;
        let last_persisted = self
            .db
            .get_last_persisted_block_number()
            .await
            .context("failed to read persisted watermark")?;
        info!(head, last_persisted, "starting historical sync");

        let monitor = Arc::clone(&self.monitor);
        Ok(tokio::spawn(async move {
            let mut cancel = cancel;
            if let Err(e) = monitor.sync_blocks(last_persisted + 1, head, &mut cancel).await {
                warn!(error = %e, "historical sync aborted");
            }
            info!("returning from historical block processing");
        }))
    }
}

/// Pump chain-head notifications into the block queue. Signals `cancel` when
/// the subscription dies so the supervisor can rebuild it.
/// Pump chain-head notifications into the block queue.
///
/// `cancel` fires on every exit, clean or not: the in-flight backfill
/// selects on it, so a stopping listener also releases the backfill.
async fn chain_head_loop(
    monitor: Arc<BlockMonitor>,
    mut heads: mpsc::Receiver<Header>,
    cancel: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
) {
    info!("starting chain head listener");
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("stopping chain head listener");
                let _ = cancel.send(true);
                return;
            }
            head = heads.recv() => match head {
                Some(header) => monitor.process_chain_head(header).await,
                None => {
                    warn!("chain head subscription closed");
                    let _ = cancel.send(true);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memorydb::MemoryDatabase;
    use crate::rpc::{CallFrame, TransactionDetail};
    use crate::types::{Block, RawAccountState};
    use alloy_primitives::{Address, B256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Upstream stub: serves empty blocks up to `head`, and can be told to
    /// fail the first N subscription attempts.
    struct MockChainClient {
        head: AtomicU64,
        subscription_failures: AtomicUsize,
        subscriptions: AtomicUsize,
        head_sender: Mutex<Option<mpsc::Sender<Header>>>,
    }

    impl MockChainClient {
        fn new(head: u64, subscription_failures: usize) -> Self {
            Self {
                head: AtomicU64::new(head),
                subscription_failures: AtomicUsize::new(subscription_failures),
                subscriptions: AtomicUsize::new(0),
                head_sender: Mutex::new(None),
            }
        }

        fn make_block(number: u64) -> Block {
            Block {
                number,
                hash: B256::repeat_byte((number % 251) as u8),
                parent_hash: B256::repeat_byte((number.saturating_sub(1) % 251) as u8),
                timestamp: 1_600_000_000 + number,
                transactions: vec![],
            }
        }

        /// Advance the head and push a notification through the live
        /// subscription.
        async fn announce_head(&self, number: u64) {
            self.head.store(number, Ordering::SeqCst);
            let sender = self.head_sender.lock().unwrap().clone();
            if let Some(sender) = sender {
                let block = Self::make_block(number);
                let _ = sender
                    .send(Header {
                        number,
                        hash: block.hash,
                        parent_hash: block.parent_hash,
                    })
                    .await;
            }
        }

        fn kill_subscription(&self) {
            self.head_sender.lock().unwrap().take();
        }
    }

    #[async_trait::async_trait]
    impl ChainClient for MockChainClient {
        async fn current_block_number(&self) -> Result<u64> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn block_by_number(&self, number: u64) -> Result<Block> {
            if number > self.head.load(Ordering::SeqCst) {
                anyhow::bail!("block {} not available upstream", number);
            }
            Ok(Self::make_block(number))
        }

        async fn transaction_detail(&self, _hash: B256) -> Result<TransactionDetail> {
            anyhow::bail!("no transactions in mock chain")
        }

        async fn trace_transaction(&self, _hash: B256) -> Result<CallFrame> {
            anyhow::bail!("no transactions in mock chain")
        }

        async fn dump_account(
            &self,
            _address: Address,
            _block: u64,
        ) -> Result<Option<RawAccountState>> {
            Ok(None)
        }

        async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Header>> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let remaining = self.subscription_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.subscription_failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("subscription refused");
            }
            let (tx, rx) = mpsc::channel(16);
            *self.head_sender.lock().unwrap() = Some(tx);
            Ok(rx)
        }
    }

    async fn wait_for<F>(mut condition: F, what: &str)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_for_watermark(db: &MemoryDatabase, target: u64) {
        for _ in 0..200 {
            if db.get_last_persisted_block_number().await.unwrap() >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("watermark never reached {}", target);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backfill_then_follow_head() {
        let db = Arc::new(MemoryDatabase::new());
        let client = Arc::new(MockChainClient::new(5, 0));
        let service = Arc::new(MonitorService::new(
            db.clone() as Arc<dyn Database>,
            client.clone() as Arc<dyn ChainClient>,
            TuningConfig::default(),
        ));
        service.clone().start().unwrap();

        // Historical blocks 1..=5 arrive via backfill
        wait_for_watermark(&db, 5).await;

        // A new head arrives over the subscription
        client.announce_head(6).await;
        wait_for_watermark(&db, 6).await;

        service.stop();
        let state_rx = service.state_rx.clone();
        wait_for(|| *state_rx.borrow() == ServiceState::Stopped, "stopped state").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscription_failures_then_recovery() {
        let db = Arc::new(MemoryDatabase::new());
        // First two subscription attempts are refused
        let client = Arc::new(MockChainClient::new(4, 2));
        let service = Arc::new(MonitorService::new(
            db.clone() as Arc<dyn Database>,
            client.clone() as Arc<dyn ChainClient>,
            TuningConfig::default(),
        ));
        service.clone().start().unwrap();

        // Despite the failed attempts, no block in 1..=head is skipped
        wait_for_watermark(&db, 4).await;
        assert!(client.subscriptions.load(Ordering::SeqCst) >= 3);

        service.stop();
        let state_rx = service.state_rx.clone();
        wait_for(|| *state_rx.borrow() == ServiceState::Stopped, "stopped state").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnect_covers_outage_gap() {
        let db = Arc::new(MemoryDatabase::new());
        let client = Arc::new(MockChainClient::new(3, 0));
        let service = Arc::new(MonitorService::new(
            db.clone() as Arc<dyn Database>,
            client.clone() as Arc<dyn ChainClient>,
            TuningConfig::default(),
        ));
        service.clone().start().unwrap();
        wait_for_watermark(&db, 3).await;

        // The subscription dies; blocks 4..=6 appear while it is down
        client.kill_subscription();
        client.head.store(6, Ordering::SeqCst);

        // The supervisor resubscribes and the fresh backfill covers the gap
        wait_for_watermark(&db, 6).await;
        assert!(client.subscriptions.load(Ordering::SeqCst) >= 2);

        service.stop();
        let state_rx = service.state_rx.clone();
        wait_for(|| *state_rx.borrow() == ServiceState::Stopped, "stopped state").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_indexing_runs_during_ingestion() {
        let address = Address::repeat_byte(0x42);
        let db = Arc::new(MemoryDatabase::new());
        db.add_addresses(vec![address]).await.unwrap();

        let client = Arc::new(MockChainClient::new(3, 0));
        let service = Arc::new(MonitorService::new(
            db.clone() as Arc<dyn Database>,
            client.clone() as Arc<dyn ChainClient>,
            TuningConfig::default(),
        ));
        service.clone().start().unwrap();
        wait_for_watermark(&db, 3).await;

        // The per-address watermark followed the ingested blocks
        for _ in 0..200 {
            if db.get_last_filtered(address).await.unwrap() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(db.get_last_filtered(address).await.unwrap(), 3);

        service.stop();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Reconnecting.to_string(), "reconnecting");
    }
}
