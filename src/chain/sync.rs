use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::models::*;
use super::rpc::ChainRpc;
use crate::error::{AppError, AppResult, ChainError};
use crate::events::{EventBus, GatewayEvent};
use crate::store::SettlementStore;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ChainSyncConfig {
    pub chain_id: u64,
    /// First block to mirror on an empty store; None starts at the current head
    pub start_block: Option<u64>,
    /// Maximum blocks backfilled per poll
    pub scan_range: u64,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub backfill_concurrency: usize,
}

impl ChainSyncConfig {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            start_block: None,
            scan_range: 5000,
            poll_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            backfill_concurrency: 4,
        }
    }
}

/// Events for one edge of the connectivity state machine.
/// Leaving `Synced` always reports `SyncLost` so lost/recovered stay paired.
pub fn transition_events(chain_id: u64, from: NodeState, to: NodeState, head: u64) -> Vec<GatewayEvent> {
    use NodeState::*;

    let connected = GatewayEvent::NodeConnected { chain_id };
    let disconnected = GatewayEvent::NodeDisconnected { chain_id };
    let lost = GatewayEvent::SyncLost { chain_id };
    let recovered = GatewayEvent::SyncRecovered {
        chain_id,
        block_number: head,
    };

    match (from, to) {
        (Disconnected, Syncing) => vec![connected],
        (Disconnected, Synced) => vec![connected, recovered],
        (Syncing, Synced) => vec![recovered],
        (Synced, Syncing) => vec![lost],
        (Syncing, Disconnected) => vec![disconnected],
        (Synced, Disconnected) => vec![lost, disconnected],
        _ => vec![],
    }
}

/// Receipt must agree with the transaction and its block, and must not be reverted
pub fn validate_transaction(
    block: &BlockData,
    tx: &TransactionData,
    receipt: Option<&TransactionReceipt>,
) -> Result<(), ChainError> {
    let invalid = |reason: &str| Err(ChainError::Validation(format!("{}: {}", tx.hash, reason)));

    if tx.block_hash.as_deref().is_some_and(|hash| hash != block.hash) {
        return invalid("transaction block hash differs from block");
    }
    let Some(receipt) = receipt else {
        return invalid("no receipt");
    };
    if receipt.transaction_hash != tx.hash {
        return invalid("receipt hash mismatch");
    }
    if receipt.block_hash != block.hash {
        return invalid("receipt block hash mismatch");
    }
    if receipt.from != tx.from || receipt.to != tx.to {
        return invalid("receipt sender or recipient mismatch");
    }
    if tx.transaction_index.is_some_and(|index| index != receipt.transaction_index) {
        return invalid("receipt index mismatch");
    }
    if receipt.status == Some(0) {
        return invalid("transaction reverted");
    }
    Ok(())
}

struct SyncState {
    node: NodeState,
    filter_id: Option<String>,
}

/// Mirrors one chain into the store and reports what changed, in order
pub struct ChainSync {
    config: ChainSyncConfig,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn SettlementStore>,
    events: EventBus,
    state: parking_lot::Mutex<SyncState>,
}

impl ChainSync {
    pub fn new(
        config: ChainSyncConfig,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn SettlementStore>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            rpc,
            store,
            events,
            state: parking_lot::Mutex::new(SyncState {
                node: NodeState::Disconnected,
                filter_id: None,
            }),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn node_state(&self) -> NodeState {
        self.state.lock().node
    }

    async fn timed<T>(&self, call: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        match tokio::time::timeout(self.config.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Connectivity {
                endpoint: self.rpc.endpoint().to_string(),
                message: format!("no answer within {:?}", self.config.rpc_timeout),
            }
            .into()),
        }
    }

    async fn load_chain(&self) -> AppResult<Chain> {
        match self.store.get_chain(self.config.chain_id).await? {
            Some(chain) => Ok(chain),
            None => {
                let chain = Chain::new(self.config.chain_id, self.rpc.endpoint());
                self.store.save_chain(&chain).await?;
                Ok(chain)
            }
        }
    }

    // ========== INGESTION ==========

    /// Store a block and its valid transactions. Re-ingesting a stored block is a no-op.
    #[instrument(skip(self, data, receipts), fields(chain_id = self.config.chain_id, block = data.number))]
    pub async fn ingest_block(&self, data: &BlockData, receipts: &[TransactionReceipt]) -> AppResult<IngestedBlock> {
        let timestamp = DateTime::<Utc>::from_timestamp(data.timestamp as i64, 0).ok_or_else(|| {
            ChainError::Validation(format!("Block {} has invalid timestamp {}", data.hash, data.timestamp))
        })?;

        let block = Block {
            chain_id: self.config.chain_id,
            hash: data.hash.clone(),
            number: data.number,
            parent_hash: data.parent_hash.clone(),
            timestamp,
            uncle_hashes: data.uncles.clone(),
        };

        let by_hash: HashMap<&str, &TransactionReceipt> = receipts
            .iter()
            .map(|r| (r.transaction_hash.as_str(), r))
            .collect();

        let mut transactions = Vec::with_capacity(data.transactions.len());
        for (position, tx) in data.transactions.iter().enumerate() {
            let receipt = by_hash.get(tx.hash.as_str()).copied();
            if let Err(e) = validate_transaction(data, tx, receipt) {
                warn!("Skipping transaction in block {}: {}", data.number, e);
                continue;
            }
            let Some(receipt) = receipt else { continue };

            transactions.push(Transaction {
                chain_id: self.config.chain_id,
                hash: tx.hash.clone(),
                block_hash: data.hash.clone(),
                block_number: data.number,
                index: tx.transaction_index.unwrap_or(position as u64),
                from_address: tx.from.clone(),
                to_address: tx.to.clone(),
                gas_used: receipt.gas_used,
                gas_price: tx.gas_price,
                nonce: tx.nonce,
                value: tx.value,
                data: tx.input.clone(),
            });
        }

        let created = self.store.upsert_block(&block, &transactions).await?;
        if created {
            debug!("Stored block {} with {} transactions", block.number, transactions.len());
            self.events.publish(GatewayEvent::BlockSealed {
                chain_id: block.chain_id,
                block_number: block.number,
            });
        }

        Ok(IngestedBlock {
            block,
            transactions,
            created,
        })
    }

    /// Block with transaction bodies plus the receipts needed to validate them
    async fn fetch_block(&self, id: BlockId) -> AppResult<Option<(BlockData, Vec<TransactionReceipt>)>> {
        let Some(data) = self.timed(self.rpc.get_block(id, true)).await? else {
            return Ok(None);
        };

        let mut receipts = Vec::with_capacity(data.transactions.len());
        for tx in &data.transactions {
            if let Some(receipt) = self.timed(self.rpc.get_transaction_receipt(&tx.hash)).await? {
                receipts.push(receipt);
            }
        }
        Ok(Some((data, receipts)))
    }

    /// Ingest a fetched block, first rewinding if a different block is stored at its height
    async fn ingest_fetched(&self, data: &BlockData, receipts: &[TransactionReceipt]) -> AppResult<Vec<ChainUpdate>> {
        let mut updates = Vec::new();

        if let Some(stored) = self.store.get_block(self.config.chain_id, data.number).await? {
            if stored.hash != data.hash {
                let report = self.rewind(data.number.saturating_sub(1)).await?;
                updates.push(ChainUpdate::Rewound(report));
            }
        }

        let ingested = self.ingest_block(data, receipts).await?;
        if ingested.created {
            updates.push(ChainUpdate::BlockIngested(ingested));
        }
        Ok(updates)
    }

    /// Fetch and ingest every block number in `[start, end]` missing from the store
    pub async fn backfill(&self, start: u64, end: u64) -> AppResult<Vec<ChainUpdate>> {
        if start > end {
            return Ok(Vec::new());
        }

        let stored: HashSet<u64> = self
            .store
            .block_numbers_in_range(self.config.chain_id, start, end)
            .await?
            .into_iter()
            .collect();
        let missing: Vec<u64> = (start..=end).filter(|n| !stored.contains(n)).collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Backfilling {} blocks of chain {} in [{}, {}]",
            missing.len(),
            self.config.chain_id,
            start,
            end
        );

        let fetched: Vec<AppResult<Option<(BlockData, Vec<TransactionReceipt>)>>> = stream::iter(missing)
            .map(|number| self.fetch_block(BlockId::Number(number)))
            .buffered(self.config.backfill_concurrency.max(1))
            .collect()
            .await;

        let mut updates = Vec::new();
        for result in fetched {
            match result? {
                Some((data, receipts)) => updates.extend(self.ingest_fetched(&data, &receipts).await?),
                None => debug!("Block not yet available on node, will retry"),
            }
        }
        Ok(updates)
    }

    // ========== REORGS ==========

    async fn rewind(&self, new_head: u64) -> AppResult<RewindReport> {
        let report = self.store.rewind_chain(self.config.chain_id, new_head).await?;

        warn!(
            "⚠️  Reorg on chain {}: rewound to {}, removed {} blocks, {} transactions, {} payments",
            self.config.chain_id,
            new_head,
            report.removed_blocks.len(),
            report.removed_transactions,
            report.removed_payments.len()
        );

        self.events.publish(GatewayEvent::ReorgDetected {
            chain_id: self.config.chain_id,
            new_head,
            removed_blocks: report.removed_blocks.len(),
        });
        Ok(report)
    }

    /// Rewind local state if it extends beyond what the node now reports as head
    pub async fn detect_reorg(&self, observed_head: u64) -> AppResult<Option<RewindReport>> {
        let chain = self.load_chain().await?;
        let latest = self
            .store
            .latest_block_number(self.config.chain_id)
            .await?
            .unwrap_or(0);
        let local_head = chain.head_number.max(latest);

        if local_head <= observed_head {
            return Ok(None);
        }
        self.rewind(observed_head).await.map(Some)
    }

    // ========== POLLING ==========

    /// Current node state and head; any failure to talk to the node counts as disconnected
    async fn observe(&self) -> (NodeState, u64) {
        let probe = async {
            let network = self.timed(self.rpc.network_id()).await?;
            if network != self.config.chain_id {
                return Err(AppError::from(ChainError::NetworkMismatch {
                    expected: self.config.chain_id,
                    actual: network,
                }));
            }
            if self.timed(self.rpc.peer_count()).await? == 0 {
                return Ok((NodeState::Disconnected, 0));
            }
            let syncing = self.timed(self.rpc.syncing()).await?;
            let head = self.timed(self.rpc.block_number()).await?;
            let state = if syncing { NodeState::Syncing } else { NodeState::Synced };
            Ok((state, head))
        };

        match probe.await {
            Ok(observed) => observed,
            Err(AppError::Chain(ChainError::NetworkMismatch { expected, actual })) => {
                error!("Node {} serves network {}, expected {}", self.rpc.endpoint(), actual, expected);
                (NodeState::Disconnected, 0)
            }
            Err(e) => {
                debug!("Node probe failed: {}", e);
                (NodeState::Disconnected, 0)
            }
        }
    }

    /// Ingest blocks announced by the node's new-block filter
    async fn drain_filter(&self, head: u64) -> AppResult<Vec<ChainUpdate>> {
        let existing = self.state.lock().filter_id.clone();
        let filter_id = match existing {
            Some(id) => id,
            None => {
                let id = self.timed(self.rpc.new_block_filter()).await?;
                self.state.lock().filter_id = Some(id.clone());
                id
            }
        };

        let hashes = match self.timed(self.rpc.get_filter_changes(&filter_id)).await {
            Ok(hashes) => hashes,
            Err(AppError::Chain(ChainError::Rpc { message, .. })) => {
                warn!("Block filter {} rejected ({}), recreating", filter_id, message);
                self.state.lock().filter_id = None;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut updates = Vec::new();
        for hash in hashes {
            if let Some((data, receipts)) = self.fetch_block(BlockId::Hash(hash)).await? {
                if data.number <= head {
                    updates.extend(self.ingest_fetched(&data, &receipts).await?);
                }
            }
        }
        Ok(updates)
    }

    /// One tick of the sync loop
    pub async fn poll_once(&self) -> AppResult<Vec<ChainUpdate>> {
        let (observed, head) = self.observe().await;

        let previous = {
            let mut state = self.state.lock();
            let previous = state.node;
            state.node = observed;
            if observed == NodeState::Disconnected {
                state.filter_id = None;
            }
            previous
        };

        for event in transition_events(self.config.chain_id, previous, observed, head) {
            match &event {
                GatewayEvent::NodeDisconnected { .. } => {
                    warn!("🔌 Lost connection to chain {} node", self.config.chain_id)
                }
                GatewayEvent::NodeConnected { .. } => {
                    info!("🔗 Connected to chain {} node", self.config.chain_id)
                }
                GatewayEvent::SyncLost { .. } => warn!("Chain {} node fell out of sync", self.config.chain_id),
                _ => {}
            }
            self.events.publish(event);
        }

        let mut chain = self.load_chain().await?;
        if observed == NodeState::Disconnected {
            if chain.online || chain.synced {
                chain.online = false;
                chain.synced = false;
                self.store.save_chain(&chain).await?;
            }
            return Ok(Vec::new());
        }

        let mut updates = Vec::new();
        let previous_head = chain.head_number;

        if observed == NodeState::Synced {
            if let Some(report) = self.detect_reorg(head).await? {
                updates.push(ChainUpdate::Rewound(report));
            }
        }

        chain = self.load_chain().await?;
        chain.online = true;
        chain.synced = observed == NodeState::Synced;
        chain.head_number = head;
        self.store.save_chain(&chain).await?;

        if observed != NodeState::Synced {
            return Ok(updates);
        }

        let from = match self.store.latest_block_number(self.config.chain_id).await? {
            Some(latest) => latest + 1,
            None => self.config.start_block.unwrap_or(head),
        };
        let to = head.min(from.saturating_add(self.config.scan_range.saturating_sub(1)));

        updates.extend(self.drain_filter(head).await?);
        updates.extend(self.backfill(from, to).await?);

        if head > previous_head {
            updates.push(ChainUpdate::HeadAdvanced {
                chain_id: self.config.chain_id,
                previous: previous_head,
                head,
            });
        }
        Ok(updates)
    }

    /// Run the poll loop until the receiving side goes away
    pub async fn poll_loop(&self, updates: mpsc::Sender<ChainUpdate>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut failures: u32 = 0;

        loop {
            ticker.tick().await;

            match self.poll_once().await {
                Ok(batch) => {
                    failures = 0;
                    for update in batch {
                        if updates.send(update).await.is_err() {
                            info!("Settlement task stopped, ending sync of chain {}", self.config.chain_id);
                            return;
                        }
                    }
                }
                Err(e) if e.is_connectivity() => {
                    failures = failures.saturating_add(1);
                    let delay = self
                        .config
                        .poll_interval
                        .saturating_mul(2u32.saturating_pow(failures.min(8)))
                        .min(MAX_BACKOFF);
                    warn!("Chain {} poll failed ({}), retrying in {:?}", self.config.chain_id, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => error!("❌ Chain {} poll failed: {}", self.config.chain_id, e),
            }
        }
    }

    pub fn start(self: Arc<Self>, updates: mpsc::Sender<ChainUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move { self.poll_loop(updates).await })
    }
}
