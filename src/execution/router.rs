use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::LedgerEntry;
use crate::transfers::models::{Rail, Transfer};

/// What a rail did for a transfer
#[derive(Debug, Clone)]
pub struct RailReceipt {
    pub rail: Rail,
    /// Rail-side proof: tx hash, channel payment key or transfer id
    pub identifier: String,
    /// Balanced entries describing where the value went, referencing the execution
    pub legs: Vec<LedgerEntry>,
}

/// One settlement rail able to carry outbound transfers
#[async_trait]
pub trait RailExecutor: Send + Sync {
    fn rail(&self) -> Rail;

    /// Whether this rail can carry the transfer right now
    async fn is_capable(&self, transfer: &Transfer) -> AppResult<bool>;

    /// Move the value. Must not be retried by the caller once it has been invoked.
    async fn execute(&self, transfer: &Transfer, execution_id: Uuid) -> AppResult<RailReceipt>;
}

/// Picks the first capable rail in priority order: internal, channel, blockchain
pub struct ExecutorRouter {
    executors: BTreeMap<Rail, Arc<dyn RailExecutor>>,
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
    }

    /// Only call this during system initialization
    pub fn register(&mut self, executor: Arc<dyn RailExecutor>) {
        info!("Registering executor for rail: {}", executor.rail());
        self.executors.insert(executor.rail(), executor);
    }

    #[instrument(skip(self, transfer), fields(transfer_id = %transfer.id))]
    pub async fn select(&self, transfer: &Transfer) -> Option<Arc<dyn RailExecutor>> {
        for (rail, executor) in &self.executors {
            match executor.is_capable(transfer).await {
                Ok(true) => {
                    debug!("Transfer {} routed to {} rail", transfer.id, rail);
                    return Some(executor.clone());
                }
                Ok(false) => continue,
                Err(e) => warn!("Capability check on {} rail failed: {}", rail, e),
            }
        }
        None
    }

    pub fn rails(&self) -> Vec<Rail> {
        self.executors.keys().copied().collect()
    }

    pub fn supports_rail(&self, rail: Rail) -> bool {
        self.executors.contains_key(&rail)
    }
}

impl Default for ExecutorRouter {
    fn default() -> Self {
        Self::new()
    }
}
