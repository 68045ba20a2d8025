use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult, TransferError};
use crate::events::{EventBus, GatewayEvent};
use crate::execution::ExecutorRouter;
use crate::ledger::{self, models::*};
use crate::settlement::SettlementMatcher;
use crate::store::SettlementStore;
use crate::wallet::UserDirectory;

/// Marks a transfer as being worked on by this process until dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Result<Self, TransferError> {
        if set.lock().insert(id) {
            Ok(Self { set, id })
        } else {
            Err(TransferError::InFlight)
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Execution claims outlive the rail timeout so capability checks and the final write fit inside
const CLAIM_LEASE_FACTOR: u32 = 3;

/// Schedules, executes and cancels outbound transfers.
/// Every terminal state is written together with its ledger entries.
///
/// Workers sharing a store coordinate through the execution claim written with the
/// reservation: only the claim holder calls a rail, and cancellation waits for the claim to lapse.
pub struct TransferEngine {
    store: Arc<dyn SettlementStore>,
    executors: Arc<ExecutorRouter>,
    directory: Arc<dyn UserDirectory>,
    events: EventBus,
    rail_timeout: Duration,
    settlement: Option<Arc<SettlementMatcher>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        executors: Arc<ExecutorRouter>,
        directory: Arc<dyn UserDirectory>,
        events: EventBus,
        rail_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executors,
            directory,
            events,
            rail_timeout,
            settlement: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Settle order payments made by internal transfers once they execute
    pub fn with_settlement(mut self, matcher: Arc<SettlementMatcher>) -> Self {
        self.settlement = Some(matcher);
        self
    }

    fn claim_deadline(&self) -> AppResult<DateTime<Utc>> {
        let lease = self
            .rail_timeout
            .checked_mul(CLAIM_LEASE_FACTOR)
            .and_then(|lease| chrono::Duration::from_std(lease).ok())
            .ok_or_else(|| AppError::Config(format!("Rail timeout {:?} out of range", self.rail_timeout)))?;
        Ok(Utc::now() + lease)
    }

    pub async fn schedule(&self, request: NewTransfer) -> AppResult<Transfer> {
        if request.amount == 0 {
            return Err(AppError::InvalidInput("Transfer amount must be positive".into()));
        }
        match &request.target {
            TransferTarget::User(id) => {
                if *id == request.sender || !self.directory.exists(*id).await? {
                    return Err(TransferError::InvalidTarget(request.target.to_string()).into());
                }
            }
            TransferTarget::Address(address) => {
                if address.trim().is_empty() {
                    return Err(TransferError::InvalidTarget("empty address".into()).into());
                }
                if request.order_id.is_some() {
                    return Err(TransferError::InvalidTarget("orders are paid to their owner".into()).into());
                }
            }
        }

        let transfer = request.into_transfer();
        self.store.insert_transfer(&transfer).await?;

        info!("📝 Scheduled transfer {} of {} to {}", transfer.id, transfer.amount, transfer.target);
        self.events.publish(GatewayEvent::TransferScheduled {
            transfer_id: transfer.id,
            amount: transfer.amount,
        });
        Ok(transfer)
    }

    pub async fn status(&self, transfer_id: Uuid) -> AppResult<TransferStatus> {
        Ok(self.record(transfer_id).await?.status())
    }

    async fn record(&self, transfer_id: Uuid) -> AppResult<TransferRecord> {
        self.store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transfer {}", transfer_id)))
    }

    fn release(transfer: &Transfer, reference: Reference) -> AppResult<Vec<LedgerEntry>> {
        ledger::transfer(
            BookOwner::Treasury(transfer.currency.chain_id),
            BookOwner::User(transfer.sender),
            transfer.amount,
            &transfer.currency,
            reference,
        )
    }

    /// Reserve, pick a rail and execute. Safe to call repeatedly; a finished transfer is left alone.
    #[instrument(skip(self))]
    pub async fn execute(&self, transfer_id: Uuid) -> AppResult<TransferStatus> {
        let _guard = InFlight::acquire(&self.in_flight, transfer_id)?;

        let record = self.record(transfer_id).await?;
        if record.finalization.is_some() {
            return Ok(record.status());
        }
        let transfer = record.transfer;

        let reservation = ledger::transfer(
            BookOwner::User(transfer.sender),
            BookOwner::Treasury(transfer.currency.chain_id),
            transfer.amount,
            &transfer.currency,
            Reference::new(ReferenceKind::TransferReservation, transfer.id),
        )?;
        let insufficient = TransferFailure::new(transfer.id, "insufficient balance");
        let claim_until = self.claim_deadline()?;

        match self
            .store
            .reserve_transfer(&transfer, &reservation, &insufficient, claim_until)
            .await?
        {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Claimed { until } => {
                debug!("Transfer {} is claimed by another worker until {}", transfer.id, until);
                return Ok(TransferStatus::Scheduled);
            }
            // Whoever held the claim may or may not have reached the rail
            ReserveOutcome::Reclaimed => {
                error!("❌ Execution claim on transfer {} lapsed without a result", transfer.id);
                return self.fail(&transfer, TransferError::ClaimExpired).await;
            }
            ReserveOutcome::AlreadyFinalized(status) => return Ok(status),
            ReserveOutcome::Insufficient { available } => {
                info!(
                    "Transfer {} failed: {}",
                    transfer.id,
                    TransferError::InsufficientBalance {
                        required: transfer.amount,
                        available
                    }
                );
                self.events.publish(GatewayEvent::TransferFailed {
                    transfer_id: transfer.id,
                });
                return Ok(TransferStatus::Failed);
            }
        }

        let Some(executor) = self.executors.select(&transfer).await else {
            return self.fail(&transfer, TransferError::NoCapableRail).await;
        };
        let rail = executor.rail();
        if Utc::now() >= claim_until {
            return self.fail(&transfer, TransferError::ClaimExpired).await;
        }

        let execution_id = Uuid::new_v4();
        let receipt = match tokio::time::timeout(self.rail_timeout, executor.execute(&transfer, execution_id)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(AppError::Transfer(e))) => return self.fail(&transfer, e).await,
            Ok(Err(e)) => {
                let rejected = TransferError::RailRejected {
                    rail,
                    message: e.to_string(),
                };
                return self.fail(&transfer, rejected).await;
            }
            Err(_) => return self.fail(&transfer, TransferError::Timeout { rail }).await,
        };

        let execution = TransferExecution {
            id: execution_id,
            transfer_id: transfer.id,
            rail,
            rail_identifier: receipt.identifier.clone(),
            created_at: Utc::now(),
        };
        let outcome = self
            .store
            .finalize_transfer(&Finalization::Executed(execution), &receipt.legs, &[])
            .await?;
        if outcome != FinalizeOutcome::Written {
            error!(
                "❌ Transfer {} went out on {} ({}) but was already finalized",
                transfer.id, rail, receipt.identifier
            );
            return self.status(transfer.id).await;
        }

        info!("✅ Transfer {} executed on {} rail: {}", transfer.id, rail, receipt.identifier);
        self.events.publish(GatewayEvent::TransferExecuted {
            transfer_id: transfer.id,
            rail,
        });

        if rail == Rail::Internal {
            self.settle_order_payment(&transfer).await;
        }
        Ok(TransferStatus::Executed)
    }

    /// An executed internal transfer that names an order counts as a payment to it
    async fn settle_order_payment(&self, transfer: &Transfer) {
        let (Some(matcher), Some(order_id)) = (&self.settlement, transfer.order_id) else {
            return;
        };
        match matcher.on_internal_payment(order_id, transfer.id).await {
            Ok(Some(payment)) => info!("🔗 Transfer {} paid order {} ({})", transfer.id, order_id, payment.id),
            Ok(None) => warn!("Transfer {} matched no open route of order {}", transfer.id, order_id),
            Err(e) => error!("❌ Transfer {} could not settle order {}: {}", transfer.id, order_id, e),
        }
    }

    async fn fail(&self, transfer: &Transfer, reason: TransferError) -> AppResult<TransferStatus> {
        info!("Transfer {} failed: {}", transfer.id, reason);

        let failure = TransferFailure::new(transfer.id, reason.to_string());
        let release = Self::release(transfer, Reference::new(ReferenceKind::TransferFailure, failure.id))?;

        match self
            .store
            .finalize_transfer(&Finalization::Failed(failure), &[], &release)
            .await?
        {
            FinalizeOutcome::Written => {
                self.events.publish(GatewayEvent::TransferFailed {
                    transfer_id: transfer.id,
                });
                Ok(TransferStatus::Failed)
            }
            FinalizeOutcome::AlreadyFinalized(status) => Ok(status),
            FinalizeOutcome::Claimed => self.status(transfer.id).await,
        }
    }

    /// Cancel a transfer that has not started executing
    pub async fn cancel(&self, transfer_id: Uuid, canceled_by: Option<Uuid>) -> AppResult<()> {
        let _guard = InFlight::acquire(&self.in_flight, transfer_id)?;

        let record = self.record(transfer_id).await?;
        let status = record.status();
        if status != TransferStatus::Scheduled {
            return Err(TransferError::NotCancellable(status).into());
        }
        if record.is_claimed(Utc::now()) {
            return Err(TransferError::InFlight.into());
        }

        let cancellation = TransferCancellation {
            id: Uuid::new_v4(),
            transfer_id,
            canceled_by,
            created_at: Utc::now(),
        };
        let release = Self::release(
            &record.transfer,
            Reference::new(ReferenceKind::TransferCancellation, cancellation.id),
        )?;

        match self
            .store
            .finalize_transfer(&Finalization::Canceled(cancellation), &[], &release)
            .await?
        {
            FinalizeOutcome::Written => {}
            FinalizeOutcome::AlreadyFinalized(current) => {
                return Err(TransferError::NotCancellable(current).into());
            }
            FinalizeOutcome::Claimed => return Err(TransferError::InFlight.into()),
        }

        info!("🚫 Transfer {} canceled", transfer_id);
        self.events.publish(GatewayEvent::TransferCanceled { transfer_id });
        Ok(())
    }

    /// Execute every transfer still waiting, oldest first
    pub async fn run_pending(&self) -> AppResult<usize> {
        let pending = self.store.scheduled_transfers().await?;
        let mut processed = 0;
        for transfer in pending {
            match self.execute(transfer.id).await {
                Ok(_) => processed += 1,
                Err(AppError::Transfer(TransferError::InFlight)) => {}
                Err(e) => error!("❌ Transfer {} could not be processed: {}", transfer.id, e),
            }
        }
        Ok(processed)
    }

    /// Start the transfer worker (runs in background)
    pub fn start(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_pending().await {
                    error!("❌ Transfer worker pass failed: {}", e);
                }
            }
        })
    }
}
