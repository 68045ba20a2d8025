use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ledger::models::{Amount, Balance, Currency};

/// Settlement mechanism, in executor priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    Internal,
    Channel,
    Blockchain,
}

impl Rail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::Internal => "internal",
            Rail::Channel => "channel",
            Rail::Blockchain => "blockchain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "internal" => Some(Rail::Internal),
            "channel" => Some(Rail::Channel),
            "blockchain" => Some(Rail::Blockchain),
            _ => None,
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TransferTarget {
    User(Uuid),
    Address(String),
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::User(id) => write!(f, "user:{}", id),
            TransferTarget::Address(address) => write!(f, "address:{}", address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub sender: Uuid,
    pub target: TransferTarget,
    pub amount: Amount,
    pub currency: Currency,
    pub memo: Option<String>,
    /// Order this transfer pays, settled once the transfer executes internally
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Input to `TransferEngine::schedule`
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub sender: Uuid,
    pub target: TransferTarget,
    pub amount: Amount,
    pub currency: Currency,
    pub memo: Option<String>,
    pub order_id: Option<Uuid>,
}

impl NewTransfer {
    pub fn into_transfer(self) -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            sender: self.sender,
            target: self.target,
            amount: self.amount,
            currency: self.currency,
            memo: self.memo,
            order_id: self.order_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferExecution {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub rail: Rail,
    /// Rail receipt: tx hash, channel payment identifier or internal reference
    pub rail_identifier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TransferFailure {
    pub fn new(transfer_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transfer_id,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancellation {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub canceled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The single terminal marker written for a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Executed(TransferExecution),
    Failed(TransferFailure),
    Canceled(TransferCancellation),
}

impl Finalization {
    pub fn transfer_id(&self) -> Uuid {
        match self {
            Finalization::Executed(e) => e.transfer_id,
            Finalization::Failed(f) => f.transfer_id,
            Finalization::Canceled(c) => c.transfer_id,
        }
    }

    pub fn marker_id(&self) -> Uuid {
        match self {
            Finalization::Executed(e) => e.id,
            Finalization::Failed(f) => f.id,
            Finalization::Canceled(c) => c.id,
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self {
            Finalization::Executed(_) => TransferStatus::Executed,
            Finalization::Failed(_) => TransferStatus::Failed,
            Finalization::Canceled(_) => TransferStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Scheduled,
    Executed,
    Failed,
    Canceled,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransferStatus::Scheduled => "scheduled",
            TransferStatus::Executed => "executed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// A transfer together with everything recorded about it
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub transfer: Transfer,
    pub reserved: bool,
    /// Deadline of the execution claim written with the reservation
    pub claimed_until: Option<DateTime<Utc>>,
    pub finalization: Option<Finalization>,
}

impl TransferRecord {
    pub fn status(&self) -> TransferStatus {
        self.finalization
            .as_ref()
            .map_or(TransferStatus::Scheduled, Finalization::status)
    }

    /// A worker is still entitled to call a rail for this transfer
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.finalization.is_none() && self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Result of the atomic "check finalized, check balance, reserve and claim" unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Funds reserved and the execution claim belongs to the caller
    Reserved,
    /// Another worker holds a live claim; the caller must not touch a rail
    Claimed { until: DateTime<Utc> },
    /// A reservation whose claim lapsed without a terminal marker. The claim was
    /// handed to the caller, who must settle the transfer without a rail call.
    Reclaimed,
    AlreadyFinalized(TransferStatus),
    /// Balance too low; the failure marker was written in the same unit
    Insufficient { available: Balance },
}

/// Result of writing a terminal marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Written,
    AlreadyFinalized(TransferStatus),
    /// Cancellation refused: a worker holds a live execution claim
    Claimed,
}
