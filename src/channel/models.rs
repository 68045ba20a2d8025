use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Opened,
    Closed,
    Settled,
}

/// One payment channel held by the gateway's node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel identifier assigned by the token network
    pub channel_id: String,
    pub chain_id: u64,
    pub token_address: String,
    pub partner_address: String,
    /// Our spendable side of the channel
    pub balance: Amount,
    pub total_deposit: Amount,
    pub state: ChannelState,
}

impl ChannelInfo {
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Opened
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentDirection {
    Received,
    Sent,
}

/// A payment event reported by the node for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayment {
    pub channel_id: String,
    pub token_address: String,
    pub direction: PaymentDirection,
    /// Counterparty: initiator for received, target for sent payments
    pub counterparty: String,
    pub amount: Amount,
    pub identifier: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChannelPayment {
    /// Unique per rail event
    pub fn rail_identifier(&self) -> String {
        format!(
            "{}:{}:{}",
            self.channel_id,
            self.identifier,
            self.timestamp.timestamp_millis()
        )
    }
}
