use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::router::{RailExecutor, RailReceipt};
use crate::channel::client::ChannelClient;
use crate::channel::models::ChannelInfo;
use crate::error::{AppResult, TransferError};
use crate::ledger::{self, models::*};
use crate::transfers::models::{Rail, Transfer, TransferTarget};

/// Off-chain payments through the gateway's channel node
pub struct ChannelExecutor {
    client: Arc<dyn ChannelClient>,
}

impl ChannelExecutor {
    pub fn new(client: Arc<dyn ChannelClient>) -> Self {
        Self { client }
    }

    fn target(transfer: &Transfer) -> Option<(&str, &str)> {
        match (&transfer.target, transfer.currency.address.as_deref()) {
            (TransferTarget::Address(target), Some(token)) => Some((target.as_str(), token)),
            _ => None,
        }
    }

    /// An open channel in the token with enough spendable balance
    async fn funding_channel(&self, transfer: &Transfer) -> AppResult<Option<ChannelInfo>> {
        let Some((_, token)) = Self::target(transfer) else {
            return Ok(None);
        };
        let channels = self.client.list_channels().await?;
        Ok(channels.into_iter().find(|c| {
            c.is_open()
                && c.chain_id == transfer.currency.chain_id
                && c.token_address == token
                && c.balance >= transfer.amount
        }))
    }
}

#[async_trait]
impl RailExecutor for ChannelExecutor {
    fn rail(&self) -> Rail {
        Rail::Channel
    }

    async fn is_capable(&self, transfer: &Transfer) -> AppResult<bool> {
        Ok(self.funding_channel(transfer).await?.is_some())
    }

    async fn execute(&self, transfer: &Transfer, execution_id: Uuid) -> AppResult<RailReceipt> {
        let (target, token) = Self::target(transfer)
            .ok_or_else(|| TransferError::InvalidTarget(transfer.target.to_string()))?;

        let identifier = rand::rng().random_range(1..(1u64 << 53));
        let sent = self
            .client
            .send_payment(token, target, transfer.amount, identifier)
            .await
            .map_err(|e| TransferError::RailRejected {
                rail: Rail::Channel,
                message: e.to_string(),
            })?;

        info!("⚡ Channel payment {} of {} sent to {}", identifier, transfer.amount, target);

        let node = self.client.node_address();
        let legs = ledger::transfer(
            BookOwner::channel(node),
            BookOwner::external(target),
            sent.amount,
            &transfer.currency,
            Reference::new(ReferenceKind::TransferExecution, execution_id),
        )?;

        Ok(RailReceipt {
            rail: Rail::Channel,
            identifier: format!("{}:{}", node, sent.identifier),
            legs,
        })
    }
}
