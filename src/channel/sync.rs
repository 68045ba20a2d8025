use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::client::ChannelClient;
use super::models::{ChannelInfo, ChannelPayment, PaymentDirection};
use crate::chain::tokens::CurrencyRegistry;
use crate::error::{AppError, AppResult};
use crate::ledger::{self, models::*};
use crate::store::SettlementStore;

/// Mirrors the channel node's channels and payment events into the store
pub struct ChannelSync {
    client: Arc<dyn ChannelClient>,
    store: Arc<dyn SettlementStore>,
    currencies: CurrencyRegistry,
}

impl ChannelSync {
    pub fn new(client: Arc<dyn ChannelClient>, store: Arc<dyn SettlementStore>, currencies: CurrencyRegistry) -> Self {
        Self {
            client,
            store,
            currencies,
        }
    }

    pub fn node_address(&self) -> &str {
        self.client.node_address()
    }

    /// Refresh channels and return payments received since the last poll
    pub async fn poll_once(&self) -> AppResult<Vec<ChannelPayment>> {
        let channels = self.client.list_channels().await?;
        let mut received = Vec::new();

        for channel in channels {
            self.store.save_channel(&channel).await?;

            let seen = self.store.channel_payment_count(&channel.channel_id).await?;
            let events = self.client.payments(&channel, seen as usize).await?;
            for event in events {
                if !self.store.record_channel_payment(&event).await? {
                    continue;
                }
                if event.direction == PaymentDirection::Received {
                    debug!(
                        "Channel {} received {} (identifier {})",
                        channel.channel_id, event.amount, event.identifier
                    );
                    received.push(event);
                }
            }
        }
        Ok(received)
    }

    /// Move on-chain funds of the node into a channel and book the shift from wallet to channel
    #[instrument(skip(self))]
    pub async fn top_up(&self, channel_id: &str, amount: Amount) -> AppResult<ChannelInfo> {
        let channel = self
            .store
            .channels()
            .await?
            .into_iter()
            .find(|c| c.channel_id == channel_id)
            .ok_or_else(|| AppError::NotFound(format!("Channel {}", channel_id)))?;

        let currency = self
            .currencies
            .token(&channel.token_address)
            .cloned()
            .ok_or_else(|| AppError::InvalidInput(format!("Untracked channel token {}", channel.token_address)))?;

        let total = channel
            .total_deposit
            .checked_add(amount)
            .ok_or_else(|| AppError::InvalidInput("Deposit overflows".into()))?;
        let updated = self.client.deposit(&channel, total).await?;
        self.store.save_channel(&updated).await?;

        let node = self.client.node_address();
        let entries = ledger::transfer(
            BookOwner::wallet(node),
            BookOwner::channel(node),
            amount,
            &currency,
            Reference::new(ReferenceKind::ChannelDeposit, Uuid::new_v4()),
        )?;
        self.store.append_entries(&entries).await?;

        info!("💰 Deposited {} into channel {}", amount, channel_id);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{self, MockChannelClient};

    const NODE: &str = "0x00000000000000000000000000000000000000ee";

    fn setup() -> (ChannelSync, Arc<MockChannelClient>, Arc<MemoryStore>) {
        let client = Arc::new(MockChannelClient::new(NODE));
        let store = Arc::new(MemoryStore::new());
        let currencies = CurrencyRegistry::new(testing::eth()).with_token(testing::usdc());
        let sync = ChannelSync::new(client.clone(), store.clone(), currencies);
        (sync, client, store)
    }

    #[tokio::test]
    async fn test_poll_returns_each_payment_once() {
        let (sync, client, store) = setup();
        client.open_channel("7", "0xpartner", 1000);
        client.receive("7", "0xpayer", 50, 11);

        let first = sync.poll_once().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].identifier, 11);
        assert!(sync.poll_once().await.unwrap().is_empty());

        client.receive("7", "0xpayer", 25, 12);
        let next = sync.poll_once().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].amount, 25);
        assert_eq!(store.channel_payment_count("7").await.unwrap(), 2);
        assert_eq!(store.channels().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_top_up_books_wallet_to_channel() {
        let (sync, client, store) = setup();
        client.open_channel("7", "0xpartner", 1000);
        sync.poll_once().await.unwrap();

        let updated = sync.top_up("7", 500).await.unwrap();
        assert_eq!(updated.total_deposit, 1500);
        assert_eq!(client.deposits(), vec![("7".to_string(), 1500)]);

        let usdc = testing::usdc();
        assert_eq!(store.balance(&BookOwner::channel(NODE), &usdc).await.unwrap(), 500);
        assert_eq!(store.balance(&BookOwner::wallet(NODE), &usdc).await.unwrap(), -500);
        assert_eq!(store.currency_net_total(&usdc).await.unwrap(), 0);

        assert!(matches!(sync.top_up("9", 1).await, Err(AppError::NotFound(_))));
    }
}
