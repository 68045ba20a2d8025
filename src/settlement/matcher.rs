use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chain::models::{ChainUpdate, RewindReport, Transaction};
use crate::chain::tokens::CurrencyRegistry;
use crate::channel::models::{ChannelPayment, PaymentDirection};
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, GatewayEvent};
use crate::ledger::{self, models::*};
use crate::payments::models::*;
use crate::store::SettlementStore;
use crate::transfers::models::{Finalization, Rail, TransferTarget};

/// Correlates rail activity with open routes and advances payments to confirmed.
/// The only writer of payments and confirmations.
pub struct SettlementMatcher {
    store: Arc<dyn SettlementStore>,
    events: EventBus,
    currencies: HashMap<u64, CurrencyRegistry>,
    minimum_confirmations: u64,
}

impl SettlementMatcher {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        events: EventBus,
        currencies: Vec<CurrencyRegistry>,
        minimum_confirmations: u64,
    ) -> Self {
        Self {
            store,
            events,
            currencies: currencies.into_iter().map(|c| (c.chain_id(), c)).collect(),
            minimum_confirmations,
        }
    }

    /// Apply one update from a chain's sync loop
    pub async fn handle_update(&self, update: ChainUpdate) -> AppResult<()> {
        match update {
            ChainUpdate::Rewound(report) => self.on_rewind(&report),
            ChainUpdate::BlockIngested(ingested) => {
                for tx in &ingested.transactions {
                    self.on_transaction_ingested(tx).await?;
                }
                self.on_block_ingested(ingested.block.chain_id, ingested.block.number)
                    .await?;
            }
            ChainUpdate::HeadAdvanced { chain_id, previous, head } => {
                self.expire_blockchain_routes(chain_id, previous, head).await?;
                self.on_block_ingested(chain_id, head).await?;
            }
        }
        Ok(())
    }

    async fn order_for(&self, route: &PaymentRoute) -> AppResult<PaymentOrder> {
        self.store
            .get_order(route.order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {} for route {}", route.order_id, route.id)))
    }

    // ========== BLOCKCHAIN ==========

    /// Record a payment when the transaction pays into an open blockchain route
    #[instrument(skip(self, tx), fields(chain_id = tx.chain_id, tx = %tx.hash))]
    pub async fn on_transaction_ingested(&self, tx: &Transaction) -> AppResult<Option<Payment>> {
        let Some(registry) = self.currencies.get(&tx.chain_id) else {
            return Ok(None);
        };
        let Some((recipient, amount, currency)) = registry.resolve_transfer(tx) else {
            return Ok(None);
        };
        let Some(route) = self
            .store
            .find_blockchain_route(tx.chain_id, &recipient, tx.block_number)
            .await?
        else {
            return Ok(None);
        };

        let order = self.order_for(&route).await?;
        if order.currency != currency {
            warn!(
                "Transaction {} pays {} into route {} of order {} priced in {}",
                tx.hash,
                currency.code(),
                route.id,
                order.id,
                order.currency.code()
            );
            return Ok(None);
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: order.id,
            route_id: route.id,
            amount,
            currency: currency.clone(),
            rail_identifier: tx.hash.clone(),
            observed_at: Utc::now(),
            details: PaymentDetails::Blockchain {
                chain_id: tx.chain_id,
                tx_hash: tx.hash.clone(),
                block_hash: tx.block_hash.clone(),
                block_number: tx.block_number,
                sender: tx.from_address.clone(),
            },
        };
        let entries = ledger::transfer(
            BookOwner::external(&tx.from_address),
            BookOwner::wallet(&recipient),
            amount,
            &currency,
            Reference::new(ReferenceKind::Payment, payment.id),
        )?;

        if !self.store.record_payment(&payment, None, &entries).await? {
            debug!("Payment for {} already recorded", tx.hash);
            return Ok(None);
        }

        info!(
            "💰 Payment of {} {} received for order {} in block {}",
            amount, currency.symbol, order.id, tx.block_number
        );
        self.events.publish(GatewayEvent::PaymentReceived {
            order_id: order.id,
            payment_id: payment.id,
            amount,
            block_number: Some(tx.block_number),
        });
        Ok(Some(payment))
    }

    /// Confirm every pending payment on the chain that is now deep enough
    pub async fn on_block_ingested(&self, chain_id: u64, block_number: u64) -> AppResult<Vec<Payment>> {
        let Some(chain) = self.store.get_chain(chain_id).await? else {
            return Ok(Vec::new());
        };
        if !chain.is_ready() {
            debug!("Chain {} not synced, holding confirmations", chain_id);
            return Ok(Vec::new());
        }
        let head = chain.head_number.max(block_number);

        let mut confirmed = Vec::new();
        for payment in self.store.unconfirmed_blockchain_payments(chain_id).await? {
            let Some(paid_in) = payment.block_number() else { continue };
            if head < paid_in.saturating_add(self.minimum_confirmations) {
                continue;
            }

            let Some(order) = self.store.get_order(payment.order_id).await? else {
                warn!("Payment {} has no order {}", payment.id, payment.order_id);
                continue;
            };
            let confirmation = PaymentConfirmation::for_payment(payment.id);
            let entries = ledger::transfer(
                BookOwner::Treasury(chain_id),
                BookOwner::User(order.owner),
                payment.amount,
                &payment.currency,
                Reference::new(ReferenceKind::PaymentConfirmation, confirmation.id),
            )?;

            if self.store.confirm_payment(&confirmation, &entries).await? {
                info!("✅ Payment {} confirmed at head {}", payment.id, head);
                self.events.publish(GatewayEvent::PaymentConfirmed {
                    order_id: order.id,
                    payment_id: payment.id,
                    amount: payment.amount,
                    block_number: Some(paid_in),
                });
                confirmed.push(payment);
            }
        }
        Ok(confirmed)
    }

    /// Payments and confirmations were removed by the store during the rewind
    pub fn on_rewind(&self, report: &RewindReport) {
        for payment in &report.removed_payments {
            warn!(
                "Payment {} for order {} removed by reorg on chain {}",
                payment.id, payment.order_id, report.chain_id
            );
        }
        if report.reversal_entries > 0 {
            info!("Posted {} reversal entries after reorg", report.reversal_entries);
        }
    }

    /// Match stored transactions against routes still open, e.g. after a restart
    pub async fn rescan(&self, chain_id: u64) -> AppResult<usize> {
        let Some(chain) = self.store.get_chain(chain_id).await? else {
            return Ok(0);
        };
        let Some(from) = self
            .store
            .earliest_open_window_start(chain_id, chain.head_number)
            .await?
        else {
            return Ok(0);
        };

        let to = self
            .store
            .latest_block_number(chain_id)
            .await?
            .map_or(chain.head_number, |latest| latest.max(chain.head_number));

        let mut found = 0;
        for tx in self.store.transactions_in_range(chain_id, from, to).await? {
            if self.on_transaction_ingested(&tx).await?.is_some() {
                found += 1;
            }
        }
        self.on_block_ingested(chain_id, chain.head_number).await?;

        if found > 0 {
            info!("Rescan of chain {} from block {} found {} payments", chain_id, from, found);
        }
        Ok(found)
    }

    // ========== CHANNEL ==========

    /// Received channel payments confirm on creation
    #[instrument(skip(self, observed), fields(identifier = observed.identifier))]
    pub async fn on_channel_payment_observed(&self, node: &str, observed: &ChannelPayment) -> AppResult<Option<Payment>> {
        if observed.direction != PaymentDirection::Received {
            return Ok(None);
        }
        let Some(route) = self
            .store
            .find_channel_route(node, observed.identifier, observed.timestamp)
            .await?
        else {
            debug!("No channel route for identifier {}", observed.identifier);
            return Ok(None);
        };

        let order = self.order_for(&route).await?;
        if order.currency.address.as_deref() != Some(observed.token_address.as_str()) {
            warn!(
                "Channel payment {} in token {} does not match order {}",
                observed.identifier, observed.token_address, order.id
            );
            return Ok(None);
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: order.id,
            route_id: route.id,
            amount: observed.amount,
            currency: order.currency.clone(),
            rail_identifier: observed.rail_identifier(),
            observed_at: observed.timestamp,
            details: PaymentDetails::Channel {
                node: node.to_lowercase(),
                sender: observed.counterparty.clone(),
                identifier: observed.identifier,
            },
        };
        let confirmation = PaymentConfirmation::for_payment(payment.id);

        let mut entries = ledger::transfer(
            BookOwner::external(&observed.counterparty),
            BookOwner::channel(node),
            payment.amount,
            &payment.currency,
            Reference::new(ReferenceKind::Payment, payment.id),
        )?;
        entries.extend(ledger::transfer(
            BookOwner::Treasury(payment.currency.chain_id),
            BookOwner::User(order.owner),
            payment.amount,
            &payment.currency,
            Reference::new(ReferenceKind::PaymentConfirmation, confirmation.id),
        )?);

        if !self
            .store
            .record_payment(&payment, Some(&confirmation), &entries)
            .await?
        {
            return Ok(None);
        }

        self.publish_received_and_confirmed(&payment);
        Ok(Some(payment))
    }

    /// Match every recorded channel event not yet handled. An event stays pending until
    /// matching it succeeds, so a failed attempt is retried on the next pass.
    pub async fn settle_channel_backlog(&self, node: &str) -> AppResult<usize> {
        let pending = self.store.unsettled_channel_payments().await?;
        let mut settled = 0;
        for observed in &pending {
            match self.on_channel_payment_observed(node, observed).await {
                Ok(_) => {
                    self.store
                        .mark_channel_payment_settled(&observed.rail_identifier())
                        .await?;
                    settled += 1;
                }
                Err(e) => error!("❌ Channel payment {} not settled: {}", observed.identifier, e),
            }
        }
        Ok(settled)
    }

    // ========== INTERNAL ==========

    /// Settle an order from an executed internal transfer. The transfer already moved the balance.
    pub async fn on_internal_payment(&self, order_id: Uuid, transfer_id: Uuid) -> AppResult<Option<Payment>> {
        let record = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transfer {}", transfer_id)))?;
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {}", order_id)))?;

        let executed_internally = matches!(
            &record.finalization,
            Some(Finalization::Executed(execution)) if execution.rail == Rail::Internal
        );
        if !executed_internally {
            return Err(AppError::InvalidInput(format!(
                "Transfer {} is not an executed internal transfer",
                transfer_id
            )));
        }

        let transfer = &record.transfer;
        if transfer.target != TransferTarget::User(order.owner) || transfer.currency != order.currency {
            return Err(AppError::InvalidInput(format!(
                "Transfer {} does not pay order {}",
                transfer_id, order_id
            )));
        }

        let Some(route) = self.store.find_internal_route(order_id, transfer.sender).await? else {
            return Ok(None);
        };

        let payment = Payment {
            id: Uuid::new_v4(),
            order_id,
            route_id: route.id,
            amount: transfer.amount,
            currency: transfer.currency.clone(),
            rail_identifier: transfer_id.to_string(),
            observed_at: Utc::now(),
            details: PaymentDetails::Internal {
                payer: transfer.sender,
                transfer_id,
            },
        };
        let confirmation = PaymentConfirmation::for_payment(payment.id);

        if !self.store.record_payment(&payment, Some(&confirmation), &[]).await? {
            return Ok(None);
        }
        self.publish_received_and_confirmed(&payment);
        Ok(Some(payment))
    }

    fn publish_received_and_confirmed(&self, payment: &Payment) {
        info!("💰 Payment of {} received and confirmed for order {}", payment.amount, payment.order_id);
        self.events.publish(GatewayEvent::PaymentReceived {
            order_id: payment.order_id,
            payment_id: payment.id,
            amount: payment.amount,
            block_number: None,
        });
        self.events.publish(GatewayEvent::PaymentConfirmed {
            order_id: payment.order_id,
            payment_id: payment.id,
            amount: payment.amount,
            block_number: None,
        });
    }

    // ========== STATUS & EXPIRY ==========

    pub async fn order_status(&self, order_id: Uuid) -> AppResult<OrderSummary> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {}", order_id)))?;
        let routes = self.store.order_routes(order_id).await?;

        let mut payments = Vec::new();
        let mut confirmed = HashSet::new();
        for (payment, confirmation) in self.store.order_payments(order_id).await? {
            if confirmation.is_some() {
                confirmed.insert(payment.id);
            }
            payments.push(payment);
        }

        let head = self
            .store
            .get_chain(order.currency.chain_id)
            .await?
            .map(|c| c.head_number);

        Ok(OrderSummary::compute(&order, &routes, &payments, &confirmed, head, Utc::now()))
    }

    /// Announce blockchain routes whose window closed between two heads
    pub async fn expire_blockchain_routes(&self, chain_id: u64, previous: u64, head: u64) -> AppResult<Vec<PaymentRoute>> {
        if head <= previous {
            return Ok(Vec::new());
        }
        let expired = self.store.blockchain_routes_ending(chain_id, previous, head).await?;
        self.announce_expired(&expired);
        Ok(expired)
    }

    /// Announce channel routes whose window closed in `(after, up_to]`
    pub async fn expire_channel_routes(&self, after: DateTime<Utc>, up_to: DateTime<Utc>) -> AppResult<Vec<PaymentRoute>> {
        let expired = self.store.channel_routes_ending(after, up_to).await?;
        self.announce_expired(&expired);
        Ok(expired)
    }

    fn announce_expired(&self, routes: &[PaymentRoute]) {
        for route in routes {
            debug!("Route {} of order {} expired", route.id, route.order_id);
            self.events.publish(GatewayEvent::RouteExpired {
                order_id: route.order_id,
                route_id: route.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::models::Chain;
    use crate::chain::tokens::encode_transfer_call;
    use crate::store::MemoryStore;
    use crate::testing;
    use crate::transfers::models::{TransferExecution, NewTransfer};
    use chrono::Duration;

    const ACCOUNT: &str = "0x00000000000000000000000000000000000000a1";
    const NODE: &str = "0x00000000000000000000000000000000000000ee";

    struct Fixture {
        matcher: SettlementMatcher,
        store: Arc<MemoryStore>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let currencies = CurrencyRegistry::new(testing::eth()).with_token(testing::usdc());
        let matcher = SettlementMatcher::new(store.clone(), events.clone(), vec![currencies], 5);
        set_head(&store, 100).await;
        Fixture { matcher, store, events }
    }

    async fn set_head(store: &MemoryStore, head: u64) {
        let mut chain = Chain::new(1, "mock://node");
        chain.head_number = head;
        chain.online = true;
        chain.synced = true;
        store.save_chain(&chain).await.unwrap();
    }

    async fn order_with_route(store: &MemoryStore, currency: Currency, amount: Amount) -> (PaymentOrder, PaymentRoute) {
        let order = PaymentOrder::new(Uuid::new_v4(), currency, amount);
        store.insert_order(&order).await.unwrap();
        let account = crate::wallet::GatewayAccount::generate(1);
        let route = store
            .claim_blockchain_route(order.id, 1, BlockWindow::new(100, 50), Some(&account))
            .await
            .unwrap()
            .unwrap();
        (order, route)
    }

    fn paying_tx(to: &str, value: Amount, block_number: u64) -> Transaction {
        testing::stored_transaction(&testing::block(1, block_number), 0, to, value)
    }

    #[tokio::test]
    async fn test_payment_confirms_at_minimum_depth() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::eth(), 10).await;

        let tx = paying_tx(&route.identifier(), 10, 120);
        let payment = f.matcher.on_transaction_ingested(&tx).await.unwrap().unwrap();
        assert_eq!(payment.route_id, route.id);

        set_head(&f.store, 124).await;
        assert!(f.matcher.on_block_ingested(1, 124).await.unwrap().is_empty());
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Paid);

        set_head(&f.store, 125).await;
        assert_eq!(f.matcher.on_block_ingested(1, 125).await.unwrap().len(), 1);
        let summary = f.matcher.order_status(order.id).await.unwrap();
        assert_eq!(summary.status, OrderStatus::Confirmed);
        assert_eq!(summary.total_confirmed, 10);

        let eth = testing::eth();
        assert_eq!(f.store.balance(&BookOwner::User(order.owner), &eth).await.unwrap(), 10);
        assert_eq!(f.store.balance(&BookOwner::wallet(&route.identifier()), &eth).await.unwrap(), 10);
        assert_eq!(f.store.currency_net_total(&eth).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_transaction_pays_once() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::eth(), 10).await;
        let tx = paying_tx(&route.identifier(), 4, 110);

        assert!(f.matcher.on_transaction_ingested(&tx).await.unwrap().is_some());
        assert!(f.matcher.on_transaction_ingested(&tx).await.unwrap().is_none());
        assert_eq!(f.store.order_payments(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transactions_outside_window_or_route_are_ignored() {
        let f = fixture().await;
        let (_, route) = order_with_route(&f.store, testing::eth(), 10).await;

        assert!(f
            .matcher
            .on_transaction_ingested(&paying_tx(&route.identifier(), 10, 150))
            .await
            .unwrap()
            .is_none());
        assert!(f
            .matcher
            .on_transaction_ingested(&paying_tx(ACCOUNT, 10, 120))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_token_payment_matches_token_order() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::usdc(), 7).await;

        let mut tx = paying_tx(testing::TOKEN, 0, 120);
        tx.data = encode_transfer_call(&route.identifier(), 7);
        let payment = f.matcher.on_transaction_ingested(&tx).await.unwrap().unwrap();
        assert_eq!(payment.currency, testing::usdc());

        // Native value into a token-priced route is not a payment
        let (_, other) = order_with_route(&f.store, testing::usdc(), 7).await;
        let native = paying_tx(&other.identifier(), 7, 121);
        assert!(f.matcher.on_transaction_ingested(&native).await.unwrap().is_none());
        assert_eq!(order.currency, testing::usdc());
    }

    #[tokio::test]
    async fn test_reorg_removes_payment_and_reverts_status() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::eth(), 10).await;

        // Route window is [100, 150)
        let block = testing::block(1, 110);
        let tx = testing::stored_transaction(&block, 0, &route.identifier(), 10);
        f.store.upsert_block(&block, &[tx.clone()]).await.unwrap();
        f.matcher.on_transaction_ingested(&tx).await.unwrap().unwrap();
        set_head(&f.store, 115).await;
        f.matcher.on_block_ingested(1, 115).await.unwrap();
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Confirmed);

        let report = f.store.rewind_chain(1, 105).await.unwrap();
        f.matcher.on_rewind(&report);

        assert_eq!(report.removed_payments.len(), 1);
        let summary = f.matcher.order_status(order.id).await.unwrap();
        assert_eq!(summary.status, OrderStatus::Open);
        assert_eq!(summary.total_paid, 0);

        let eth = testing::eth();
        assert_eq!(f.store.balance(&BookOwner::User(order.owner), &eth).await.unwrap(), 0);
        assert_eq!(f.store.currency_net_total(&eth).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsynced_chain_holds_confirmations() {
        let f = fixture().await;
        let (_, route) = order_with_route(&f.store, testing::eth(), 10).await;
        f.matcher
            .on_transaction_ingested(&paying_tx(&route.identifier(), 10, 110))
            .await
            .unwrap();

        let mut chain = f.store.get_chain(1).await.unwrap().unwrap();
        chain.synced = false;
        chain.head_number = 200;
        f.store.save_chain(&chain).await.unwrap();

        assert!(f.matcher.on_block_ingested(1, 200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_payment_confirms_immediately() {
        let f = fixture().await;
        let order = PaymentOrder::new(Uuid::new_v4(), testing::usdc(), 50);
        f.store.insert_order(&order).await.unwrap();
        let now = Utc::now();
        let route = PaymentRoute::new(
            order.id,
            RouteDetails::Channel {
                node: NODE.into(),
                identifier: 4242,
                window: TimeWindow {
                    start: now - Duration::seconds(5),
                    end: now + Duration::seconds(900),
                },
            },
        );
        f.store.insert_route(&route).await.unwrap();
        let mut rx = f.events.subscribe();

        let client = testing::MockChannelClient::new(NODE);
        let observed = client.receive("7", "0xpayer", 50, 4242);
        let payment = f
            .matcher
            .on_channel_payment_observed(NODE, &observed)
            .await
            .unwrap()
            .unwrap();
        assert!(f.matcher.on_channel_payment_observed(NODE, &observed).await.unwrap().is_none());

        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Confirmed);
        let usdc = testing::usdc();
        assert_eq!(f.store.balance(&BookOwner::User(order.owner), &usdc).await.unwrap(), 50);
        assert_eq!(f.store.balance(&BookOwner::channel(NODE), &usdc).await.unwrap(), 50);
        assert_eq!(
            rx.try_recv().unwrap(),
            GatewayEvent::PaymentReceived {
                order_id: order.id,
                payment_id: payment.id,
                amount: 50,
                block_number: None
            }
        );

        let unknown = client.receive("7", "0xpayer", 50, 1);
        assert!(f.matcher.on_channel_payment_observed(NODE, &unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_backlog_retries_failed_match() {
        let f = fixture().await;
        let order = PaymentOrder::new(Uuid::new_v4(), testing::usdc(), 50);
        let now = Utc::now();
        let route = PaymentRoute::new(
            order.id,
            RouteDetails::Channel {
                node: NODE.into(),
                identifier: 77,
                window: TimeWindow {
                    start: now - Duration::seconds(5),
                    end: now + Duration::seconds(900),
                },
            },
        );
        // Route stored before its order, so matching fails until the order lands
        f.store.insert_route(&route).await.unwrap();

        let client = Arc::new(testing::MockChannelClient::new(NODE));
        client.open_channel("7", "0xpayer", 0);
        client.receive("7", "0xpayer", 50, 77);
        let currencies = CurrencyRegistry::new(testing::eth()).with_token(testing::usdc());
        let sync = crate::channel::ChannelSync::new(client.clone(), f.store.clone(), currencies);
        assert_eq!(sync.poll_once().await.unwrap().len(), 1);

        assert_eq!(f.matcher.settle_channel_backlog(NODE).await.unwrap(), 0);
        assert_eq!(f.store.unsettled_channel_payments().await.unwrap().len(), 1);
        // The node offset already counts the event, so polling again brings nothing new
        assert!(sync.poll_once().await.unwrap().is_empty());

        f.store.insert_order(&order).await.unwrap();
        assert_eq!(f.matcher.settle_channel_backlog(NODE).await.unwrap(), 1);
        assert!(f.store.unsettled_channel_payments().await.unwrap().is_empty());
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Confirmed);
        assert_eq!(f.matcher.settle_channel_backlog(NODE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_internal_payment_requires_executed_transfer() {
        let f = fixture().await;
        let payer = Uuid::new_v4();
        let order = PaymentOrder::new(Uuid::new_v4(), testing::eth(), 5);
        f.store.insert_order(&order).await.unwrap();
        f.store
            .insert_route(&PaymentRoute::new(order.id, RouteDetails::Internal { payer }))
            .await
            .unwrap();

        let transfer = NewTransfer {
            sender: payer,
            target: TransferTarget::User(order.owner),
            amount: 5,
            currency: testing::eth(),
            memo: None,
            order_id: None,
        }
        .into_transfer();
        f.store.insert_transfer(&transfer).await.unwrap();

        assert!(f.matcher.on_internal_payment(order.id, transfer.id).await.is_err());

        let execution = TransferExecution {
            id: Uuid::new_v4(),
            transfer_id: transfer.id,
            rail: Rail::Internal,
            rail_identifier: transfer.id.to_string(),
            created_at: Utc::now(),
        };
        f.store
            .finalize_transfer(&Finalization::Executed(execution), &[], &[])
            .await
            .unwrap();

        assert!(f.matcher.on_internal_payment(order.id, transfer.id).await.unwrap().is_some());
        assert!(f.matcher.on_internal_payment(order.id, transfer.id).await.unwrap().is_none());
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_expired_routes_are_announced_once() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::eth(), 10).await;
        let mut rx = f.events.subscribe();

        assert!(f.matcher.expire_blockchain_routes(1, 100, 149).await.unwrap().is_empty());
        assert_eq!(f.matcher.expire_blockchain_routes(1, 149, 150).await.unwrap().len(), 1);
        assert!(f.matcher.expire_blockchain_routes(1, 150, 160).await.unwrap().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            GatewayEvent::RouteExpired {
                order_id: order.id,
                route_id: route.id
            }
        );

        set_head(&f.store, 150).await;
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().status, OrderStatus::Expired);
    }

    #[tokio::test]
    async fn test_rescan_finds_payments_in_stored_blocks() {
        let f = fixture().await;
        let (order, route) = order_with_route(&f.store, testing::eth(), 10).await;

        let block = testing::block(1, 101);
        let tx = testing::stored_transaction(&block, 0, &route.identifier(), 10);
        f.store.upsert_block(&block, &[tx]).await.unwrap();

        assert_eq!(f.matcher.rescan(1).await.unwrap(), 1);
        assert_eq!(f.matcher.rescan(1).await.unwrap(), 0);
        assert_eq!(f.matcher.order_status(order.id).await.unwrap().total_paid, 10);
    }
}
