use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::models::*;
use crate::error::{AppError, AppResult, RouteError};
use crate::store::SettlementStore;
use crate::wallet::{AccountProvisioner, UserDirectory};

/// Largest identifier a channel payment can carry without losing precision in JSON clients
const MAX_CHANNEL_IDENTIFIER: u64 = (1 << 53) - 1;
const IDENTIFIER_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Blocks a blockchain route stays open
    pub blockchain_route_lifetime: u64,
    pub channel_route_lifetime: ChronoDuration,
    /// Address of the channel node, when one is configured
    pub channel_node: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            blockchain_route_lifetime: 100,
            channel_route_lifetime: ChronoDuration::seconds(900),
            channel_node: None,
        }
    }
}

/// Opens payment routes for orders on every rail that can currently receive
pub struct PaymentRouter {
    store: Arc<dyn SettlementStore>,
    provisioner: Arc<dyn AccountProvisioner>,
    directory: Arc<dyn UserDirectory>,
    config: RouterConfig,
}

impl PaymentRouter {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        provisioner: Arc<dyn AccountProvisioner>,
        directory: Arc<dyn UserDirectory>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            provisioner,
            directory,
            config,
        }
    }

    /// Store a new order and open its routes
    pub async fn open_order(&self, order: PaymentOrder) -> AppResult<(PaymentOrder, Vec<PaymentRoute>)> {
        if order.amount_due == 0 {
            return Err(AppError::InvalidInput("Order amount must be positive".into()));
        }
        self.store.insert_order(&order).await?;
        let routes = self.allocate_routes(&order).await?;
        Ok((order, routes))
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, currency = %order.currency.code()))]
    pub async fn allocate_routes(&self, order: &PaymentOrder) -> AppResult<Vec<PaymentRoute>> {
        let mut routes = Vec::new();

        if let Some(route) = self.blockchain_route(order).await? {
            routes.push(route);
        }
        if let Some(route) = self.channel_route(order).await? {
            routes.push(route);
        }
        if let Some(route) = self.internal_route(order).await? {
            routes.push(route);
        }

        info!("Opened {} routes for order {}", routes.len(), order.id);
        Ok(routes)
    }

    async fn blockchain_route(&self, order: &PaymentOrder) -> AppResult<Option<PaymentRoute>> {
        let chain_id = order.currency.chain_id;
        let chain = match self.store.get_chain(chain_id).await? {
            Some(chain) if chain.is_ready() => chain,
            _ => {
                warn!("{}", RouteError::ChainNotSynced(chain_id));
                return Ok(None);
            }
        };

        let window = BlockWindow::new(chain.head_number, self.config.blockchain_route_lifetime);

        if let Some(route) = self
            .store
            .claim_blockchain_route(order.id, chain_id, window, None)
            .await?
        {
            return Ok(Some(route));
        }

        // Every account is busy for this window
        let account = self.provisioner.provision(chain_id).await?;
        debug!("Provisioned gateway account {} on chain {}", account.address, chain_id);
        self.store
            .claim_blockchain_route(order.id, chain_id, window, Some(&account))
            .await
    }

    async fn channel_route(&self, order: &PaymentOrder) -> AppResult<Option<PaymentRoute>> {
        let Some(node) = self.config.channel_node.as_deref() else {
            return Ok(None);
        };
        let Some(token) = order.currency.address.as_deref() else {
            return Ok(None);
        };

        let channels = self.store.channels().await?;
        let reachable = channels
            .iter()
            .any(|c| c.is_open() && c.chain_id == order.currency.chain_id && c.token_address == token);
        if !reachable {
            return Ok(None);
        }

        let start = Utc::now();
        let window = TimeWindow {
            start,
            end: start + self.config.channel_route_lifetime,
        };

        for _ in 0..IDENTIFIER_ATTEMPTS {
            let identifier = rand::rng().random_range(1..=MAX_CHANNEL_IDENTIFIER);
            let route = PaymentRoute::new(
                order.id,
                RouteDetails::Channel {
                    node: node.to_lowercase(),
                    identifier,
                    window,
                },
            );
            match self.store.insert_route(&route).await {
                Ok(()) => return Ok(Some(route)),
                Err(AppError::Route(RouteError::IdentifierCollision(_))) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(RouteError::IdentifierCollision(format!(
            "No free channel identifier after {} attempts",
            IDENTIFIER_ATTEMPTS
        ))
        .into())
    }

    async fn internal_route(&self, order: &PaymentOrder) -> AppResult<Option<PaymentRoute>> {
        let Some(reference) = order.payer_ref.as_deref() else {
            return Ok(None);
        };
        let Some(payer) = self.directory.resolve(reference).await? else {
            debug!("Payer {} is not a known user", reference);
            return Ok(None);
        };
        if payer == order.owner {
            return Ok(None);
        }

        let route = PaymentRoute::new(order.id, RouteDetails::Internal { payer });
        self.store.insert_route(&route).await?;
        Ok(Some(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::models::Chain;
    use crate::channel::models::{ChannelInfo, ChannelState};
    use crate::store::MemoryStore;
    use crate::testing;
    use crate::wallet::{InMemoryUserDirectory, KeyPairProvisioner};
    use std::collections::HashSet;
    use uuid::Uuid;

    const NODE: &str = "0x00000000000000000000000000000000000000ee";

    async fn setup(synced: bool) -> (PaymentRouter, Arc<MemoryStore>, Arc<InMemoryUserDirectory>) {
        let store = Arc::new(MemoryStore::new());
        let mut chain = Chain::new(1, "mock://node");
        chain.head_number = 100;
        chain.online = true;
        chain.synced = synced;
        store.save_chain(&chain).await.unwrap();

        let directory = Arc::new(InMemoryUserDirectory::new());
        let config = RouterConfig {
            channel_node: Some(NODE.into()),
            ..RouterConfig::default()
        };
        let router = PaymentRouter::new(store.clone(), Arc::new(KeyPairProvisioner), directory.clone(), config);
        (router, store, directory)
    }

    fn blockchain_parts(route: &PaymentRoute) -> (String, BlockWindow) {
        match &route.details {
            RouteDetails::Blockchain { account, window, .. } => (account.clone(), *window),
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_orders_get_distinct_accounts() {
        let (router, store, _) = setup(true).await;

        let first = PaymentOrder::new(Uuid::new_v4(), testing::eth(), 1_000);
        let second = PaymentOrder::new(Uuid::new_v4(), testing::eth(), 2_000);
        let (_, a) = router.open_order(first).await.unwrap();
        let (_, b) = router.open_order(second).await.unwrap();

        let (account_a, window_a) = blockchain_parts(&a[0]);
        let (account_b, window_b) = blockchain_parts(&b[0]);
        assert_eq!(window_a, BlockWindow { start: 100, end: 200 });
        assert_eq!(window_b, window_a);
        assert_ne!(account_a, account_b);
        assert_eq!(store.gateway_accounts(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_account_is_reused_after_window_ends() {
        let (router, store, _) = setup(true).await;
        router
            .open_order(PaymentOrder::new(Uuid::new_v4(), testing::eth(), 1))
            .await
            .unwrap();

        let mut chain = store.get_chain(1).await.unwrap().unwrap();
        chain.head_number = 200;
        store.save_chain(&chain).await.unwrap();

        let (_, routes) = router
            .open_order(PaymentOrder::new(Uuid::new_v4(), testing::eth(), 1))
            .await
            .unwrap();
        assert_eq!(blockchain_parts(&routes[0]).1.start, 200);
        assert_eq!(store.gateway_accounts(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsynced_chain_gets_no_blockchain_route() {
        let (router, _, _) = setup(false).await;
        let (_, routes) = router
            .open_order(PaymentOrder::new(Uuid::new_v4(), testing::eth(), 1))
            .await
            .unwrap();
        assert!(routes.iter().all(|r| r.kind() != RouteKind::Blockchain));
    }

    #[tokio::test]
    async fn test_channel_and_internal_routes() {
        let (router, store, directory) = setup(true).await;
        store
            .save_channel(&ChannelInfo {
                channel_id: "7".into(),
                chain_id: 1,
                token_address: testing::TOKEN.into(),
                partner_address: "0xpartner".into(),
                balance: 0,
                total_deposit: 0,
                state: ChannelState::Opened,
            })
            .await
            .unwrap();
        let payer = Uuid::new_v4();
        directory.register("alice", payer).await;

        let order = PaymentOrder::new(Uuid::new_v4(), testing::usdc(), 500).with_payer("alice");
        let (_, routes) = router.open_order(order).await.unwrap();

        let kinds: HashSet<RouteKind> = routes.iter().map(|r| r.kind()).collect();
        assert_eq!(kinds.len(), 3);

        let channel = routes.iter().find(|r| r.kind() == RouteKind::Channel).unwrap();
        match &channel.details {
            RouteDetails::Channel { node, identifier, window } => {
                assert_eq!(node, NODE);
                assert!((1..=MAX_CHANNEL_IDENTIFIER).contains(identifier));
                assert!(window.end > window.start);
            }
            _ => unreachable!(),
        }

        let internal = routes.iter().find(|r| r.kind() == RouteKind::Internal).unwrap();
        assert_eq!(internal.identifier(), payer.to_string());
    }

    #[tokio::test]
    async fn test_native_currency_has_no_channel_route() {
        let (router, _, directory) = setup(true).await;
        directory.register("bob", Uuid::new_v4()).await;

        let order = PaymentOrder::new(Uuid::new_v4(), testing::eth(), 5).with_payer("nobody");
        let (_, routes) = router.open_order(order).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].kind(), RouteKind::Blockchain);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (router, _, _) = setup(true).await;
        let order = PaymentOrder::new(Uuid::new_v4(), testing::eth(), 0);
        assert!(matches!(router.open_order(order).await, Err(AppError::InvalidInput(_))));
    }
}
