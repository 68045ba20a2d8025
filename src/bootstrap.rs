use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    chain::{rpc::JsonRpcClient, ChainSync, ClientRegistry},
    channel::{ChannelClient, ChannelSync, RestChannelClient},
    config::Config,
    error::AppResult,
    events::EventBus,
    execution::{BlockchainExecutor, ChannelExecutor, ExecutorRouter, InternalExecutor},
    ledger::Ledger,
    payments::PaymentRouter,
    settlement::{SettlementMatcher, SettlementScheduler},
    store::{MemoryStore, PgStore, SettlementStore},
    transfers::TransferEngine,
    wallet::{InMemoryUserDirectory, KeyPairProvisioner, UserDirectory},
};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Everything the gateway runs on, wired once at startup
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    pub events: EventBus,
    pub ledger: Arc<Ledger>,
    pub directory: Arc<dyn UserDirectory>,
    pub payment_router: Arc<PaymentRouter>,
    pub matcher: Arc<SettlementMatcher>,
    pub transfer_engine: Arc<TransferEngine>,
    pub channel_sync: Option<Arc<ChannelSync>>,
    scheduler: SettlementScheduler,
}

impl AppState {
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        self.scheduler.start()
    }
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing gateway components ...");

    let store: Arc<dyn SettlementStore> = match &config.database_url {
        Some(url) => Arc::new(PgStore::new(initialize_database(url).await?)),
        None => {
            error!("⚠️  DATABASE_URL not set - using in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let events = EventBus::new();
    let ledger = Arc::new(Ledger::new(store.clone()));
    let directory: Arc<dyn UserDirectory> = Arc::new(InMemoryUserDirectory::new());
    let currencies = config.currencies();

    // Chain client
    let mut clients = ClientRegistry::new();
    clients.register(
        config.chain.id,
        Arc::new(JsonRpcClient::new(&config.chain.rpc_url, config.chain_sync().rpc_timeout)?),
    );
    let rpc = clients.get(config.chain.id)?;
    info!("✅ Chain {} client registered ({})", config.chain.id, config.chain.rpc_url);

    let chain_sync = Arc::new(ChainSync::new(
        config.chain_sync(),
        rpc.clone(),
        store.clone(),
        events.clone(),
    ));

    let payment_router = Arc::new(PaymentRouter::new(
        store.clone(),
        Arc::new(KeyPairProvisioner),
        directory.clone(),
        config.router(),
    ));

    let matcher = Arc::new(SettlementMatcher::new(
        store.clone(),
        events.clone(),
        vec![currencies.clone()],
        config.payment.minimum_confirmations,
    ));
    info!(
        "✅ Settlement matcher ready ({} confirmations required)",
        config.payment.minimum_confirmations
    );

    info!("⚙️  Initializing transfer rails...");
    let mut executors = ExecutorRouter::new();
    executors.register(Arc::new(InternalExecutor::new(directory.clone())));

    let channel_client: Option<Arc<dyn ChannelClient>> = match &config.channel {
        Some(settings) => {
            let client = RestChannelClient::new(
                &settings.api_url,
                &settings.node_address,
                config.chain.id,
                config.chain_sync().rpc_timeout,
            )?;
            Some(Arc::new(client))
        }
        None => {
            error!("⚠️  Channel node not configured - channel rail disabled");
            None
        }
    };
    if let Some(client) = &channel_client {
        executors.register(Arc::new(ChannelExecutor::new(client.clone())));
    }

    executors.register(Arc::new(BlockchainExecutor::new(
        rpc,
        store.clone(),
        config.native_currency(),
        config.gas(),
    )));
    let executors = Arc::new(executors);
    info!("🔗 Transfer rails in priority order: {:?}", executors.rails());

    let transfer_engine = Arc::new(
        TransferEngine::new(
            store.clone(),
            executors,
            directory.clone(),
            events.clone(),
            config.rail_timeout(),
        )
        .with_settlement(matcher.clone()),
    );

    let channel_sync = channel_client
        .map(|client| Arc::new(ChannelSync::new(client, store.clone(), currencies)));

    let mut scheduler = SettlementScheduler::new(matcher.clone(), EXPIRY_SWEEP_INTERVAL)
        .with_chain(chain_sync)
        .with_transfers(
            transfer_engine.clone(),
            Duration::from_secs(config.transfer.poll_interval_secs.max(1)),
        );
    if let (Some(sync), Some(settings)) = (&channel_sync, &config.channel) {
        scheduler = scheduler.with_channel(sync.clone(), Duration::from_secs(settings.poll_interval_secs.max(1)));
    }

    Ok(AppState {
        store,
        events,
        ledger,
        directory,
        payment_router,
        matcher,
        transfer_engine,
        channel_sync,
        scheduler,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
