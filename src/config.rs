use serde::Deserialize;
use std::time::Duration;

use crate::chain::tokens::CurrencyRegistry;
use crate::chain::ChainSyncConfig;
use crate::execution::GasSettings;
use crate::ledger::models::Currency;
use crate::payments::RouterConfig;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,
    pub chain: ChainSettings,
    pub payment: PaymentSettings,
    pub transfer: TransferSettings,
    pub channel: Option<ChannelSettings>,
    pub tokens: Vec<TokenSettings>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainSettings {
    pub id: u64,
    pub rpc_url: String,
    pub start_block: u64,
    pub scan_range: u64,
    pub poll_interval_secs: u64,
    pub rpc_timeout_secs: u64,
    pub native_symbol: String,
    pub native_decimals: u8,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            start_block: 0,
            scan_range: 5000,
            poll_interval_secs: 10,
            rpc_timeout_secs: 30,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaymentSettings {
    pub minimum_confirmations: u64,
    /// Blocks
    pub blockchain_route_lifetime: u64,
    pub channel_route_lifetime_secs: i64,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            minimum_confirmations: 5,
            blockchain_route_lifetime: 100,
            channel_route_lifetime_secs: 900,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransferSettings {
    pub rail_timeout_secs: u64,
    pub gas_limit: u64,
    pub token_gas_limit: u64,
    pub poll_interval_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            rail_timeout_secs: 60,
            gas_limit: 21_000,
            token_gas_limit: 100_000,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    pub api_url: String,
    pub node_address: String,
    #[serde(default = "default_channel_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_channel_poll_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenSettings {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

impl Config {
    /// Defaults, then an optional `gateway.toml`, then `GATEWAY__SECTION__KEY` variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name("gateway").required(false))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if config.database_url.is_none() {
            config.database_url = std::env::var("DATABASE_URL").ok();
        }
        Ok(config)
    }

    pub fn native_currency(&self) -> Currency {
        Currency::native(self.chain.id, &self.chain.native_symbol, self.chain.native_decimals)
    }

    pub fn currencies(&self) -> CurrencyRegistry {
        self.tokens
            .iter()
            .fold(CurrencyRegistry::new(self.native_currency()), |registry, token| {
                registry.with_token(Currency::token(
                    self.chain.id,
                    &token.symbol,
                    &token.address,
                    token.decimals,
                ))
            })
    }

    pub fn chain_sync(&self) -> ChainSyncConfig {
        let mut sync = ChainSyncConfig::new(self.chain.id);
        sync.start_block = Some(self.chain.start_block);
        sync.scan_range = self.chain.scan_range.max(1);
        sync.poll_interval = Duration::from_secs(self.chain.poll_interval_secs.max(1));
        sync.rpc_timeout = Duration::from_secs(self.chain.rpc_timeout_secs.max(1));
        sync
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            blockchain_route_lifetime: self.payment.blockchain_route_lifetime,
            channel_route_lifetime: chrono::Duration::seconds(self.payment.channel_route_lifetime_secs),
            channel_node: self.channel.as_ref().map(|c| c.node_address.clone()),
        }
    }

    pub fn gas(&self) -> GasSettings {
        GasSettings {
            native_transfer: self.transfer.gas_limit,
            token_transfer: self.transfer.token_gas_limit,
        }
    }

    pub fn rail_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.rail_timeout_secs)
    }
}
