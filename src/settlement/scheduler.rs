use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use super::matcher::SettlementMatcher;
use crate::chain::models::ChainUpdate;
use crate::chain::ChainSync;
use crate::channel::ChannelSync;
use crate::transfers::TransferEngine;

const UPDATE_BUFFER: usize = 1024;

/// Owns the background tasks that feed rail activity into the matcher
pub struct SettlementScheduler {
    matcher: Arc<SettlementMatcher>,
    chains: Vec<Arc<ChainSync>>,
    channel: Option<(Arc<ChannelSync>, Duration)>,
    transfers: Option<(Arc<TransferEngine>, Duration)>,
    expiry_interval: Duration,
}

impl SettlementScheduler {
    pub fn new(matcher: Arc<SettlementMatcher>, expiry_interval: Duration) -> Self {
        Self {
            matcher,
            chains: Vec::new(),
            channel: None,
            transfers: None,
            expiry_interval,
        }
    }

    pub fn with_chain(mut self, sync: Arc<ChainSync>) -> Self {
        self.chains.push(sync);
        self
    }

    pub fn with_channel(mut self, sync: Arc<ChannelSync>, poll_interval: Duration) -> Self {
        self.channel = Some((sync, poll_interval));
        self
    }

    pub fn with_transfers(mut self, engine: Arc<TransferEngine>, poll_interval: Duration) -> Self {
        self.transfers = Some((engine, poll_interval));
        self
    }

    /// Start every loop (runs in background)
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let chain_ids = self.chains.iter().map(|c| c.chain_id()).collect();
        handles.push(Self::run_settlement(self.matcher.clone(), chain_ids, rx));
        for sync in &self.chains {
            info!("⛓️  Starting sync of chain {}", sync.chain_id());
            handles.push(sync.clone().start(tx.clone()));
        }

        if let Some((sync, every)) = &self.channel {
            info!("⚡ Starting channel poller for node {}", sync.node_address());
            handles.push(Self::run_channel_poller(self.matcher.clone(), sync.clone(), *every));
        }

        if let Some((engine, every)) = &self.transfers {
            info!("💸 Starting transfer worker");
            handles.push(engine.clone().start(*every));
        }

        handles.push(Self::run_expiry_sweep(self.matcher.clone(), self.expiry_interval));
        handles
    }

    /// Rescan at startup, then apply chain updates strictly in the order they arrive
    fn run_settlement(
        matcher: Arc<SettlementMatcher>,
        chain_ids: Vec<u64>,
        mut updates: mpsc::Receiver<ChainUpdate>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            for chain_id in chain_ids {
                if let Err(e) = matcher.rescan(chain_id).await {
                    error!("❌ Startup rescan of chain {} failed: {}", chain_id, e);
                }
            }

            while let Some(update) = updates.recv().await {
                if let Err(e) = matcher.handle_update(update).await {
                    error!("❌ Failed to apply chain update: {}", e);
                }
            }
            warn!("All chain syncs stopped, settlement task exiting");
        })
    }

    fn run_channel_poller(
        matcher: Arc<SettlementMatcher>,
        sync: Arc<ChannelSync>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;

                if let Err(e) = sync.poll_once().await {
                    warn!("Channel node poll failed: {}", e);
                }
                // Recorded events are matched from the store, including earlier failures
                if let Err(e) = matcher.settle_channel_backlog(sync.node_address()).await {
                    error!("❌ Channel backlog pass failed: {}", e);
                }
            }
        })
    }

    /// Channel routes expire on wall-clock time, so they need their own sweep
    fn run_expiry_sweep(matcher: Arc<SettlementMatcher>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            let mut last = Utc::now();
            loop {
                ticker.tick().await;
                let now = Utc::now();
                match matcher.expire_channel_routes(last, now).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!("🗑️  Expired {} channel routes", expired.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Channel route sweep failed: {}", e),
                }
                last = now;
            }
        })
    }
}
