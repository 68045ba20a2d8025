use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::SettlementStore;
use crate::channel::models::{ChannelInfo, ChannelPayment, PaymentDirection};
use crate::chain::models::{Block, Chain, RewindReport, Transaction};
use crate::error::{AppError, AppResult, RouteError};
use crate::ledger::{self, models::*};
use crate::payments::models::{
    BlockWindow, Payment, PaymentConfirmation, PaymentDetails, PaymentOrder, PaymentRoute, RouteDetails,
};
use crate::transfers::models::{
    FinalizeOutcome, Finalization, ReserveOutcome, Transfer, TransferFailure, TransferRecord,
};
use crate::wallet::GatewayAccount;

#[derive(Default)]
struct MemoryState {
    chains: HashMap<u64, Chain>,
    blocks: HashMap<(u64, String), Block>,
    transactions: HashMap<(u64, String), Transaction>,
    orders: HashMap<Uuid, PaymentOrder>,
    accounts: Vec<GatewayAccount>,
    routes: HashMap<Uuid, PaymentRoute>,
    payments: HashMap<Uuid, Payment>,
    /// keyed by payment id
    confirmations: HashMap<Uuid, PaymentConfirmation>,
    channels: HashMap<String, ChannelInfo>,
    channel_payments: HashMap<String, Vec<ChannelPayment>>,
    /// Rail identifiers of channel events that need no further matching
    settled_channel_payments: HashSet<String>,
    transfers: HashMap<Uuid, Transfer>,
    /// Reserved transfers with their execution claim deadline
    reservations: HashMap<Uuid, DateTime<Utc>>,
    finalizations: HashMap<Uuid, Finalization>,
    entries: Vec<LedgerEntry>,
}

impl MemoryState {
    fn balance(&self, owner: &BookOwner, currency: &Currency) -> Balance {
        ledger::balance_of(self.entries.iter().filter(|e| e.belongs_to(owner, currency)))
    }

    fn append(&mut self, entries: &[LedgerEntry]) {
        self.entries.extend_from_slice(entries);
    }

    fn account_is_free(&self, chain_id: u64, address: &str, window: &BlockWindow) -> bool {
        !self.routes.values().any(|route| match &route.details {
            RouteDetails::Blockchain {
                chain_id: route_chain,
                account,
                window: taken,
            } => *route_chain == chain_id && account == address && taken.overlaps(window),
            _ => false,
        })
    }
}

/// Store held entirely in process memory. Each operation holds the write guard for its
/// whole unit and validates before mutating, so a rejected unit leaves no trace.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    // ========== CHAIN OPERATIONS ==========

    async fn get_chain(&self, chain_id: u64) -> AppResult<Option<Chain>> {
        let state = self.state.read().await;
        Ok(state.chains.get(&chain_id).cloned())
    }

    async fn save_chain(&self, chain: &Chain) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.chains.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn upsert_block(&self, block: &Block, transactions: &[Transaction]) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let key = (block.chain_id, block.hash.clone());
        if state.blocks.contains_key(&key) {
            return Ok(false);
        }

        state.blocks.insert(key, block.clone());
        for tx in transactions {
            state
                .transactions
                .entry((tx.chain_id, tx.hash.clone()))
                .or_insert_with(|| tx.clone());
        }
        Ok(true)
    }

    async fn get_block(&self, chain_id: u64, number: u64) -> AppResult<Option<Block>> {
        let state = self.state.read().await;
        Ok(state
            .blocks
            .values()
            .find(|b| b.chain_id == chain_id && b.number == number)
            .cloned())
    }

    async fn block_numbers_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<u64>> {
        let state = self.state.read().await;
        let mut numbers: Vec<u64> = state
            .blocks
            .values()
            .filter(|b| b.chain_id == chain_id && b.number >= start && b.number <= end)
            .map(|b| b.number)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn latest_block_number(&self, chain_id: u64) -> AppResult<Option<u64>> {
        let state = self.state.read().await;
        Ok(state
            .blocks
            .values()
            .filter(|b| b.chain_id == chain_id)
            .map(|b| b.number)
            .max())
    }

    async fn get_transaction(&self, chain_id: u64, hash: &str) -> AppResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&(chain_id, hash.to_string())).cloned())
    }

    async fn transactions_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.block_number >= start && tx.block_number <= end)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.block_number, tx.index));
        Ok(txs)
    }

    async fn rewind_chain(&self, chain_id: u64, new_head: u64) -> AppResult<RewindReport> {
        let mut state = self.state.write().await;

        let mut removed_blocks: Vec<u64> = state
            .blocks
            .values()
            .filter(|b| b.chain_id == chain_id && b.number > new_head)
            .map(|b| b.number)
            .collect();
        removed_blocks.sort_unstable();
        state
            .blocks
            .retain(|_, b| !(b.chain_id == chain_id && b.number > new_head));

        let before = state.transactions.len();
        state
            .transactions
            .retain(|_, tx| !(tx.chain_id == chain_id && tx.block_number > new_head));
        let removed_transactions = before - state.transactions.len();

        let removed_payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| {
                matches!(
                    p.details,
                    PaymentDetails::Blockchain { chain_id: c, block_number, .. }
                        if c == chain_id && block_number > new_head
                )
            })
            .cloned()
            .collect();

        let mut reversals = Vec::new();
        for payment in &removed_payments {
            let mut references = vec![Reference::new(ReferenceKind::Payment, payment.id)];
            if let Some(confirmation) = state.confirmations.remove(&payment.id) {
                references.push(Reference::new(ReferenceKind::PaymentConfirmation, confirmation.id));
            }
            state.payments.remove(&payment.id);

            let originals: Vec<LedgerEntry> = state
                .entries
                .iter()
                .filter(|e| references.contains(&e.reference))
                .cloned()
                .collect();
            reversals.extend(ledger::reversal_of(
                &originals,
                Reference::new(ReferenceKind::PaymentReversal, payment.id),
            ));
        }
        state.append(&reversals);

        if let Some(chain) = state.chains.get_mut(&chain_id) {
            chain.head_number = chain.head_number.min(new_head);
        }

        Ok(RewindReport {
            chain_id,
            new_head,
            removed_blocks,
            removed_transactions,
            removed_payments,
            reversal_entries: reversals.len(),
        })
    }

    // ========== ORDER & ROUTE OPERATIONS ==========

    async fn insert_order(&self, order: &PaymentOrder) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<PaymentOrder>> {
        let state = self.state.read().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn gateway_accounts(&self, chain_id: u64) -> AppResult<Vec<GatewayAccount>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn claim_blockchain_route(
        &self,
        order_id: Uuid,
        chain_id: u64,
        window: BlockWindow,
        new_account: Option<&GatewayAccount>,
    ) -> AppResult<Option<PaymentRoute>> {
        let mut state = self.state.write().await;

        let address = match new_account {
            Some(account) => {
                if state.accounts.iter().any(|a| a.address == account.address) {
                    return Err(AppError::InvalidInput(format!(
                        "Account {} already exists",
                        account.address
                    )));
                }
                state.accounts.push(account.clone());
                account.address.clone()
            }
            None => {
                let free: Vec<String> = state
                    .accounts
                    .iter()
                    .filter(|a| a.chain_id == chain_id)
                    .filter(|a| state.account_is_free(chain_id, &a.address, &window))
                    .map(|a| a.address.clone())
                    .collect();
                match free.choose(&mut rand::rng()) {
                    Some(address) => address.clone(),
                    None => return Ok(None),
                }
            }
        };

        let route = PaymentRoute::new(
            order_id,
            RouteDetails::Blockchain {
                chain_id,
                account: address,
                window,
            },
        );
        state.routes.insert(route.id, route.clone());
        Ok(Some(route))
    }

    async fn insert_route(&self, route: &PaymentRoute) -> AppResult<()> {
        let mut state = self.state.write().await;

        if let RouteDetails::Channel { node, identifier, window } = &route.details {
            let collides = state.routes.values().any(|existing| match &existing.details {
                RouteDetails::Channel {
                    node: other_node,
                    identifier: other_id,
                    window: other_window,
                } => other_node == node && other_id == identifier && other_window.overlaps(window),
                _ => false,
            });
            if collides {
                return Err(RouteError::IdentifierCollision(identifier.to_string()).into());
            }
        }
        if let RouteDetails::Blockchain { chain_id, account, window } = &route.details {
            if !state.account_is_free(*chain_id, account, window) {
                return Err(RouteError::OverlappingWindow {
                    account: account.clone(),
                    start: window.start,
                    end: window.end,
                }
                .into());
            }
        }

        state.routes.insert(route.id, route.clone());
        Ok(())
    }

    async fn order_routes(&self, order_id: Uuid) -> AppResult<Vec<PaymentRoute>> {
        let state = self.state.read().await;
        let mut routes: Vec<PaymentRoute> = state
            .routes
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        routes.sort_by_key(|r| r.created_at);
        Ok(routes)
    }

    async fn find_blockchain_route(
        &self,
        chain_id: u64,
        account: &str,
        block_number: u64,
    ) -> AppResult<Option<PaymentRoute>> {
        let state = self.state.read().await;
        let account = account.to_lowercase();
        Ok(state
            .routes
            .values()
            .find(|r| match &r.details {
                RouteDetails::Blockchain {
                    chain_id: c,
                    account: a,
                    window,
                } => *c == chain_id && *a == account && window.contains(block_number),
                _ => false,
            })
            .cloned())
    }

    async fn find_channel_route(
        &self,
        node: &str,
        identifier: u64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<PaymentRoute>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .values()
            .find(|r| match &r.details {
                RouteDetails::Channel {
                    node: n,
                    identifier: i,
                    window,
                } => n == node && *i == identifier && window.contains(at),
                _ => false,
            })
            .cloned())
    }

    async fn find_internal_route(&self, order_id: Uuid, payer: Uuid) -> AppResult<Option<PaymentRoute>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .values()
            .find(|r| {
                r.order_id == order_id
                    && matches!(r.details, RouteDetails::Internal { payer: p } if p == payer)
            })
            .cloned())
    }

    async fn blockchain_routes_ending(&self, chain_id: u64, after: u64, up_to: u64) -> AppResult<Vec<PaymentRoute>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .values()
            .filter(|r| match &r.details {
                RouteDetails::Blockchain { chain_id: c, window, .. } => {
                    *c == chain_id && window.end > after && window.end <= up_to
                }
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn channel_routes_ending(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRoute>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .values()
            .filter(|r| match &r.details {
                RouteDetails::Channel { window, .. } => window.end > after && window.end <= up_to,
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn earliest_open_window_start(&self, chain_id: u64, head: u64) -> AppResult<Option<u64>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .values()
            .filter_map(|r| match &r.details {
                RouteDetails::Blockchain { chain_id: c, window, .. }
                    if *c == chain_id && !window.is_expired(head) =>
                {
                    Some(window.start)
                }
                _ => None,
            })
            .min())
    }

    // ========== PAYMENT OPERATIONS ==========

    async fn record_payment(
        &self,
        payment: &Payment,
        confirmation: Option<&PaymentConfirmation>,
        entries: &[LedgerEntry],
    ) -> AppResult<bool> {
        ledger::ensure_balanced(entries)?;
        let mut state = self.state.write().await;

        let duplicate = state.payments.values().any(|p| {
            p.rail_identifier == payment.rail_identifier && p.route_id == payment.route_id
        });
        if duplicate {
            return Ok(false);
        }

        state.payments.insert(payment.id, payment.clone());
        if let Some(confirmation) = confirmation {
            state.confirmations.insert(payment.id, confirmation.clone());
        }
        state.append(entries);
        Ok(true)
    }

    async fn confirm_payment(&self, confirmation: &PaymentConfirmation, entries: &[LedgerEntry]) -> AppResult<bool> {
        ledger::ensure_balanced(entries)?;
        let mut state = self.state.write().await;

        if !state.payments.contains_key(&confirmation.payment_id)
            || state.confirmations.contains_key(&confirmation.payment_id)
        {
            return Ok(false);
        }

        state
            .confirmations
            .insert(confirmation.payment_id, confirmation.clone());
        state.append(entries);
        Ok(true)
    }

    async fn unconfirmed_blockchain_payments(&self, chain_id: u64) -> AppResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut pending: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| !state.confirmations.contains_key(&p.id))
            .filter(|p| matches!(p.details, PaymentDetails::Blockchain { chain_id: c, .. } if c == chain_id))
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.block_number());
        Ok(pending)
    }

    async fn order_payments(&self, order_id: Uuid) -> AppResult<Vec<(Payment, Option<PaymentConfirmation>)>> {
        let state = self.state.read().await;
        let mut payments: Vec<(Payment, Option<PaymentConfirmation>)> = state
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .map(|p| (p.clone(), state.confirmations.get(&p.id).cloned()))
            .collect();
        payments.sort_by_key(|(p, _)| p.observed_at);
        Ok(payments)
    }

    // ========== CHANNEL OPERATIONS ==========

    async fn save_channel(&self, channel: &ChannelInfo) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .channels
            .insert(channel.channel_id.clone(), channel.clone());
        Ok(())
    }

    async fn channels(&self) -> AppResult<Vec<ChannelInfo>> {
        let state = self.state.read().await;
        let mut channels: Vec<ChannelInfo> = state.channels.values().cloned().collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Ok(channels)
    }

    async fn record_channel_payment(&self, payment: &ChannelPayment) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let events = state
            .channel_payments
            .entry(payment.channel_id.clone())
            .or_default();
        if events
            .iter()
            .any(|e| e.rail_identifier() == payment.rail_identifier())
        {
            return Ok(false);
        }
        events.push(payment.clone());
        if payment.direction != PaymentDirection::Received {
            state.settled_channel_payments.insert(payment.rail_identifier());
        }
        Ok(true)
    }

    async fn channel_payment_count(&self, channel_id: &str) -> AppResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .channel_payments
            .get(channel_id)
            .map_or(0, |events| events.len() as u64))
    }

    async fn unsettled_channel_payments(&self) -> AppResult<Vec<ChannelPayment>> {
        let state = self.state.read().await;
        let mut pending: Vec<ChannelPayment> = state
            .channel_payments
            .values()
            .flatten()
            .filter(|e| !state.settled_channel_payments.contains(&e.rail_identifier()))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.timestamp);
        Ok(pending)
    }

    async fn mark_channel_payment_settled(&self, rail_identifier: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.settled_channel_payments.insert(rail_identifier.to_string());
        Ok(())
    }

    // ========== TRANSFER OPERATIONS ==========

    async fn insert_transfer(&self, transfer: &Transfer) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> AppResult<Option<TransferRecord>> {
        let state = self.state.read().await;
        Ok(state.transfers.get(&transfer_id).map(|transfer| TransferRecord {
            transfer: transfer.clone(),
            reserved: state.reservations.contains_key(&transfer_id),
            claimed_until: state.reservations.get(&transfer_id).copied(),
            finalization: state.finalizations.get(&transfer_id).cloned(),
        }))
    }

    async fn scheduled_transfers(&self) -> AppResult<Vec<Transfer>> {
        let state = self.state.read().await;
        let mut scheduled: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| !state.finalizations.contains_key(&t.id))
            .cloned()
            .collect();
        scheduled.sort_by_key(|t| t.created_at);
        Ok(scheduled)
    }

    async fn reserve_transfer(
        &self,
        transfer: &Transfer,
        entries: &[LedgerEntry],
        insufficient: &TransferFailure,
        claim_until: DateTime<Utc>,
    ) -> AppResult<ReserveOutcome> {
        ledger::ensure_balanced(entries)?;
        let mut state = self.state.write().await;

        if !state.transfers.contains_key(&transfer.id) {
            return Err(AppError::NotFound(format!("Transfer {} not found", transfer.id)));
        }
        if let Some(finalization) = state.finalizations.get(&transfer.id) {
            return Ok(ReserveOutcome::AlreadyFinalized(finalization.status()));
        }
        if let Some(until) = state.reservations.get_mut(&transfer.id) {
            if *until > Utc::now() {
                return Ok(ReserveOutcome::Claimed { until: *until });
            }
            *until = claim_until;
            return Ok(ReserveOutcome::Reclaimed);
        }

        let available = state.balance(&BookOwner::User(transfer.sender), &transfer.currency);
        if available < transfer.amount as Balance {
            state
                .finalizations
                .insert(transfer.id, Finalization::Failed(insufficient.clone()));
            return Ok(ReserveOutcome::Insufficient { available });
        }

        state.reservations.insert(transfer.id, claim_until);
        state.append(entries);
        Ok(ReserveOutcome::Reserved)
    }

    async fn finalize_transfer(
        &self,
        finalization: &Finalization,
        entries: &[LedgerEntry],
        release: &[LedgerEntry],
    ) -> AppResult<FinalizeOutcome> {
        ledger::ensure_balanced(entries)?;
        ledger::ensure_balanced(release)?;
        let mut state = self.state.write().await;

        let transfer_id = finalization.transfer_id();
        if !state.transfers.contains_key(&transfer_id) {
            return Err(AppError::NotFound(format!("Transfer {} not found", transfer_id)));
        }
        if let Some(existing) = state.finalizations.get(&transfer_id) {
            return Ok(FinalizeOutcome::AlreadyFinalized(existing.status()));
        }
        let claimed = state
            .reservations
            .get(&transfer_id)
            .is_some_and(|until| *until > Utc::now());
        if claimed && matches!(finalization, Finalization::Canceled(_)) {
            return Ok(FinalizeOutcome::Claimed);
        }

        state.finalizations.insert(transfer_id, finalization.clone());
        state.append(entries);
        if state.reservations.contains_key(&transfer_id) {
            state.append(release);
        }
        Ok(FinalizeOutcome::Written)
    }

    // ========== LEDGER OPERATIONS ==========

    async fn append_entries(&self, entries: &[LedgerEntry]) -> AppResult<()> {
        ledger::ensure_balanced(entries)?;
        let mut state = self.state.write().await;
        state.append(entries);
        Ok(())
    }

    async fn book_entries(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.belongs_to(owner, currency))
            .cloned()
            .collect())
    }

    async fn balance(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Balance> {
        let state = self.state.read().await;
        Ok(state.balance(owner, currency))
    }

    async fn currency_net_total(&self, currency: &Currency) -> AppResult<Balance> {
        let state = self.state.read().await;
        Ok(ledger::balance_of(
            state.entries.iter().filter(|e| &e.currency == currency),
        ))
    }
}
