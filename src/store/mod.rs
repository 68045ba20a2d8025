pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channel::models::{ChannelInfo, ChannelPayment};
use crate::chain::models::{Block, Chain, RewindReport, Transaction};
use crate::error::AppResult;
use crate::ledger::models::{Balance, BookOwner, Currency, LedgerEntry};
use crate::payments::models::{BlockWindow, Payment, PaymentConfirmation, PaymentOrder, PaymentRoute};
use crate::transfers::models::{
    FinalizeOutcome, Finalization, ReserveOutcome, Transfer, TransferFailure, TransferRecord,
};
use crate::wallet::GatewayAccount;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence for every settlement record.
///
/// Each method is one atomic unit: either everything it describes is written or nothing is.
/// Ledger entries handed to a method must balance per currency; implementations reject
/// unbalanced batches before writing anything.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // ========== CHAIN OPERATIONS ==========

    async fn get_chain(&self, chain_id: u64) -> AppResult<Option<Chain>>;

    async fn save_chain(&self, chain: &Chain) -> AppResult<()>;

    /// Insert a block and its transactions keyed by (chain, hash). Returns false if already stored.
    async fn upsert_block(&self, block: &Block, transactions: &[Transaction]) -> AppResult<bool>;

    async fn get_block(&self, chain_id: u64, number: u64) -> AppResult<Option<Block>>;

    /// Stored block numbers within `[start, end]`
    async fn block_numbers_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<u64>>;

    async fn latest_block_number(&self, chain_id: u64) -> AppResult<Option<u64>>;

    async fn get_transaction(&self, chain_id: u64, hash: &str) -> AppResult<Option<Transaction>>;

    /// Stored transactions in blocks `[start, end]`, ordered by block and index
    async fn transactions_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<Transaction>>;

    /// Delete every block above `new_head` with its transactions, the payments they carried and
    /// their confirmations. Ledger entries of removed payments are offset by mirror entries.
    async fn rewind_chain(&self, chain_id: u64, new_head: u64) -> AppResult<RewindReport>;

    // ========== ORDER & ROUTE OPERATIONS ==========

    async fn insert_order(&self, order: &PaymentOrder) -> AppResult<()>;

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<PaymentOrder>>;

    async fn gateway_accounts(&self, chain_id: u64) -> AppResult<Vec<GatewayAccount>>;

    /// Find-then-claim a gateway account whose routes do not overlap `window`.
    /// With `new_account` the account is inserted and claimed in the same unit.
    /// Returns None when every existing account overlaps.
    async fn claim_blockchain_route(
        &self,
        order_id: Uuid,
        chain_id: u64,
        window: BlockWindow,
        new_account: Option<&GatewayAccount>,
    ) -> AppResult<Option<PaymentRoute>>;

    /// Insert a channel or internal route, rejecting identifier collisions
    async fn insert_route(&self, route: &PaymentRoute) -> AppResult<()>;

    async fn order_routes(&self, order_id: Uuid) -> AppResult<Vec<PaymentRoute>>;

    /// Blockchain route on `account` whose window contains `block_number`
    async fn find_blockchain_route(
        &self,
        chain_id: u64,
        account: &str,
        block_number: u64,
    ) -> AppResult<Option<PaymentRoute>>;

    /// Channel route for `identifier` whose window contains `at`
    async fn find_channel_route(
        &self,
        node: &str,
        identifier: u64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<PaymentRoute>>;

    async fn find_internal_route(&self, order_id: Uuid, payer: Uuid) -> AppResult<Option<PaymentRoute>>;

    /// Blockchain routes whose window end lies in `(after, up_to]`
    async fn blockchain_routes_ending(&self, chain_id: u64, after: u64, up_to: u64) -> AppResult<Vec<PaymentRoute>>;

    /// Channel routes whose window end lies in `(after, up_to]`
    async fn channel_routes_ending(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRoute>>;

    /// Lowest window start among blockchain routes not yet expired at `head`
    async fn earliest_open_window_start(&self, chain_id: u64, head: u64) -> AppResult<Option<u64>>;

    // ========== PAYMENT OPERATIONS ==========

    /// Create a payment, optionally confirmed, with its ledger entries.
    /// Returns false when a payment with the same (rail identifier, route) exists.
    async fn record_payment(
        &self,
        payment: &Payment,
        confirmation: Option<&PaymentConfirmation>,
        entries: &[LedgerEntry],
    ) -> AppResult<bool>;

    /// Returns false when the payment is gone or already confirmed
    async fn confirm_payment(&self, confirmation: &PaymentConfirmation, entries: &[LedgerEntry]) -> AppResult<bool>;

    async fn unconfirmed_blockchain_payments(&self, chain_id: u64) -> AppResult<Vec<Payment>>;

    async fn order_payments(&self, order_id: Uuid) -> AppResult<Vec<(Payment, Option<PaymentConfirmation>)>>;

    // ========== CHANNEL OPERATIONS ==========

    async fn save_channel(&self, channel: &ChannelInfo) -> AppResult<()>;

    async fn channels(&self) -> AppResult<Vec<ChannelInfo>>;

    /// Returns false when the event was already recorded. Received events start unsettled.
    async fn record_channel_payment(&self, payment: &ChannelPayment) -> AppResult<bool>;

    async fn channel_payment_count(&self, channel_id: &str) -> AppResult<u64>;

    /// Received events the matcher has not handled yet, oldest first
    async fn unsettled_channel_payments(&self) -> AppResult<Vec<ChannelPayment>>;

    async fn mark_channel_payment_settled(&self, rail_identifier: &str) -> AppResult<()>;

    // ========== TRANSFER OPERATIONS ==========

    async fn insert_transfer(&self, transfer: &Transfer) -> AppResult<()>;

    async fn get_transfer(&self, transfer_id: Uuid) -> AppResult<Option<TransferRecord>>;

    /// Transfers without a terminal marker, oldest first
    async fn scheduled_transfers(&self) -> AppResult<Vec<Transfer>>;

    /// Check for a terminal marker, check for a prior reservation and its claim, check the
    /// sender's balance, then either write the reservation entries with an execution claim
    /// valid until `claim_until`, or the failure marker.
    async fn reserve_transfer(
        &self,
        transfer: &Transfer,
        entries: &[LedgerEntry],
        insufficient: &TransferFailure,
        claim_until: DateTime<Utc>,
    ) -> AppResult<ReserveOutcome>;

    /// Write the terminal marker with its entries. `release` is applied only when a
    /// reservation exists. A cancellation is refused while an execution claim is live.
    async fn finalize_transfer(
        &self,
        finalization: &Finalization,
        entries: &[LedgerEntry],
        release: &[LedgerEntry],
    ) -> AppResult<FinalizeOutcome>;

    // ========== LEDGER OPERATIONS ==========

    async fn append_entries(&self, entries: &[LedgerEntry]) -> AppResult<()>;

    async fn book_entries(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Vec<LedgerEntry>>;

    async fn balance(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Balance>;

    /// Sum of every book's balance in `currency`
    async fn currency_net_total(&self, currency: &Currency) -> AppResult<Balance>;
}
