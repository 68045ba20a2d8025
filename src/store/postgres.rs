use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use super::SettlementStore;
use crate::channel::models::{ChannelInfo, ChannelPayment, ChannelState, PaymentDirection};
use crate::chain::models::{Block, Chain, RewindReport, Transaction as ChainTransaction};
use crate::error::{AppError, AppResult, RouteError};
use crate::ledger::{self, models::*};
use crate::payments::models::{
    BlockWindow, Payment, PaymentConfirmation, PaymentDetails, PaymentOrder, PaymentRoute, RouteDetails,
    TimeWindow,
};
use crate::transfers::models::{
    FinalizeOutcome, Finalization, Rail, ReserveOutcome, Transfer, TransferCancellation, TransferExecution,
    TransferFailure, TransferRecord, TransferStatus, TransferTarget,
};
use crate::wallet::GatewayAccount;

/// Postgres-backed store. Each trait method runs in a single SQL transaction.
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

// ========== CONVERSIONS ==========

fn to_numeric(value: u128) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("Numeric conversion failed: {}", e)))
}

fn from_numeric(value: &BigDecimal) -> AppResult<u128> {
    value
        .with_scale(0)
        .to_string()
        .parse::<u128>()
        .map_err(|e| AppError::Internal(format!("Stored amount {} out of range: {}", value, e)))
}

fn from_signed_numeric(value: &BigDecimal) -> AppResult<Balance> {
    value
        .with_scale(0)
        .to_string()
        .parse::<i128>()
        .map_err(|e| AppError::Internal(format!("Stored balance {} out of range: {}", value, e)))
}

fn currency_from_row(row: &PgRow) -> AppResult<Currency> {
    let decimals: i16 = row.try_get("currency_decimals")?;
    Ok(Currency {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        symbol: row.try_get("currency_symbol")?,
        address: row.try_get("currency_address")?,
        decimals: decimals as u8,
    })
}

fn chain_from_row(row: &PgRow) -> AppResult<Chain> {
    Ok(Chain {
        id: row.try_get::<i64, _>("id")? as u64,
        provider_endpoint: row.try_get("provider_endpoint")?,
        head_number: row.try_get::<i64, _>("head_number")? as u64,
        synced: row.try_get("synced")?,
        online: row.try_get("online")?,
    })
}

fn block_from_row(row: &PgRow) -> AppResult<Block> {
    Ok(Block {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        hash: row.try_get("hash")?,
        number: row.try_get::<i64, _>("number")? as u64,
        parent_hash: row.try_get("parent_hash")?,
        timestamp: row.try_get("timestamp")?,
        uncle_hashes: row.try_get("uncle_hashes")?,
    })
}

fn transaction_from_row(row: &PgRow) -> AppResult<ChainTransaction> {
    Ok(ChainTransaction {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        hash: row.try_get("hash")?,
        block_hash: row.try_get("block_hash")?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        index: row.try_get::<i64, _>("tx_index")? as u64,
        from_address: row.try_get("from_address")?,
        to_address: row.try_get("to_address")?,
        gas_used: from_numeric(&row.try_get("gas_used")?)?,
        gas_price: from_numeric(&row.try_get("gas_price")?)?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        value: from_numeric(&row.try_get("value")?)?,
        data: row.try_get("data")?,
    })
}

fn order_from_row(row: &PgRow) -> AppResult<PaymentOrder> {
    Ok(PaymentOrder {
        id: row.try_get("id")?,
        currency: currency_from_row(row)?,
        amount_due: from_numeric(&row.try_get("amount_due")?)?,
        owner: row.try_get("owner_id")?,
        payer_ref: row.try_get("payer_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn account_from_row(row: &PgRow) -> AppResult<GatewayAccount> {
    Ok(GatewayAccount {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        address: row.try_get("address")?,
        public_key: row.try_get("public_key")?,
        secret_key: row.try_get("secret_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn route_from_row(row: &PgRow) -> AppResult<PaymentRoute> {
    let kind: String = row.try_get("kind")?;
    let missing = |field: &str| AppError::Internal(format!("Route column {} is null", field));

    let details = match kind.as_str() {
        "internal" => RouteDetails::Internal {
            payer: row.try_get::<Option<Uuid>, _>("payer")?.ok_or_else(|| missing("payer"))?,
        },
        "blockchain" => RouteDetails::Blockchain {
            chain_id: row
                .try_get::<Option<i64>, _>("chain_id")?
                .ok_or_else(|| missing("chain_id"))? as u64,
            account: row
                .try_get::<Option<String>, _>("account")?
                .ok_or_else(|| missing("account"))?,
            window: BlockWindow {
                start: row
                    .try_get::<Option<i64>, _>("block_start")?
                    .ok_or_else(|| missing("block_start"))? as u64,
                end: row
                    .try_get::<Option<i64>, _>("block_end")?
                    .ok_or_else(|| missing("block_end"))? as u64,
            },
        },
        "channel" => RouteDetails::Channel {
            node: row.try_get::<Option<String>, _>("node")?.ok_or_else(|| missing("node"))?,
            identifier: row
                .try_get::<Option<i64>, _>("identifier")?
                .ok_or_else(|| missing("identifier"))? as u64,
            window: TimeWindow {
                start: row
                    .try_get::<Option<DateTime<Utc>>, _>("time_start")?
                    .ok_or_else(|| missing("time_start"))?,
                end: row
                    .try_get::<Option<DateTime<Utc>>, _>("time_end")?
                    .ok_or_else(|| missing("time_end"))?,
            },
        },
        other => return Err(AppError::Internal(format!("Unknown route kind {}", other))),
    };

    Ok(PaymentRoute {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        details,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> AppResult<Payment> {
    let kind: String = row.try_get("kind")?;
    let missing = |field: &str| AppError::Internal(format!("Payment column {} is null", field));

    let details = match kind.as_str() {
        "blockchain" => PaymentDetails::Blockchain {
            chain_id: row.try_get::<i64, _>("chain_id")? as u64,
            tx_hash: row.try_get::<Option<String>, _>("tx_hash")?.ok_or_else(|| missing("tx_hash"))?,
            block_hash: row
                .try_get::<Option<String>, _>("block_hash")?
                .ok_or_else(|| missing("block_hash"))?,
            block_number: row
                .try_get::<Option<i64>, _>("block_number")?
                .ok_or_else(|| missing("block_number"))? as u64,
            sender: row.try_get::<Option<String>, _>("sender")?.ok_or_else(|| missing("sender"))?,
        },
        "channel" => PaymentDetails::Channel {
            node: row.try_get::<Option<String>, _>("node")?.ok_or_else(|| missing("node"))?,
            sender: row.try_get::<Option<String>, _>("sender")?.ok_or_else(|| missing("sender"))?,
            identifier: row
                .try_get::<Option<i64>, _>("identifier")?
                .ok_or_else(|| missing("identifier"))? as u64,
        },
        "internal" => PaymentDetails::Internal {
            payer: row.try_get::<Option<Uuid>, _>("payer")?.ok_or_else(|| missing("payer"))?,
            transfer_id: row
                .try_get::<Option<Uuid>, _>("transfer_id")?
                .ok_or_else(|| missing("transfer_id"))?,
        },
        other => return Err(AppError::Internal(format!("Unknown payment kind {}", other))),
    };

    Ok(Payment {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        route_id: row.try_get("route_id")?,
        amount: from_numeric(&row.try_get("amount")?)?,
        currency: currency_from_row(row)?,
        rail_identifier: row.try_get("rail_identifier")?,
        observed_at: row.try_get("observed_at")?,
        details,
    })
}

fn channel_from_row(row: &PgRow) -> AppResult<ChannelInfo> {
    let state: String = row.try_get("state")?;
    Ok(ChannelInfo {
        channel_id: row.try_get("channel_id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        token_address: row.try_get("token_address")?,
        partner_address: row.try_get("partner_address")?,
        balance: from_numeric(&row.try_get("balance")?)?,
        total_deposit: from_numeric(&row.try_get("total_deposit")?)?,
        state: match state.as_str() {
            "opened" => ChannelState::Opened,
            "closed" => ChannelState::Closed,
            _ => ChannelState::Settled,
        },
    })
}

fn channel_payment_from_row(row: &PgRow) -> AppResult<ChannelPayment> {
    let direction: String = row.try_get("direction")?;
    let direction = match direction.as_str() {
        "received" => PaymentDirection::Received,
        "sent" => PaymentDirection::Sent,
        other => return Err(AppError::Internal(format!("Unknown channel payment direction {}", other))),
    };
    Ok(ChannelPayment {
        channel_id: row.try_get("channel_id")?,
        token_address: row.try_get("token_address")?,
        direction,
        counterparty: row.try_get("counterparty")?,
        amount: from_numeric(&row.try_get("amount")?)?,
        identifier: row.try_get::<i64, _>("identifier")? as u64,
        timestamp: row.try_get("timestamp")?,
    })
}

fn channel_state_str(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Opened => "opened",
        ChannelState::Closed => "closed",
        ChannelState::Settled => "settled",
    }
}

fn transfer_from_row(row: &PgRow) -> AppResult<Transfer> {
    let target_kind: String = row.try_get("target_kind")?;
    let target_value: String = row.try_get("target_value")?;
    let target = match target_kind.as_str() {
        "user" => TransferTarget::User(
            Uuid::parse_str(&target_value)
                .map_err(|e| AppError::Internal(format!("Bad transfer target: {}", e)))?,
        ),
        _ => TransferTarget::Address(target_value),
    };

    Ok(Transfer {
        id: row.try_get("id")?,
        sender: row.try_get("sender")?,
        target,
        amount: from_numeric(&row.try_get("amount")?)?,
        currency: currency_from_row(row)?,
        memo: row.try_get("memo")?,
        order_id: row.try_get("order_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn finalization_from_row(row: &PgRow) -> AppResult<Finalization> {
    let status: String = row.try_get("status")?;
    let transfer_id: Uuid = row.try_get("transfer_id")?;
    let id: Uuid = row.try_get("marker_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    let finalization = match status.as_str() {
        "executed" => {
            let rail: Option<String> = row.try_get("rail")?;
            let rail = rail
                .as_deref()
                .and_then(Rail::parse)
                .ok_or_else(|| AppError::Internal(format!("Execution {} without rail", id)))?;
            Finalization::Executed(TransferExecution {
                id,
                transfer_id,
                rail,
                rail_identifier: row.try_get::<Option<String>, _>("rail_identifier")?.unwrap_or_default(),
                created_at,
            })
        }
        "failed" => Finalization::Failed(TransferFailure {
            id,
            transfer_id,
            reason: row.try_get::<Option<String>, _>("reason")?.unwrap_or_default(),
            created_at,
        }),
        "canceled" => Finalization::Canceled(TransferCancellation {
            id,
            transfer_id,
            canceled_by: row.try_get("canceled_by")?,
            created_at,
        }),
        other => return Err(AppError::Internal(format!("Unknown transfer status {}", other))),
    };
    Ok(finalization)
}

fn entry_from_row(row: &PgRow) -> AppResult<LedgerEntry> {
    let owner_kind: String = row.try_get("owner_kind")?;
    let owner_id: String = row.try_get("owner_id")?;
    let kind: String = row.try_get("kind")?;
    let reference_kind: String = row.try_get("reference_kind")?;

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        owner: BookOwner::parse(&owner_kind, &owner_id)?,
        currency: currency_from_row(row)?,
        kind: EntryKind::parse(&kind)?,
        amount: from_numeric(&row.try_get("amount")?)?,
        reference: Reference::new(ReferenceKind::parse(&reference_kind)?, row.try_get("reference_id")?),
        created_at: row.try_get("created_at")?,
    })
}

// ========== SHARED STATEMENTS ==========

async fn insert_entries(tx: &mut Transaction<'_, Postgres>, entries: &[LedgerEntry]) -> AppResult<()> {
    ledger::ensure_balanced(entries)?;

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, owner_kind, owner_id, chain_id, currency_code, currency_symbol, currency_address,
                 currency_decimals, kind, amount, reference_kind, reference_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.owner.kind())
        .bind(entry.owner.identifier())
        .bind(entry.currency.chain_id as i64)
        .bind(entry.currency.code())
        .bind(&entry.currency.symbol)
        .bind(&entry.currency.address)
        .bind(i16::from(entry.currency.decimals))
        .bind(entry.kind.as_str())
        .bind(to_numeric(entry.amount)?)
        .bind(entry.reference.kind.as_str())
        .bind(entry.reference.id)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn book_balance(
    tx: &mut Transaction<'_, Postgres>,
    owner: &BookOwner,
    currency: &Currency,
) -> AppResult<Balance> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(CASE WHEN kind = 'credit' THEN amount ELSE -amount END), 0) AS balance
        FROM ledger_entries
        WHERE owner_kind = $1 AND owner_id = $2 AND currency_code = $3
        "#,
    )
    .bind(owner.kind())
    .bind(owner.identifier())
    .bind(currency.code())
    .fetch_one(&mut **tx)
    .await?;

    from_signed_numeric(&row.try_get("balance")?)
}

/// Serializes writers on one book within the current transaction
async fn lock_book(tx: &mut Transaction<'_, Postgres>, owner: &BookOwner, currency: &Currency) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("book:{}:{}", owner, currency.code()))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

const ROUTE_COLUMNS: &str = "id, order_id, kind, chain_id, account, block_start, block_end, node, identifier, time_start, time_end, payer, created_at";

const PAYMENT_COLUMNS: &str = "id, order_id, route_id, amount, chain_id, currency_code, currency_symbol, currency_address, currency_decimals, rail_identifier, observed_at, kind, tx_hash, block_hash, block_number, sender, node, identifier, payer, transfer_id";

const ENTRY_COLUMNS: &str = "id, owner_kind, owner_id, chain_id, currency_code, currency_symbol, currency_address, currency_decimals, kind, amount, reference_kind, reference_id, created_at";

#[async_trait]
impl SettlementStore for PgStore {
    // ========== CHAIN OPERATIONS ==========

    async fn get_chain(&self, chain_id: u64) -> AppResult<Option<Chain>> {
        let row = sqlx::query("SELECT id, provider_endpoint, head_number, synced, online FROM chains WHERE id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chain_from_row).transpose()
    }

    async fn save_chain(&self, chain: &Chain) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chains (id, provider_endpoint, head_number, synced, online)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET provider_endpoint = EXCLUDED.provider_endpoint,
                head_number = EXCLUDED.head_number,
                synced = EXCLUDED.synced,
                online = EXCLUDED.online
            "#,
        )
        .bind(chain.id as i64)
        .bind(&chain.provider_endpoint)
        .bind(chain.head_number as i64)
        .bind(chain.synced)
        .bind(chain.online)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_block(&self, block: &Block, transactions: &[ChainTransaction]) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO blocks (chain_id, hash, number, parent_hash, timestamp, uncle_hashes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chain_id, hash) DO NOTHING
            "#,
        )
        .bind(block.chain_id as i64)
        .bind(&block.hash)
        .bind(block.number as i64)
        .bind(&block.parent_hash)
        .bind(block.timestamp)
        .bind(&block.uncle_hashes)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for transaction in transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions
                    (chain_id, hash, block_hash, block_number, tx_index, from_address, to_address,
                     gas_used, gas_price, nonce, value, data)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (chain_id, hash) DO NOTHING
                "#,
            )
            .bind(transaction.chain_id as i64)
            .bind(&transaction.hash)
            .bind(&transaction.block_hash)
            .bind(transaction.block_number as i64)
            .bind(transaction.index as i64)
            .bind(&transaction.from_address)
            .bind(&transaction.to_address)
            .bind(to_numeric(transaction.gas_used)?)
            .bind(to_numeric(transaction.gas_price)?)
            .bind(transaction.nonce as i64)
            .bind(to_numeric(transaction.value)?)
            .bind(&transaction.data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_block(&self, chain_id: u64, number: u64) -> AppResult<Option<Block>> {
        let row = sqlx::query(
            "SELECT chain_id, hash, number, parent_hash, timestamp, uncle_hashes FROM blocks WHERE chain_id = $1 AND number = $2 LIMIT 1",
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn block_numbers_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<u64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT number FROM blocks WHERE chain_id = $1 AND number BETWEEN $2 AND $3 ORDER BY number",
        )
        .bind(chain_id as i64)
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("number")? as u64))
            .collect()
    }

    async fn latest_block_number(&self, chain_id: u64) -> AppResult<Option<u64>> {
        let row = sqlx::query("SELECT MAX(number) AS latest FROM blocks WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("latest")?.map(|n| n as u64))
    }

    async fn get_transaction(&self, chain_id: u64, hash: &str) -> AppResult<Option<ChainTransaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE chain_id = $1 AND hash = $2")
            .bind(chain_id as i64)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transactions_in_range(&self, chain_id: u64, start: u64, end: u64) -> AppResult<Vec<ChainTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM transactions
            WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3
            ORDER BY block_number, tx_index
            "#,
        )
        .bind(chain_id as i64)
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn rewind_chain(&self, chain_id: u64, new_head: u64) -> AppResult<RewindReport> {
        let mut tx = self.begin_tx().await?;

        let payment_rows = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE kind = 'blockchain' AND chain_id = $1 AND block_number > $2 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(new_head as i64)
        .fetch_all(&mut *tx)
        .await?;
        let removed_payments: Vec<Payment> = payment_rows.iter().map(payment_from_row).collect::<AppResult<_>>()?;

        let mut reversal_entries = 0;
        for payment in &removed_payments {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {} FROM ledger_entries
                WHERE (reference_kind = 'payment' AND reference_id = $1)
                   OR (reference_kind = 'payment_confirmation' AND reference_id IN
                        (SELECT id FROM payment_confirmations WHERE payment_id = $1))
                "#,
                ENTRY_COLUMNS
            ))
            .bind(payment.id)
            .fetch_all(&mut *tx)
            .await?;
            let originals: Vec<LedgerEntry> = rows.iter().map(entry_from_row).collect::<AppResult<_>>()?;

            let reversal = ledger::reversal_of(
                &originals,
                Reference::new(ReferenceKind::PaymentReversal, payment.id),
            );
            insert_entries(&mut tx, &reversal).await?;
            reversal_entries += reversal.len();

            sqlx::query("DELETE FROM payments WHERE id = $1")
                .bind(payment.id)
                .execute(&mut *tx)
                .await?;
        }

        let removed_transactions = sqlx::query("DELETE FROM transactions WHERE chain_id = $1 AND block_number > $2")
            .bind(chain_id as i64)
            .bind(new_head as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        let block_rows = sqlx::query("DELETE FROM blocks WHERE chain_id = $1 AND number > $2 RETURNING number")
            .bind(chain_id as i64)
            .bind(new_head as i64)
            .fetch_all(&mut *tx)
            .await?;
        let mut removed_blocks: Vec<u64> = block_rows
            .iter()
            .map(|row| Ok(row.try_get::<i64, _>("number")? as u64))
            .collect::<AppResult<_>>()?;
        removed_blocks.sort_unstable();

        sqlx::query("UPDATE chains SET head_number = LEAST(head_number, $2) WHERE id = $1")
            .bind(chain_id as i64)
            .bind(new_head as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if !removed_payments.is_empty() {
            warn!(
                "Rewind of chain {} to {} removed {} payments",
                chain_id,
                new_head,
                removed_payments.len()
            );
        }

        Ok(RewindReport {
            chain_id,
            new_head,
            removed_blocks,
            removed_transactions,
            removed_payments,
            reversal_entries,
        })
    }

    // ========== ORDER & ROUTE OPERATIONS ==========

    async fn insert_order(&self, order: &PaymentOrder) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_orders
                (id, chain_id, currency_code, currency_symbol, currency_address, currency_decimals,
                 amount_due, owner_id, payer_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id)
        .bind(order.currency.chain_id as i64)
        .bind(order.currency.code())
        .bind(&order.currency.symbol)
        .bind(&order.currency.address)
        .bind(i16::from(order.currency.decimals))
        .bind(to_numeric(order.amount_due)?)
        .bind(order.owner)
        .bind(&order.payer_ref)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<PaymentOrder>> {
        let row = sqlx::query("SELECT * FROM payment_orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn gateway_accounts(&self, chain_id: u64) -> AppResult<Vec<GatewayAccount>> {
        let rows = sqlx::query("SELECT * FROM gateway_accounts WHERE chain_id = $1 ORDER BY created_at")
            .bind(chain_id as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn claim_blockchain_route(
        &self,
        order_id: Uuid,
        chain_id: u64,
        window: BlockWindow,
        new_account: Option<&GatewayAccount>,
    ) -> AppResult<Option<PaymentRoute>> {
        let mut tx = self.begin_tx().await?;

        // One claimer per chain at a time
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(chain_id as i64)
            .execute(&mut *tx)
            .await?;

        let address = match new_account {
            Some(account) => {
                sqlx::query(
                    r#"
                    INSERT INTO gateway_accounts (address, chain_id, public_key, secret_key, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(&account.address)
                .bind(account.chain_id as i64)
                .bind(&account.public_key)
                .bind(&account.secret_key)
                .bind(account.created_at)
                .execute(&mut *tx)
                .await?;
                account.address.clone()
            }
            None => {
                let row = sqlx::query(
                    r#"
                    SELECT a.address FROM gateway_accounts a
                    WHERE a.chain_id = $1
                      AND NOT EXISTS (
                        SELECT 1 FROM payment_routes r
                        WHERE r.kind = 'blockchain'
                          AND r.chain_id = a.chain_id
                          AND r.account = a.address
                          AND r.block_start < $3
                          AND $2 < r.block_end
                      )
                    ORDER BY random()
                    LIMIT 1
                    "#,
                )
                .bind(chain_id as i64)
                .bind(window.start as i64)
                .bind(window.end as i64)
                .fetch_optional(&mut *tx)
                .await?;

                match row {
                    Some(row) => row.try_get("address")?,
                    None => {
                        tx.rollback().await?;
                        return Ok(None);
                    }
                }
            }
        };

        let route = PaymentRoute::new(
            order_id,
            RouteDetails::Blockchain {
                chain_id,
                account: address.clone(),
                window,
            },
        );

        sqlx::query(
            r#"
            INSERT INTO payment_routes (id, order_id, kind, chain_id, account, block_start, block_end, created_at)
            VALUES ($1, $2, 'blockchain', $3, $4, $5, $6, $7)
            "#,
        )
        .bind(route.id)
        .bind(order_id)
        .bind(chain_id as i64)
        .bind(&address)
        .bind(window.start as i64)
        .bind(window.end as i64)
        .bind(route.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Claimed {} for order {} over [{}, {})", address, order_id, window.start, window.end);
        Ok(Some(route))
    }

    async fn insert_route(&self, route: &PaymentRoute) -> AppResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO payment_routes
                (id, order_id, kind, chain_id, account, block_start, block_end, node, identifier,
                 time_start, time_end, payer, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(route.id)
        .bind(route.order_id)
        .bind(route.kind().as_str());

        let query = match &route.details {
            RouteDetails::Internal { payer } => query
                .bind(None::<i64>)
                .bind(None::<String>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<String>)
                .bind(None::<i64>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<DateTime<Utc>>)
                .bind(Some(*payer)),
            RouteDetails::Blockchain { chain_id, account, window } => query
                .bind(Some(*chain_id as i64))
                .bind(Some(account.clone()))
                .bind(Some(window.start as i64))
                .bind(Some(window.end as i64))
                .bind(None::<String>)
                .bind(None::<i64>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<DateTime<Utc>>)
                .bind(None::<Uuid>),
            RouteDetails::Channel { node, identifier, window } => query
                .bind(None::<i64>)
                .bind(None::<String>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(Some(node.clone()))
                .bind(Some(*identifier as i64))
                .bind(Some(window.start))
                .bind(Some(window.end))
                .bind(None::<Uuid>),
        };

        match query.bind(route.created_at).execute(&self.pool).await {
            Ok(_) => Ok(()),
            // 23P01: exclusion_violation
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23P01") => {
                Err(RouteError::IdentifierCollision(route.identifier()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn order_routes(&self, order_id: Uuid) -> AppResult<Vec<PaymentRoute>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_routes WHERE order_id = $1 ORDER BY created_at",
            ROUTE_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(route_from_row).collect()
    }

    async fn find_blockchain_route(
        &self,
        chain_id: u64,
        account: &str,
        block_number: u64,
    ) -> AppResult<Option<PaymentRoute>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_routes
            WHERE kind = 'blockchain' AND chain_id = $1 AND account = $2
              AND block_start <= $3 AND $3 < block_end
            "#,
            ROUTE_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(account.to_lowercase())
        .bind(block_number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(route_from_row).transpose()
    }

    async fn find_channel_route(
        &self,
        node: &str,
        identifier: u64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<PaymentRoute>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_routes
            WHERE kind = 'channel' AND node = $1 AND identifier = $2
              AND time_start <= $3 AND $3 < time_end
            "#,
            ROUTE_COLUMNS
        ))
        .bind(node)
        .bind(identifier as i64)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(route_from_row).transpose()
    }

    async fn find_internal_route(&self, order_id: Uuid, payer: Uuid) -> AppResult<Option<PaymentRoute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_routes WHERE kind = 'internal' AND order_id = $1 AND payer = $2 LIMIT 1",
            ROUTE_COLUMNS
        ))
        .bind(order_id)
        .bind(payer)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(route_from_row).transpose()
    }

    async fn blockchain_routes_ending(&self, chain_id: u64, after: u64, up_to: u64) -> AppResult<Vec<PaymentRoute>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_routes
            WHERE kind = 'blockchain' AND chain_id = $1 AND block_end > $2 AND block_end <= $3
            "#,
            ROUTE_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(after as i64)
        .bind(up_to as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(route_from_row).collect()
    }

    async fn channel_routes_ending(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRoute>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_routes WHERE kind = 'channel' AND time_end > $1 AND time_end <= $2",
            ROUTE_COLUMNS
        ))
        .bind(after)
        .bind(up_to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(route_from_row).collect()
    }

    async fn earliest_open_window_start(&self, chain_id: u64, head: u64) -> AppResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT MIN(block_start) AS start FROM payment_routes WHERE kind = 'blockchain' AND chain_id = $1 AND block_end > $2",
        )
        .bind(chain_id as i64)
        .bind(head as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("start")?.map(|n| n as u64))
    }

    // ========== PAYMENT OPERATIONS ==========

    async fn record_payment(
        &self,
        payment: &Payment,
        confirmation: Option<&PaymentConfirmation>,
        entries: &[LedgerEntry],
    ) -> AppResult<bool> {
        ledger::ensure_balanced(entries)?;
        let mut tx = self.begin_tx().await?;

        let (kind, tx_hash, block_hash, block_number, sender, node, identifier, payer, transfer_id) =
            match &payment.details {
                PaymentDetails::Blockchain {
                    tx_hash,
                    block_hash,
                    block_number,
                    sender,
                    ..
                } => (
                    "blockchain",
                    Some(tx_hash.clone()),
                    Some(block_hash.clone()),
                    Some(*block_number as i64),
                    Some(sender.clone()),
                    None,
                    None,
                    None,
                    None,
                ),
                PaymentDetails::Channel { node, sender, identifier } => (
                    "channel",
                    None,
                    None,
                    None,
                    Some(sender.clone()),
                    Some(node.clone()),
                    Some(*identifier as i64),
                    None,
                    None,
                ),
                PaymentDetails::Internal { payer, transfer_id } => (
                    "internal",
                    None,
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(*payer),
                    Some(*transfer_id),
                ),
            };

        let result = sqlx::query(
            r#"
            INSERT INTO payments
                (id, order_id, route_id, amount, chain_id, currency_code, currency_symbol, currency_address,
                 currency_decimals, rail_identifier, observed_at, kind, tx_hash, block_hash, block_number,
                 sender, node, identifier, payer, transfer_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (rail_identifier, route_id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(payment.route_id)
        .bind(to_numeric(payment.amount)?)
        .bind(payment.currency.chain_id as i64)
        .bind(payment.currency.code())
        .bind(&payment.currency.symbol)
        .bind(&payment.currency.address)
        .bind(i16::from(payment.currency.decimals))
        .bind(&payment.rail_identifier)
        .bind(payment.observed_at)
        .bind(kind)
        .bind(tx_hash)
        .bind(block_hash)
        .bind(block_number)
        .bind(sender)
        .bind(node)
        .bind(identifier)
        .bind(payer)
        .bind(transfer_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(confirmation) = confirmation {
            sqlx::query("INSERT INTO payment_confirmations (id, payment_id, created_at) VALUES ($1, $2, $3)")
                .bind(confirmation.id)
                .bind(payment.id)
                .bind(confirmation.created_at)
                .execute(&mut *tx)
                .await?;
        }

        insert_entries(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn confirm_payment(&self, confirmation: &PaymentConfirmation, entries: &[LedgerEntry]) -> AppResult<bool> {
        ledger::ensure_balanced(entries)?;
        let mut tx = self.begin_tx().await?;

        let exists = sqlx::query("SELECT id FROM payments WHERE id = $1 FOR UPDATE")
            .bind(confirmation.payment_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            tx.rollback().await?;
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO payment_confirmations (id, payment_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(confirmation.id)
        .bind(confirmation.payment_id)
        .bind(confirmation.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_entries(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn unconfirmed_blockchain_payments(&self, chain_id: u64) -> AppResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM payments p
            WHERE p.kind = 'blockchain' AND p.chain_id = $1
              AND NOT EXISTS (SELECT 1 FROM payment_confirmations c WHERE c.payment_id = p.id)
            ORDER BY p.block_number
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn order_payments(&self, order_id: Uuid) -> AppResult<Vec<(Payment, Option<PaymentConfirmation>)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, c.id AS confirmation_id, c.created_at AS confirmed_at
            FROM payments p
            LEFT JOIN payment_confirmations c ON c.payment_id = p.id
            WHERE p.order_id = $1
            ORDER BY p.observed_at
            "#,
            PAYMENT_COLUMNS
                .split(", ")
                .map(|column| format!("p.{}", column))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payment = payment_from_row(row)?;
                let confirmation = match row.try_get::<Option<Uuid>, _>("confirmation_id")? {
                    Some(id) => Some(PaymentConfirmation {
                        id,
                        payment_id: payment.id,
                        created_at: row.try_get("confirmed_at")?,
                    }),
                    None => None,
                };
                Ok((payment, confirmation))
            })
            .collect()
    }

    // ========== CHANNEL OPERATIONS ==========

    async fn save_channel(&self, channel: &ChannelInfo) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (channel_id, chain_id, token_address, partner_address, balance, total_deposit, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (channel_id) DO UPDATE
            SET balance = EXCLUDED.balance,
                total_deposit = EXCLUDED.total_deposit,
                state = EXCLUDED.state
            "#,
        )
        .bind(&channel.channel_id)
        .bind(channel.chain_id as i64)
        .bind(&channel.token_address)
        .bind(&channel.partner_address)
        .bind(to_numeric(channel.balance)?)
        .bind(to_numeric(channel.total_deposit)?)
        .bind(channel_state_str(channel.state))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channels(&self) -> AppResult<Vec<ChannelInfo>> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY channel_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn record_channel_payment(&self, payment: &ChannelPayment) -> AppResult<bool> {
        let direction = match payment.direction {
            PaymentDirection::Received => "received",
            PaymentDirection::Sent => "sent",
        };
        let result = sqlx::query(
            r#"
            INSERT INTO channel_payments
                (rail_identifier, channel_id, token_address, direction, counterparty, amount, identifier, timestamp,
                 settled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (rail_identifier) DO NOTHING
            "#,
        )
        .bind(payment.rail_identifier())
        .bind(&payment.channel_id)
        .bind(&payment.token_address)
        .bind(direction)
        .bind(&payment.counterparty)
        .bind(to_numeric(payment.amount)?)
        .bind(payment.identifier as i64)
        .bind(payment.timestamp)
        .bind(payment.direction != PaymentDirection::Received)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn channel_payment_count(&self, channel_id: &str) -> AppResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM channel_payments WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("total")? as u64)
    }

    async fn unsettled_channel_payments(&self) -> AppResult<Vec<ChannelPayment>> {
        let rows = sqlx::query("SELECT * FROM channel_payments WHERE NOT settled ORDER BY timestamp")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(channel_payment_from_row).collect()
    }

    async fn mark_channel_payment_settled(&self, rail_identifier: &str) -> AppResult<()> {
        sqlx::query("UPDATE channel_payments SET settled = TRUE WHERE rail_identifier = $1")
            .bind(rail_identifier)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========== TRANSFER OPERATIONS ==========

    async fn insert_transfer(&self, transfer: &Transfer) -> AppResult<()> {
        let (target_kind, target_value) = match &transfer.target {
            TransferTarget::User(id) => ("user", id.to_string()),
            TransferTarget::Address(address) => ("address", address.clone()),
        };
        sqlx::query(
            r#"
            INSERT INTO transfers
                (id, sender, target_kind, target_value, amount, chain_id, currency_code, currency_symbol,
                 currency_address, currency_decimals, memo, order_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(transfer.id)
        .bind(transfer.sender)
        .bind(target_kind)
        .bind(target_value)
        .bind(to_numeric(transfer.amount)?)
        .bind(transfer.currency.chain_id as i64)
        .bind(transfer.currency.code())
        .bind(&transfer.currency.symbol)
        .bind(&transfer.currency.address)
        .bind(i16::from(transfer.currency.decimals))
        .bind(&transfer.memo)
        .bind(transfer.order_id)
        .bind(transfer.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> AppResult<Option<TransferRecord>> {
        let Some(row) = sqlx::query("SELECT * FROM transfers WHERE id = $1")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let finalization = sqlx::query("SELECT * FROM transfer_finalizations WHERE transfer_id = $1")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(Some(TransferRecord {
            transfer: transfer_from_row(&row)?,
            reserved: row.try_get("reserved")?,
            claimed_until: row.try_get("claimed_until")?,
            finalization: finalization.as_ref().map(finalization_from_row).transpose()?,
        }))
    }

    async fn scheduled_transfers(&self) -> AppResult<Vec<Transfer>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM transfers t
            WHERE NOT EXISTS (SELECT 1 FROM transfer_finalizations f WHERE f.transfer_id = t.id)
            ORDER BY t.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn reserve_transfer(
        &self,
        transfer: &Transfer,
        entries: &[LedgerEntry],
        insufficient: &TransferFailure,
        claim_until: DateTime<Utc>,
    ) -> AppResult<ReserveOutcome> {
        ledger::ensure_balanced(entries)?;
        let mut tx = self.begin_tx().await?;

        let row = sqlx::query("SELECT reserved, claimed_until FROM transfers WHERE id = $1 FOR UPDATE")
            .bind(transfer.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transfer {} not found", transfer.id)))?;
        let reserved: bool = row.try_get("reserved")?;
        let claimed_until: Option<DateTime<Utc>> = row.try_get("claimed_until")?;

        let marker = sqlx::query("SELECT * FROM transfer_finalizations WHERE transfer_id = $1")
            .bind(transfer.id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(marker) = marker {
            let status = finalization_from_row(&marker)?.status();
            tx.rollback().await?;
            return Ok(ReserveOutcome::AlreadyFinalized(status));
        }
        if reserved {
            if let Some(until) = claimed_until.filter(|until| *until > Utc::now()) {
                tx.rollback().await?;
                return Ok(ReserveOutcome::Claimed { until });
            }
            sqlx::query("UPDATE transfers SET claimed_until = $2 WHERE id = $1")
                .bind(transfer.id)
                .bind(claim_until)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(ReserveOutcome::Reclaimed);
        }

        let sender = BookOwner::User(transfer.sender);
        lock_book(&mut tx, &sender, &transfer.currency).await?;
        let available = book_balance(&mut tx, &sender, &transfer.currency).await?;

        if available < transfer.amount as Balance {
            sqlx::query(
                r#"
                INSERT INTO transfer_finalizations (transfer_id, marker_id, status, reason, created_at)
                VALUES ($1, $2, 'failed', $3, $4)
                "#,
            )
            .bind(transfer.id)
            .bind(insufficient.id)
            .bind(&insufficient.reason)
            .bind(insufficient.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(ReserveOutcome::Insufficient { available });
        }

        sqlx::query("UPDATE transfers SET reserved = TRUE, claimed_until = $2 WHERE id = $1")
            .bind(transfer.id)
            .bind(claim_until)
            .execute(&mut *tx)
            .await?;
        insert_entries(&mut tx, entries).await?;
        tx.commit().await?;
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
        let transfer_id = finalization.transfer_id();
        let mut tx = self.begin_tx().await?;

        let row = sqlx::query("SELECT reserved, claimed_until FROM transfers WHERE id = $1 FOR UPDATE")
            .bind(transfer_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transfer {} not found", transfer_id)))?;
        let reserved: bool = row.try_get("reserved")?;
        let claimed_until: Option<DateTime<Utc>> = row.try_get("claimed_until")?;

        let marker = sqlx::query("SELECT * FROM transfer_finalizations WHERE transfer_id = $1")
            .bind(transfer_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(marker) = marker {
            let status = finalization_from_row(&marker)?.status();
            tx.rollback().await?;
            return Ok(FinalizeOutcome::AlreadyFinalized(status));
        }
        let claimed = reserved && claimed_until.is_some_and(|until| until > Utc::now());
        if claimed && matches!(finalization, Finalization::Canceled(_)) {
            tx.rollback().await?;
            return Ok(FinalizeOutcome::Claimed);
        }

        let (rail, rail_identifier, reason, canceled_by) = match finalization {
            Finalization::Executed(e) => (Some(e.rail.as_str()), Some(e.rail_identifier.clone()), None, None),
            Finalization::Failed(f) => (None, None, Some(f.reason.clone()), None),
            Finalization::Canceled(c) => (None, None, None, c.canceled_by),
        };
        let created_at = match finalization {
            Finalization::Executed(e) => e.created_at,
            Finalization::Failed(f) => f.created_at,
            Finalization::Canceled(c) => c.created_at,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO transfer_finalizations
                (transfer_id, marker_id, status, rail, rail_identifier, reason, canceled_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(transfer_id)
        .bind(finalization.marker_id())
        .bind(finalization.status().to_string())
        .bind(rail)
        .bind(rail_identifier)
        .bind(reason)
        .bind(canceled_by)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let status = self
                .get_transfer(transfer_id)
                .await?
                .map_or(TransferStatus::Scheduled, |record| record.status());
            return Ok(FinalizeOutcome::AlreadyFinalized(status));
        }

        insert_entries(&mut tx, entries).await?;
        if reserved {
            insert_entries(&mut tx, release).await?;
        }
        tx.commit().await?;
        Ok(FinalizeOutcome::Written)
    }

    // ========== LEDGER OPERATIONS ==========

    async fn append_entries(&self, entries: &[LedgerEntry]) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;
        insert_entries(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn book_entries(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM ledger_entries
            WHERE owner_kind = $1 AND owner_id = $2 AND currency_code = $3
            ORDER BY created_at
            "#,
            ENTRY_COLUMNS
        ))
        .bind(owner.kind())
        .bind(owner.identifier())
        .bind(currency.code())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn balance(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Balance> {
        let mut tx = self.begin_tx().await?;
        let balance = book_balance(&mut tx, owner, currency).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn currency_net_total(&self, currency: &Currency) -> AppResult<Balance> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN kind = 'credit' THEN amount ELSE -amount END), 0) AS total
            FROM ledger_entries
            WHERE currency_code = $1
            "#,
        )
        .bind(currency.code())
        .fetch_one(&self.pool)
        .await?;
        from_signed_numeric(&row.try_get("total")?)
    }
}
