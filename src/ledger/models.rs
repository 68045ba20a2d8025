use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Token amount in minor units (wei, token base units)
pub type Amount = u128;

/// Signed book balance in minor units
pub type Balance = i128;

/// A token on a chain. Native currencies carry no contract address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub chain_id: u64,
    pub symbol: String,
    /// Token contract address, lowercase hex (None for the native currency)
    pub address: Option<String>,
    pub decimals: u8,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

impl Currency {
    pub fn native(chain_id: u64, symbol: &str, decimals: u8) -> Self {
        Self {
            chain_id,
            symbol: symbol.to_string(),
            address: None,
            decimals,
        }
    }

    pub fn token(chain_id: u64, symbol: &str, address: &str, decimals: u8) -> Self {
        Self {
            chain_id,
            symbol: symbol.to_string(),
            address: Some(address.to_lowercase()),
            decimals,
        }
    }

    pub fn is_native(&self) -> bool {
        self.address.is_none()
    }

    /// Stable key used for persistence, e.g. `1:ETH` or `1:0xa0b8...`
    pub fn code(&self) -> String {
        match &self.address {
            Some(address) => format!("{}:{}", self.chain_id, address),
            None => format!("{}:{}", self.chain_id, self.symbol),
        }
    }

    /// Convert a human amount (e.g. `1.5`) to minor units without going through floats.
    /// Rejects negative values and values with more precision than the token supports.
    pub fn to_minor_units(&self, value: Decimal) -> AppResult<Amount> {
        if value.is_sign_negative() {
            return Err(AppError::InvalidInput(format!(
                "Negative amount {} for {}",
                value, self.symbol
            )));
        }

        let value = value.normalize();
        let mantissa = value.mantissa() as u128;
        let scale = value.scale();
        let decimals = u32::from(self.decimals);

        let overflow = || AppError::InvalidInput(format!("Amount {} overflows", value));

        if scale <= decimals {
            let factor = 10u128.checked_pow(decimals - scale).ok_or_else(overflow)?;
            mantissa.checked_mul(factor).ok_or_else(overflow)
        } else {
            let divisor = 10u128.checked_pow(scale - decimals).ok_or_else(overflow)?;
            if mantissa % divisor != 0 {
                return Err(AppError::InvalidInput(format!(
                    "{} has more than {} decimal places",
                    value, self.decimals
                )));
            }
            Ok(mantissa / divisor)
        }
    }

    /// Convert minor units back to a human amount
    pub fn from_minor_units(&self, amount: Amount) -> AppResult<Decimal> {
        let signed = i128::try_from(amount)
            .map_err(|_| AppError::InvalidInput(format!("Amount {} overflows", amount)))?;
        let value = Decimal::try_from_i128_with_scale(signed, u32::from(self.decimals))?;
        Ok(value.normalize())
    }
}

/// Owner of a ledger book. Every value-moving operation debits one owner and credits another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BookOwner {
    /// Platform user
    User(Uuid),
    /// Platform custody per chain, the counterpart of every user balance
    Treasury(u64),
    /// Gateway-controlled on-chain account
    Wallet(String),
    /// Gateway's channel-rail node
    Channel(String),
    /// Shadow book for an address outside the platform
    External(String),
    /// Network fees paid by gateway accounts on a chain
    FeeCollector(u64),
}

impl BookOwner {
    pub fn wallet(address: &str) -> Self {
        BookOwner::Wallet(address.to_lowercase())
    }

    pub fn channel(node: &str) -> Self {
        BookOwner::Channel(node.to_lowercase())
    }

    pub fn external(address: &str) -> Self {
        BookOwner::External(address.to_lowercase())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BookOwner::User(_) => "user",
            BookOwner::Treasury(_) => "treasury",
            BookOwner::Wallet(_) => "wallet",
            BookOwner::Channel(_) => "channel",
            BookOwner::External(_) => "external",
            BookOwner::FeeCollector(_) => "fee_collector",
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            BookOwner::User(id) => id.to_string(),
            BookOwner::Treasury(chain_id) | BookOwner::FeeCollector(chain_id) => {
                chain_id.to_string()
            }
            BookOwner::Wallet(address)
            | BookOwner::Channel(address)
            | BookOwner::External(address) => address.clone(),
        }
    }

    pub fn parse(kind: &str, identifier: &str) -> AppResult<Self> {
        let bad = || AppError::Internal(format!("Malformed book owner {}:{}", kind, identifier));
        match kind {
            "user" => Uuid::parse_str(identifier).map(BookOwner::User).map_err(|_| bad()),
            "treasury" => identifier.parse().map(BookOwner::Treasury).map_err(|_| bad()),
            "fee_collector" => identifier.parse().map(BookOwner::FeeCollector).map_err(|_| bad()),
            "wallet" => Ok(BookOwner::Wallet(identifier.to_string())),
            "channel" => Ok(BookOwner::Channel(identifier.to_string())),
            "external" => Ok(BookOwner::External(identifier.to_string())),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for BookOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.identifier())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "credit" => Ok(EntryKind::Credit),
            "debit" => Ok(EntryKind::Debit),
            other => Err(AppError::Internal(format!("Unknown entry kind {}", other))),
        }
    }
}

/// What caused a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Payment,
    PaymentConfirmation,
    PaymentReversal,
    TransferReservation,
    TransferExecution,
    TransferFailure,
    TransferCancellation,
    ChannelDeposit,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Payment => "payment",
            ReferenceKind::PaymentConfirmation => "payment_confirmation",
            ReferenceKind::PaymentReversal => "payment_reversal",
            ReferenceKind::TransferReservation => "transfer_reservation",
            ReferenceKind::TransferExecution => "transfer_execution",
            ReferenceKind::TransferFailure => "transfer_failure",
            ReferenceKind::TransferCancellation => "transfer_cancellation",
            ReferenceKind::ChannelDeposit => "channel_deposit",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        let kind = match value {
            "payment" => ReferenceKind::Payment,
            "payment_confirmation" => ReferenceKind::PaymentConfirmation,
            "payment_reversal" => ReferenceKind::PaymentReversal,
            "transfer_reservation" => ReferenceKind::TransferReservation,
            "transfer_execution" => ReferenceKind::TransferExecution,
            "transfer_failure" => ReferenceKind::TransferFailure,
            "transfer_cancellation" => ReferenceKind::TransferCancellation,
            "channel_deposit" => ReferenceKind::ChannelDeposit,
            other => return Err(AppError::Internal(format!("Unknown reference kind {}", other))),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub id: Uuid,
}

impl Reference {
    pub fn new(kind: ReferenceKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

/// One append-only line in a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub owner: BookOwner,
    pub currency: Currency,
    pub kind: EntryKind,
    pub amount: Amount,
    pub reference: Reference,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Contribution of this entry to its book's balance
    pub fn signed_amount(&self) -> Balance {
        let amount = self.amount as Balance;
        match self.kind {
            EntryKind::Credit => amount,
            EntryKind::Debit => -amount,
        }
    }

    pub fn belongs_to(&self, owner: &BookOwner, currency: &Currency) -> bool {
        &self.owner == owner && &self.currency == currency
    }
}
