use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::transfers::models::{Rail, TransferStatus};

/// Top-level error type for the gateway
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Errors raised while talking to, or interpreting data from, a chain node
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Node at {endpoint} unreachable: {message}")]
    Connectivity { endpoint: String, message: String },

    #[error("Node for chain {chain_id} is not synced")]
    OutOfSync { chain_id: u64 },

    #[error("Invalid chain data: {0}")]
    Validation(String),

    #[error("RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Node reports network {actual}, expected {expected}")]
    NetworkMismatch { expected: u64, actual: u64 },

    #[error("No client registered for chain {0}")]
    UnknownChain(u64),
}

/// Outbound transfer errors. Every variant resolves to a TransferFailure.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u128, available: i128 },

    #[error("No rail can deliver this transfer")]
    NoCapableRail,

    #[error("Rail {rail} rejected transfer: {message}")]
    RailRejected { rail: Rail, message: String },

    #[error("Rail {rail} did not answer in time")]
    Timeout { rail: Rail },

    #[error("Invalid transfer target: {0}")]
    InvalidTarget(String),

    #[error("Transfer is {0} and can no longer be canceled")]
    NotCancellable(TransferStatus),

    #[error("Transfer is currently being executed")]
    InFlight,

    #[error("Execution claim lapsed before the transfer was finalized")]
    ClaimExpired,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Entries for {currency} do not balance: net {net}")]
    Unbalanced { currency: String, net: i128 },

    #[error("Ledger entries must carry a positive amount")]
    ZeroAmount,

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Chain {0} is not synced, blockchain route skipped")]
    ChainNotSynced(u64),

    #[error("Route identifier {0} already in use")]
    IdentifierCollision(String),

    #[error("Account {account} already has a route overlapping [{start}, {end})")]
    OverlappingWindow { account: String, start: u64, end: u64 },
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {:?}", error))
    }
}

impl AppError {
    /// Connectivity problems are retried by the poll loops instead of surfaced
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AppError::Chain(ChainError::Connectivity { .. }) | AppError::ExternalError(_)
        )
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
