use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::Amount;
use crate::payments::models::Payment;

/// Mirror of a network as seen by its sync loop. Only ChainSync writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub id: u64,
    pub provider_endpoint: String,
    pub head_number: u64,
    pub synced: bool,
    pub online: bool,
}

impl Chain {
    pub fn new(id: u64, provider_endpoint: &str) -> Self {
        Self {
            id,
            provider_endpoint: provider_endpoint.to_string(),
            head_number: 0,
            synced: false,
            online: false,
        }
    }

    /// Routes may only be allocated and payments confirmed on a chain that is online and synced
    pub fn is_ready(&self) -> bool {
        self.online && self.synced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: u64,
    pub hash: String,
    pub number: u64,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    pub uncle_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub chain_id: u64,
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub index: u64,
    pub from_address: String,
    pub to_address: Option<String>,
    pub gas_used: u128,
    pub gas_price: u128,
    pub nonce: u64,
    pub value: Amount,
    /// Call data as 0x-prefixed hex
    pub data: String,
}

/// Block as returned by the node, with full transaction objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub uncles: Vec<String>,
    pub transactions: Vec<TransactionData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub hash: String,
    pub block_hash: Option<String>,
    pub block_number: Option<u64>,
    pub transaction_index: Option<u64>,
    pub from: String,
    pub to: Option<String>,
    pub value: Amount,
    pub gas_price: u128,
    pub nonce: u64,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: String,
    pub to: Option<String>,
    pub gas_used: u128,
    /// 1 = success, 0 = reverted, None on pre-byzantium nodes
    pub status: Option<u64>,
}

/// Identifies a block in `ChainRpc::get_block`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(String),
}

/// Result of storing one block
#[derive(Debug, Clone)]
pub struct IngestedBlock {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    /// false when the block was already stored
    pub created: bool,
}

/// What a reorg rewind removed
#[derive(Debug, Clone, Default)]
pub struct RewindReport {
    pub chain_id: u64,
    pub new_head: u64,
    pub removed_blocks: Vec<u64>,
    pub removed_transactions: usize,
    pub removed_payments: Vec<Payment>,
    pub reversal_entries: usize,
}

/// Connectivity state of a chain node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Disconnected,
    Syncing,
    Synced,
}

/// Messages sent from a chain's poll loop to the settlement task, in order
#[derive(Debug, Clone)]
pub enum ChainUpdate {
    Rewound(RewindReport),
    BlockIngested(IngestedBlock),
    HeadAdvanced { chain_id: u64, previous: u64, head: u64 },
}
