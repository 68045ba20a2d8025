//! Fakes and fixtures shared by unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

use crate::chain::models::*;
use crate::chain::rpc::ChainRpc;
use crate::channel::client::ChannelClient;
use crate::channel::models::{ChannelInfo, ChannelPayment, ChannelState, PaymentDirection};
use crate::error::{AppError, AppResult, ChainError};
use crate::ledger::models::{Amount, Currency};
use crate::payments::models::{Payment, PaymentDetails};

pub const TOKEN: &str = "0x00000000000000000000000000000000000000aa";

pub fn eth() -> Currency {
    Currency::native(1, "ETH", 18)
}

pub fn usdc() -> Currency {
    Currency::token(1, "USDC", TOKEN, 6)
}

// ========== FIXTURES ==========

pub fn block_hash(number: u64, fork: u64) -> String {
    format!("0x{:060x}{:04x}", number, fork)
}

fn tx_hash(block: &str, index: usize) -> String {
    format!("{}{:04x}", block, index)
}

pub fn block(chain_id: u64, number: u64) -> Block {
    Block {
        chain_id,
        hash: block_hash(number, 0),
        number,
        parent_hash: block_hash(number.saturating_sub(1), 0),
        timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + number as i64 * 12, 0).unwrap(),
        uncle_hashes: vec![],
    }
}

pub fn stored_transaction(block: &Block, index: u64, to: &str, value: Amount) -> Transaction {
    Transaction {
        chain_id: block.chain_id,
        hash: tx_hash(&block.hash, index as usize),
        block_hash: block.hash.clone(),
        block_number: block.number,
        index,
        from_address: "0x000000000000000000000000000000000000beef".into(),
        to_address: Some(to.to_lowercase()),
        gas_used: 21_000,
        gas_price: 1,
        nonce: index,
        value,
        data: "0x".into(),
    }
}

pub fn blockchain_payment(
    order_id: Uuid,
    route_id: Uuid,
    currency: &Currency,
    amount: Amount,
    block_number: u64,
) -> Payment {
    let hash = block_hash(block_number, 0);
    Payment {
        id: Uuid::new_v4(),
        order_id,
        route_id,
        amount,
        currency: currency.clone(),
        rail_identifier: tx_hash(&hash, 0),
        observed_at: Utc::now(),
        details: PaymentDetails::Blockchain {
            chain_id: currency.chain_id,
            tx_hash: tx_hash(&hash, 0),
            block_hash: hash,
            block_number,
            sender: "0x000000000000000000000000000000000000beef".into(),
        },
    }
}

/// Transaction body; `block_data` fills in hash and position
pub fn tx_data(from: &str, to: &str, value: Amount) -> TransactionData {
    TransactionData {
        hash: String::new(),
        block_hash: None,
        block_number: None,
        transaction_index: None,
        from: from.to_lowercase(),
        to: Some(to.to_lowercase()),
        value,
        gas_price: 1,
        nonce: 0,
        input: "0x".into(),
    }
}

pub fn block_data(_chain_id: u64, number: u64, fork: u64, transactions: Vec<TransactionData>) -> BlockData {
    let hash = block_hash(number, fork);
    let transactions = transactions
        .into_iter()
        .enumerate()
        .map(|(index, mut tx)| {
            tx.hash = tx_hash(&hash, index);
            tx.block_hash = Some(hash.clone());
            tx.block_number = Some(number);
            tx.transaction_index = Some(index as u64);
            tx
        })
        .collect();

    BlockData {
        number,
        parent_hash: block_hash(number.saturating_sub(1), 0),
        hash,
        timestamp: 1_700_000_000 + number * 12,
        uncles: vec![],
        transactions,
    }
}

pub fn receipt_for(block: &BlockData, tx: &TransactionData) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx.hash.clone(),
        block_hash: block.hash.clone(),
        block_number: block.number,
        transaction_index: tx.transaction_index.unwrap_or(0),
        from: tx.from.clone(),
        to: tx.to.clone(),
        gas_used: 21_000,
        status: Some(1),
    }
}

// ========== CHAIN NODE ==========

struct MockChainState {
    reachable: bool,
    syncing: bool,
    peers: u64,
    head: u64,
    blocks: BTreeMap<u64, BlockData>,
    by_hash: HashMap<String, BlockData>,
    receipts: HashMap<String, TransactionReceipt>,
    filter: Option<(String, Vec<String>)>,
    block_requests: usize,
    balances: HashMap<String, u128>,
    nonces: HashMap<String, u64>,
    sent: Vec<String>,
    reject_sends: bool,
}

/// In-process node with scriptable blocks, connectivity and balances
pub struct MockChainRpc {
    chain_id: u64,
    state: Mutex<MockChainState>,
}

impl MockChainRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockChainState {
                reachable: true,
                syncing: false,
                peers: 3,
                head: 0,
                blocks: BTreeMap::new(),
                by_hash: HashMap::new(),
                receipts: HashMap::new(),
                filter: None,
                block_requests: 0,
                balances: HashMap::new(),
                nonces: HashMap::new(),
                sent: Vec::new(),
                reject_sends: false,
            }),
        }
    }

    /// Produce canonical block `number` with (from, to, value) transfers
    pub fn mine(&self, number: u64, transfers: Vec<(&str, &str, Amount)>) -> BlockData {
        self.mine_fork(number, 0, transfers)
    }

    pub fn mine_fork(&self, number: u64, fork: u64, transfers: Vec<(&str, &str, Amount)>) -> BlockData {
        let txs = transfers
            .into_iter()
            .map(|(from, to, value)| tx_data(from, to, value))
            .collect();
        let data = block_data(self.chain_id, number, fork, txs);
        self.push_block(data.clone());
        data
    }

    pub fn push_block(&self, data: BlockData) {
        let mut state = self.state.lock();
        for tx in &data.transactions {
            state.receipts.insert(tx.hash.clone(), receipt_for(&data, tx));
        }
        if let Some((_, pending)) = state.filter.as_mut() {
            pending.push(data.hash.clone());
        }
        state.head = state.head.max(data.number);
        state.by_hash.insert(data.hash.clone(), data.clone());
        state.blocks.insert(data.number, data);
    }

    /// Drop canonical blocks above `head`
    pub fn truncate(&self, head: u64) {
        let mut state = self.state.lock();
        state.blocks.retain(|number, _| *number <= head);
        state.head = head;
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.state.lock().syncing = syncing;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn set_peers(&self, peers: u64) {
        self.state.lock().peers = peers;
    }

    pub fn set_balance(&self, address: &str, balance: u128) {
        self.state.lock().balances.insert(address.to_lowercase(), balance);
    }

    pub fn reject_sends(&self, reject: bool) {
        self.state.lock().reject_sends = reject;
    }

    pub fn block_requests(&self) -> usize {
        self.state.lock().block_requests
    }

    pub fn sent_transactions(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    fn ensure_reachable(&self) -> AppResult<()> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(ChainError::Connectivity {
                endpoint: self.endpoint().to_string(),
                message: "connection refused".into(),
            }
            .into())
        }
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    fn endpoint(&self) -> &str {
        "mock://node"
    }

    async fn network_id(&self) -> AppResult<u64> {
        self.ensure_reachable()?;
        Ok(self.chain_id)
    }

    async fn peer_count(&self) -> AppResult<u64> {
        self.ensure_reachable()?;
        Ok(self.state.lock().peers)
    }

    async fn syncing(&self) -> AppResult<bool> {
        self.ensure_reachable()?;
        Ok(self.state.lock().syncing)
    }

    async fn block_number(&self) -> AppResult<u64> {
        self.ensure_reachable()?;
        Ok(self.state.lock().head)
    }

    async fn get_block(&self, id: BlockId, with_transactions: bool) -> AppResult<Option<BlockData>> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        state.block_requests += 1;
        let found = match id {
            BlockId::Number(number) => state.blocks.get(&number).cloned(),
            BlockId::Hash(hash) => state.by_hash.get(&hash).cloned(),
        };
        Ok(found.map(|mut block| {
            if !with_transactions {
                block.transactions.clear();
            }
            block
        }))
    }

    async fn get_transaction(&self, hash: &str) -> AppResult<Option<TransactionData>> {
        self.ensure_reachable()?;
        let state = self.state.lock();
        Ok(state
            .by_hash
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.hash == hash)
            .cloned())
    }

    async fn get_transaction_receipt(&self, hash: &str) -> AppResult<Option<TransactionReceipt>> {
        self.ensure_reachable()?;
        Ok(self.state.lock().receipts.get(hash).cloned())
    }

    async fn new_block_filter(&self) -> AppResult<String> {
        self.ensure_reachable()?;
        let id = format!("0x{}", Uuid::new_v4().simple());
        self.state.lock().filter = Some((id.clone(), Vec::new()));
        Ok(id)
    }

    async fn get_filter_changes(&self, filter_id: &str) -> AppResult<Vec<String>> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        match state.filter.as_mut() {
            Some((id, pending)) if id == filter_id => Ok(std::mem::take(pending)),
            _ => Err(ChainError::Rpc {
                method: "eth_getFilterChanges".into(),
                message: "filter not found".into(),
            }
            .into()),
        }
    }

    async fn send_raw_transaction(&self, signed: &str) -> AppResult<String> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        if state.reject_sends {
            return Err(ChainError::Rpc {
                method: "eth_sendRawTransaction".into(),
                message: "insufficient funds for gas".into(),
            }
            .into());
        }
        state.sent.push(signed.to_string());
        Ok(format!("0x{:064x}", state.sent.len()))
    }

    async fn gas_price(&self) -> AppResult<u128> {
        self.ensure_reachable()?;
        Ok(1)
    }

    async fn transaction_count(&self, address: &str) -> AppResult<u64> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        let nonce = state.nonces.entry(address.to_lowercase()).or_insert(0);
        let current = *nonce;
        *nonce += 1;
        Ok(current)
    }

    async fn balance(&self, address: &str) -> AppResult<u128> {
        self.ensure_reachable()?;
        Ok(self
            .state
            .lock()
            .balances
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0))
    }
}

// ========== CHANNEL NODE ==========

struct MockChannelState {
    channels: Vec<ChannelInfo>,
    events: HashMap<String, Vec<ChannelPayment>>,
    sent: Vec<ChannelPayment>,
    deposits: Vec<(String, Amount)>,
    delay: Option<Duration>,
    fail: bool,
}

pub struct MockChannelClient {
    address: String,
    state: Mutex<MockChannelState>,
}

impl MockChannelClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_lowercase(),
            state: Mutex::new(MockChannelState {
                channels: Vec::new(),
                events: HashMap::new(),
                sent: Vec::new(),
                deposits: Vec::new(),
                delay: None,
                fail: false,
            }),
        }
    }

    pub fn open_channel(&self, channel_id: &str, partner: &str, balance: Amount) -> ChannelInfo {
        let info = ChannelInfo {
            channel_id: channel_id.to_string(),
            chain_id: 1,
            token_address: TOKEN.to_string(),
            partner_address: partner.to_lowercase(),
            balance,
            total_deposit: balance,
            state: ChannelState::Opened,
        };
        self.state.lock().channels.push(info.clone());
        info
    }

    pub fn receive(&self, channel_id: &str, sender: &str, amount: Amount, identifier: u64) -> ChannelPayment {
        let payment = ChannelPayment {
            channel_id: channel_id.to_string(),
            token_address: TOKEN.to_string(),
            direction: PaymentDirection::Received,
            counterparty: sender.to_lowercase(),
            amount,
            identifier,
            timestamp: Utc::now(),
        };
        self.state
            .lock()
            .events
            .entry(channel_id.to_string())
            .or_default()
            .push(payment.clone());
        payment
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn set_failing(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn sent(&self) -> Vec<ChannelPayment> {
        self.state.lock().sent.clone()
    }

    pub fn deposits(&self) -> Vec<(String, Amount)> {
        self.state.lock().deposits.clone()
    }
}

#[async_trait]
impl ChannelClient for MockChannelClient {
    fn node_address(&self) -> &str {
        &self.address
    }

    async fn list_channels(&self) -> AppResult<Vec<ChannelInfo>> {
        Ok(self.state.lock().channels.clone())
    }

    async fn payments(&self, channel: &ChannelInfo, offset: usize) -> AppResult<Vec<ChannelPayment>> {
        let state = self.state.lock();
        Ok(state
            .events
            .get(&channel.channel_id)
            .map(|events| events.iter().skip(offset).cloned().collect())
            .unwrap_or_default())
    }

    async fn send_payment(
        &self,
        token_address: &str,
        target: &str,
        amount: Amount,
        identifier: u64,
    ) -> AppResult<ChannelPayment> {
        let (delay, fail) = {
            let state = self.state.lock();
            (state.delay, state.fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(AppError::ExternalError("no route to target".into()));
        }

        let payment = ChannelPayment {
            channel_id: String::new(),
            token_address: token_address.to_lowercase(),
            direction: PaymentDirection::Sent,
            counterparty: target.to_lowercase(),
            amount,
            identifier,
            timestamp: Utc::now(),
        };
        let mut state = self.state.lock();
        if let Some(channel) = state
            .channels
            .iter_mut()
            .find(|c| c.partner_address == payment.counterparty)
        {
            channel.balance = channel.balance.saturating_sub(amount);
        }
        state.sent.push(payment.clone());
        Ok(payment)
    }

    async fn deposit(&self, channel: &ChannelInfo, total_deposit: Amount) -> AppResult<ChannelInfo> {
        let mut state = self.state.lock();
        state.deposits.push((channel.channel_id.clone(), total_deposit));
        let stored = state
            .channels
            .iter_mut()
            .find(|c| c.channel_id == channel.channel_id)
            .ok_or_else(|| AppError::NotFound(format!("Channel {}", channel.channel_id)))?;
        stored.balance += total_deposit.saturating_sub(stored.total_deposit);
        stored.total_deposit = total_deposit;
        Ok(stored.clone())
    }
}
