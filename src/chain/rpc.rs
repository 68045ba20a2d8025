use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::models::{BlockData, BlockId, TransactionData, TransactionReceipt};
use crate::error::{AppError, AppResult, ChainError};

/// Node access used by ChainSync and the blockchain executor
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn network_id(&self) -> AppResult<u64>;

    async fn peer_count(&self) -> AppResult<u64>;

    /// True while the node is still catching up with the network
    async fn syncing(&self) -> AppResult<bool>;

    async fn block_number(&self) -> AppResult<u64>;

    async fn get_block(&self, id: BlockId, with_transactions: bool) -> AppResult<Option<BlockData>>;

    async fn get_transaction(&self, hash: &str) -> AppResult<Option<TransactionData>>;

    async fn get_transaction_receipt(&self, hash: &str) -> AppResult<Option<TransactionReceipt>>;

    /// Register a filter for new block hashes
    async fn new_block_filter(&self) -> AppResult<String>;

    /// Block hashes seen since the last poll of `filter_id`
    async fn get_filter_changes(&self, filter_id: &str) -> AppResult<Vec<String>>;

    async fn send_raw_transaction(&self, signed: &str) -> AppResult<String>;

    async fn gas_price(&self) -> AppResult<u128>;

    async fn transaction_count(&self, address: &str) -> AppResult<u64>;

    async fn balance(&self, address: &str) -> AppResult<u128>;
}

// ========== HEX QUANTITIES ==========

pub fn parse_quantity(value: &str) -> AppResult<u128> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| ChainError::Validation(format!("Invalid hex quantity {}", value)).into())
}

pub fn parse_u64(value: &str) -> AppResult<u64> {
    u64::try_from(parse_quantity(value)?)
        .map_err(|_| ChainError::Validation(format!("Quantity {} exceeds u64", value)).into())
}

pub fn to_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

// ========== WIRE FORMAT ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
    timestamp: String,
    #[serde(default)]
    uncles: Vec<String>,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    block_hash: Option<String>,
    block_number: Option<String>,
    transaction_index: Option<String>,
    from: String,
    to: Option<String>,
    value: String,
    gas_price: Option<String>,
    nonce: String,
    #[serde(default)]
    input: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_hash: String,
    block_number: String,
    transaction_index: String,
    from: String,
    to: Option<String>,
    gas_used: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

fn lower(value: &str) -> String {
    value.to_lowercase()
}

fn convert_transaction(raw: RpcTransaction) -> AppResult<TransactionData> {
    Ok(TransactionData {
        hash: lower(&raw.hash),
        block_hash: raw.block_hash.as_deref().map(lower),
        block_number: raw.block_number.as_deref().map(parse_u64).transpose()?,
        transaction_index: raw.transaction_index.as_deref().map(parse_u64).transpose()?,
        from: lower(&raw.from),
        to: raw.to.as_deref().map(lower),
        value: parse_quantity(&raw.value)?,
        gas_price: raw.gas_price.as_deref().map(parse_quantity).transpose()?.unwrap_or(0),
        nonce: parse_u64(&raw.nonce)?,
        input: raw.input,
    })
}

fn convert_block(raw: RpcBlock) -> AppResult<BlockData> {
    let transactions = raw
        .transactions
        .into_iter()
        // hashes only when the block was requested without transaction bodies
        .filter(|tx| tx.is_object())
        .map(|tx| serde_json::from_value::<RpcTransaction>(tx).map_err(AppError::from))
        .map(|tx| tx.and_then(convert_transaction))
        .collect::<AppResult<Vec<_>>>()?;

    Ok(BlockData {
        number: parse_u64(&raw.number)?,
        hash: lower(&raw.hash),
        parent_hash: lower(&raw.parent_hash),
        timestamp: parse_u64(&raw.timestamp)?,
        uncles: raw.uncles.iter().map(|u| lower(u)).collect(),
        transactions,
    })
}

fn convert_receipt(raw: RpcReceipt) -> AppResult<TransactionReceipt> {
    Ok(TransactionReceipt {
        transaction_hash: lower(&raw.transaction_hash),
        block_hash: lower(&raw.block_hash),
        block_number: parse_u64(&raw.block_number)?,
        transaction_index: parse_u64(&raw.transaction_index)?,
        from: lower(&raw.from),
        to: raw.to.as_deref().map(lower),
        gas_used: parse_quantity(&raw.gas_used)?,
        status: raw.status.as_deref().map(parse_u64).transpose()?,
    })
}

/// JSON-RPC 2.0 client over HTTP
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> AppResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("→ {} {}", method, params);

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChainError::Connectivity {
                endpoint: self.url.clone(),
                message: e.to_string(),
            })?;

        let body: RpcResponse = response.json().await.map_err(|e| ChainError::Rpc {
            method: method.to_string(),
            message: format!("Malformed response: {}", e),
        })?;

        if let Some(error) = body.error {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                message: format!("{} ({})", error.message, error.code),
            }
            .into());
        }

        let result = body.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| {
            ChainError::Rpc {
                method: method.to_string(),
                message: format!("Unexpected result: {}", e),
            }
            .into()
        })
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn network_id(&self) -> AppResult<u64> {
        let version: String = self.call("net_version", json!([])).await?;
        match version.parse::<u64>() {
            Ok(id) => Ok(id),
            Err(_) => parse_u64(&version),
        }
    }

    async fn peer_count(&self) -> AppResult<u64> {
        let count: String = self.call("net_peerCount", json!([])).await?;
        parse_u64(&count)
    }

    async fn syncing(&self) -> AppResult<bool> {
        let status: Value = self.call("eth_syncing", json!([])).await?;
        Ok(!matches!(status, Value::Bool(false)))
    }

    async fn block_number(&self) -> AppResult<u64> {
        let number: String = self.call("eth_blockNumber", json!([])).await?;
        parse_u64(&number)
    }

    async fn get_block(&self, id: BlockId, with_transactions: bool) -> AppResult<Option<BlockData>> {
        let raw: Option<RpcBlock> = match id {
            BlockId::Number(number) => {
                self.call(
                    "eth_getBlockByNumber",
                    json!([to_quantity(u128::from(number)), with_transactions]),
                )
                .await?
            }
            BlockId::Hash(hash) => {
                self.call("eth_getBlockByHash", json!([hash, with_transactions]))
                    .await?
            }
        };
        raw.map(convert_block).transpose()
    }

    async fn get_transaction(&self, hash: &str) -> AppResult<Option<TransactionData>> {
        let raw: Option<RpcTransaction> = self.call("eth_getTransactionByHash", json!([hash])).await?;
        raw.map(convert_transaction).transpose()
    }

    async fn get_transaction_receipt(&self, hash: &str) -> AppResult<Option<TransactionReceipt>> {
        let raw: Option<RpcReceipt> = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        raw.map(convert_receipt).transpose()
    }

    async fn new_block_filter(&self) -> AppResult<String> {
        self.call("eth_newBlockFilter", json!([])).await
    }

    async fn get_filter_changes(&self, filter_id: &str) -> AppResult<Vec<String>> {
        let hashes: Vec<String> = self.call("eth_getFilterChanges", json!([filter_id])).await?;
        Ok(hashes.iter().map(|h| lower(h)).collect())
    }

    async fn send_raw_transaction(&self, signed: &str) -> AppResult<String> {
        self.call("eth_sendRawTransaction", json!([signed])).await
    }

    async fn gas_price(&self) -> AppResult<u128> {
        let price: String = self.call("eth_gasPrice", json!([])).await?;
        parse_quantity(&price)
    }

    async fn transaction_count(&self, address: &str) -> AppResult<u64> {
        let count: String = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_u64(&count)
    }

    async fn balance(&self, address: &str) -> AppResult<u128> {
        let balance: String = self.call("eth_getBalance", json!([address, "latest"])).await?;
        parse_quantity(&balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x1bc16d674ec80000").unwrap(), 2_000_000_000_000_000_000);
        assert!(parse_quantity("0xzz").is_err());
        assert_eq!(to_quantity(255), "0xff");
    }

    #[test]
    fn test_convert_block_with_transactions() {
        let raw: RpcBlock = serde_json::from_value(json!({
            "number": "0x78",
            "hash": "0xAB",
            "parentHash": "0xaa",
            "timestamp": "0x5f5e100",
            "uncles": [],
            "transactions": [{
                "hash": "0xT1",
                "blockHash": "0xab",
                "blockNumber": "0x78",
                "transactionIndex": "0x0",
                "from": "0xFROM",
                "to": "0xTO",
                "value": "0xa",
                "gasPrice": "0x1",
                "nonce": "0x2",
                "input": "0x"
            }]
        }))
        .unwrap();

        let block = convert_block(raw).unwrap();
        assert_eq!(block.number, 120);
        assert_eq!(block.hash, "0xab");
        assert_eq!(block.timestamp, 100_000_000);
        assert_eq!(block.transactions.len(), 1);

        let tx = &block.transactions[0];
        assert_eq!(tx.hash, "0xt1");
        assert_eq!(tx.from, "0xfrom");
        assert_eq!(tx.to.as_deref(), Some("0xto"));
        assert_eq!(tx.value, 10);
        assert_eq!(tx.block_number, Some(120));
    }

    #[test]
    fn test_convert_block_with_hashes_only() {
        let raw: RpcBlock = serde_json::from_value(json!({
            "number": "0x1",
            "hash": "0x01",
            "parentHash": "0x00",
            "timestamp": "0x0",
            "transactions": ["0xdead", "0xbeef"]
        }))
        .unwrap();

        assert!(convert_block(raw).unwrap().transactions.is_empty());
    }

    #[test]
    fn test_convert_receipt_status() {
        let raw: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": "0xT1",
            "blockHash": "0xab",
            "blockNumber": "0x78",
            "transactionIndex": "0x0",
            "from": "0xfrom",
            "to": null,
            "gasUsed": "0x5208",
            "status": "0x0"
        }))
        .unwrap();

        let receipt = convert_receipt(raw).unwrap();
        assert_eq!(receipt.gas_used, 21000);
        assert_eq!(receipt.status, Some(0));
        assert!(receipt.to.is_none());
    }
}
