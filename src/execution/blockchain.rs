use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::router::{RailExecutor, RailReceipt};
use crate::chain::rpc::ChainRpc;
use crate::chain::tokens::encode_transfer_call;
use crate::chain::tx::{parse_address, parse_hex_data, LegacyTransaction};
use crate::error::{AppError, AppResult, TransferError};
use crate::ledger::{self, models::*};
use crate::store::SettlementStore;
use crate::transfers::models::{Rail, Transfer, TransferTarget};
use crate::wallet::GatewayAccount;

#[derive(Debug, Clone)]
pub struct GasSettings {
    pub native_transfer: u64,
    pub token_transfer: u64,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            native_transfer: 21_000,
            token_transfer: 100_000,
        }
    }
}

/// Where a payout comes from and what it costs
struct Funding {
    account: GatewayAccount,
    gas_price: u128,
    fee: u128,
}

/// On-chain payouts signed by the gateway's own accounts
pub struct BlockchainExecutor {
    chain_id: u64,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn SettlementStore>,
    native: Currency,
    gas: GasSettings,
}

impl BlockchainExecutor {
    pub fn new(rpc: Arc<dyn ChainRpc>, store: Arc<dyn SettlementStore>, native: Currency, gas: GasSettings) -> Self {
        Self {
            chain_id: native.chain_id,
            rpc,
            store,
            native,
            gas,
        }
    }

    /// Only well-formed 20 byte addresses can be paid on chain
    fn target(transfer: &Transfer) -> Option<&str> {
        match &transfer.target {
            TransferTarget::Address(address) if parse_address(address).is_some() => Some(address.as_str()),
            _ => None,
        }
    }

    fn gas_limit(&self, currency: &Currency) -> u64 {
        if currency.is_native() {
            self.gas.native_transfer
        } else {
            self.gas.token_transfer
        }
    }

    /// First gateway account whose books and on-chain balance cover amount plus fee
    async fn funding(&self, transfer: &Transfer) -> AppResult<Option<Funding>> {
        if Self::target(transfer).is_none() || transfer.currency.chain_id != self.chain_id {
            return Ok(None);
        }

        let gas_price = self.rpc.gas_price().await?;
        let fee = gas_price.saturating_mul(u128::from(self.gas_limit(&transfer.currency)));
        let native_needed = if transfer.currency.is_native() {
            transfer.amount.saturating_add(fee)
        } else {
            fee
        };

        for account in self.store.gateway_accounts(self.chain_id).await? {
            let wallet = BookOwner::wallet(&account.address);
            let booked = self.store.balance(&wallet, &transfer.currency).await?;
            if booked < transfer.amount as Balance {
                continue;
            }
            if !transfer.currency.is_native() {
                let booked_native = self.store.balance(&wallet, &self.native).await?;
                if booked_native < fee as Balance {
                    continue;
                }
            }
            if self.rpc.balance(&account.address).await? < native_needed {
                continue;
            }
            return Ok(Some(Funding { account, gas_price, fee }));
        }
        Ok(None)
    }

    /// Native payouts go straight to the target; token payouts call `transfer` on the token
    fn build_transaction(
        &self,
        transfer: &Transfer,
        target: &str,
        funding: &Funding,
        nonce: u64,
    ) -> AppResult<LegacyTransaction> {
        let invalid = || TransferError::InvalidTarget(transfer.target.to_string());
        let (to, value, data) = match transfer.currency.address.as_deref() {
            None => (parse_address(target).ok_or_else(invalid)?, transfer.amount, Vec::new()),
            Some(token) => {
                let contract = parse_address(token)
                    .ok_or_else(|| AppError::Config(format!("Bad token address {}", token)))?;
                let call = parse_hex_data(&encode_transfer_call(target, transfer.amount))?;
                (contract, 0, call)
            }
        };
        Ok(LegacyTransaction {
            nonce,
            gas_price: funding.gas_price,
            gas_limit: self.gas_limit(&transfer.currency),
            to,
            value,
            data,
            chain_id: self.chain_id,
        })
    }
}

#[async_trait]
impl RailExecutor for BlockchainExecutor {
    fn rail(&self) -> Rail {
        Rail::Blockchain
    }

    async fn is_capable(&self, transfer: &Transfer) -> AppResult<bool> {
        Ok(self.funding(transfer).await?.is_some())
    }

    #[instrument(skip(self, transfer), fields(transfer_id = %transfer.id, chain_id = self.chain_id))]
    async fn execute(&self, transfer: &Transfer, execution_id: Uuid) -> AppResult<RailReceipt> {
        let target = Self::target(transfer)
            .ok_or_else(|| TransferError::InvalidTarget(transfer.target.to_string()))?;
        let funding = self
            .funding(transfer)
            .await?
            .ok_or(AppError::Transfer(TransferError::NoCapableRail))?;

        let nonce = self.rpc.transaction_count(&funding.account.address).await?;
        let tx = self.build_transaction(transfer, target, &funding, nonce)?;
        let signed = funding.account.sign_transaction(&tx)?;

        let tx_hash = self
            .rpc
            .send_raw_transaction(&signed.raw_hex())
            .await
            .map_err(|e| TransferError::RailRejected {
                rail: Rail::Blockchain,
                message: e.to_string(),
            })?;

        if !tx_hash.eq_ignore_ascii_case(&signed.hash_hex()) {
            warn!("Node reported hash {} for transaction {}", tx_hash, signed.hash_hex());
        }
        info!(
            "⛓️  Sent {} {} from {} to {} in {}",
            transfer.amount, transfer.currency.symbol, funding.account.address, target, tx_hash
        );

        let reference = Reference::new(ReferenceKind::TransferExecution, execution_id);
        let wallet = BookOwner::wallet(&funding.account.address);
        let mut legs = ledger::transfer(
            wallet.clone(),
            BookOwner::external(target),
            transfer.amount,
            &transfer.currency,
            reference,
        )?;
        if funding.fee > 0 {
            legs.extend(ledger::transfer(
                wallet,
                BookOwner::FeeCollector(self.chain_id),
                funding.fee,
                &self.native,
                reference,
            )?);
        }

        Ok(RailReceipt {
            rail: Rail::Blockchain,
            identifier: tx_hash,
            legs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tx::decode;
    use crate::store::MemoryStore;
    use crate::testing::{self, MockChainRpc};
    use crate::transfers::models::NewTransfer;
    use crate::payments::models::BlockWindow;

    const TARGET: &str = "0x2222222222222222222222222222222222222222";

    async fn funded_account(store: &MemoryStore, rpc: &MockChainRpc, booked: Amount, on_chain: u128) -> GatewayAccount {
        let account = GatewayAccount::generate(1);
        store
            .claim_blockchain_route(Uuid::new_v4(), 1, BlockWindow::new(0, 1), Some(&account))
            .await
            .unwrap();
        if booked > 0 {
            let entries = ledger::transfer(
                BookOwner::external("0xpayer"),
                BookOwner::wallet(&account.address),
                booked,
                &testing::eth(),
                Reference::new(ReferenceKind::Payment, Uuid::new_v4()),
            )
            .unwrap();
            store.append_entries(&entries).await.unwrap();
        }
        rpc.set_balance(&account.address, on_chain);
        account
    }

    fn transfer(amount: Amount) -> Transfer {
        NewTransfer {
            sender: Uuid::new_v4(),
            target: TransferTarget::Address(TARGET.into()),
            amount,
            currency: testing::eth(),
            memo: None,
            order_id: None,
        }
        .into_transfer()
    }

    fn executor(rpc: Arc<MockChainRpc>, store: Arc<MemoryStore>) -> BlockchainExecutor {
        BlockchainExecutor::new(rpc, store, testing::eth(), GasSettings::default())
    }

    #[tokio::test]
    async fn test_capability_requires_booked_and_on_chain_funds() {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        let executor = executor(rpc.clone(), store.clone());

        assert!(!executor.is_capable(&transfer(1_000)).await.unwrap());

        // Booked but the node reports too little to cover gas
        funded_account(&store, &rpc, 1_000, 1_000).await;
        assert!(!executor.is_capable(&transfer(1_000)).await.unwrap());

        funded_account(&store, &rpc, 1_000, 1_000 + 21_000).await;
        assert!(executor.is_capable(&transfer(1_000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_signs_and_books_fee() {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        let account = funded_account(&store, &rpc, 50_000, 1_000_000).await;
        let executor = executor(rpc.clone(), store.clone());

        let receipt = executor.execute(&transfer(1_000), Uuid::new_v4()).await.unwrap();
        assert_eq!(rpc.sent_transactions().len(), 1);
        assert!(ledger::ensure_balanced(&receipt.legs).is_ok());

        let fee = receipt
            .legs
            .iter()
            .find(|e| e.owner == BookOwner::FeeCollector(1))
            .unwrap();
        assert_eq!(fee.amount, 21_000);

        // Raw bytes are an RLP list signed by the funding account for this chain
        let raw = hex::decode(rpc.sent_transactions()[0].trim_start_matches("0x")).unwrap();
        assert!(raw[0] >= 0xc0);
        let (tx, signer) = decode::recover(&raw).unwrap();
        assert_eq!(crate::wallet::keys::address_for(&signer), account.address);
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.to, parse_address(TARGET).unwrap());
        assert_eq!(tx.value, 1_000);
        assert_eq!(tx.gas_limit, 21_000);
        assert!(tx.data.is_empty());
    }

    #[tokio::test]
    async fn test_token_payout_calls_contract() {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        let account = funded_account(&store, &rpc, 50_000_000, 1_000_000_000).await;
        let usdc = testing::usdc();
        let entries = ledger::transfer(
            BookOwner::external("0xpayer"),
            BookOwner::wallet(&account.address),
            500,
            &usdc,
            Reference::new(ReferenceKind::Payment, Uuid::new_v4()),
        )
        .unwrap();
        store.append_entries(&entries).await.unwrap();

        let mut payout = transfer(500);
        payout.currency = usdc;
        executor(rpc.clone(), store).execute(&payout, Uuid::new_v4()).await.unwrap();

        let raw = hex::decode(rpc.sent_transactions()[0].trim_start_matches("0x")).unwrap();
        let (tx, _) = decode::recover(&raw).unwrap();
        assert_eq!(tx.to, parse_address(testing::TOKEN).unwrap());
        assert_eq!(tx.value, 0);
        assert_eq!(tx.gas_limit, 100_000);
        assert_eq!(
            format!("0x{}", hex::encode(&tx.data)),
            encode_transfer_call(TARGET, 500)
        );
    }

    #[tokio::test]
    async fn test_malformed_address_is_not_payable() {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        funded_account(&store, &rpc, 50_000, 1_000_000).await;

        let mut payout = transfer(1_000);
        payout.target = TransferTarget::Address("0xpartner".into());
        assert!(!executor(rpc, store).is_capable(&payout).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_broadcast_is_reported() {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        funded_account(&store, &rpc, 50_000, 1_000_000).await;
        rpc.reject_sends(true);

        let result = executor(rpc, store).execute(&transfer(1_000), Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(AppError::Transfer(TransferError::RailRejected { rail: Rail::Blockchain, .. }))
        ));
    }
}
