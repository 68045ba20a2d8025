use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::router::{RailExecutor, RailReceipt};
use crate::error::{AppResult, TransferError};
use crate::ledger::{self, models::*};
use crate::transfers::models::{Rail, Transfer, TransferTarget};
use crate::wallet::UserDirectory;

/// Book-to-book transfers between platform users
pub struct InternalExecutor {
    directory: Arc<dyn UserDirectory>,
}

impl InternalExecutor {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    fn receiver(transfer: &Transfer) -> Option<Uuid> {
        match transfer.target {
            TransferTarget::User(id) if id != transfer.sender => Some(id),
            _ => None,
        }
    }
}

#[async_trait]
impl RailExecutor for InternalExecutor {
    fn rail(&self) -> Rail {
        Rail::Internal
    }

    async fn is_capable(&self, transfer: &Transfer) -> AppResult<bool> {
        match Self::receiver(transfer) {
            Some(receiver) => self.directory.exists(receiver).await,
            None => Ok(false),
        }
    }

    async fn execute(&self, transfer: &Transfer, execution_id: Uuid) -> AppResult<RailReceipt> {
        let receiver = Self::receiver(transfer)
            .ok_or_else(|| TransferError::InvalidTarget(transfer.target.to_string()))?;

        // Reservation already moved the sender's funds to the treasury
        let legs = ledger::transfer(
            BookOwner::Treasury(transfer.currency.chain_id),
            BookOwner::User(receiver),
            transfer.amount,
            &transfer.currency,
            Reference::new(ReferenceKind::TransferExecution, execution_id),
        )?;

        Ok(RailReceipt {
            rail: Rail::Internal,
            identifier: transfer.id.to_string(),
            legs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::transfers::models::NewTransfer;
    use crate::wallet::InMemoryUserDirectory;

    #[tokio::test]
    async fn test_only_known_users_are_reachable() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let known = Uuid::new_v4();
        directory.register("carol", known).await;
        let executor = InternalExecutor::new(directory);

        let transfer = |target| {
            NewTransfer {
                sender: Uuid::new_v4(),
                target,
                amount: 3,
                currency: testing::eth(),
                memo: None,
                order_id: None,
            }
            .into_transfer()
        };

        assert!(executor.is_capable(&transfer(TransferTarget::User(known))).await.unwrap());
        assert!(!executor
            .is_capable(&transfer(TransferTarget::User(Uuid::new_v4())))
            .await
            .unwrap());
        assert!(!executor
            .is_capable(&transfer(TransferTarget::Address("0xdest".into())))
            .await
            .unwrap());

        let receipt = executor
            .execute(&transfer(TransferTarget::User(known)), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(receipt.legs.len(), 2);
        assert!(ledger::ensure_balanced(&receipt.legs).is_ok());
        assert_eq!(receipt.legs[1].owner, BookOwner::User(known));
    }
}
