pub mod models;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppResult, LedgerError};
use crate::store::SettlementStore;
use models::*;

/// Build a credit line for `owner`. Entries only take effect once a balanced batch is stored.
pub fn credit(owner: BookOwner, amount: Amount, currency: &Currency, reference: Reference) -> AppResult<LedgerEntry> {
    entry(owner, EntryKind::Credit, amount, currency, reference)
}

/// Build a debit line for `owner`
pub fn debit(owner: BookOwner, amount: Amount, currency: &Currency, reference: Reference) -> AppResult<LedgerEntry> {
    entry(owner, EntryKind::Debit, amount, currency, reference)
}

fn entry(
    owner: BookOwner,
    kind: EntryKind,
    amount: Amount,
    currency: &Currency,
    reference: Reference,
) -> AppResult<LedgerEntry> {
    if amount == 0 {
        return Err(LedgerError::ZeroAmount.into());
    }
    Ok(LedgerEntry {
        id: Uuid::new_v4(),
        owner,
        currency: currency.clone(),
        kind,
        amount,
        reference,
        created_at: Utc::now(),
    })
}

/// Balanced pair moving `amount` from one book to another
pub fn transfer(
    from: BookOwner,
    to: BookOwner,
    amount: Amount,
    currency: &Currency,
    reference: Reference,
) -> AppResult<Vec<LedgerEntry>> {
    Ok(vec![
        debit(from, amount, currency, reference)?,
        credit(to, amount, currency, reference)?,
    ])
}

/// Every currency in the batch must net to zero
pub fn ensure_balanced(entries: &[LedgerEntry]) -> AppResult<()> {
    let mut net: HashMap<&Currency, Balance> = HashMap::new();
    for entry in entries {
        *net.entry(&entry.currency).or_default() += entry.signed_amount();
    }

    match net.into_iter().find(|(_, total)| *total != 0) {
        Some((currency, total)) => Err(LedgerError::Unbalanced {
            currency: currency.code(),
            net: total,
        }
        .into()),
        None => Ok(()),
    }
}

/// Mirror entries offsetting `originals`, all tagged with `reference`
pub fn reversal_of(originals: &[LedgerEntry], reference: Reference) -> Vec<LedgerEntry> {
    let now = Utc::now();
    originals
        .iter()
        .map(|original| LedgerEntry {
            id: Uuid::new_v4(),
            owner: original.owner.clone(),
            currency: original.currency.clone(),
            kind: match original.kind {
                EntryKind::Credit => EntryKind::Debit,
                EntryKind::Debit => EntryKind::Credit,
            },
            amount: original.amount,
            reference,
            created_at: now,
        })
        .collect()
}

/// Sum of credits minus debits
pub fn balance_of<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Balance {
    entries.into_iter().map(LedgerEntry::signed_amount).sum()
}

/// Read side of the books plus balanced posting
pub struct Ledger {
    store: Arc<dyn SettlementStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Balance> {
        self.store.balance(owner, currency).await
    }

    pub async fn entries(&self, owner: &BookOwner, currency: &Currency) -> AppResult<Vec<LedgerEntry>> {
        self.store.book_entries(owner, currency).await
    }

    /// Append a balanced batch
    pub async fn post(&self, entries: &[LedgerEntry]) -> AppResult<()> {
        ensure_balanced(entries)?;
        self.store.append_entries(entries).await
    }

    /// Σ of all books in `currency`; anything but zero means value was created or destroyed
    pub async fn net_position(&self, currency: &Currency) -> AppResult<Balance> {
        self.store.currency_net_total(currency).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::MemoryStore;

    fn eth() -> Currency {
        Currency::native(1, "ETH", 18)
    }

    fn reference() -> Reference {
        Reference::new(ReferenceKind::Payment, Uuid::new_v4())
    }

    #[test]
    fn test_zero_amount_rejected() {
        let result = credit(BookOwner::Treasury(1), 0, &eth(), reference());
        assert!(matches!(result, Err(AppError::Ledger(LedgerError::ZeroAmount))));
    }

    #[test]
    fn test_ensure_balanced() {
        let pair = transfer(BookOwner::Treasury(1), BookOwner::User(Uuid::new_v4()), 7, &eth(), reference()).unwrap();
        assert!(ensure_balanced(&pair).is_ok());

        let lone = vec![credit(BookOwner::Treasury(1), 7, &eth(), reference()).unwrap()];
        assert!(matches!(
            ensure_balanced(&lone),
            Err(AppError::Ledger(LedgerError::Unbalanced { net: 7, .. }))
        ));
    }

    #[test]
    fn test_balanced_per_currency() {
        let usdc = Currency::token(1, "USDC", "0xa0b8", 6);
        let user = BookOwner::User(Uuid::new_v4());
        // Same magnitude in two currencies does not cancel out
        let entries = vec![
            debit(user.clone(), 5, &eth(), reference()).unwrap(),
            credit(user, 5, &usdc, reference()).unwrap(),
        ];
        assert!(ensure_balanced(&entries).is_err());
    }

    #[test]
    fn test_reversal_offsets_original() {
        let user = BookOwner::User(Uuid::new_v4());
        let original = transfer(BookOwner::Treasury(1), user.clone(), 9, &eth(), reference()).unwrap();
        let reversal_ref = Reference::new(ReferenceKind::PaymentReversal, Uuid::new_v4());
        let reversal = reversal_of(&original, reversal_ref);

        assert_eq!(reversal.len(), 2);
        assert!(reversal.iter().all(|e| e.reference == reversal_ref));

        let all: Vec<LedgerEntry> = original.into_iter().chain(reversal).collect();
        let user_entries = all.iter().filter(|e| e.owner == user);
        assert_eq!(balance_of(user_entries), 0);
    }

    #[tokio::test]
    async fn test_post_and_balance() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store);
        let user = BookOwner::User(Uuid::new_v4());

        let entries = transfer(BookOwner::Treasury(1), user.clone(), 12, &eth(), reference()).unwrap();
        ledger.post(&entries).await.unwrap();

        assert_eq!(ledger.balance(&user, &eth()).await.unwrap(), 12);
        assert_eq!(ledger.balance(&BookOwner::Treasury(1), &eth()).await.unwrap(), -12);
        assert_eq!(ledger.entries(&user, &eth()).await.unwrap().len(), 1);
        assert_eq!(ledger.net_position(&eth()).await.unwrap(), 0);

        let unbalanced = vec![credit(user, 1, &eth(), reference()).unwrap()];
        assert!(ledger.post(&unbalanced).await.is_err());
        assert_eq!(ledger.net_position(&eth()).await.unwrap(), 0);
    }
}
