use std::collections::HashMap;

use super::models::Transaction;
use crate::ledger::models::{Amount, Currency};

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: &str = "a9059cbb";

const WORD: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub recipient: String,
    pub amount: Amount,
}

/// Decode ERC-20 transfer call data. Amounts above u128 are not representable and rejected.
pub fn decode_transfer_call(data: &str) -> Option<TokenTransfer> {
    let hex = data.trim_start_matches("0x").to_lowercase();
    if hex.len() != TRANSFER_SELECTOR.len() + 2 * WORD || !hex.starts_with(TRANSFER_SELECTOR) {
        return None;
    }

    let address_word = &hex[8..8 + WORD];
    let amount_word = &hex[8 + WORD..];

    if !address_word[..24].chars().all(|c| c == '0') || !amount_word[..32].chars().all(|c| c == '0') {
        return None;
    }

    let amount = u128::from_str_radix(&amount_word[32..], 16).ok()?;
    Some(TokenTransfer {
        recipient: format!("0x{}", &address_word[24..]),
        amount,
    })
}

pub fn encode_transfer_call(recipient: &str, amount: Amount) -> String {
    format!(
        "0x{}{:0>64}{:064x}",
        TRANSFER_SELECTOR,
        recipient.trim_start_matches("0x").to_lowercase(),
        amount
    )
}

/// Currencies tracked on one chain: the native coin plus configured tokens
#[derive(Debug, Clone)]
pub struct CurrencyRegistry {
    native: Currency,
    tokens: HashMap<String, Currency>,
}

impl CurrencyRegistry {
    pub fn new(native: Currency) -> Self {
        Self {
            native,
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: Currency) -> Self {
        if let Some(address) = token.address.clone() {
            self.tokens.insert(address, token);
        }
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.native.chain_id
    }

    pub fn native(&self) -> &Currency {
        &self.native
    }

    pub fn token(&self, address: &str) -> Option<&Currency> {
        self.tokens.get(&address.to_lowercase())
    }

    /// Recipient, amount and currency moved by a transaction, if it moves anything we track
    pub fn resolve_transfer(&self, tx: &Transaction) -> Option<(String, Amount, Currency)> {
        let to = tx.to_address.as_deref()?;

        if let Some(token) = self.token(to) {
            let call = decode_transfer_call(&tx.data)?;
            return Some((call.recipient, call.amount, token.clone()));
        }

        if tx.value > 0 {
            return Some((to.to_lowercase(), tx.value, self.native.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";

    fn registry() -> CurrencyRegistry {
        CurrencyRegistry::new(Currency::native(1, "ETH", 18))
            .with_token(Currency::token(1, "USDC", TOKEN, 6))
    }

    #[test]
    fn test_transfer_call_round_trip() {
        let data = encode_transfer_call(RECIPIENT, 1_500_000);
        assert_eq!(data.len(), 2 + 8 + 128);

        let decoded = decode_transfer_call(&data).unwrap();
        assert_eq!(decoded.recipient, RECIPIENT);
        assert_eq!(decoded.amount, 1_500_000);
    }

    #[test]
    fn test_decode_rejects_other_calls() {
        assert!(decode_transfer_call("0x").is_none());
        assert!(decode_transfer_call(&encode_transfer_call(RECIPIENT, 1).replace(TRANSFER_SELECTOR, "095ea7b3")).is_none());
    }

    #[test]
    fn test_resolve_native_and_token_transfers() {
        let block = testing::block(1, 10);

        let native = testing::stored_transaction(&block, 0, RECIPIENT, 42);
        let (to, amount, currency) = registry().resolve_transfer(&native).unwrap();
        assert_eq!((to.as_str(), amount), (RECIPIENT, 42));
        assert!(currency.is_native());

        let mut token = testing::stored_transaction(&block, 1, TOKEN, 0);
        token.data = encode_transfer_call(RECIPIENT, 7);
        let (to, amount, currency) = registry().resolve_transfer(&token).unwrap();
        assert_eq!((to.as_str(), amount), (RECIPIENT, 7));
        assert_eq!(currency.symbol, "USDC");

        let empty = testing::stored_transaction(&block, 2, RECIPIENT, 0);
        assert!(registry().resolve_transfer(&empty).is_none());
    }
}
