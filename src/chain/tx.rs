use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};

use crate::error::{AppError, AppResult};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a `0x`-prefixed 20 byte address
pub fn parse_address(value: &str) -> Option<[u8; 20]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).ok()?.try_into().ok()
}

pub fn parse_hex_data(value: &str) -> AppResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| AppError::InvalidInput(format!("Bad call data {}: {}", value, e)))
}

// ========== RLP ==========

fn length_prefix(len: usize, short_offset: u8) -> Vec<u8> {
    if len <= 55 {
        return vec![short_offset + len as u8];
    }
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    let mut out = vec![short_offset + 55 + (be.len() - skip) as u8];
    out.extend_from_slice(&be[skip..]);
    out
}

fn rlp_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);
    out
}

/// Big-endian integer without leading zeros; zero is the empty string
fn rlp_uint_bytes(bytes: &[u8]) -> Vec<u8> {
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    rlp_bytes(&bytes[skip..])
}

fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_uint_bytes(&value.to_be_bytes())
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.concat();
    let mut out = length_prefix(payload.len(), 0xc0);
    out.extend_from_slice(&payload);
    out
}

// ========== LEGACY TRANSACTION ==========

/// Pre-typed Ethereum transaction with EIP-155 replay protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// RLP bytes ready for `eth_sendRawTransaction`
    pub raw: Vec<u8>,
    pub hash: [u8; 32],
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }

    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}

impl LegacyTransaction {
    fn fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(u128::from(self.nonce)),
            rlp_uint(self.gas_price),
            rlp_uint(u128::from(self.gas_limit)),
            rlp_bytes(&self.to),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut fields = self.fields();
        fields.push(rlp_uint(u128::from(self.chain_id)));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        rlp_list(&fields)
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    pub fn sign(&self, key: &SigningKey) -> AppResult<SignedTransaction> {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&self.signing_hash())
            .map_err(|e| AppError::Internal(format!("Signing failed: {}", e)))?;
        let (r, s) = signature.split_bytes();
        let v = u128::from(self.chain_id) * 2 + 35 + u128::from(recovery_id.to_byte());

        let mut fields = self.fields();
        fields.push(rlp_uint(v));
        fields.push(rlp_uint_bytes(&r));
        fields.push(rlp_uint_bytes(&s));
        let raw = rlp_list(&fields);

        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::keys::address_for;

    /// Transaction from the EIP-155 worked example
    fn eip155_example() -> LegacyTransaction {
        LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: [0x35; 20],
            value: 1_000_000_000_000_000_000,
            data: Vec::new(),
            chain_id: 1,
        }
    }

    #[test]
    fn test_rlp_encoding_rules() {
        assert_eq!(rlp_uint(0), vec![0x80]);
        assert_eq!(rlp_uint(0x7f), vec![0x7f]);
        assert_eq!(rlp_uint(0x80), vec![0x81, 0x80]);
        assert_eq!(rlp_uint(1024), vec![0x82, 0x04, 0x00]);
        assert_eq!(rlp_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(rlp_list(&[]), vec![0xc0]);

        let long = vec![0xaa; 56];
        let encoded = rlp_bytes(&long);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(encoded.len(), 58);
    }

    #[test]
    fn test_eip155_signing_payload() {
        let tx = eip155_example();
        assert_eq!(
            hex::encode(tx.signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_signed_transaction_recovers_sender() {
        let key = SigningKey::from_slice(&[0x46; 32]).unwrap();
        let tx = eip155_example();
        let signed = tx.sign(&key).unwrap();

        assert_eq!(signed.hash, keccak256(&signed.raw));
        let items = decode::list(&signed.raw).unwrap();
        assert!(items[6] == vec![37] || items[6] == vec![38]);

        let (decoded, signer) = decode::recover(&signed.raw).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(address_for(&signer), "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x3535353535353535353535353535353535353535"), Some([0x35; 20]));
        assert!(parse_address("0xpartner").is_none());
        assert!(parse_address("0x35").is_none());
    }
}
