use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::chain::tx::{keccak256, LegacyTransaction, SignedTransaction};
use crate::error::{AppError, AppResult};

/// On-chain account controlled by the gateway, used as a payment route destination
/// and as the source of blockchain transfers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAccount {
    pub chain_id: u64,
    pub address: String,
    /// Hex encoded uncompressed SEC1 secp256k1 public key
    pub public_key: String,
    /// Hex encoded secp256k1 secret scalar
    pub secret_key: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for GatewayAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayAccount")
            .field("chain_id", &self.chain_id)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// `0x` + last 20 bytes of keccak256 over the uncompressed public key without its tag byte
pub fn address_for(key: &VerifyingKey) -> String {
    let point = key.as_affine().to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

impl GatewayAccount {
    pub fn generate(chain_id: u64) -> Self {
        let mut rng = rand::rng();
        loop {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // Zero or a value above the curve order is rejected; draw again
            if let Ok(account) = Self::from_secret(chain_id, &secret) {
                return account;
            }
        }
    }

    pub fn from_secret(chain_id: u64, secret: &[u8]) -> AppResult<Self> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| AppError::InvalidInput(format!("Invalid secp256k1 secret: {}", e)))?;
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            chain_id,
            address: address_for(verifying_key),
            public_key: hex::encode(verifying_key.as_affine().to_encoded_point(false).as_bytes()),
            secret_key: hex::encode(signing_key.to_bytes()),
            created_at: Utc::now(),
        })
    }

    fn signing_key(&self) -> AppResult<SigningKey> {
        let bytes = hex::decode(&self.secret_key)
            .map_err(|e| AppError::Internal(format!("Corrupt key for {}: {}", self.address, e)))?;
        SigningKey::from_slice(&bytes)
            .map_err(|e| AppError::Internal(format!("Invalid key for {}: {}", self.address, e)))
    }

    /// Sign `tx` for broadcast from this account
    pub fn sign_transaction(&self, tx: &LegacyTransaction) -> AppResult<SignedTransaction> {
        tx.sign(&self.signing_key()?)
    }
}

/// Source of fresh gateway accounts for route allocation
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    async fn provision(&self, chain_id: u64) -> AppResult<GatewayAccount>;
}

/// Generates a new random key pair per request
pub struct KeyPairProvisioner;

#[async_trait]
impl AccountProvisioner for KeyPairProvisioner {
    async fn provision(&self, chain_id: u64) -> AppResult<GatewayAccount> {
        let account = GatewayAccount::generate(chain_id);
        info!("🔑 Generated gateway account {} on chain {}", account.address, chain_id);
        Ok(account)
    }
}
