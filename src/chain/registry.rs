use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::rpc::ChainRpc;
use crate::error::{AppResult, ChainError};

/// RPC clients built once at startup, one per chain id
pub struct ClientRegistry {
    clients: HashMap<u64, Arc<dyn ChainRpc>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Only call this during system initialization
    pub fn register(&mut self, chain_id: u64, client: Arc<dyn ChainRpc>) {
        info!("Registering RPC client for chain {} at {}", chain_id, client.endpoint());
        self.clients.insert(chain_id, client);
    }

    pub fn get(&self, chain_id: u64) -> AppResult<Arc<dyn ChainRpc>> {
        self.clients
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| ChainError::UnknownChain(chain_id).into())
    }

    pub fn supports_chain(&self, chain_id: u64) -> bool {
        self.clients.contains_key(&chain_id)
    }

    pub fn chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.clients.keys().copied().collect();
        chains.sort_unstable();
        chains
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::testing::MockChainRpc;

    #[test]
    fn test_lookup_by_chain() {
        let mut registry = ClientRegistry::new();
        registry.register(5, Arc::new(MockChainRpc::new(5)));

        assert!(registry.supports_chain(5));
        assert!(registry.get(5).is_ok());
        assert!(matches!(
            registry.get(1),
            Err(AppError::Chain(ChainError::UnknownChain(1)))
        ));
        assert_eq!(registry.chains(), vec![5]);
    }
}
