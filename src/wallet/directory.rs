use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppResult;

/// Lookup of platform users, owned by the account service
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a username or user id string to a user id
    async fn resolve(&self, reference: &str) -> AppResult<Option<Uuid>>;

    async fn exists(&self, user_id: Uuid) -> AppResult<bool>;
}

pub struct InMemoryUserDirectory {
    users: tokio::sync::RwLock<HashMap<String, Uuid>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            users: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, username: &str, user_id: Uuid) {
        let mut users = self.users.write().await;
        users.insert(username.to_lowercase(), user_id);
    }
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn resolve(&self, reference: &str) -> AppResult<Option<Uuid>> {
        let users = self.users.read().await;
        if let Some(id) = users.get(&reference.to_lowercase()) {
            return Ok(Some(*id));
        }
        Ok(Uuid::parse_str(reference)
            .ok()
            .filter(|id| users.values().any(|known| known == id)))
    }

    async fn exists(&self, user_id: Uuid) -> AppResult<bool> {
        let users = self.users.read().await;
        Ok(users.values().any(|id| *id == user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_by_name_and_id() {
        let directory = InMemoryUserDirectory::new();
        let alice = Uuid::new_v4();
        directory.register("Alice", alice).await;

        assert_eq!(directory.resolve("alice").await.unwrap(), Some(alice));
        assert_eq!(directory.resolve(&alice.to_string()).await.unwrap(), Some(alice));
        assert_eq!(directory.resolve("bob").await.unwrap(), None);
        assert_eq!(directory.resolve(&Uuid::new_v4().to_string()).await.unwrap(), None);
        assert!(directory.exists(alice).await.unwrap());
    }
}
