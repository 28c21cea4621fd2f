use std::fmt;

use async_trait::async_trait;

use crate::security;
use crate::storage::{SharedStore, StoreResult, User};

/// Login name and secret as presented to `login`. Lives for one call.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the authentication core needs from the persistence layer.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user(&self, username: &str) -> StoreResult<Option<User>>;

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<User>>;

    /// Replace the stored secret hash.
    async fn set_password_hash(&self, user_id: i64, hash: &str) -> StoreResult<()>;

    /// Salted one-way comparison; a malformed stored hash never matches.
    fn verify_secret(&self, user: &User, secret: &str) -> bool {
        security::verify_password(&user.password_hash, secret)
    }
}

pub struct SqlCredentialStore {
    store: SharedStore,
}

impl SqlCredentialStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialStore for SqlCredentialStore {
    async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        self.store.find_user(username.trim()).await
    }

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        self.store.get_user(user_id).await
    }

    async fn set_password_hash(&self, user_id: i64, hash: &str) -> StoreResult<()> {
        self.store.set_password_hash(user_id, hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let c = Credential::new("alice", "hunter2");
        let out = format!("{c:?}");
        assert!(out.contains("alice"));
        assert!(!out.contains("hunter2"));
    }
}
