//! Caller identity resolution.
//!
//! The engine calls an `AuthGate` once at the start of every operation and
//! works only with the resolved `User` afterwards.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::User;
use crate::store::QueueStore;

#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Resolve a bearer token or session identifier to a user.
    async fn resolve(&self, credential: &str) -> Result<User>;
}

/// Resolves bearer tokens against the users in a `QueueStore`.
pub struct TokenGate<S: ?Sized> {
    store: Arc<S>,
}

impl<S: QueueStore + ?Sized> TokenGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: QueueStore + ?Sized> AuthGate for TokenGate<S> {
    async fn resolve(&self, credential: &str) -> Result<User> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(Error::Unauthorized);
        }
        self.store
            .user_by_token(credential)
            .await?
            .ok_or(Error::Unauthorized)
    }
}
