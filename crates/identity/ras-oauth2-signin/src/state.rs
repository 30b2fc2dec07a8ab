//! OAuth2 state payloads, protection and replay tracking for CSRF protection.

use crate::claims::AuthenticationProperties;
use crate::error::StateError;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bundle round-tripped through the provider inside the `state` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub properties: AuthenticationProperties,
    pub correlation_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StatePayload {
    pub fn new(properties: AuthenticationProperties, lifetime: Duration) -> Self {
        let issued_at = Utc::now();

        Self {
            properties,
            correlation_id: generate_correlation_id(),
            issued_at,
            expires_at: issued_at + lifetime,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

fn generate_correlation_id() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Serializes and authenticates [`StatePayload`]s into URL-safe tokens.
pub trait StateProtector: Send + Sync {
    /// Produce a token for the payload. Repeated calls yield different tokens.
    fn protect(&self, payload: &StatePayload) -> Result<String, StateError>;

    /// Verify and decode a token produced by [`protect`](Self::protect).
    ///
    /// Fails on tampering, a foreign key or purpose, and expiry.
    fn unprotect(&self, token: &str) -> Result<StatePayload, StateError>;
}

/// Tracks correlation ids of state tokens that have already been accepted
#[async_trait]
pub trait ConsumedStateStore: Send + Sync {
    /// Mark the id consumed. Returns `false` when it was consumed before.
    async fn consume(&self, correlation_id: &str, expires_at: DateTime<Utc>) -> bool;

    /// Forget ids whose tokens have expired anyway
    async fn cleanup_expired(&self) -> usize;
}

/// In-memory implementation of ConsumedStateStore
pub struct InMemoryConsumedStateStore {
    consumed: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryConsumedStateStore {
    pub fn new() -> Self {
        Self {
            consumed: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryConsumedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsumedStateStore for InMemoryConsumedStateStore {
    async fn consume(&self, correlation_id: &str, expires_at: DateTime<Utc>) -> bool {
        let mut consumed = self.consumed.write().await;

        if consumed.contains_key(correlation_id) {
            return false;
        }

        // Expired tokens are rejected by the protector, so their ids can go
        let now = Utc::now();
        consumed.retain(|_, expiry| *expiry > now);
        consumed.insert(correlation_id.to_string(), expires_at);
        true
    }

    async fn cleanup_expired(&self) -> usize {
        let mut consumed = self.consumed.write().await;
        let now = Utc::now();

        let before = consumed.len();
        consumed.retain(|_, expiry| *expiry > now);
        before - consumed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_correlation_ids_unique() {
        let a = StatePayload::new(AuthenticationProperties::default(), Duration::minutes(5));
        let b = StatePayload::new(AuthenticationProperties::default(), Duration::minutes(5));

        assert_ne!(a.correlation_id, b.correlation_id);
        // 32 bytes base64url without padding
        assert_eq!(a.correlation_id.len(), 43);
        assert!(!a.is_expired());
    }

    #[tokio::test]
    async fn test_consumed_state_store() {
        let store = InMemoryConsumedStateStore::new();
        let expires_at = Utc::now() + Duration::minutes(5);

        assert!(store.consume("abc", expires_at).await);
        // Second use must fail
        assert!(!store.consume("abc", expires_at).await);
        assert!(store.consume("def", expires_at).await);
    }

    #[tokio::test]
    async fn test_expired_consumed_cleanup() {
        let store = InMemoryConsumedStateStore::new();

        // Manually insert an expired entry
        store
            .consumed
            .write()
            .await
            .insert("old".to_string(), Utc::now() - Duration::minutes(1));
        assert!(store.consume("fresh", Utc::now() + Duration::minutes(5)).await);

        // The expired entry was pruned while consuming
        assert_eq!(store.cleanup_expired().await, 0);
        assert_eq!(store.consumed.read().await.len(), 1);

        store
            .consumed
            .write()
            .await
            .insert("stale".to_string(), Utc::now() - Duration::seconds(1));
        assert_eq!(store.cleanup_expired().await, 1);
    }
}
