//! Stream authenticator trait and the token-cache implementation

use crate::cache::TokenCache;
use crate::credential::Credential;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("No token configured for node {0}")]
    UnknownNode(String),

    #[error("Token mismatch for node {0}")]
    TokenMismatch(String),
}

/// Validates the credential an edge presents when opening its stream
///
/// Returns the authenticated node name. Implementations must not allocate
/// any per-node state; that only happens after a successful return.
#[async_trait]
pub trait StreamAuthenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<String, AuthError>;
}

/// Compares `{nodename, token}` credentials against a [`TokenCache`]
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    cache: Arc<TokenCache>,
}

impl TokenAuthenticator {
    pub fn new(cache: Arc<TokenCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }
}

#[async_trait]
impl StreamAuthenticator for TokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<String, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let credential = Credential::decode(credential)
            .map_err(|e| AuthError::MalformedCredential(e.to_string()))?;

        if credential.nodename.is_empty() {
            return Err(AuthError::MalformedCredential(
                "empty node name".to_string(),
            ));
        }

        let expected = self
            .cache
            .lookup(&credential.nodename)
            .await
            .ok_or_else(|| AuthError::UnknownNode(credential.nodename.clone()))?;

        if !tokens_match(expected.as_bytes(), credential.token.as_bytes()) {
            warn!(node = %credential.nodename, "Token mismatch");
            return Err(AuthError::TokenMismatch(credential.nodename));
        }

        debug!(node = %credential.nodename, "Credential accepted");
        Ok(credential.nodename)
    }
}

// Comparison time does not depend on where the first differing byte is
fn tokens_match(expected: &[u8], presented: &[u8]) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
