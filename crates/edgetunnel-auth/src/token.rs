//! Token generation for the credentials file

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;

/// Node authentication token
#[derive(Debug, Clone, PartialEq)]
pub struct Token(String);

impl Token {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Token errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

/// Token generator
pub struct TokenGenerator;

impl TokenGenerator {
    /// Generate a random token (two v4 UUIDs of entropy, URL-safe base64)
    pub fn generate() -> Token {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());

        Token(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Validate token format: non-empty URL-safe base64, usable in a `name:token` line
    pub fn validate_format(token: &Token) -> Result<(), TokenError> {
        if token.0.is_empty() || token.0.contains(':') {
            return Err(TokenError::InvalidFormat);
        }

        URL_SAFE_NO_PAD.decode(&token.0)?;
        Ok(())
    }

    /// Credentials file line for `node`
    pub fn credentials_line(node: &str, token: &Token) -> String {
        format!("{}:{}", node, token.as_str())
    }
}
