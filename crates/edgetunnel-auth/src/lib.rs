//! Stream authentication for edge nodes
//!
//! An edge presents a JSON credential `{nodename, token}` when it opens its
//! stream. The cloud compares it against an in-memory cache that is
//! periodically refreshed from a flat `name:token` file.

pub mod cache;
pub mod credential;
pub mod token;
pub mod validator;

pub use cache::{parse_tokens, TokenCache, TokenCacheError, DEFAULT_ENTRY};
pub use credential::Credential;
pub use token::{Token, TokenError, TokenGenerator};
pub use validator::{AuthError, StreamAuthenticator, TokenAuthenticator};

// Re-export useful types
pub use async_trait::async_trait;
