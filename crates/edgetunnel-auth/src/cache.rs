//! Node token cache backed by a flat credentials file
//!
//! The file holds one `name:token` pair per line. Blank lines and lines
//! starting with `#` are ignored. An entry named [`DEFAULT_ENTRY`] applies to
//! every node without its own line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fallback entry for nodes without their own line
pub const DEFAULT_ENTRY: &str = "default";

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error("Failed to read token file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed token entry on line {line}: expected 'name:token'")]
    MalformedLine { line: usize },
}

/// Parse `name:token` lines into a map
pub fn parse_tokens(content: &str) -> Result<HashMap<String, String>, TokenCacheError> {
    let mut tokens = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, token) = line
            .split_once(':')
            .ok_or(TokenCacheError::MalformedLine { line: idx + 1 })?;
        let (name, token) = (name.trim(), token.trim());

        if name.is_empty() || token.is_empty() || token.contains(':') {
            return Err(TokenCacheError::MalformedLine { line: idx + 1 });
        }

        tokens.insert(name.to_string(), token.to_string());
    }

    Ok(tokens)
}

/// In-memory token map, refreshed from disk
#[derive(Debug)]
pub struct TokenCache {
    path: Option<PathBuf>,
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenCache {
    /// Load the cache from `path`; the initial load must succeed
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TokenCacheError> {
        let path = path.as_ref().to_path_buf();
        let tokens = Self::read_file(&path).await?;

        info!(path = %path.display(), entries = tokens.len(), "Loaded node tokens");

        Ok(Self {
            path: Some(path),
            tokens: RwLock::new(tokens),
        })
    }

    /// Build a cache from fixed entries (no backing file)
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tokens = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self {
            path: None,
            tokens: RwLock::new(tokens),
        }
    }

    async fn read_file(path: &Path) -> Result<HashMap<String, String>, TokenCacheError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| TokenCacheError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
        parse_tokens(&content)
    }

    /// Re-read the backing file, replacing the cache atomically
    ///
    /// On failure the previous entries stay in place.
    pub async fn reload(&self) -> Result<usize, TokenCacheError> {
        let Some(path) = &self.path else {
            return Ok(self.len().await);
        };

        let tokens = Self::read_file(path).await?;
        let count = tokens.len();
        *self.tokens.write().await = tokens;

        debug!(path = %path.display(), entries = count, "Refreshed node tokens");
        Ok(count)
    }

    /// Token expected from `node`, falling back to the default entry
    pub async fn lookup(&self, node: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens
            .get(node)
            .or_else(|| tokens.get(DEFAULT_ENTRY))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reload the cache every `interval` until the handle is aborted
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately

            loop {
                ticker.tick().await;
                if let Err(e) = self.reload().await {
                    warn!(error = %e, "Token refresh failed, keeping previous entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tokens() {
        let tokens = parse_tokens("# nodes\nedge-1:abc\n\n default : xyz \n").unwrap();

        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get("edge-1").map(String::as_str), Some("abc"));
        assert_eq!(tokens.get("default").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(matches!(
            parse_tokens("edge-1:abc\nbroken\n"),
            Err(TokenCacheError::MalformedLine { line: 2 })
        ));
        assert!(parse_tokens("edge-1:").is_err());
        assert!(parse_tokens("edge-1:a:b").is_err());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_default() {
        let cache = TokenCache::from_entries([("edge-1", "abc"), (DEFAULT_ENTRY, "xyz")]);

        assert_eq!(cache.lookup("edge-1").await.as_deref(), Some("abc"));
        assert_eq!(cache.lookup("edge-2").await.as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_lookup_without_default() {
        let cache = TokenCache::from_entries([("edge-1", "abc")]);
        assert_eq!(cache.lookup("edge-2").await, None);
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "edge-1:abc").unwrap();

        let cache = TokenCache::load(file.path()).await.unwrap();
        assert_eq!(cache.lookup("edge-1").await.as_deref(), Some("abc"));

        std::fs::write(file.path(), "edge-1:rotated\nedge-2:new\n").unwrap();
        assert_eq!(cache.reload().await.unwrap(), 2);
        assert_eq!(cache.lookup("edge-1").await.as_deref(), Some("rotated"));
        assert_eq!(cache.lookup("edge-2").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "edge-1:abc").unwrap();

        let cache = TokenCache::load(file.path()).await.unwrap();
        std::fs::write(file.path(), "garbage line\n").unwrap();

        assert!(cache.reload().await.is_err());
        assert_eq!(cache.lookup("edge-1").await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = TokenCache::load("/nonexistent/edgetunnel/tokens").await;
        assert!(matches!(result, Err(TokenCacheError::Read { .. })));
    }
}
