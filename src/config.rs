//! YAML configuration file for the `edgetunnel` binary
//!
//! Every section is optional; command-line flags and `EDGETUNNEL_*`
//! environment variables override what the file sets.

use anyhow::{Context, Result};
use edgetunnel_control::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Engine tuning shared by both roles
    pub tunnel: TunnelConfig,
    pub cloud: CloudSection,
    pub edge: EdgeSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    /// Address edges connect to
    pub listen: Option<String>,
    pub tokens: Option<TokenCacheConfig>,
    /// `LISTEN=NODE/TARGET` forwards into edge networks
    pub forwards: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeSection {
    pub cloud_addr: Option<String>,
    pub node_name: Option<String>,
    pub token: Option<String>,
    /// `LISTEN=NODE/TARGET` forwards out through the cloud
    pub forwards: Vec<String>,
    /// Targets this edge may dial; empty allows everything
    pub allow: Vec<String>,
}

/// Credentials file and how often it is re-read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheConfig {
    pub path: PathBuf,
    /// Seconds between reloads
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

fn default_refresh_interval() -> u64 {
    10
}

/// Load configuration from a YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
tunnel:
  connect_timeout: 2.5
  heartbeat_interval: 15
cloud:
  listen: 0.0.0.0:9000
  tokens:
    path: /etc/edgetunnel/tokens
  forwards:
    - 127.0.0.1:2222=edge-1/127.0.0.1:22
edge:
  node_name: edge-1
  allow: ["127.0.0.1:22"]
"#
        )
        .unwrap();

        let config = load_config_file(file.path()).unwrap();

        assert_eq!(config.tunnel.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.tunnel.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.tunnel.channel_capacity, 1000);
        assert_eq!(config.cloud.listen.as_deref(), Some("0.0.0.0:9000"));

        let tokens = config.cloud.tokens.unwrap();
        assert_eq!(tokens.path, PathBuf::from("/etc/edgetunnel/tokens"));
        assert_eq!(tokens.refresh_interval, 10);

        assert_eq!(config.cloud.forwards.len(), 1);
        assert_eq!(config.edge.node_name.as_deref(), Some("edge-1"));
        assert!(config.edge.cloud_addr.is_none());
        assert_eq!(config.edge.allow, vec!["127.0.0.1:22"]);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = load_config_file(file.path()).unwrap();

        assert_eq!(config.tunnel, TunnelConfig::default());
        assert!(config.cloud.listen.is_none());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config_file(Path::new("/nonexistent/edgetunnel.yaml")).is_err());
    }
}
