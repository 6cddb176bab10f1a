//! Tunnel engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of every node and connection channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Bounded capacity of node outbound and connection inbound channels
    pub channel_capacity: usize,

    /// How long a connect handshake waits for `connected`/`connect-failed`
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Edge heartbeat period; two silent periods are fatal
    #[serde(
        serialize_with = "duration_secs::serialize",
        deserialize_with = "duration_secs::deserialize_nonzero"
    )]
    pub heartbeat_interval: Duration,

    /// Deadline for the open/accept exchange on a new stream
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Deadline for dialing a target address during connect resolution
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// How long teardown waits to push `closed` into a full channel
    #[serde(with = "duration_secs")]
    pub close_notify_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            close_notify_timeout: Duration::from_secs(1),
        }
    }
}

/// Durations as (fractional) seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration: {} seconds",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    pub fn deserialize_nonzero<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = deserialize(deserializer)?;
        if value.is_zero() {
            return Err(serde::de::Error::custom("duration must be greater than zero"));
        }
        Ok(value)
    }
}
