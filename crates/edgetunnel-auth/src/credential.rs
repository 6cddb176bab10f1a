//! Bearer credential carried in the stream's open frame

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub nodename: String,
    pub token: String,
}

impl Credential {
    pub fn new(nodename: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            token: token.into(),
        }
    }

    /// JSON form sent on the wire
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
