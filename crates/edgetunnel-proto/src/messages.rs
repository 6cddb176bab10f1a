//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol family a message belongs to; selects the handler module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Node-level control (heartbeat, node closed)
    Stream,
    /// Generic TCP forwarding
    Tcp,
    Ssh,
    Https,
    HttpProxy,
    Egress,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Stream,
        Category::Tcp,
        Category::Ssh,
        Category::Https,
        Category::HttpProxy,
        Category::Egress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Stream => "stream",
            Category::Tcp => "tcp",
            Category::Ssh => "ssh",
            Category::Https => "https",
            Category::HttpProxy => "http-proxy",
            Category::Egress => "egress",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Unknown identifier: {0}")]
pub struct UnknownIdentifier(pub String);

impl FromStr for Category {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownIdentifier(s.to_string()))
    }
}

/// Control state or data tag of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Connecting,
    Connected,
    ConnectFailed,
    Closed,
    Heartbeat,
    /// Payload-bearing data on a live connection
    Forward,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connecting => "connecting",
            MessageType::Connected => "connected",
            MessageType::ConnectFailed => "connect-failed",
            MessageType::Closed => "closed",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Forward => "forward",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire unit exchanged over a node's stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Target node name
    pub node: String,
    pub category: Category,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Logical connection id, or [`crate::NODE_TOPIC`] for node-level control
    pub topic: String,
    /// Connect target (only meaningful for `connecting`)
    pub addr: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Message {
    fn control(node: &str, category: Category, msg_type: MessageType, topic: &str) -> Self {
        Self {
            node: node.to_string(),
            category,
            msg_type,
            topic: topic.to_string(),
            addr: String::new(),
            data: Vec::new(),
        }
    }

    pub fn connecting(node: &str, category: Category, topic: &str, addr: &str) -> Self {
        let mut msg = Self::control(node, category, MessageType::Connecting, topic);
        msg.addr = addr.to_string();
        msg
    }

    pub fn connected(node: &str, category: Category, topic: &str) -> Self {
        Self::control(node, category, MessageType::Connected, topic)
    }

    pub fn connect_failed(node: &str, category: Category, topic: &str, reason: &str) -> Self {
        let mut msg = Self::control(node, category, MessageType::ConnectFailed, topic);
        msg.data = reason.as_bytes().to_vec();
        msg
    }

    pub fn closed(node: &str, category: Category, topic: &str) -> Self {
        Self::control(node, category, MessageType::Closed, topic)
    }

    pub fn heartbeat(node: &str) -> Self {
        Self::control(
            node,
            Category::Stream,
            MessageType::Heartbeat,
            crate::NODE_TOPIC,
        )
    }

    /// The `closed`/`stream` signal that stops a node's outbound loop
    pub fn stream_closed(node: &str) -> Self {
        Self::control(node, Category::Stream, MessageType::Closed, crate::NODE_TOPIC)
    }

    pub fn forward(node: &str, category: Category, topic: &str, data: Vec<u8>) -> Self {
        let mut msg = Self::control(node, category, MessageType::Forward, topic);
        msg.data = data;
        msg
    }

    pub fn is_stream_closed(&self) -> bool {
        self.category == Category::Stream
            && self.msg_type == MessageType::Closed
            && self.topic == crate::NODE_TOPIC
    }

    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == MessageType::Heartbeat
    }

    /// Error text carried by a `connect-failed` reply
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Frames exchanged on a physical transport stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame sent by an edge; carries the bearer credential
    Open { credential: String },
    /// Cloud accepted the stream and registered the node
    Accepted { node: String },
    /// Cloud rejected the stream before registering anything
    Rejected { reason: String },
    Message(Message),
}

// Bytes are serialized as a single blob rather than a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
