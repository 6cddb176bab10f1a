//! Tunnel engine errors

use edgetunnel_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Connection not found: {0}")]
    ConnNotFound(String),

    #[error("Connection already exists: {0}")]
    DuplicateConn(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Channel full: {0}")]
    ChannelFull(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Stream rejected: {0}")]
    AuthRejected(String),

    #[error("Stream handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a protocol handler; logged by dispatch, never propagated
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}
