//! Transport abstraction layer for edge tunnel streams
//!
//! An edge node owns exactly one physical duplex stream to the cloud. This
//! crate provides the traits the tunnel engine drives that stream through,
//! without coupling it to a specific network stack:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            edgetunnel-control (stream pump)              │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ FrameSink / FrameSource
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │  tcp: length-prefixed     │  memory: in-process duplex   │
//! │  frames over TcpStream    │  pair (tests, embedding)     │
//! └──────────────────────────┴──────────────────────────────┘
//! ```

use async_trait::async_trait;
use edgetunnel_proto::{CodecError, Frame, Message};
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub mod memory;
pub mod tcp;

pub use memory::{memory_pair, MemorySink, MemorySource, MemoryStream};
pub use tcp::{TcpFrameSink, TcpFrameSource, TcpTransport, TcpTransportConnector, TcpTransportListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a transport stream
#[async_trait]
pub trait FrameSink: Send + Debug {
    /// Send one frame
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Send a tunnel message
    async fn send_message(&mut self, message: Message) -> TransportResult<()> {
        self.send_frame(Frame::Message(message)).await
    }
}

/// Read half of a transport stream
#[async_trait]
pub trait FrameSource: Send + Debug {
    /// Receive the next frame
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>>;

    /// Receive the next tunnel message; any other frame is a protocol error
    async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        match self.recv_frame().await? {
            Some(Frame::Message(message)) => Ok(Some(message)),
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Unexpected frame on established stream: {:?}",
                other
            ))),
            None => Ok(None),
        }
    }
}

/// A full duplex stream that can be split into independently owned halves
pub trait TransportStream: FrameSink + FrameSource {
    type Sink: FrameSink + 'static;
    type Source: FrameSource + 'static;

    /// Split into write and read halves
    fn split(self) -> (Self::Sink, Self::Source);

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// Server-side: accepts incoming edge streams
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Stream: TransportStream + 'static;

    /// Accept an incoming stream
    async fn accept(&self) -> TransportResult<(Self::Stream, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// Client-side: opens the outbound stream to the cloud
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Stream: TransportStream + 'static;

    /// Connect to `addr` (host:port)
    async fn connect(&self, addr: &str) -> TransportResult<Self::Stream>;
}
