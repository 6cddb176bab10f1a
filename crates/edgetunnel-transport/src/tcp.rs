//! Length-prefixed frames over plain TCP

use crate::{
    FrameSink, FrameSource, TransportConnector, TransportError, TransportListener,
    TransportResult, TransportStream,
};
use async_trait::async_trait;
use edgetunnel_proto::{Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// Write half of a TCP transport
#[derive(Debug)]
pub struct TcpFrameSink {
    inner: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

/// Read half of a TCP transport
#[derive(Debug)]
pub struct TcpFrameSource {
    inner: FramedRead<OwnedReadHalf, FrameCodec>,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// A framed TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    sink: TcpFrameSink,
    source: TcpFrameSource,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> TransportResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        Ok(Self {
            sink: TcpFrameSink {
                inner: FramedWrite::new(write, FrameCodec),
            },
            source: TcpFrameSource {
                inner: FramedRead::new(read, FrameCodec),
            },
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl FrameSink for TcpTransport {
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        self.sink.send_frame(frame).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.sink.finish().await
    }
}

#[async_trait]
impl FrameSource for TcpTransport {
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        self.source.recv_frame().await
    }
}

impl TransportStream for TcpTransport {
    type Sink = TcpFrameSink;
    type Source = TcpFrameSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (self.sink, self.source)
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Accepts edge streams on a TCP socket
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!("Transport listener bound to {}", listener.local_addr()?);
        Ok(Self { listener })
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpTransport;

    async fn accept(&self) -> TransportResult<(Self::Stream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((TcpTransport::new(stream)?, peer))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Opens the outbound TCP stream from an edge node
#[derive(Debug, Clone)]
pub struct TcpTransportConnector {
    connect_timeout: Duration,
}

impl TcpTransportConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl TransportConnector for TcpTransportConnector {
    type Stream = TcpTransport;

    async fn connect(&self, addr: &str) -> TransportResult<Self::Stream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;

        TcpTransport::new(stream)
    }
}
