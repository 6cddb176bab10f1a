//! In-process duplex transport
//!
//! Two connected [`MemoryStream`]s behave like the two ends of a TCP
//! transport: dropping or finishing one side's sink makes the other side's
//! source return `None`.

use crate::{FrameSink, FrameSource, TransportError, TransportResult, TransportStream};
use async_trait::async_trait;
use edgetunnel_proto::Frame;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx.take();
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}

/// One end of an in-process duplex pair
#[derive(Debug)]
pub struct MemoryStream {
    sink: MemorySink,
    source: MemorySource,
    label: String,
}

#[async_trait]
impl FrameSink for MemoryStream {
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        self.sink.send_frame(frame).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.sink.finish().await
    }
}

#[async_trait]
impl FrameSource for MemoryStream {
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        self.source.recv_frame().await
    }
}

impl TransportStream for MemoryStream {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (self.sink, self.source)
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

/// Create two connected streams with `capacity` frames buffered per direction
pub fn memory_pair(capacity: usize) -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = MemoryStream {
        sink: MemorySink { tx: Some(a_tx) },
        source: MemorySource { rx: a_rx },
        label: "memory:a".to_string(),
    };
    let b = MemoryStream {
        sink: MemorySink { tx: Some(b_tx) },
        source: MemorySource { rx: b_rx },
        label: "memory:b".to_string(),
    };

    (a, b)
}
