//! Stream pump: binds one node to one transport stream
//!
//! The outbound loop drains the node's channel onto the transport until the
//! node is stopped (or it sees the node-scoped `closed` message). The inbound
//! loop reads the transport and hands messages to heartbeat handling, the
//! relay (cloud) or dispatch; when it ends it stops the node. The pump
//! finishes when both loops have exited.

use crate::context::TunnelContext;
use crate::error::TunnelError;
use crate::heartbeat::HeartbeatState;
use crate::node::Node;
use crate::relay::relay;
use edgetunnel_proto::Message;
use edgetunnel_transport::{FrameSink, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct StreamPump {
    ctx: Arc<TunnelContext>,
    node: Arc<Node>,
    heartbeat: Option<Arc<HeartbeatState>>,
}

impl StreamPump {
    pub fn new(ctx: Arc<TunnelContext>, node: Arc<Node>) -> Self {
        Self {
            ctx,
            node,
            heartbeat: None,
        }
    }

    /// Ack heartbeat echoes on `state` instead of answering heartbeats
    pub fn with_heartbeat(mut self, state: Arc<HeartbeatState>) -> Self {
        self.heartbeat = Some(state);
        self
    }

    /// Run both loops until each has exited
    ///
    /// The caller removes the node afterwards.
    pub async fn run<S, R>(self, sink: S, source: R) -> Result<(), TunnelError>
    where
        S: FrameSink + 'static,
        R: FrameSource + 'static,
    {
        let rx = self
            .node
            .take_receiver()
            .await
            .ok_or_else(|| TunnelError::ChannelClosed(self.node.name().to_string()))?;

        info!(node = %self.node.name(), "Stream pump started");

        let outbound = tokio::spawn(outbound_loop(
            self.node.clone(),
            rx,
            sink,
            self.ctx.config().close_notify_timeout,
        ));
        let inbound = tokio::spawn(inbound_loop(
            self.ctx.clone(),
            self.node.clone(),
            self.heartbeat.clone(),
            source,
        ));

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        if let Err(e) = outbound {
            warn!(node = %self.node.name(), error = %e, "Outbound loop panicked");
        }
        if let Err(e) = inbound {
            warn!(node = %self.node.name(), error = %e, "Inbound loop panicked");
        }

        info!(node = %self.node.name(), "Stream pump finished");
        Ok(())
    }
}

async fn outbound_loop<S: FrameSink>(
    node: Arc<Node>,
    mut rx: mpsc::Receiver<Message>,
    mut sink: S,
    finish_wait: Duration,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = node.stopped() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if msg.is_stream_closed() {
            break;
        }

        // A stalled transport must not keep a stopped node alive
        tokio::select! {
            biased;
            _ = node.stopped() => break,
            result = sink.send_message(msg) => {
                if let Err(e) = result {
                    warn!(node = %node.name(), error = %e, "Transport write failed");
                    break;
                }
            }
        }
    }
    debug!(node = %node.name(), "Outbound loop stopped");

    // Dropping the receiver makes further sends to this node fail fast
    drop(rx);
    match tokio::time::timeout(finish_wait, sink.finish()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(node = %node.name(), error = %e, "Transport finish failed"),
        Err(_) => debug!(node = %node.name(), "Transport finish timed out"),
    }
}

async fn inbound_loop<R: FrameSource>(
    ctx: Arc<TunnelContext>,
    node: Arc<Node>,
    heartbeat: Option<Arc<HeartbeatState>>,
    mut source: R,
) {
    loop {
        let msg = match source.recv_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!(node = %node.name(), "Transport closed by peer");
                break;
            }
            Err(e) => {
                warn!(node = %node.name(), error = %e, "Transport read failed");
                break;
            }
        };

        if !ctx.nodes().is_current(&node).await {
            info!(node = %node.name(), "Node superseded by a newer stream");
            break;
        }

        if msg.is_heartbeat() {
            match &heartbeat {
                Some(state) => state.ack(),
                None => {
                    // Echo so the edge sees traffic
                    if let Err(e) = node.send(Message::heartbeat(node.name())).await {
                        debug!(node = %node.name(), error = %e, "Heartbeat echo dropped");
                    }
                }
            }
            continue;
        }

        let msg = if ctx.is_cloud() {
            match relay(&ctx, &node, msg).await {
                Some(msg) => msg,
                None => continue,
            }
        } else {
            msg
        };

        ctx.dispatch(msg).await;
    }

    node.stop();
}
