//! Cloud-side stream acceptor
//!
//! Every accepted stream must open with a credential. Only after it
//! authenticates is a node registered and a pump started; when the pump
//! finishes the node is removed.

use crate::context::TunnelContext;
use crate::error::TunnelError;
use crate::pump::StreamPump;
use edgetunnel_auth::StreamAuthenticator;
use edgetunnel_proto::Frame;
use edgetunnel_transport::{FrameSink, FrameSource, TransportListener, TransportStream};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct TunnelServer {
    ctx: Arc<TunnelContext>,
    authenticator: Arc<dyn StreamAuthenticator>,
}

impl TunnelServer {
    pub fn new(ctx: Arc<TunnelContext>, authenticator: Arc<dyn StreamAuthenticator>) -> Self {
        Self { ctx, authenticator }
    }

    /// Accept streams until the listener fails
    pub async fn serve<L: TransportListener>(&self, listener: L) -> Result<(), TunnelError> {
        info!(addr = ?listener.local_addr().ok(), "Tunnel server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(e.into());
                }
            };

            debug!(peer = %peer, "Stream accepted");
            let ctx = self.ctx.clone();
            let authenticator = self.authenticator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(ctx, authenticator, stream).await {
                    warn!(peer = %peer, error = %e, "Stream ended with error");
                }
            });
        }
    }
}

/// Authenticate one stream and pump it for the node's lifetime
pub async fn handle_stream<T: TransportStream>(
    ctx: Arc<TunnelContext>,
    authenticator: Arc<dyn StreamAuthenticator>,
    mut stream: T,
) -> Result<(), TunnelError> {
    let peer = stream.peer();
    let wait = ctx.config().handshake_timeout;

    let first = tokio::time::timeout(wait, stream.recv_frame())
        .await
        .map_err(|_| TunnelError::Handshake(format!("no open frame within {:?}", wait)))??;

    let credential = match first {
        Some(Frame::Open { credential }) => credential,
        Some(other) => {
            return Err(TunnelError::Handshake(format!(
                "expected open frame, got {:?}",
                other
            )));
        }
        None => return Err(TunnelError::Handshake("stream closed before open".to_string())),
    };

    let node_name = match authenticator.authenticate(&credential).await {
        Ok(name) => name,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Stream rejected");
            let reason = e.to_string();
            let _ = stream
                .send_frame(Frame::Rejected {
                    reason: reason.clone(),
                })
                .await;
            let _ = stream.finish().await;
            return Err(TunnelError::AuthRejected(reason));
        }
    };

    let node = ctx.add_node(&node_name).await;
    if let Err(e) = stream
        .send_frame(Frame::Accepted {
            node: node_name.clone(),
        })
        .await
    {
        ctx.remove_node_instance(&node).await;
        return Err(e.into());
    }

    info!(peer = %peer, node = %node_name, "Node connected");

    let (sink, source) = stream.split();
    let result = StreamPump::new(ctx.clone(), node.clone())
        .run(sink, source)
        .await;

    ctx.remove_node_instance(&node).await;
    info!(peer = %peer, node = %node_name, "Node disconnected");
    result
}
