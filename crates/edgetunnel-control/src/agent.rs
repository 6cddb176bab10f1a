//! Edge-side uplink
//!
//! Opens the single stream to the cloud, presents the node credential,
//! registers the uplink node and runs the pump with a heartbeat monitor
//! until the stream ends.

use crate::context::TunnelContext;
use crate::error::TunnelError;
use crate::heartbeat::{FatalHook, HeartbeatMonitor};
use crate::pump::StreamPump;
use edgetunnel_auth::Credential;
use edgetunnel_proto::Frame;
use edgetunnel_transport::{FrameSink, FrameSource, TransportConnector, TransportStream};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cloud tunnel address (host:port)
    pub cloud_addr: String,

    /// Name this edge registers under
    pub node_name: String,

    /// Token matching the cloud's credentials file
    pub token: String,
}

pub struct EdgeAgent {
    ctx: Arc<TunnelContext>,
    config: AgentConfig,
    fatal: FatalHook,
}

impl EdgeAgent {
    pub fn new(ctx: Arc<TunnelContext>, config: AgentConfig, fatal: FatalHook) -> Self {
        Self { ctx, config, fatal }
    }

    /// Connect to the cloud and run until the uplink ends
    pub async fn run<C: TransportConnector>(&self, connector: &C) -> Result<(), TunnelError> {
        info!(cloud = %self.config.cloud_addr, node = %self.config.node_name, "Connecting to cloud");
        let stream = connector.connect(&self.config.cloud_addr).await?;
        self.run_stream(stream).await
    }

    /// Authenticate on an already connected stream and pump it
    pub async fn run_stream<T: TransportStream>(&self, mut stream: T) -> Result<(), TunnelError> {
        let credential = Credential::new(&self.config.node_name, &self.config.token)
            .encode()
            .map_err(|e| TunnelError::Handshake(format!("cannot encode credential: {}", e)))?;
        stream.send_frame(Frame::Open { credential }).await?;

        let wait = self.ctx.config().handshake_timeout;
        let verdict = tokio::time::timeout(wait, stream.recv_frame())
            .await
            .map_err(|_| TunnelError::Handshake(format!("no reply from cloud within {:?}", wait)))??;

        match verdict {
            Some(Frame::Accepted { node }) => {
                info!(node = %node, "Stream accepted by cloud");
            }
            Some(Frame::Rejected { reason }) => {
                error!(reason = %reason, "Stream rejected by cloud");
                return Err(TunnelError::AuthRejected(reason));
            }
            Some(other) => {
                return Err(TunnelError::Handshake(format!(
                    "expected accept or reject, got {:?}",
                    other
                )));
            }
            None => {
                return Err(TunnelError::Handshake(
                    "cloud closed stream during handshake".to_string(),
                ));
            }
        }

        let node = self.ctx.add_node(&self.config.node_name).await;
        let monitor = HeartbeatMonitor::new(self.ctx.config().heartbeat_interval, self.fatal.clone());
        let heartbeat_state = monitor.state();
        let heartbeat = monitor.spawn(node.clone());

        let (sink, source) = stream.split();
        let result = StreamPump::new(self.ctx.clone(), node.clone())
            .with_heartbeat(heartbeat_state)
            .run(sink, source)
            .await;

        heartbeat.abort();
        self.ctx.remove_node_instance(&node).await;
        info!(node = %self.config.node_name, "Uplink closed");
        result
    }
}
