//! Live pipe between an established connection and a local TCP socket

use crate::conn::Conn;
use crate::context::TunnelContext;
use edgetunnel_proto::{Category, Message, MessageType};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// How a pipe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Local socket hit EOF or failed; the remote side was sent `closed`
    Local,
    /// The remote side closed the connection (or its node went away)
    Remote,
}

/// Bytes moved through a pipe
#[derive(Debug, Clone, Copy)]
pub struct PipeStats {
    pub end: PipeEnd,
    pub bytes_to_tunnel: u64,
    pub bytes_to_socket: u64,
}

/// Pumps bytes between `conn` and `socket` until either side closes
///
/// Outgoing data is addressed to `node`. On exit the connection is unbound
/// from its node and removed from the registry.
pub struct Pipe {
    ctx: Arc<TunnelContext>,
    node: String,
    category: Category,
    conn: Arc<Conn>,
}

impl Pipe {
    pub fn new(ctx: Arc<TunnelContext>, node: &str, category: Category, conn: Arc<Conn>) -> Self {
        Self {
            ctx,
            node: node.to_string(),
            category,
            conn,
        }
    }

    pub async fn run(self, socket: TcpStream) -> PipeStats {
        let uid = self.conn.uid().to_string();
        let (mut reader, mut writer) = socket.into_split();

        let mut bytes_to_tunnel = 0u64;
        let mut bytes_to_socket = 0u64;

        let socket_to_tunnel = async {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        debug!(uid = %uid, "Local socket closed");
                        break;
                    }
                    Ok(n) => {
                        let msg = Message::forward(&self.node, self.category, &uid, buffer[..n].to_vec());
                        if let Err(e) = self.ctx.send_to_node(msg).await {
                            warn!(uid = %uid, error = %e, "Could not forward data into tunnel");
                            return PipeEnd::Remote;
                        }
                        bytes_to_tunnel += n as u64;
                    }
                    Err(e) => {
                        debug!(uid = %uid, error = %e, "Local socket read failed");
                        break;
                    }
                }
            }
            PipeEnd::Local
        };

        let tunnel_to_socket = async {
            while let Some(msg) = self.conn.recv().await {
                match msg.msg_type {
                    MessageType::Forward => {
                        if let Err(e) = writer.write_all(&msg.data).await {
                            debug!(uid = %uid, error = %e, "Local socket write failed");
                            return PipeEnd::Local;
                        }
                        bytes_to_socket += msg.data.len() as u64;
                    }
                    MessageType::Closed => {
                        debug!(uid = %uid, "Remote side closed connection");
                        break;
                    }
                    other => {
                        debug!(uid = %uid, msg_type = %other, "Ignoring message on live connection");
                    }
                }
            }
            let _ = writer.shutdown().await;
            PipeEnd::Remote
        };

        let end = tokio::select! {
            end = socket_to_tunnel => end,
            end = tunnel_to_socket => end,
        };

        if end == PipeEnd::Local {
            let msg = Message::closed(&self.node, self.category, &uid);
            if let Err(e) = self.ctx.send_to_node(msg).await {
                debug!(uid = %uid, error = %e, "Could not send closed to remote side");
            }
        }

        if let Some(node) = self.ctx.route_node(&self.node).await {
            node.unbind_conn(&uid);
        }
        self.ctx.conns().remove_conn(&uid);

        info!(
            uid = %uid,
            node = %self.node,
            end = ?end,
            bytes_to_tunnel,
            bytes_to_socket,
            "Connection finished"
        );

        PipeStats {
            end,
            bytes_to_tunnel,
            bytes_to_socket,
        }
    }
}
