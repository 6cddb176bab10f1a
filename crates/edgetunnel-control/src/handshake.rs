//! Connect handshake
//!
//! Opens a logical connection to a target address behind a node:
//!
//! ```text
//! add conn + bind --> send connecting --> wait (connect_timeout)
//!                                          |-- connected      => live
//!                                          |-- connect-failed => unwind, error
//!                                          |-- closed         => unwind, error
//!                                          `-- timeout        => unwind, error
//! ```
//!
//! Any reply arriving after the unwind finds no connection and is dropped.

use crate::conn::Conn;
use crate::context::TunnelContext;
use crate::error::TunnelError;
use edgetunnel_proto::{Category, Message, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl TunnelContext {
    /// Open a connection to `addr` via `node`, using the configured timeout
    pub async fn connect_node(
        &self,
        node: &str,
        category: Category,
        addr: &str,
    ) -> Result<Arc<Conn>, TunnelError> {
        self.connect_node_with_timeout(node, category, addr, self.config().connect_timeout)
            .await
    }

    /// Open a connection to `addr` via `node`
    ///
    /// On success the returned connection is registered and bound to the
    /// node; on any failure nothing is left behind.
    pub async fn connect_node_with_timeout(
        &self,
        node: &str,
        category: Category,
        addr: &str,
        wait: Duration,
    ) -> Result<Arc<Conn>, TunnelError> {
        let uplink = self
            .route_node(node)
            .await
            .ok_or_else(|| TunnelError::NodeNotFound(node.to_string()))?;

        let uid = Uuid::new_v4().to_string();
        let conn = self.conns().add_conn(&uid)?;
        uplink.bind_conn(&uid);

        let unwind = || {
            uplink.unbind_conn(&uid);
            self.conns().remove_conn(&uid);
        };

        debug!(node = %node, uid = %uid, addr = %addr, "Connecting");

        if let Err(e) = uplink
            .send(Message::connecting(node, category, &uid, addr))
            .await
        {
            unwind();
            return Err(e);
        }

        let reply = tokio::time::timeout(wait, async {
            loop {
                match conn.recv().await {
                    Some(msg) => match msg.msg_type {
                        MessageType::Connected
                        | MessageType::ConnectFailed
                        | MessageType::Closed => return Some(msg),
                        other => {
                            debug!(uid = %conn.uid(), msg_type = %other, "Ignoring message during connect");
                        }
                    },
                    None => return None,
                }
            }
        })
        .await;

        match reply {
            Ok(Some(msg)) if msg.msg_type == MessageType::Connected => {
                info!(node = %node, uid = %uid, addr = %addr, "Connection established");
                Ok(conn)
            }
            Ok(Some(msg)) if msg.msg_type == MessageType::ConnectFailed => {
                unwind();
                let reason = msg.error_text();
                warn!(node = %node, uid = %uid, addr = %addr, reason = %reason, "Connect failed");
                Err(TunnelError::ConnectFailed(reason))
            }
            Ok(_) => {
                unwind();
                warn!(node = %node, uid = %uid, addr = %addr, "Connection closed during connect");
                Err(TunnelError::ConnectFailed(
                    "connection closed before it was established".to_string(),
                ))
            }
            Err(_) => {
                self.conns().mark_expired(&uid);
                unwind();
                warn!(node = %node, uid = %uid, addr = %addr, timeout = ?wait, "Connect timed out");
                Err(TunnelError::ConnectTimeout(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::context::Role;

    async fn cloud_with_node() -> (Arc<TunnelContext>, tokio::sync::mpsc::Receiver<Message>) {
        let ctx = TunnelContext::new(Role::Cloud, TunnelConfig::default()).await;
        let node = ctx.add_node("edge-1").await;
        let rx = node.take_receiver().await.unwrap();
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_connect_succeeds_on_connected() {
        let (ctx, mut rx) = cloud_with_node().await;

        let responder = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                assert_eq!(msg.msg_type, MessageType::Connecting);
                assert_eq!(msg.addr, "127.0.0.1:22");
                ctx.send_to_conn(Message::connected("edge-1", Category::Tcp, &msg.topic))
                    .await
                    .unwrap();
                msg.topic
            })
        };

        let conn = ctx
            .connect_node("edge-1", Category::Tcp, "127.0.0.1:22")
            .await
            .unwrap();
        let uid = responder.await.unwrap();

        assert_eq!(conn.uid(), uid);
        let node = ctx.nodes().get_node("edge-1").await.unwrap();
        assert_eq!(node.conn_ids(), vec![uid]);
    }

    #[tokio::test]
    async fn test_connect_failed_unwinds() {
        let (ctx, mut rx) = cloud_with_node().await;

        let ctx2 = ctx.clone();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            ctx2.send_to_conn(Message::connect_failed(
                "edge-1",
                Category::Tcp,
                &msg.topic,
                "connection refused",
            ))
            .await
            .unwrap();
        });

        let result = ctx.connect_node("edge-1", Category::Tcp, "10.0.0.1:80").await;

        assert!(matches!(result, Err(TunnelError::ConnectFailed(r)) if r == "connection refused"));
        assert!(ctx.conns().is_empty());
        assert!(ctx.nodes().get_node("edge-1").await.unwrap().conn_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_unwinds_and_drops_late_reply() {
        let (ctx, mut rx) = cloud_with_node().await;

        let result = ctx
            .connect_node_with_timeout("edge-1", Category::Tcp, "10.0.0.1:80", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TunnelError::ConnectTimeout(_))));
        assert!(ctx.conns().is_empty());

        let uid = rx.recv().await.unwrap().topic;
        assert!(ctx.conns().was_expired(&uid));

        let late = ctx
            .send_to_conn(Message::connected("edge-1", Category::Tcp, &uid))
            .await;
        assert!(matches!(late, Err(TunnelError::ConnNotFound(_))));
    }

    #[tokio::test]
    async fn test_node_removed_during_connect() {
        let (ctx, mut rx) = cloud_with_node().await;
        let node = ctx.nodes().get_node("edge-1").await.unwrap();

        let remover = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                assert_eq!(msg.msg_type, MessageType::Connecting);
                assert!(ctx.remove_node("edge-1").await);
            })
        };

        let started = tokio::time::Instant::now();
        let result = ctx
            .connect_node_with_timeout("edge-1", Category::Tcp, "10.0.0.1:80", Duration::from_secs(5))
            .await;
        remover.await.unwrap();

        assert!(matches!(result, Err(TunnelError::ConnectFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(ctx.conns().is_empty());
        assert!(node.conn_ids().is_empty());
        assert!(!ctx.nodes().node_is_exist("edge-1").await);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_node() {
        let ctx = TunnelContext::new(Role::Cloud, TunnelConfig::default()).await;
        let result = ctx.connect_node("ghost", Category::Tcp, "x:1").await;

        assert!(matches!(result, Err(TunnelError::NodeNotFound(_))));
        assert!(ctx.conns().is_empty());
    }
}
