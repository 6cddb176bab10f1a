//! Shared tunnel context
//!
//! One [`TunnelContext`] per process holds the node, connection and protocol
//! registries. It is created once at startup and passed (as `Arc`) to every
//! server, agent, pump and handler.

use crate::config::TunnelConfig;
use crate::conn::ConnRegistry;
use crate::error::{HandlerError, TunnelError};
use crate::node::{DetachedState, Node, NodeRegistry};
use crate::protocol::{handler, ProtocolRegistry};
use edgetunnel_proto::{Category, Message, MessageType, NODE_TOPIC};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which side of the tunnel this process is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepts edge streams; relays between nodes
    Cloud,
    /// Holds a single uplink node named after itself
    Edge { node: String },
}

#[derive(Debug)]
pub struct TunnelContext {
    role: Role,
    config: TunnelConfig,
    nodes: NodeRegistry,
    conns: ConnRegistry,
    protocols: ProtocolRegistry,
}

impl TunnelContext {
    /// Build a context with the `stream` module loaded
    pub async fn new(role: Role, config: TunnelConfig) -> Arc<Self> {
        let ctx = Arc::new(Self {
            nodes: NodeRegistry::new(config.channel_capacity),
            conns: ConnRegistry::new(config.channel_capacity),
            protocols: ProtocolRegistry::new(),
            role,
            config,
        });

        ctx.protocols.add_module(Category::Stream).await;
        ctx.protocols
            .register_handler(
                Category::Stream,
                MessageType::Closed,
                handler(stream_closed_handler),
            )
            .await;

        ctx
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_cloud(&self) -> bool {
        self.role == Role::Cloud
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn conns(&self) -> &ConnRegistry {
        &self.conns
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// Register a node, tearing down any node it supersedes
    pub async fn add_node(&self, name: &str) -> Arc<Node> {
        let (node, old) = self.nodes.add_node(name).await;
        if let Some(old) = old {
            info!(
                node = %name,
                old_connected_at = %old.connected_at(),
                "Superseding previous stream for node"
            );
            self.teardown(&old).await;
        }
        node
    }

    /// Remove the node registered under `name`, notifying everything bound to it
    pub async fn remove_node(&self, name: &str) -> bool {
        match self.nodes.get_node(name).await {
            Some(node) => self.remove_node_instance(&node).await,
            None => false,
        }
    }

    /// Remove `node` if it is still the live instance for its name
    ///
    /// Bound connections receive `closed` before the registry entry goes away.
    pub async fn remove_node_instance(&self, node: &Arc<Node>) -> bool {
        if !self.nodes.is_current(node).await {
            return false;
        }
        self.teardown(node).await;
        self.nodes.remove_instance(node).await
    }

    async fn teardown(&self, node: &Arc<Node>) {
        let DetachedState { conns, pairs } = node.detach();
        let wait = self.config.close_notify_timeout;

        // Concurrently, so a few full channels cost one timeout in total
        join_all(self.conns.get_conns(&conns).into_iter().map(|conn| async move {
            let msg = Message::closed(node.name(), Category::Stream, conn.uid());
            if tokio::time::timeout(wait, conn.send(msg)).await.is_err() {
                warn!(node = %node.name(), uid = %conn.uid(), "Timed out notifying connection of node close");
            }
        }))
        .await;

        for (uid, peer) in pairs {
            let Some(peer_node) = self.nodes.get_node(&peer).await else {
                continue;
            };
            peer_node.unbind_pair(&uid);
            let msg = Message::closed(&peer, Category::Stream, &uid);
            match tokio::time::timeout(wait, peer_node.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %peer, uid = %uid, error = %e, "Paired node already gone"),
                Err(_) => warn!(peer = %peer, uid = %uid, "Timed out notifying paired node"),
            }
        }

        node.stop();

        debug!(node = %node.name(), conns = conns.len(), "Node torn down");
    }

    /// The node a message addressed to `name` should go out on
    ///
    /// An edge has a single uplink, so anything not registered locally goes
    /// there.
    pub async fn route_node(&self, name: &str) -> Option<Arc<Node>> {
        if let Some(node) = self.nodes.get_node(name).await {
            return Some(node);
        }
        match &self.role {
            Role::Edge { node } => self.nodes.get_node(node).await,
            Role::Cloud => None,
        }
    }

    /// Enqueue `msg` on the node named by `msg.node`
    pub async fn send_to_node(&self, msg: Message) -> Result<(), TunnelError> {
        let node = self
            .route_node(&msg.node)
            .await
            .ok_or_else(|| TunnelError::NodeNotFound(msg.node.clone()))?;
        node.send(msg).await
    }

    /// Enqueue `msg` on the connection named by `msg.topic`
    pub async fn send_to_conn(&self, msg: Message) -> Result<(), TunnelError> {
        match self.conns.get_conn(&msg.topic) {
            Some(conn) => conn.send(msg).await,
            None => {
                if self.conns.was_expired(&msg.topic) {
                    debug!(
                        uid = %msg.topic,
                        msg_type = %msg.msg_type,
                        "Late reply for timed-out connection dropped"
                    );
                } else {
                    warn!(
                        uid = %msg.topic,
                        node = %msg.node,
                        msg_type = %msg.msg_type,
                        "Message for unknown connection dropped"
                    );
                }
                Err(TunnelError::ConnNotFound(msg.topic))
            }
        }
    }

    /// Run the handler registered for the message, if any
    pub async fn dispatch(self: &Arc<Self>, msg: Message) {
        let (category, msg_type) = (msg.category, msg.msg_type);

        let Some(handler) = self.protocols.get_handler(category, msg_type).await else {
            debug!(category = %category, msg_type = %msg_type, topic = %msg.topic, "No handler for message");
            return;
        };

        if let Err(e) = handler(self.clone(), msg).await {
            warn!(category = %category, msg_type = %msg_type, error = %e, "Handler failed");
        }
    }
}

/// Forward connection-scoped `closed` messages; node-scoped ones need no action
async fn stream_closed_handler(ctx: Arc<TunnelContext>, msg: Message) -> Result<(), HandlerError> {
    if msg.topic == NODE_TOPIC {
        return Ok(());
    }
    route_to_conn(&ctx, msg).await
}

/// Deliver a message to its connection; an unknown uid is not an error
pub(crate) async fn route_to_conn(ctx: &TunnelContext, msg: Message) -> Result<(), HandlerError> {
    match ctx.send_to_conn(msg).await {
        Ok(()) | Err(TunnelError::ConnNotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
