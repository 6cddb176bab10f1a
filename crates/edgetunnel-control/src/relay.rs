//! Cloud-side relay between edge nodes
//!
//! A `connecting` message whose `node` names another registered edge is not
//! resolved locally: the cloud pairs the two nodes under the connection uid
//! and forwards every message for that uid from one side to the other.

use crate::context::TunnelContext;
use crate::node::Node;
use edgetunnel_proto::{Message, MessageType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Forward `msg` to its paired node if it belongs to a relayed connection
///
/// Returns the message back when it is for local handling.
pub(crate) async fn relay(
    ctx: &TunnelContext,
    source: &Arc<Node>,
    msg: Message,
) -> Option<Message> {
    if let Some(peer) = source.pair_of(&msg.topic) {
        forward_paired(ctx, source, &peer, msg).await;
        return None;
    }

    if msg.msg_type != MessageType::Connecting || msg.node == source.name() {
        return Some(msg);
    }

    let uid = msg.topic.clone();
    let Some(target) = ctx.nodes().get_node(&msg.node).await else {
        warn!(from = %source.name(), to = %msg.node, uid = %uid, "Relay target not connected");
        let reason = format!("node {} is not connected", msg.node);
        let reply = Message::connect_failed(&msg.node, msg.category, &uid, &reason);
        if let Err(e) = source.send(reply).await {
            debug!(node = %source.name(), error = %e, "Could not report relay failure");
        }
        return None;
    };

    source.bind_pair(&uid, target.name());
    target.bind_pair(&uid, source.name());
    info!(from = %source.name(), to = %target.name(), uid = %uid, "Relaying connection");

    let category = msg.category;
    let to = msg.node.clone();
    if let Err(e) = target.send(msg).await {
        source.unbind_pair(&uid);
        target.unbind_pair(&uid);
        let reply = Message::connect_failed(&to, category, &uid, &e.to_string());
        let _ = source.send(reply).await;
    }
    None
}

async fn forward_paired(ctx: &TunnelContext, source: &Arc<Node>, peer: &str, msg: Message) {
    let uid = msg.topic.clone();
    let terminal = matches!(msg.msg_type, MessageType::Closed | MessageType::ConnectFailed);
    let peer_node = ctx.nodes().get_node(peer).await;

    if terminal {
        source.unbind_pair(&uid);
        if let Some(peer_node) = &peer_node {
            peer_node.unbind_pair(&uid);
        }
        debug!(from = %source.name(), to = %peer, uid = %uid, "Relayed connection finished");
    }

    match peer_node {
        Some(peer_node) => {
            if let Err(e) = peer_node.send(msg).await {
                debug!(to = %peer, uid = %uid, error = %e, "Paired node stopped, message dropped");
            }
        }
        None => debug!(to = %peer, uid = %uid, "Paired node gone, message dropped"),
    }
}
