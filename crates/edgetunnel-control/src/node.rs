//! Node registry
//!
//! A [`Node`] is a peer reachable over one physical stream. Every message
//! destined for it goes through its bounded outbound channel, which the
//! stream pump drains onto the wire in FIFO order. A separate stop signal
//! ends the pump's outbound loop even when that channel is full.

use crate::error::TunnelError;
use chrono::{DateTime, Utc};
use edgetunnel_proto::Message;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::info;

#[derive(Debug)]
pub struct Node {
    name: String,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    conns: StdRwLock<BTreeSet<String>>,
    /// uid -> peer node, for connections relayed through this process
    pairs: StdRwLock<HashMap<String, String>>,
    stop: watch::Sender<bool>,
    connected_at: DateTime<Utc>,
}

impl Node {
    fn new(name: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
            conns: StdRwLock::new(BTreeSet::new()),
            pairs: StdRwLock::new(HashMap::new()),
            stop,
            connected_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue an outbound message; waits while the channel is full
    ///
    /// Fails once the outbound loop has stopped.
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TunnelError::ChannelClosed(self.name.clone()))
    }

    /// Enqueue without waiting; a full channel is reported as `ChannelFull`
    pub fn try_send(&self, msg: Message) -> Result<(), TunnelError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TunnelError::ChannelFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => TunnelError::ChannelClosed(self.name.clone()),
        })
    }

    /// Signal the outbound loop to stop
    ///
    /// Also queues the node-scoped `closed` message when there is room for it.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        let _ = self.tx.try_send(Message::stream_closed(&self.name));
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`Node::stop`] has been called
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Hand the outbound receiver to the stream pump (only once)
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().await.take()
    }

    pub fn bind_conn(&self, uid: &str) {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(uid.to_string());
    }

    pub fn unbind_conn(&self, uid: &str) -> bool {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        conns.remove(uid)
    }

    /// Bound connection uids, ordered
    pub fn conn_ids(&self) -> Vec<String> {
        let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
        conns.iter().cloned().collect()
    }

    fn take_conn_ids(&self) -> Vec<String> {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *conns).into_iter().collect()
    }

    pub fn bind_pair(&self, uid: &str, peer: &str) {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        pairs.insert(uid.to_string(), peer.to_string());
    }

    pub fn unbind_pair(&self, uid: &str) -> Option<String> {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        pairs.remove(uid)
    }

    pub fn pair_of(&self, uid: &str) -> Option<String> {
        let pairs = self.pairs.read().unwrap_or_else(|e| e.into_inner());
        pairs.get(uid).cloned()
    }

    fn take_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pairs).into_iter().collect()
    }

    /// Clear the node's bindings and return them for teardown
    pub fn detach(&self) -> DetachedState {
        DetachedState {
            conns: self.take_conn_ids(),
            pairs: self.take_pairs(),
        }
    }
}

/// Everything a node was holding when it was detached
#[derive(Debug, Default)]
pub struct DetachedState {
    pub conns: Vec<String>,
    pub pairs: Vec<(String, String)>,
}

/// name -> node map; at most one live node per name
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    capacity: usize,
    connected: AtomicUsize,
}

impl NodeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            capacity,
            connected: AtomicUsize::new(0),
        }
    }

    /// Register a fresh node under `name`
    ///
    /// Returns the new node and, if one was registered under the same name,
    /// the node it superseded. The caller is responsible for tearing the old
    /// one down.
    pub async fn add_node(&self, name: &str) -> (Arc<Node>, Option<Arc<Node>>) {
        let node = Arc::new(Node::new(name, self.capacity));
        let old = self
            .nodes
            .write()
            .await
            .insert(name.to_string(), node.clone());

        if old.is_none() {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            node = %name,
            replaced = old.is_some(),
            connected = self.connected_count(),
            "Node registered"
        );

        (node, old)
    }

    pub async fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn node_is_exist(&self, name: &str) -> bool {
        self.nodes.read().await.contains_key(name)
    }

    pub async fn get_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Remove `name` from the registry
    pub async fn remove_node(&self, name: &str) -> Option<Arc<Node>> {
        let removed = self.nodes.write().await.remove(name);
        if removed.is_some() {
            self.connected.fetch_sub(1, Ordering::Relaxed);
            info!(node = %name, connected = self.connected_count(), "Node removed");
        }
        removed
    }

    /// Remove `node` only if it is still the registered instance for its name
    pub async fn remove_instance(&self, node: &Arc<Node>) -> bool {
        let mut nodes = self.nodes.write().await;
        let current = nodes
            .get(node.name())
            .is_some_and(|existing| Arc::ptr_eq(existing, node));
        if current {
            nodes.remove(node.name());
            drop(nodes);
            self.connected.fetch_sub(1, Ordering::Relaxed);
            info!(node = %node.name(), connected = self.connected_count(), "Node removed");
        }
        current
    }

    /// Whether `node` is still the registered instance for its name
    pub async fn is_current(&self, node: &Arc<Node>) -> bool {
        self.nodes
            .read()
            .await
            .get(node.name())
            .is_some_and(|existing| Arc::ptr_eq(existing, node))
    }

    /// Number of registered nodes (the connected-nodes gauge)
    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }
}
