//! Logical connection registry
//!
//! A [`Conn`] is one end of a tunneled byte stream, keyed by its uid (the
//! `topic` of every message that belongs to it). Its inbound channel is fed by
//! the stream pump and drained by whoever owns the connection: the connect
//! handshake first, then the live pipe.

use crate::error::TunnelError;
use dashmap::DashMap;
use edgetunnel_proto::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

/// Number of timed-out uids remembered for late-reply diagnostics
pub const EXPIRED_HISTORY: usize = 1024;

#[derive(Debug)]
pub struct Conn {
    uid: String,
    tx: mpsc::Sender<Message>,
    rx: AsyncMutex<mpsc::Receiver<Message>>,
}

impl Conn {
    fn new(uid: String, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            uid,
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Enqueue an inbound message; waits while the channel is full
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TunnelError::ChannelClosed(self.uid.clone()))
    }

    /// Next inbound message, in arrival order
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }
}

/// uid -> connection map shared by the pump, handlers and pipes
#[derive(Debug)]
pub struct ConnRegistry {
    conns: DashMap<String, Arc<Conn>>,
    capacity: usize,
    expired: Mutex<VecDeque<String>>,
}

impl ConnRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            conns: DashMap::new(),
            capacity,
            expired: Mutex::new(VecDeque::new()),
        }
    }

    /// Create and register a connection; uids are unique
    pub fn add_conn(&self, uid: &str) -> Result<Arc<Conn>, TunnelError> {
        use dashmap::mapref::entry::Entry;

        match self.conns.entry(uid.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateConn(uid.to_string())),
            Entry::Vacant(slot) => {
                let conn = Arc::new(Conn::new(uid.to_string(), self.capacity));
                slot.insert(conn.clone());
                debug!(uid = %uid, "Connection added");
                Ok(conn)
            }
        }
    }

    pub fn get_conn(&self, uid: &str) -> Option<Arc<Conn>> {
        self.conns.get(uid).map(|entry| entry.value().clone())
    }

    /// Resolve several uids at once; unknown uids are skipped
    pub fn get_conns<'a, I>(&self, uids: I) -> Vec<Arc<Conn>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        uids.into_iter()
            .filter_map(|uid| self.get_conn(uid))
            .collect()
    }

    pub fn remove_conn(&self, uid: &str) -> Option<Arc<Conn>> {
        let removed = self.conns.remove(uid).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!(uid = %uid, "Connection removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Remember a uid whose connect handshake timed out
    pub fn mark_expired(&self, uid: &str) {
        if let Ok(mut expired) = self.expired.lock() {
            if expired.len() >= EXPIRED_HISTORY {
                expired.pop_front();
            }
            expired.push_back(uid.to_string());
        }
    }

    /// Whether `uid` belonged to a handshake that already timed out
    pub fn was_expired(&self, uid: &str) -> bool {
        self.expired
            .lock()
            .map(|expired| expired.iter().any(|u| u == uid))
            .unwrap_or(false)
    }
}
