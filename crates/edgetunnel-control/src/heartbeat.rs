//! Edge-side heartbeat monitor
//!
//! Sends a heartbeat on the uplink every interval. The inbound loop acks each
//! echo from the cloud; if two consecutive intervals pass without an ack the
//! uplink is considered dead, the outbound loop is stopped and the fatal hook
//! runs. The monitor never waits on the outbound channel: a heartbeat that
//! does not fit is skipped and the interval counts as missed.

use crate::error::TunnelError;
use crate::node::Node;
use edgetunnel_proto::Message;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Consecutive silent intervals tolerated before the link is declared dead
pub const MAX_MISSED_HEARTBEATS: u32 = 2;

/// Shortest heartbeat period the monitor will run with
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Called once with a reason when the uplink is declared dead
///
/// The binary exits the process here; tests record the call.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Heartbeat bookkeeping shared between the monitor and the inbound loop
#[derive(Debug, Default)]
pub struct HeartbeatState {
    awaiting: AtomicBool,
    missed: AtomicU32,
}

impl HeartbeatState {
    /// Record heartbeat traffic from the peer
    pub fn ack(&self) {
        self.awaiting.store(false, Ordering::SeqCst);
    }

    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    /// Advance one interval; returns the consecutive miss count
    fn tick(&self) -> u32 {
        if self.awaiting.swap(true, Ordering::SeqCst) {
            self.missed.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.missed.store(0, Ordering::SeqCst);
            0
        }
    }
}

pub struct HeartbeatMonitor {
    interval: Duration,
    state: Arc<HeartbeatState>,
    fatal: FatalHook,
}

impl HeartbeatMonitor {
    /// `interval` is raised to [`MIN_HEARTBEAT_INTERVAL`] if shorter
    pub fn new(interval: Duration, fatal: FatalHook) -> Self {
        Self {
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            state: Arc::new(HeartbeatState::default()),
            fatal,
        }
    }

    /// State handle for the inbound loop to ack on
    pub fn state(&self) -> Arc<HeartbeatState> {
        self.state.clone()
    }

    /// Run until the uplink is declared dead, the node stops accepting
    /// messages, or the handle is aborted
    pub fn spawn(self, node: Arc<Node>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);

            loop {
                ticker.tick().await;

                let missed = self.state.tick();
                if missed >= MAX_MISSED_HEARTBEATS {
                    let reason = format!(
                        "no heartbeat from cloud for {} intervals of {:?}",
                        missed, self.interval
                    );
                    error!(node = %node.name(), missed, "Uplink heartbeat lost");

                    node.stop();
                    (self.fatal)(&reason);
                    return;
                }
                if missed > 0 {
                    warn!(node = %node.name(), missed, "Heartbeat not acknowledged");
                }

                match node.try_send(Message::heartbeat(node.name())) {
                    Ok(()) => {}
                    Err(TunnelError::ChannelFull(_)) => {
                        warn!(node = %node.name(), "Uplink channel full, heartbeat skipped");
                    }
                    Err(_) => {
                        debug!(node = %node.name(), "Uplink closed, heartbeat monitor stopping");
                        return;
                    }
                }
            }
        })
    }
}
