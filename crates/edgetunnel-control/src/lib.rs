//! Tunnel multiplexing engine
//!
//! Binds edge nodes to the cloud over one stream each and multiplexes any
//! number of logical byte-pipes over it:
//!
//! - [`NodeRegistry`], [`ConnRegistry`] and [`ProtocolRegistry`], shared
//!   through a [`TunnelContext`]
//! - the connect handshake ([`TunnelContext::connect_node`])
//! - the [`StreamPump`] that drives one node's transport
//! - the edge [`HeartbeatMonitor`]
//! - [`TunnelServer`] (cloud) and [`EdgeAgent`] (edge)

pub mod agent;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
mod handshake;
pub mod heartbeat;
pub mod node;
pub mod pipe;
pub mod protocol;
pub mod pump;
mod relay;
pub mod server;
pub mod tcp;

pub use agent::{AgentConfig, EdgeAgent};
pub use config::TunnelConfig;
pub use conn::{Conn, ConnRegistry};
pub use context::{Role, TunnelContext};
pub use error::{HandlerError, TunnelError};
pub use heartbeat::{FatalHook, HeartbeatMonitor, HeartbeatState, MAX_MISSED_HEARTBEATS};
pub use node::{Node, NodeRegistry};
pub use pipe::{Pipe, PipeEnd, PipeStats};
pub use protocol::{handler, Handler, ProtocolRegistry};
pub use pump::StreamPump;
pub use server::{handle_stream, TunnelServer};
pub use tcp::{
    AllowAll, AllowList, Dialer, ForwardRule, Resolution, TargetResolver, TcpDialer,
    TcpForwarder, TcpModule,
};
