//! Generic TCP forwarding module
//!
//! Registers handlers that resolve `connecting` requests by dialing the
//! target address locally and then piping bytes, and a listener-side
//! [`TcpForwarder`] that opens connections through the tunnel for every
//! accepted local socket.

use crate::context::{route_to_conn, TunnelContext};
use crate::error::{HandlerError, TunnelError};
use crate::pipe::Pipe;
use crate::protocol::handler;
use async_trait::async_trait;
use edgetunnel_proto::{Category, Message, MessageType};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Opens the local socket for a resolved connect request
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer with a connect deadline
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial {} timed out after {:?}", addr, self.timeout),
            )),
        }
    }
}

/// Outcome of resolving a connect target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Dial the address from this process
    Local,
    /// Refuse with the given reason
    NotFound(String),
}

/// Decides whether a connect target may be dialed from here
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, node: &str, addr: &str) -> Resolution;
}

/// Resolves every target locally
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl TargetResolver for AllowAll {
    fn resolve(&self, _node: &str, _addr: &str) -> Resolution {
        Resolution::Local
    }
}

/// Resolves only the listed `host:port` targets
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    targets: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

impl TargetResolver for AllowList {
    fn resolve(&self, _node: &str, addr: &str) -> Resolution {
        if self.targets.contains(addr) {
            Resolution::Local
        } else {
            Resolution::NotFound(format!("target {} is not allowed", addr))
        }
    }
}

/// Handler set for one forwarding category
#[derive(Clone)]
pub struct TcpModule {
    dialer: Arc<dyn Dialer>,
    resolver: Arc<dyn TargetResolver>,
}

impl TcpModule {
    pub fn new(dialer: Arc<dyn Dialer>, resolver: Arc<dyn TargetResolver>) -> Self {
        Self { dialer, resolver }
    }

    /// Default module: dial anything, with the configured dial timeout
    pub fn with_defaults(ctx: &TunnelContext) -> Self {
        Self::new(
            Arc::new(TcpDialer::new(ctx.config().dial_timeout)),
            Arc::new(AllowAll),
        )
    }

    /// Load the module for `category` and register its handlers
    pub async fn register(self, ctx: &TunnelContext, category: Category) {
        let protocols = ctx.protocols();
        protocols.add_module(category).await;

        let module = Arc::new(self);
        protocols
            .register_handler(
                category,
                MessageType::Connecting,
                handler(move |ctx, msg| {
                    let module = module.clone();
                    async move {
                        module.on_connecting(ctx, msg);
                        Ok(())
                    }
                }),
            )
            .await;

        for msg_type in [
            MessageType::Connected,
            MessageType::ConnectFailed,
            MessageType::Closed,
            MessageType::Forward,
        ] {
            protocols
                .register_handler(category, msg_type, handler(route_handler))
                .await;
        }
    }

    /// Resolve a connect request off the inbound loop
    fn on_connecting(&self, ctx: Arc<TunnelContext>, msg: Message) {
        let module = self.clone();
        tokio::spawn(async move {
            let (node, uid) = (msg.node.clone(), msg.topic.clone());
            if let Err(e) = module.resolve(ctx.clone(), msg).await {
                warn!(node = %node, uid = %uid, error = %e, "Connect resolution failed");
            }
        });
    }

    async fn resolve(&self, ctx: Arc<TunnelContext>, msg: Message) -> Result<(), HandlerError> {
        let Message {
            node,
            category,
            topic: uid,
            addr,
            ..
        } = msg;

        if addr.is_empty() {
            return reply_failed(&ctx, &node, category, &uid, "empty target address").await;
        }
        if let Resolution::NotFound(reason) = self.resolver.resolve(&node, &addr) {
            return reply_failed(&ctx, &node, category, &uid, &reason).await;
        }

        let conn = match ctx.conns().add_conn(&uid) {
            Ok(conn) => conn,
            Err(e) => return reply_failed(&ctx, &node, category, &uid, &e.to_string()).await,
        };
        let uplink = ctx
            .route_node(&node)
            .await
            .ok_or_else(|| TunnelError::NodeNotFound(node.clone()));
        let uplink = match uplink {
            Ok(uplink) => uplink,
            Err(e) => {
                ctx.conns().remove_conn(&uid);
                return Err(e.into());
            }
        };
        uplink.bind_conn(&uid);

        let socket = match self.dialer.dial(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                uplink.unbind_conn(&uid);
                ctx.conns().remove_conn(&uid);
                debug!(uid = %uid, addr = %addr, error = %e, "Dial failed");
                return reply_failed(&ctx, &node, category, &uid, &e.to_string()).await;
            }
        };

        if let Err(e) = ctx
            .send_to_node(Message::connected(&node, category, &uid))
            .await
        {
            uplink.unbind_conn(&uid);
            ctx.conns().remove_conn(&uid);
            return Err(e.into());
        }

        info!(node = %node, uid = %uid, addr = %addr, "Connection resolved locally");
        Pipe::new(ctx, &node, category, conn).run(socket).await;
        Ok(())
    }
}

async fn route_handler(ctx: Arc<TunnelContext>, msg: Message) -> Result<(), HandlerError> {
    route_to_conn(&ctx, msg).await
}

async fn reply_failed(
    ctx: &TunnelContext,
    node: &str,
    category: Category,
    uid: &str,
    reason: &str,
) -> Result<(), HandlerError> {
    debug!(node = %node, uid = %uid, reason = %reason, "Replying connect-failed");
    ctx.send_to_node(Message::connect_failed(node, category, uid, reason))
        .await?;
    Ok(())
}

/// A local listener forwarded through the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub listen: String,
    pub node: String,
    pub target: String,
    pub category: Category,
}

impl std::str::FromStr for ForwardRule {
    type Err = String;

    /// `LISTEN=NODE/TARGET`, e.g. `127.0.0.1:2222=edge-1/127.0.0.1:22`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (listen, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("invalid forward rule '{}': expected LISTEN=NODE/TARGET", s))?;
        let (node, target) = rest
            .split_once('/')
            .ok_or_else(|| format!("invalid forward rule '{}': expected LISTEN=NODE/TARGET", s))?;

        if listen.is_empty() || node.is_empty() || target.is_empty() {
            return Err(format!("invalid forward rule '{}': empty field", s));
        }

        Ok(Self {
            listen: listen.to_string(),
            node: node.to_string(),
            target: target.to_string(),
            category: Category::Tcp,
        })
    }
}

/// Accepts local sockets and connects each one to `rule.target` via `rule.node`
pub struct TcpForwarder {
    ctx: Arc<TunnelContext>,
    rule: ForwardRule,
    listener: TcpListener,
}

impl TcpForwarder {
    pub async fn bind(ctx: Arc<TunnelContext>, rule: ForwardRule) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(&rule.listen).await?;
        info!(
            listen = %rule.listen,
            node = %rule.node,
            target = %rule.target,
            "Forwarder listening"
        );
        Ok(Self {
            ctx,
            rule,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the listener fails
    pub async fn run(self) -> Result<(), TunnelError> {
        let rule = Arc::new(self.rule);
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(listen = %rule.listen, error = %e, "Forwarder accept failed");
                    return Err(e.into());
                }
            };

            let ctx = self.ctx.clone();
            let rule = rule.clone();
            tokio::spawn(async move {
                debug!(peer = %peer, node = %rule.node, "Forwarding local connection");
                match ctx.connect_node(&rule.node, rule.category, &rule.target).await {
                    Ok(conn) => {
                        Pipe::new(ctx, &rule.node, rule.category, conn)
                            .run(socket)
                            .await;
                    }
                    Err(e) => {
                        warn!(peer = %peer, node = %rule.node, target = %rule.target, error = %e, "Forward failed");
                    }
                }
            });
        }
    }
}
