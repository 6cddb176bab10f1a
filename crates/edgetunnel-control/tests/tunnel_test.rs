//! End-to-end tunnel tests: cloud and edge contexts in one process

use edgetunnel_auth::{Credential, StreamAuthenticator, TokenAuthenticator, TokenCache};
use edgetunnel_control::{
    handle_stream, AgentConfig, AllowList, EdgeAgent, FatalHook, ForwardRule, Role, TcpDialer,
    TcpForwarder, TcpModule, TunnelConfig, TunnelContext, TunnelError, TunnelServer,
};
use edgetunnel_proto::{Category, Frame, Message, MessageType};
use edgetunnel_transport::{
    memory_pair, FrameSink, FrameSource, MemoryStream, TcpTransportConnector, TcpTransportListener,
    TransportListener,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

fn config() -> TunnelConfig {
    TunnelConfig {
        connect_timeout: Duration::from_secs(2),
        ..TunnelConfig::default()
    }
}

fn authenticator() -> Arc<dyn StreamAuthenticator> {
    Arc::new(TokenAuthenticator::new(Arc::new(TokenCache::from_entries([
        ("edge-a", "token-a"),
        ("edge-b", "token-b"),
    ]))))
}

fn ignore_fatal() -> FatalHook {
    Arc::new(|_reason: &str| {})
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn cloud() -> Arc<TunnelContext> {
    init_tracing();
    let ctx = TunnelContext::new(Role::Cloud, config()).await;
    TcpModule::with_defaults(&ctx).register(&ctx, Category::Tcp).await;
    ctx
}

async fn edge(name: &str) -> Arc<TunnelContext> {
    init_tracing();
    let ctx = TunnelContext::new(
        Role::Edge {
            node: name.to_string(),
        },
        config(),
    )
    .await;
    TcpModule::with_defaults(&ctx).register(&ctx, Category::Tcp).await;
    ctx
}

fn agent(ctx: &Arc<TunnelContext>, name: &str, token: &str, fatal: FatalHook) -> EdgeAgent {
    EdgeAgent::new(
        ctx.clone(),
        AgentConfig {
            cloud_addr: "memory".to_string(),
            node_name: name.to_string(),
            token: token.to_string(),
        },
        fatal,
    )
}

struct Attached {
    server: JoinHandle<Result<(), TunnelError>>,
    agent: JoinHandle<Result<(), TunnelError>>,
}

/// Connect an edge context to a cloud context over an in-memory stream
fn attach(cloud: &Arc<TunnelContext>, edge: &Arc<TunnelContext>, name: &str, token: &str) -> Attached {
    let (edge_side, cloud_side) = memory_pair(64);
    let server = tokio::spawn(handle_stream(cloud.clone(), authenticator(), cloud_side));
    let agent = agent(edge, name, token, ignore_fatal());
    let agent = tokio::spawn(async move { agent.run_stream(edge_side).await });
    Attached { server, agent }
}

async fn wait_for_node(ctx: &TunnelContext, name: &str) {
    for _ in 0..200 {
        if ctx.nodes().node_is_exist(name).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {} never registered", name);
}

/// TCP server that echoes every byte back
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn forwarder(ctx: &Arc<TunnelContext>, node: &str, target: SocketAddr) -> SocketAddr {
    let forwarder = TcpForwarder::bind(
        ctx.clone(),
        ForwardRule {
            listen: "127.0.0.1:0".to_string(),
            node: node.to_string(),
            target: target.to_string(),
            category: Category::Tcp,
        },
    )
    .await
    .unwrap();
    let addr = forwarder.local_addr().unwrap();
    tokio::spawn(forwarder.run());
    addr
}

async fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    received
}

#[tokio::test]
async fn test_cloud_to_edge_forwarding() {
    let cloud = cloud().await;
    let edge = edge("edge-a").await;
    let _attached = attach(&cloud, &edge, "edge-a", "token-a");
    wait_for_node(&cloud, "edge-a").await;

    let target = echo_server().await;
    let local = forwarder(&cloud, "edge-a", target).await;

    let received = echo_roundtrip(local, b"hello through the tunnel").await;
    assert_eq!(received, b"hello through the tunnel");
}

#[tokio::test]
async fn test_large_payload_keeps_order() {
    let cloud = cloud().await;
    let edge = edge("edge-a").await;
    let _attached = attach(&cloud, &edge, "edge-a", "token-a");
    wait_for_node(&cloud, "edge-a").await;

    let target = echo_server().await;
    let local = forwarder(&cloud, "edge-a", target).await;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let received = echo_roundtrip(local, &payload).await;
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_edge_to_edge_relay() {
    let cloud = cloud().await;
    let edge_a = edge("edge-a").await;
    let edge_b = edge("edge-b").await;
    let _a = attach(&cloud, &edge_a, "edge-a", "token-a");
    let _b = attach(&cloud, &edge_b, "edge-b", "token-b");
    wait_for_node(&cloud, "edge-a").await;
    wait_for_node(&cloud, "edge-b").await;
    wait_for_node(&edge_a, "edge-a").await;

    // Forwarder on edge A, target reachable from edge B
    let target = echo_server().await;
    let local = forwarder(&edge_a, "edge-b", target).await;

    let received = echo_roundtrip(local, b"relayed").await;
    assert_eq!(received, b"relayed");
}

#[tokio::test]
async fn test_connect_failed_is_reported() {
    let cloud = cloud().await;
    let edge = TunnelContext::new(
        Role::Edge {
            node: "edge-a".to_string(),
        },
        config(),
    )
    .await;
    TcpModule::new(
        Arc::new(TcpDialer::new(Duration::from_secs(1))),
        Arc::new(AllowList::new(["127.0.0.1:1"])),
    )
    .register(&edge, Category::Tcp)
    .await;
    let _attached = attach(&cloud, &edge, "edge-a", "token-a");
    wait_for_node(&cloud, "edge-a").await;

    let result = cloud
        .connect_node("edge-a", Category::Tcp, "127.0.0.1:2")
        .await;

    assert!(matches!(result, Err(TunnelError::ConnectFailed(reason)) if reason.contains("not allowed")));
    assert!(cloud.conns().is_empty());
}

#[tokio::test]
async fn test_unreachable_target_is_reported() {
    let cloud = cloud().await;
    let edge = edge("edge-a").await;
    let _attached = attach(&cloud, &edge, "edge-a", "token-a");
    wait_for_node(&cloud, "edge-a").await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let result = cloud
        .connect_node("edge-a", Category::Tcp, &addr.to_string())
        .await;
    assert!(matches!(result, Err(TunnelError::ConnectFailed(_))));
}

#[tokio::test]
async fn test_bad_token_is_rejected_without_registering() {
    let cloud = cloud().await;
    let edge = edge("edge-a").await;
    let attached = attach(&cloud, &edge, "edge-a", "wrong");

    let server = attached.server.await.unwrap();
    let agent = attached.agent.await.unwrap();

    assert!(matches!(server, Err(TunnelError::AuthRejected(_))));
    assert!(matches!(agent, Err(TunnelError::AuthRejected(_))));
    assert!(!cloud.nodes().node_is_exist("edge-a").await);
    assert_eq!(cloud.nodes().connected_count(), 0);
    assert!(!edge.nodes().node_is_exist("edge-a").await);
}

#[tokio::test]
async fn test_missing_open_frame_is_rejected() {
    let cloud = cloud().await;
    let (mut edge_side, cloud_side) = memory_pair(4);

    let server = tokio::spawn(handle_stream(cloud.clone(), authenticator(), cloud_side));
    edge_side
        .send_frame(Frame::Accepted {
            node: "edge-a".to_string(),
        })
        .await
        .unwrap();

    assert!(matches!(
        server.await.unwrap(),
        Err(TunnelError::Handshake(_))
    ));
    assert_eq!(cloud.nodes().connected_count(), 0);
}

#[tokio::test]
async fn test_reregistration_supersedes_old_stream() {
    let cloud = cloud().await;
    let first_edge = edge("edge-a").await;
    let first = attach(&cloud, &first_edge, "edge-a", "token-a");
    wait_for_node(&cloud, "edge-a").await;

    // A connection bound to the first stream's node
    let old_node = cloud.nodes().get_node("edge-a").await.unwrap();
    let old_conn = cloud.conns().add_conn("old-conn").unwrap();
    old_node.bind_conn("old-conn");

    let second_edge = edge("edge-a").await;
    let _second = attach(&cloud, &second_edge, "edge-a", "token-a");

    let msg = tokio::time::timeout(Duration::from_secs(5), old_conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.msg_type, MessageType::Closed);

    // The old stream winds down on its own
    let old_agent = tokio::time::timeout(Duration::from_secs(5), first.agent)
        .await
        .unwrap()
        .unwrap();
    assert!(old_agent.is_ok());
    tokio::time::timeout(Duration::from_secs(5), first.server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let current = cloud.nodes().get_node("edge-a").await.unwrap();
    assert!(!Arc::ptr_eq(&current, &old_node));
    assert_eq!(cloud.nodes().connected_count(), 1);
}

#[tokio::test]
async fn test_stream_end_removes_node_and_closes_conns() {
    let cloud = cloud().await;
    let (mut edge_side, cloud_side) = memory_pair(16);
    let server = tokio::spawn(handle_stream(cloud.clone(), authenticator(), cloud_side));

    let credential = Credential::new("edge-a", "token-a").encode().unwrap();
    edge_side
        .send_frame(Frame::Open { credential })
        .await
        .unwrap();
    assert!(matches!(
        edge_side.recv_frame().await.unwrap(),
        Some(Frame::Accepted { node }) if node == "edge-a"
    ));

    let conn = cloud.conns().add_conn("u1").unwrap();
    cloud.nodes().get_node("edge-a").await.unwrap().bind_conn("u1");

    // The edge going away ends the cloud's stream
    drop(edge_side);
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!cloud.nodes().node_is_exist("edge-a").await);
    let msg = conn.recv().await.unwrap();
    assert_eq!(msg.msg_type, MessageType::Closed);
    assert_eq!(msg.topic, "u1");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_silence_invokes_fatal_hook() {
    let edge = edge("edge-a").await;
    let (edge_side, mut cloud_side): (MemoryStream, MemoryStream) = memory_pair(64);

    let fired = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let hook: FatalHook = {
        let fired = fired.clone();
        let calls = calls.clone();
        Arc::new(move |_reason: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            fired.notify_one();
        })
    };

    let agent = agent(&edge, "edge-a", "token-a", hook);
    tokio::spawn(async move { agent.run_stream(edge_side).await });

    // A cloud that accepts and then never answers heartbeats
    assert!(matches!(
        cloud_side.recv_frame().await.unwrap(),
        Some(Frame::Open { .. })
    ));
    cloud_side
        .send_frame(Frame::Accepted {
            node: "edge-a".to_string(),
        })
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Ok(Some(_)) = cloud_side.recv_frame().await {}
    });

    tokio::time::timeout(Duration::from_secs(300), fired.notified())
        .await
        .expect("fatal hook was not invoked");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_uplink_invokes_fatal_hook() {
    init_tracing();
    let edge = TunnelContext::new(
        Role::Edge {
            node: "edge-a".to_string(),
        },
        TunnelConfig {
            channel_capacity: 2,
            ..config()
        },
    )
    .await;
    let (edge_side, mut cloud_side) = memory_pair(1);

    let calls = Arc::new(AtomicUsize::new(0));
    let hook: FatalHook = {
        let calls = calls.clone();
        Arc::new(move |_reason: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };

    let agent = agent(&edge, "edge-a", "token-a", hook);
    tokio::spawn(async move { agent.run_stream(edge_side).await });

    // A cloud that accepts and then stops reading altogether
    assert!(matches!(
        cloud_side.recv_frame().await.unwrap(),
        Some(Frame::Open { .. })
    ));
    cloud_side
        .send_frame(Frame::Accepted {
            node: "edge-a".to_string(),
        })
        .await
        .unwrap();
    wait_for_node(&edge, "edge-a").await;

    let uplink = edge.nodes().get_node("edge-a").await.unwrap();
    tokio::spawn({
        let uplink = uplink.clone();
        async move {
            for i in 0..20u8 {
                let msg = Message::forward("edge-a", Category::Tcp, "u1", vec![i]);
                if uplink.send(msg).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(uplink.is_stopped());
    drop(cloud_side);
}

#[tokio::test]
async fn test_half_closed_edge_is_removed_while_backlogged() {
    init_tracing();
    let cloud = TunnelContext::new(
        Role::Cloud,
        TunnelConfig {
            channel_capacity: 2,
            ..config()
        },
    )
    .await;
    let (mut edge_side, cloud_side) = memory_pair(1);
    let server = tokio::spawn(handle_stream(cloud.clone(), authenticator(), cloud_side));

    let credential = Credential::new("edge-a", "token-a").encode().unwrap();
    edge_side
        .send_frame(Frame::Open { credential })
        .await
        .unwrap();
    assert!(matches!(
        edge_side.recv_frame().await.unwrap(),
        Some(Frame::Accepted { .. })
    ));

    let node = cloud.nodes().get_node("edge-a").await.unwrap();
    let conn = cloud.conns().add_conn("u1").unwrap();
    node.bind_conn("u1");

    // Backlog the cloud's outbound side; the edge is not reading
    tokio::spawn({
        let node = node.clone();
        async move {
            for i in 0..10u8 {
                let msg = Message::forward("edge-a", Category::Tcp, "u1", vec![i]);
                if node.send(msg).await.is_err() {
                    break;
                }
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    edge_side.finish().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("stream handler did not finish")
        .unwrap()
        .unwrap();

    assert!(!cloud.nodes().node_is_exist("edge-a").await);
    assert_eq!(conn.recv().await.unwrap().msg_type, MessageType::Closed);
    drop(edge_side);
}

#[tokio::test(start_paused = true)]
async fn test_echoed_heartbeats_keep_uplink_alive() {
    let cloud = cloud().await;
    let edge = edge("edge-a").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let hook: FatalHook = {
        let calls = calls.clone();
        Arc::new(move |_reason: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };

    let (edge_side, cloud_side) = memory_pair(64);
    tokio::spawn(handle_stream(cloud.clone(), authenticator(), cloud_side));
    let agent = agent(&edge, "edge-a", "token-a", hook);
    tokio::spawn(async move { agent.run_stream(edge_side).await });

    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(cloud.nodes().node_is_exist("edge-a").await);
}

#[tokio::test]
async fn test_tcp_transport_end_to_end() {
    let cloud = cloud().await;
    let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
    let cloud_addr = listener.local_addr().unwrap();

    let server = TunnelServer::new(cloud.clone(), authenticator());
    tokio::spawn(async move { server.serve(listener).await });

    let edge = edge("edge-b").await;
    let agent = EdgeAgent::new(
        edge.clone(),
        AgentConfig {
            cloud_addr: cloud_addr.to_string(),
            node_name: "edge-b".to_string(),
            token: "token-b".to_string(),
        },
        ignore_fatal(),
    );
    tokio::spawn(async move { agent.run(&TcpTransportConnector::default()).await });
    wait_for_node(&cloud, "edge-b").await;

    let target = echo_server().await;
    let local = forwarder(&cloud, "edge-b", target).await;
    assert_eq!(echo_roundtrip(local, b"over tcp").await, b"over tcp");
}
