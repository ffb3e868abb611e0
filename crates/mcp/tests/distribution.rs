#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bosun_core::{FullName, Key, Resource, Version};
use bosun_mcp::client::McpClient;
use bosun_mcp::monitoring::InMemoryStats;
use bosun_mcp::{McpError, McpServer, McpServerConfig, SnapshotCache};
use bosun_runtime::KindSnapshot;
use tokio::task::JoinHandle;

const GATEWAYS: &str = "istio/networking/v1alpha3/gateways";

async fn start_server(
    collections: Vec<&str>,
) -> (Arc<McpServer>, Arc<SnapshotCache>, Arc<InMemoryStats>, SocketAddr, JoinHandle<()>) {
    let cache = Arc::new(SnapshotCache::new(collections.into_iter().map(String::from)));
    let stats = InMemoryStats::new();
    let server = Arc::new(McpServer::new(
        McpServerConfig::default(),
        cache.clone(),
        stats.clone(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(Arc::clone(&server).serve(listener));
    (server, cache, stats, addr, handle)
}

fn snapshot(version: &str, names: &[&str]) -> KindSnapshot {
    KindSnapshot {
        collection: GATEWAYS.to_string(),
        version: version.to_string(),
        resources: names
            .iter()
            .map(|n| {
                Resource::new(
                    Key::new("Gateway", FullName::new(Some("edge"), n)),
                    Version::from(version),
                    serde_json::json!({ "selector": {} }),
                )
            })
            .collect(),
    }
}

async fn recv_timeout(client: &mut McpClient) -> Result<bosun_mcp::proto::McpResponse, McpError> {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for server frame")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_is_gated_on_acknowledgment() {
    let (server, cache, stats, addr, handle) = start_server(vec![GATEWAYS]).await;
    cache.set(snapshot("1", &["gw-a"]));

    let mut client = McpClient::connect(addr, "pilot-0").await.unwrap();
    client.subscribe(GATEWAYS).await.unwrap();

    let first = recv_timeout(&mut client).await.unwrap();
    assert_eq!(first.version_info, "1");
    assert_eq!(first.envelopes.len(), 1);
    assert_eq!(first.envelopes[0].name, "edge/gw-a");
    assert!(!first.nonce.is_empty());

    // A new snapshot lands while the first is unacknowledged: the
    // subscriber must not see it yet.
    cache.set(snapshot("2", &["gw-a", "gw-b"]));
    let premature = tokio::time::timeout(Duration::from_millis(300), client.recv()).await;
    assert!(premature.is_err(), "second snapshot pushed before ack");

    client.ack(&first).await.unwrap();
    let second = recv_timeout(&mut client).await.unwrap();
    assert_eq!(second.version_info, "2");
    assert_eq!(second.envelopes.len(), 2);

    assert_eq!(stats.acks(), 1);
    server.shutdown();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nack_is_recorded_and_waits_for_the_next_version() {
    let (server, cache, stats, addr, handle) = start_server(vec![GATEWAYS]).await;
    cache.set(snapshot("1", &["gw-a"]));

    let mut client = McpClient::connect(addr, "pilot-0").await.unwrap();
    client.subscribe(GATEWAYS).await.unwrap();
    let first = recv_timeout(&mut client).await.unwrap();

    client.nack(&first, "schema mismatch").await.unwrap();

    // The rejected version must not be resent.
    let resend = tokio::time::timeout(Duration::from_millis(300), client.recv()).await;
    assert!(resend.is_err(), "rejected snapshot was resent");

    cache.set(snapshot("2", &["gw-a"]));
    let next = recv_timeout(&mut client).await.unwrap();
    assert_eq!(next.version_info, "2");

    assert_eq!(stats.nacks(), 1);
    server.shutdown();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_delivers_clean_end_of_stream() {
    let (server, cache, _stats, addr, handle) = start_server(vec![GATEWAYS]).await;
    cache.set(snapshot("1", &["gw-a"]));

    let mut client = McpClient::connect(addr, "pilot-0").await.unwrap();
    client.subscribe(GATEWAYS).await.unwrap();
    let _ = recv_timeout(&mut client).await.unwrap();

    server.shutdown();
    let eos = recv_timeout(&mut client).await.unwrap();
    assert!(eos.end_of_stream);
    assert!(matches!(client.recv().await, Err(McpError::Closed)));

    // Accept loop returns promptly; a second shutdown is a no-op.
    handle.await.unwrap();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_subscriber_does_not_disturb_others() {
    let (server, cache, _stats, addr, handle) = start_server(vec![GATEWAYS]).await;
    cache.set(snapshot("1", &["gw-a"]));

    let mut good = McpClient::connect(addr, "good").await.unwrap();
    good.subscribe(GATEWAYS).await.unwrap();
    let first = recv_timeout(&mut good).await.unwrap();

    // Unknown collection: that connection is closed, nothing else.
    let mut bad = McpClient::connect(addr, "bad").await.unwrap();
    bad.subscribe("no/such/collection").await.unwrap();
    assert!(bad.recv().await.is_err());

    good.ack(&first).await.unwrap();
    cache.set(snapshot("2", &["gw-a"]));
    let second = recv_timeout(&mut good).await.unwrap();
    assert_eq!(second.version_info, "2");

    server.shutdown();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_before_serve_returns_immediately() {
    let cache = Arc::new(SnapshotCache::new(vec![GATEWAYS.to_string()]));
    let server = Arc::new(McpServer::new(
        McpServerConfig::default(),
        cache,
        InMemoryStats::new(),
    ));
    server.shutdown();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), Arc::clone(&server).serve(listener))
        .await
        .expect("serve must return at once after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_count_tracks_cache() {
    let (server, _cache, _stats, _addr, handle) = start_server(vec![GATEWAYS, "a/b"]).await;
    assert_eq!(server.channel_count(), 2);
    server.shutdown();
    handle.await.unwrap();
}
