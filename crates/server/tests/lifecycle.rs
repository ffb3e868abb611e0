#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;

use bosun_core::{FullName, Key, Resource, Version};
use bosun_kubehub::mock::MockInterfaces;
use bosun_kubehub::Interfaces;
use bosun_mcp::client::McpClient;
use bosun_mcp::monitoring::InMemoryStats;
use bosun_meshconfig::{Cache, InMemory};
use bosun_runtime::{InMemorySource, Source};
use bosun_schema::{default_registry, MESH_CONFIG_COLLECTION};
use bosun_server::{new_server, Args, PatchTable};

fn test_args() -> Args {
    Args {
        api_address: "tcp://127.0.0.1:0".to_string(),
        insecure: true,
        ..Default::default()
    }
}

/// Table with every external dependency faked out, mirroring what the
/// production wiring expects of each factory.
fn test_table() -> PatchTable {
    PatchTable {
        configure_logging: Box::new(|_| Ok(())),
        new_interfaces: Box::new(|_| {
            Ok(Arc::new(MockInterfaces::serving_default_registry()) as Arc<dyn Interfaces>)
        }),
        verify_resource_types_presence: Box::new(|_, _| async { Ok(()) }.boxed()),
        new_source: Box::new(|_, _, _, _| Ok(Arc::new(InMemorySource::new()) as Arc<dyn Source>)),
        net_listen: Box::new(|address: &str| std::net::TcpListener::bind(address)),
        new_mesh_config_cache: Box::new(|_| Ok(Arc::new(InMemory::new()) as Arc<dyn Cache>)),
        fs_new: Box::new(|_, _, _| Ok(Arc::new(InMemorySource::new()) as Arc<dyn Source>)),
        mcp_metric_reporter: Box::new(|_| InMemoryStats::new()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_server_errors() {
    for i in 0..6 {
        let mut table = test_table();
        let mut args = test_args();

        match i {
            0 => table.configure_logging = Box::new(|_| Err(anyhow!("err"))),
            1 => table.new_interfaces = Box::new(|_| Err(anyhow!("err"))),
            2 => table.new_source = Box::new(|_, _, _, _| Err(anyhow!("err"))),
            3 => {
                table.net_listen = Box::new(|_| {
                    Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "err"))
                })
            }
            4 => table.new_mesh_config_cache = Box::new(|_| Err(anyhow!("err"))),
            5 => {
                args.config_path = Some("aaa".into());
                table.fs_new = Box::new(|_, _, _| Err(anyhow!("err")));
            }
            _ => unreachable!(),
        }

        let result = new_server(&args, &table, false).await;
        assert!(result.is_err(), "expected error not found for i={i}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secure_mode_without_credentials_is_a_config_error() {
    let table = test_table();
    let mut args = test_args();
    args.insecure = false;
    let err = new_server(&args, &table, false).await.unwrap_err();
    assert!(format!("{err:#}").contains("credential material"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verification_failure_aborts_construction() {
    let mut table = test_table();
    table.verify_resource_types_presence =
        Box::new(|_, _| async { Err(anyhow!("kinds missing")) }.boxed());
    assert!(new_server(&test_args(), &table, false).await.is_err());

    // Unless the check is explicitly disabled.
    let mut args = test_args();
    args.disable_resource_ready_check = true;
    let server = new_server(&args, &table, false).await.unwrap();
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_count_follows_service_conversion_flag() {
    let type_count = default_registry().len();
    for (convert_k8s_service, want) in [(false, type_count - 1), (true, type_count)] {
        let server = new_server(&test_args(), &test_table(), convert_k8s_service)
            .await
            .unwrap();
        assert_eq!(
            server.channel_count(),
            want,
            "convert_k8s_service={convert_k8s_service}"
        );
        server.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_then_close_does_not_deadlock() {
    let server = Arc::new(new_server(&test_args(), &test_table(), false).await.unwrap());

    let run = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    // Give the accept loop a moment to come up, then shut down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close().await;

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not return after close")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_without_run_and_close_twice() {
    let server = new_server(&test_args(), &test_table(), false).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.close())
        .await
        .expect("close without run must return promptly");
    server.close().await;

    // Run after close is a no-op, not a hang.
    tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .expect("run after close must return promptly")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_to_end_snapshots_flow_to_a_subscriber() {
    let source = Arc::new(InMemorySource::new());
    let mesh = Arc::new(InMemory::new());

    let mut table = test_table();
    let source_for_table = Arc::clone(&source);
    table.new_source =
        Box::new(move |_, _, _, _| Ok(Arc::clone(&source_for_table) as Arc<dyn Source>));
    let mesh_for_table = Arc::clone(&mesh);
    table.new_mesh_config_cache =
        Box::new(move |_| Ok(Arc::clone(&mesh_for_table) as Arc<dyn Cache>));

    let server = Arc::new(new_server(&test_args(), &table, false).await.unwrap());
    let addr = server.local_addr().await.expect("listener bound");
    let run = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    // Feed a resource through the aggregation pipeline.
    source
        .set(Resource::new(
            Key::new("Gateway", FullName::new(Some("edge"), "gw")),
            Version::from("1"),
            serde_json::json!({ "selector": { "istio": "ingressgateway" } }),
        ))
        .await;

    let mut client = McpClient::connect(addr, "test-sink").await.unwrap();
    client.subscribe("istio/networking/v1alpha3/gateways").await.unwrap();

    // The first snapshot may predate the resource; ack until it shows.
    let snapshot = loop {
        let resp = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for snapshot")
            .unwrap();
        if resp.envelopes.iter().any(|e| e.name == "edge/gw") {
            break resp;
        }
        client.ack(&resp).await.unwrap();
    };
    let body: serde_json::Value =
        serde_json::from_slice(&snapshot.envelopes[0].body).unwrap();
    assert_eq!(body["selector"]["istio"], "ingressgateway");

    // The mesh configuration flows on its own channel.
    client.subscribe(MESH_CONFIG_COLLECTION).await.unwrap();
    let mesh_resp = loop {
        let resp = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for mesh config")
            .unwrap();
        if resp.collection == MESH_CONFIG_COLLECTION && !resp.envelopes.is_empty() {
            break resp;
        }
        client.ack(&resp).await.unwrap();
    };
    let mesh_body: serde_json::Value =
        serde_json::from_slice(&mesh_resp.envelopes[0].body).unwrap();
    assert_eq!(mesh_body["ingressClass"], "istio");

    server.close().await;
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not return")
        .unwrap()
        .unwrap();
}
