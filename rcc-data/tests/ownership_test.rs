// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercises of the ownership registry over HTTP
//!
//! The server runs with the in-memory store, so these cover the full
//! request path (routing, body handling, status codes) plus the claim and
//! expiration semantics, without needing a database.

use chrono::Utc;
use rcc_common::api::AcquireRequest;
use rcc_common::api::NodeClass;
use rcc_common::api::NodeInfo;
use rcc_data::datastore::MemStore;
use slog::Logger;
use slog::o;
use std::sync::Arc;

struct TestRegistry {
    server: rcc_data::Server,
    store: Arc<MemStore>,
    client: rcc_data_client::Client,
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn start_registry() -> TestRegistry {
    let store = Arc::new(MemStore::new());
    let dropshot_config = dropshot::ConfigDropshot {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        default_request_body_max_bytes: 16 * 1024 * 1024,
        ..Default::default()
    };
    let log = test_logger();
    let server = rcc_data::start_server(
        Arc::clone(&store) as Arc<dyn rcc_data::datastore::OwnershipStore>,
        &dropshot_config,
        &log,
    )
    .expect("started test registry");
    let client = rcc_data_client::Client::new(
        &format!("http://{}", server.local_addr()),
        test_logger(),
    );
    TestRegistry { server, store, client }
}

fn river_nodes(range: std::ops::Range<u32>) -> Vec<NodeInfo> {
    range.map(|i| node(&format!("x1000c0s0b{}n0", i), NodeClass::River)).collect()
}

fn node(name: &str, class: NodeClass) -> NodeInfo {
    let bmc = name.rsplit_once('n').map(|(b, _)| b).unwrap_or(name);
    NodeInfo {
        node_name: name.to_string(),
        bmc_name: bmc.to_string(),
        bmc_fqdn: format!("{}.local", bmc),
        class,
        nid: 1,
        role: "Compute".to_string(),
        node_console_name: String::new(),
    }
}

#[tokio::test]
async fn bulk_claim() {
    let registry = start_registry();
    let created = registry
        .client
        .upsert_inventory(&river_nodes(0..2500))
        .await
        .unwrap();
    assert_eq!(created, 2500);

    let assigned = registry
        .client
        .acquire(
            "1",
            &AcquireRequest {
                nummtn: 0,
                numrvr: 500,
                xname: String::new(),
                alias: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(assigned.len(), 500);
    assert_eq!(registry.client.active_workers().await.unwrap(), 1);
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn inventory_create_counts_and_statuses() {
    let registry = start_registry();
    let base = format!("http://{}/v1/inventory", registry.server.local_addr());
    let http = reqwest::Client::new();

    // overlapping updates report only newly created rows
    assert_eq!(
        registry.client.upsert_inventory(&river_nodes(0..2500)).await.unwrap(),
        2500
    );
    assert_eq!(
        registry.client.upsert_inventory(&river_nodes(2500..3000)).await.unwrap(),
        500
    );
    assert_eq!(
        registry.client.upsert_inventory(&river_nodes(3000..8000)).await.unwrap(),
        5000
    );

    // a fully duplicate update creates nothing, and the status drops to 200
    let response = http
        .put(&base)
        .json(&river_nodes(100..200))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = http
        .put(&base)
        .json(&river_nodes(8000..8001))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn mixed_class_claim() {
    let registry = start_registry();
    let mut nodes = river_nodes(0..25);
    nodes.extend(
        (0..25).map(|i| {
            node(&format!("x9000c0s{}b0n0", i), NodeClass::Mountain)
        }),
    );
    registry.client.upsert_inventory(&nodes).await.unwrap();

    let assigned = registry
        .client
        .acquire(
            "1",
            &AcquireRequest {
                nummtn: 5,
                numrvr: 5,
                xname: String::new(),
                alias: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(assigned.len(), 10);
    let mountain =
        assigned.iter().filter(|n| n.class == NodeClass::Mountain).count();
    let river =
        assigned.iter().filter(|n| n.class == NodeClass::River).count();
    assert_eq!(mountain, 5);
    assert_eq!(river, 5);
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn expiration_over_http() {
    let registry = start_registry();
    registry.client.upsert_inventory(&river_nodes(0..6)).await.unwrap();

    let a = registry
        .client
        .acquire(
            "1",
            &AcquireRequest {
                nummtn: 0,
                numrvr: 3,
                xname: String::new(),
                alias: String::new(),
            },
        )
        .await
        .unwrap();
    let b = registry
        .client
        .acquire(
            "2",
            &AcquireRequest {
                nummtn: 0,
                numrvr: 3,
                xname: String::new(),
                alias: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(a.len(), 3);
    assert_eq!(b.len(), 3);
    assert_eq!(registry.client.active_workers().await.unwrap(), 2);

    // push both workers and all heartbeats past the stale threshold
    let stale = Utc::now() - chrono::Duration::minutes(30);
    for n in a.iter().chain(b.iter()) {
        registry.store.backdate_heartbeat(&n.node_name, stale).await;
    }
    registry.store.backdate_worker("1", stale);
    registry.store.backdate_worker("2", stale);

    let url = format!(
        "http://{}/v1/consolepod/3/clear",
        registry.server.local_addr()
    );
    let response = reqwest::Client::new().delete(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    // nothing left to expire: status relaxes to 200
    let response = reqwest::Client::new().delete(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    assert_eq!(registry.client.active_workers().await.unwrap(), 0);
    for n in a.iter().chain(b.iter()) {
        let found =
            registry.client.lookup_node(&n.node_name).await.unwrap().unwrap();
        assert_eq!(found.node_console_name, "");
    }
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn heartbeat_and_release_round_trip() {
    let registry = start_registry();
    registry.client.upsert_inventory(&river_nodes(0..4)).await.unwrap();

    let mine = registry
        .client
        .acquire(
            "1",
            &AcquireRequest {
                nummtn: 0,
                numrvr: 4,
                xname: String::new(),
                alias: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(mine.len(), 4);

    let dropped = registry
        .client
        .heartbeat("1", mine.clone(), "")
        .await
        .unwrap();
    assert!(dropped.is_empty());

    let released =
        registry.client.release("1", &mine[..2]).await.unwrap();
    assert_eq!(released, 2);

    // released nodes now belong to nobody; heartbeating them reports them
    // as drops for this worker
    let dropped = registry
        .client
        .heartbeat("1", mine.clone(), "")
        .await
        .unwrap();
    assert_eq!(dropped.len(), 2);
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn invalid_nodes_are_rejected() {
    let registry = start_registry();
    let mut bad = node("x1000c0s0b0n0", NodeClass::River);
    bad.node_name = "x1000'; drop table ownership; --".to_string();
    match registry.client.upsert_inventory(&[bad]).await {
        Err(rcc_data_client::Error::Status { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::BAD_REQUEST)
        }
        other => panic!("expected bad request, got {:?}", other),
    }
    registry.server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_node_lookup_is_404() {
    let registry = start_registry();
    assert!(
        registry.client.lookup_node("x0c0s0b0n9").await.unwrap().is_none()
    );
    registry.server.close().await.unwrap();
}
