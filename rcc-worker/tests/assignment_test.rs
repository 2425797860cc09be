// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assignment and heartbeat loops against a fake registry
//!
//! The registry is an httptest server, the targets file a tempfile; the
//! loops run one cycle at a time so the tests can assert exactly what
//! traffic each cycle produced.

use camino::Utf8PathBuf;
use httptest::Expectation;
use httptest::matchers::request;
use httptest::responders::json_encoded;
use httptest::responders::status_code;
use rcc_common::api::NodeClass;
use rcc_common::api::NodeInfo;
use rcc_common::background::BackgroundTask;
use rcc_common::targets::TargetCounts;
use rcc_worker::WorkerContext;
use rcc_worker::aggregator::AggregationLog;
use rcc_worker::assignment::AssignmentTask;
use rcc_worker::config::Identity;
use rcc_worker::config::Knobs;
use rcc_worker::config::UpstreamConfig;
use rcc_worker::credentials::FakeKeySink;
use rcc_worker::credentials::FakeSecretStore;
use rcc_worker::heartbeat::HeartbeatTask;
use rcc_worker::operator_client::WorkerPlacement;
use slog::Logger;
use slog::o;
use std::sync::Arc;

struct TestWorker {
    _dir: tempfile::TempDir,
    ctx: Arc<WorkerContext>,
    targets_file: Utf8PathBuf,
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn knobs() -> Knobs {
    Knobs {
        heartbeat_send_sec: 30,
        node_update_sec: 30,
        max_acquire_mountain: 200,
        max_acquire_river: 500,
    }
}

fn node(name: &str, class: NodeClass) -> NodeInfo {
    NodeInfo {
        node_name: name.to_string(),
        bmc_name: format!("{}b", name),
        bmc_fqdn: format!("{}b.local", name),
        class,
        nid: 1,
        role: "Compute".to_string(),
        node_console_name: String::new(),
    }
}

fn test_worker(registry_url: &str) -> TestWorker {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let targets_file = root.join("TargetNodes.txt");
    let upstream = UpstreamConfig {
        data_url: registry_url.to_string(),
        operator_url: "http://unused".to_string(),
        scs_url: "http://unused".to_string(),
        secret_store_url: "http://unused".to_string(),
        targets_file: targets_file.clone(),
        key_dir: root.join("keys"),
        base_conf_file: root.join("conman_base.conf"),
        conf_file: root.join("conman.conf"),
        console_log_dir: root.join("conman-logs"),
        agg_log_dir: root.join("consoleAgg"),
        log_backup_dir: root.join("conman.old"),
        logrotate_conf_file: root.join("logrotate.conman"),
        logrotate_state_file: root.join("rot_conman.state"),
    };
    let aggregator = Arc::new(AggregationLog::new(
        &root.join("consoleAgg/consoleAgg-test.log"),
        test_logger(),
    ));
    let ctx = Arc::new(WorkerContext::new(
        upstream,
        Identity { name: "rcc-worker-1".to_string(), id: "1".to_string() },
        WorkerPlacement {
            worker: "rcc-worker-1".to_string(),
            alias: "nid000001".to_string(),
            xname: "x3000c0s1b0n0".to_string(),
        },
        rcc_data_client::Client::new(registry_url, test_logger()),
        Arc::new(FakeSecretStore::default()),
        Arc::new(FakeKeySink),
        aggregator,
        test_logger(),
    ));
    TestWorker { _dir: dir, ctx, targets_file }
}

#[tokio::test]
async fn claims_up_to_target() {
    let server = httptest::Server::run();
    let assigned = vec![
        node("x0n0", NodeClass::River),
        node("x0n1", NodeClass::River),
        node("x9n0", NodeClass::Mountain),
    ];
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/v1/consolepod/1/acquire",
        ))
        .respond_with(json_encoded(assigned)),
    );

    let worker = test_worker(&server.url_str(""));
    rcc_common::targets::write_file(
        &worker.targets_file,
        &TargetCounts { river: 2, mountain: 1 },
    )
    .unwrap();

    let mut task = AssignmentTask::new(Arc::clone(&worker.ctx), knobs());
    task.activate(&test_logger()).await;

    let sets = worker.ctx.nodes.lock().await;
    assert_eq!(sets.river_count(), 2);
    assert_eq!(sets.mountain_count(), 1);
    // membership changed: exactly one restart request
    assert_eq!(worker.ctx.mux.term_requests(), 1);
}

#[tokio::test]
async fn rebalance_releases_excess_in_one_call() {
    let server = httptest::Server::run();
    // over target: the cycle must not acquire, and must release exactly
    // once
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/v1/consolepod/1/release",
        ))
        .times(1)
        .respond_with(
            status_code(200)
                .append_header("content-type", "application/json")
                .body(r#"{"message":"deleted=4"}"#),
        ),
    );

    let worker = test_worker(&server.url_str(""));
    {
        let mut sets = worker.ctx.nodes.lock().await;
        for i in 0..10 {
            sets.insert(node(&format!("x9n{}", i), NodeClass::Mountain));
        }
    }
    rcc_common::targets::write_file(
        &worker.targets_file,
        &TargetCounts { river: 0, mountain: 6 },
    )
    .unwrap();

    let mut task = AssignmentTask::new(Arc::clone(&worker.ctx), knobs());
    task.activate(&test_logger()).await;

    let sets = worker.ctx.nodes.lock().await;
    assert_eq!(sets.mountain_count(), 6);
    assert_eq!(worker.ctx.mux.term_requests(), 1);
}

#[tokio::test]
async fn unreadable_targets_keep_previous_values() {
    let server = httptest::Server::run();
    let worker = test_worker(&server.url_str(""));
    {
        let mut sets = worker.ctx.nodes.lock().await;
        sets.apply_targets(rcc_common::targets::PartialTargets {
            river: Some(3),
            mountain: Some(2),
        });
        for i in 0..3 {
            sets.insert(node(&format!("x0n{}", i), NodeClass::River));
        }
        for i in 0..2 {
            sets.insert(node(&format!("x9n{}", i), NodeClass::Mountain));
        }
    }
    // no targets file on disk at all; the cycle is at capacity and makes
    // no registry calls (the server would fail any unexpected request)
    let mut task = AssignmentTask::new(Arc::clone(&worker.ctx), knobs());
    task.activate(&test_logger()).await;

    let sets = worker.ctx.nodes.lock().await;
    assert_eq!(sets.target_river, Some(3));
    assert_eq!(sets.target_mountain, Some(2));
    assert_eq!(sets.total(), 5);
    assert_eq!(worker.ctx.mux.term_requests(), 0);
}

#[tokio::test]
async fn heartbeat_drops_foreign_nodes() {
    let server = httptest::Server::run();
    let mine = node("x0n0", NodeClass::River);
    let stolen = node("x0n1", NodeClass::River);
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/v1/consolepod/1/heartbeat",
        ))
        .respond_with(json_encoded(vec![stolen.clone()])),
    );

    let worker = test_worker(&server.url_str(""));
    {
        let mut sets = worker.ctx.nodes.lock().await;
        sets.insert(mine.clone());
        sets.insert(stolen.clone());
    }

    let mut task = HeartbeatTask::new(Arc::clone(&worker.ctx));
    task.activate(&test_logger()).await;

    let sets = worker.ctx.nodes.lock().await;
    assert_eq!(sets.total(), 1);
    assert!(sets.river.contains_key(&mine.node_name));
    assert!(worker.ctx.last_heartbeat().is_some());
    assert_eq!(worker.ctx.mux.term_requests(), 1);
}
