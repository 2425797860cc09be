// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the RCC operator

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use rcc_common::background::Driver;
use rcc_common::reaper::REAP_PERIOD_SECS;
use rcc_common::reaper::ZombieReaper;
use rcc_operator::autoscaler::Autoscaler;
use rcc_operator::config::Knobs;
use rcc_operator::config::MaxNodesPerWorker;
use rcc_operator::context::OperatorStatus;
use rcc_operator::context::ServerContext;
use rcc_operator::hsm::FakeHsm;
use rcc_operator::hsm::Hsm;
use rcc_operator::hsm::HttpHsm;
use rcc_operator::inventory::Reconciler;
use rcc_operator::keys::DEPLOY_QUEUE_DEPTH;
use rcc_operator::keys::FakeKeySink;
use rcc_operator::keys::FakeKeySource;
use rcc_operator::keys::HttpKeySink;
use rcc_operator::keys::HttpKeySource;
use rcc_operator::keys::KeyDeployer;
use rcc_operator::keys::KeyMaterial;
use rcc_operator::keys::KeySink;
use rcc_operator::keys::KeySource;
use rcc_operator::location::FakeLocationSource;
use rcc_operator::location::HttpLocationSource;
use rcc_operator::location::LocationSource;
use rcc_operator::orchestrator::FakeOrchestrator;
use rcc_operator::orchestrator::HttpOrchestrator;
use rcc_operator::orchestrator::Orchestrator;
use rcc_operator::sweeper::HeartbeatSweeper;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::sync::mpsc;
use tokio::sync::watch;

/// Name prefix of the worker replica set; worker ids are appended when
/// answering placement queries.
const WORKER_SET: &str = "rcc-worker";

/// Path of the service-account token used to authenticate to the secret
/// store.
const SERVICE_TOKEN_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = rcc_operator::Config::from_file(&args.config_file)
        .context("loading configuration")?;
    let log = config
        .log
        .to_logger("rcc-operator")
        .context("failed to create logger")?;

    let debug = rcc_common::env::debug_mode();
    if debug {
        info!(log, "DEBUG mode: using self-test fakes");
    }
    let knobs = Knobs::from_env(&log);
    let max_nodes = Arc::new(MaxNodesPerWorker::from_env(&log));
    let status = Arc::new(Mutex::new(OperatorStatus::default()));
    let upstream = &config.upstream;

    let data = rcc_data_client::Client::new(
        &upstream.data_url,
        log.new(o!("component" => "data-client")),
    );
    let hsm: Arc<dyn Hsm> = if debug {
        Arc::new(FakeHsm {
            redfish: Vec::new(),
            components: Vec::new(),
            paradise: Default::default(),
        })
    } else {
        Arc::new(HttpHsm::new(&upstream.hsm_url))
    };
    let orchestrator: Arc<dyn Orchestrator> = if debug {
        Arc::new(FakeOrchestrator::new(1))
    } else {
        Arc::new(HttpOrchestrator::new(&upstream.orchestrator_url))
    };
    let location: Arc<dyn LocationSource> = if debug {
        Arc::new(FakeLocationSource(Vec::new()))
    } else {
        Arc::new(HttpLocationSource::new(&upstream.location_url))
    };
    let key_source: Arc<dyn KeySource> = if debug {
        Arc::new(FakeKeySource("debug-only-key".to_string()))
    } else {
        Arc::new(HttpKeySource::new(
            &upstream.secret_store_url,
            Utf8PathBuf::from(SERVICE_TOKEN_FILE).as_path(),
            log.new(o!("component" => "key-source")),
        ))
    };
    let key_sink: Arc<dyn KeySink> = if debug {
        Arc::new(FakeKeySink)
    } else {
        Arc::new(HttpKeySink::new(
            &upstream.scs_url,
            log.new(o!("component" => "key-sink")),
        ))
    };

    // the console keypair must exist before any key deployment can work
    let material = KeyMaterial::new(&upstream.key_dir);
    if let Err(error) =
        material.ensure_keypair(&log, key_source.as_ref()).await
    {
        warn!(log, "could not establish console keypair";
            "error" => %error);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (key_deploy_tx, key_deploy_rx) = mpsc::channel(DEPLOY_QUEUE_DEPTH);
    let deployer = KeyDeployer::new(
        key_deploy_rx,
        Arc::clone(&key_sink),
        &upstream.key_dir,
        shutdown_rx.clone(),
        log.new(o!("component" => "key-deployer")),
    );
    let deployer_task = tokio::spawn(deployer.run());

    let autoscaler = Autoscaler::new(
        Arc::clone(&orchestrator),
        &upstream.targets_file,
        Arc::clone(&max_nodes),
        Arc::clone(&status),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&hsm),
        data.clone(),
        autoscaler,
        key_deploy_tx,
        Arc::clone(&status),
    );
    let sweeper =
        HeartbeatSweeper::new(data.clone(), knobs.heartbeat_stale_minutes);

    let mut driver = Driver::new(shutdown_rx.clone());
    driver.register(
        "inventory_reconciler",
        Duration::from_secs(knobs.hardware_update_sec),
        Box::new(reconciler),
        &log,
    );
    driver.register(
        "heartbeat_sweeper",
        Duration::from_secs(knobs.heartbeat_check_sec),
        Box::new(sweeper),
        &log,
    );
    driver.register(
        "zombie_reaper",
        Duration::from_secs(REAP_PERIOD_SECS),
        Box::new(ZombieReaper),
        &log,
    );

    let context = Arc::new(ServerContext {
        data,
        orchestrator,
        location,
        status,
        max_nodes,
        knobs,
        worker_set: WORKER_SET.to_string(),
        log: log.new(o!("component" => "ServerContext")),
    });
    let server =
        rcc_operator::start_server(context, &config.dropshot, &log)?;
    info!(log, "operator listening"; "address" => %server.local_addr());

    // wait for the signal to shut down
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!(log, "caught SIGTERM"),
        _ = sigint.recv() => info!(log, "caught SIGINT"),
    }

    shutdown_tx.send(true).ok();
    deployer_task.abort();
    drop(driver);
    if let Err(error) = server.close().await {
        warn!(log, "error draining server"; "error" => error);
    }
    info!(log, "service exiting");
    Ok(())
}
