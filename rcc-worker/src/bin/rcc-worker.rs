// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs an RCC console worker

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use rcc_common::background::Driver;
use rcc_common::reaper::REAP_PERIOD_SECS;
use rcc_common::reaper::ZombieReaper;
use rcc_worker::WorkerContext;
use rcc_worker::aggregator::AggregationLog;
use rcc_worker::assignment::AssignmentTask;
use rcc_worker::config::Identity;
use rcc_worker::config::Knobs;
use rcc_worker::credentials::FakeKeySink;
use rcc_worker::credentials::FakeSecretStore;
use rcc_worker::credentials::HttpKeySink;
use rcc_worker::credentials::KeySink;
use rcc_worker::credentials::SecretStore;
use rcc_worker::credentials::VaultSecretStore;
use rcc_worker::heartbeat::HeartbeatTask;
use rcc_worker::monitor::CredentialMonitor;
use rcc_worker::monitor::MONITOR_PERIOD_SECS;
use rcc_worker::mux::MuxSupervisor;
use rcc_worker::operator_client::OperatorClient;
use rcc_worker::rotation::RotationSettings;
use rcc_worker::rotation::RotationTask;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::sync::watch;

/// Hard deadline on graceful shutdown before the process force-exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

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
    let config = rcc_worker::Config::from_file(&args.config_file)
        .context("loading configuration")?;
    let log = config
        .log
        .to_logger("rcc-worker")
        .context("failed to create logger")?;

    let debug = rcc_common::env::debug_mode();
    if debug {
        info!(log, "DEBUG mode: using self-test fakes");
    }
    let knobs = Knobs::from_env(&log);
    let rotation_settings = RotationSettings::from_env(&log);
    let identity = Identity::from_env(&log);
    let upstream = config.upstream.clone();

    // the multiplexer needs its log directory before it can start
    if let Err(error) = std::fs::create_dir_all(&upstream.console_log_dir) {
        warn!(log, "could not create console log directory";
            "path" => %upstream.console_log_dir, "error" => %error);
    }

    let data = rcc_data_client::Client::new(
        &upstream.data_url,
        log.new(o!("component" => "data-client")),
    );
    let secrets: Arc<dyn SecretStore> = if debug {
        Arc::new(FakeSecretStore::default())
    } else {
        Arc::new(VaultSecretStore::new(
            &upstream.secret_store_url,
            Utf8PathBuf::from(SERVICE_TOKEN_FILE).as_path(),
            log.new(o!("component" => "secret-store")),
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

    // placement must resolve before the first heartbeat can carry it
    let operator = OperatorClient::new(
        &upstream.operator_url,
        log.new(o!("component" => "operator-client")),
    );
    info!(log, "resolving placement"; "worker" => &identity.name);
    let placement = operator.placement_blocking(&identity.name).await;

    let aggregator = Arc::new(AggregationLog::new(
        &identity.agg_log_file(&upstream.agg_log_dir),
        log.new(o!("component" => "aggregation")),
    ));
    if let Err(error) = aggregator.respin() {
        warn!(log, "could not open aggregation log"; "error" => %error);
    }

    let ctx = Arc::new(WorkerContext::new(
        upstream,
        identity,
        placement,
        data,
        secrets,
        key_sink,
        aggregator,
        log.new(o!("component" => "worker")),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = MuxSupervisor::new(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
        log.new(o!("component" => "mux-supervisor")),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    let mut driver = Driver::new(shutdown_rx.clone());
    driver.register(
        "assignment",
        Duration::from_secs(knobs.node_update_sec),
        Box::new(AssignmentTask::new(Arc::clone(&ctx), knobs)),
        &log,
    );
    driver.register(
        "heartbeat",
        Duration::from_secs(knobs.heartbeat_send_sec),
        Box::new(HeartbeatTask::new(Arc::clone(&ctx))),
        &log,
    );
    driver.register(
        "credential_monitor",
        Duration::from_secs(MONITOR_PERIOD_SECS),
        Box::new(CredentialMonitor::new(Arc::clone(&ctx))),
        &log,
    );
    driver.register(
        "log_rotation",
        Duration::from_secs(rotation_settings.period_secs),
        Box::new(RotationTask::new(Arc::clone(&ctx), rotation_settings)),
        &log,
    );
    driver.register(
        "zombie_reaper",
        Duration::from_secs(REAP_PERIOD_SECS),
        Box::new(ZombieReaper),
        &log,
    );

    let server =
        rcc_worker::start_server(Arc::clone(&ctx), &config.dropshot, &log)?;
    info!(log, "worker listening"; "address" => %server.local_addr());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!(log, "caught SIGTERM"),
        _ = sigint.recv() => info!(log, "caught SIGINT"),
    }

    // graceful shutdown, with a hard deadline backstop
    shutdown_tx.send(true).ok();
    let shutdown_log = log.clone();
    let deadline = tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        warn!(shutdown_log, "graceful shutdown stalled, forcing exit");
        std::process::exit(1);
    });

    release_all_nodes(&ctx).await;
    supervisor_task.abort();
    drop(driver);
    if let Err(error) = server.close().await {
        warn!(log, "error draining server"; "error" => error);
    }
    deadline.abort();
    info!(log, "service exiting");
    Ok(())
}

/// Give every owned node back to the registry immediately so other
/// workers can pick the consoles up without waiting for heartbeat
/// expiration.
async fn release_all_nodes(ctx: &Arc<WorkerContext>) {
    let mut sets = ctx.nodes.lock().await;
    let nodes = sets.all_nodes();
    if nodes.is_empty() {
        return;
    }
    info!(ctx.log, "releasing all nodes for re-assignment";
        "count" => nodes.len());
    for node in &nodes {
        ctx.tailers.stop_tailing(&node.node_name).await;
    }
    sets.river.clear();
    sets.key_ssh.clear();
    sets.password_ssh.clear();
    match ctx.data.release(&ctx.identity.id, &nodes).await {
        Ok(released) => {
            info!(ctx.log, "released nodes"; "count" => released);
        }
        Err(error) => {
            warn!(ctx.log, "release on shutdown failed";
                "error" => %error);
        }
    }
}
