// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::DateTime;
use chrono::Utc;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::aggregator::AggregationLog;
use crate::aggregator::TailerRegistry;
use crate::config::Identity;
use crate::config::UpstreamConfig;
use crate::credentials::BmcCredentials;
use crate::credentials::ConsoleKeys;
use crate::credentials::KeySink;
use crate::credentials::SecretStore;
use crate::mux::MuxHandle;
use crate::nodes::NodeSets;
use crate::operator_client::WorkerPlacement;

/// State shared by every worker loop and the HTTP handlers.
pub struct WorkerContext {
    pub config: UpstreamConfig,
    pub identity: Identity,
    /// where this worker runs, as reported by the operator at startup
    pub placement: WorkerPlacement,
    pub data: rcc_data_client::Client,
    pub secrets: Arc<dyn SecretStore>,
    pub key_sink: Arc<dyn KeySink>,
    pub console_keys: ConsoleKeys,
    /// the three ownership maps; one coarse lock covers a full
    /// assignment cycle or configuration generation
    pub nodes: tokio::sync::Mutex<NodeSets>,
    pub mux: MuxHandle,
    pub aggregator: Arc<AggregationLog>,
    pub tailers: TailerRegistry,
    /// credentials used at the last configuration generation, compared
    /// by the monitor to detect rotation upstream
    pub last_passwords: Mutex<BTreeMap<String, BmcCredentials>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    ready: AtomicBool,
    pub log: Logger,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: UpstreamConfig,
        identity: Identity,
        placement: WorkerPlacement,
        data: rcc_data_client::Client,
        secrets: Arc<dyn SecretStore>,
        key_sink: Arc<dyn KeySink>,
        aggregator: Arc<AggregationLog>,
        log: Logger,
    ) -> WorkerContext {
        let console_keys = ConsoleKeys::new(&config.key_dir);
        let tailers = TailerRegistry::new(
            &config.console_log_dir,
            Arc::clone(&aggregator),
            log.new(slog::o!("component" => "tailers")),
        );
        let mux =
            MuxHandle::new(log.new(slog::o!("component" => "mux-handle")));
        WorkerContext {
            config,
            identity,
            placement,
            data,
            secrets,
            key_sink,
            console_keys,
            nodes: tokio::sync::Mutex::new(NodeSets::new()),
            mux,
            aggregator,
            tailers,
            last_passwords: Mutex::new(BTreeMap::new()),
            last_heartbeat: Mutex::new(None),
            ready: AtomicBool::new(false),
            log,
        }
    }

    pub fn set_last_heartbeat(&self, when: DateTime<Utc>) {
        *self.last_heartbeat.lock().unwrap() = Some(when);
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock().unwrap()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}
