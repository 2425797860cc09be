// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::DateTime;
use chrono::Utc;
use rcc_common::targets::TargetCounts;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::Knobs;
use crate::config::MaxNodesPerWorker;
use crate::location::LocationSource;
use crate::orchestrator::Orchestrator;

/// Observable operator state, shared between the reconciler/autoscaler
/// loops and the health handler.  Everything here is a snapshot; the
/// loops own the live data.
#[derive(Clone, Copy, Debug, Default)]
pub struct OperatorStatus {
    /// number of consoles in the last successfully synced inventory
    pub console_count: Option<usize>,
    /// when the last hardware reconcile pass started
    pub hardware_update_time: Option<DateTime<Utc>>,
    /// worker replica count last pushed to the orchestrator
    pub replica_count: Option<u64>,
    /// per-worker targets last written to the shared file
    pub targets: Option<TargetCounts>,
}

/// Shared state available to every request handler.
pub struct ServerContext {
    pub data: rcc_data_client::Client,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub location: Arc<dyn LocationSource>,
    pub status: Arc<Mutex<OperatorStatus>>,
    pub max_nodes: Arc<MaxNodesPerWorker>,
    pub knobs: Knobs,
    /// name prefix of the worker replica set, used to answer placement
    /// queries
    pub worker_set: String,
    pub log: Logger,
}
