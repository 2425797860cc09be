// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker autoscaling
//!
//! From the live per-class node counts and the per-worker caps, compute
//! how many worker replicas are required and how many nodes each should
//! hold, then push both answers out: the replica count to the
//! orchestrator, the per-worker targets to the shared file every worker
//! polls.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use rcc_common::targets::TargetCounts;
use rcc_common::targets::write_file;
use slog::Logger;
use slog::crit;
use slog::info;
use slog::warn;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::MaxNodesPerWorker;
use crate::context::OperatorStatus;
use crate::orchestrator::Orchestrator;

/// Consecutive targets-file failures tolerated before the operator gives
/// up.  A stuck targets file silently starves the whole fleet, so this
/// escalates to process exit and an orchestrator restart.
const MAX_FILE_ERRORS: u32 = 3;

/// Replica count and per-worker targets for given node counts.
///
/// One extra replica absorbs exact-multiple boundaries and gives evicted
/// self-monitored nodes somewhere to go; the per-worker targets are padded
/// by the current replica count so fleet capacity always exceeds demand.
pub fn compute_scale(
    num_mountain: u64,
    num_river: u64,
    max_mountain: u64,
    max_river: u64,
    current_replicas: u64,
) -> (u64, TargetCounts) {
    let max_mountain = max_mountain.max(1);
    let max_river = max_river.max(1);
    let replicas =
        num_mountain.div_ceil(max_mountain).max(num_river.div_ceil(max_river))
            + 1;
    let targets = TargetCounts {
        mountain: num_mountain.div_ceil(replicas) + 1 + current_replicas,
        river: num_river.div_ceil(replicas) + 1 + current_replicas,
    };
    (replicas, targets)
}

pub struct Autoscaler {
    orchestrator: Arc<dyn Orchestrator>,
    targets_file: Utf8PathBuf,
    max_nodes: Arc<MaxNodesPerWorker>,
    status: Arc<Mutex<OperatorStatus>>,
    consecutive_file_errors: u32,
}

impl Autoscaler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        targets_file: &Utf8Path,
        max_nodes: Arc<MaxNodesPerWorker>,
        status: Arc<Mutex<OperatorStatus>>,
    ) -> Autoscaler {
        Autoscaler {
            orchestrator,
            targets_file: targets_file.to_owned(),
            max_nodes,
            status,
            consecutive_file_errors: 0,
        }
    }

    /// React to fresh node counts from the reconciler.
    pub async fn update(
        &mut self,
        log: &Logger,
        num_mountain: u64,
        num_river: u64,
    ) {
        // an empty read is far more likely a transient discovery failure
        // than a cluster with no nodes; never shrink on it
        if num_mountain + num_river == 0 {
            info!(log, "no nodes found, skipping scale update");
            return;
        }

        // pad per-worker targets by the current replica count so an
        // evicted self-monitored node always has somewhere to go
        let current_replicas = match self.orchestrator.replica_count().await {
            Ok(count) => count,
            Err(error) => {
                warn!(log, "could not read current replica count";
                    "error" => %error);
                0
            }
        };

        let (replicas, targets) = compute_scale(
            num_mountain,
            num_river,
            self.max_nodes.mountain(),
            self.max_nodes.river(),
            current_replicas,
        );
        info!(log, "computed scale";
            "num_mountain" => num_mountain,
            "num_river" => num_river,
            "replicas" => replicas,
            "target_mountain" => targets.mountain,
            "target_river" => targets.river,
        );

        match self.orchestrator.set_replica_count(replicas).await {
            Ok(()) => {
                self.status.lock().unwrap().replica_count = Some(replicas);
            }
            Err(error) => {
                // leave the recorded count alone so the next cycle retries
                warn!(log, "failed to scale worker replica set";
                    "replicas" => replicas, "error" => %error);
            }
        }

        self.write_targets(log, &targets);
    }

    fn write_targets(&mut self, log: &Logger, targets: &TargetCounts) {
        if let Some(dir) = self.targets_file.parent() {
            if let Err(error) = std::fs::create_dir_all(dir) {
                self.file_error(log, "create targets directory", &error);
                return;
            }
        }
        match write_file(&self.targets_file, targets) {
            Ok(()) => {
                self.consecutive_file_errors = 0;
                self.status.lock().unwrap().targets = Some(*targets);
            }
            Err(error) => {
                self.file_error(log, "write targets file", &error);
            }
        }
    }

    fn file_error(
        &mut self,
        log: &Logger,
        what: &str,
        error: &std::io::Error,
    ) {
        self.consecutive_file_errors += 1;
        if self.consecutive_file_errors > MAX_FILE_ERRORS {
            crit!(log, "repeated shared-volume failures, exiting";
                "operation" => what,
                "failures" => self.consecutive_file_errors,
                "error" => %error);
            std::process::exit(1);
        }
        warn!(log, "targets file update failed";
            "operation" => what,
            "failures" => self.consecutive_file_errors,
            "error" => %error);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scale_for_small_system() {
        // 100 mountain, 200 river with generous caps: one worker would
        // do, the formula keeps a spare
        let (replicas, targets) = compute_scale(100, 200, 750, 2000, 0);
        assert_eq!(replicas, 2);
        assert_eq!(targets.mountain, 51);
        assert_eq!(targets.river, 101);
    }

    #[test]
    fn scale_at_exact_cap_multiple() {
        let (replicas, _) = compute_scale(1500, 0, 750, 2000, 0);
        assert_eq!(replicas, 3);
    }

    #[test]
    fn replica_padding_feeds_targets() {
        let (_, unpadded) = compute_scale(90, 90, 750, 2000, 0);
        let (_, padded) = compute_scale(90, 90, 750, 2000, 4);
        assert_eq!(padded.mountain, unpadded.mountain + 4);
        assert_eq!(padded.river, unpadded.river + 4);
    }

    #[test]
    fn river_can_dominate_replica_count() {
        let (replicas, _) = compute_scale(10, 9000, 750, 2000, 0);
        assert_eq!(replicas, 6);
    }

    #[test]
    fn zero_caps_do_not_divide_by_zero() {
        let (replicas, _) = compute_scale(10, 10, 0, 0, 0);
        assert_eq!(replicas, 11);
    }
}
