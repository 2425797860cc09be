// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The assignment loop
//!
//! Each cycle re-reads the per-worker targets, claims more nodes from the
//! registry while below target, evicts down to target when over, and
//! pokes the supervisor whenever membership changed.  The whole cycle
//! runs under the nodes lock so configuration generation never observes a
//! half-applied change.

use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::api::AcquireRequest;
use rcc_common::background::BackgroundTask;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::Arc;

use crate::config::Knobs;
use crate::context::WorkerContext;

pub struct AssignmentTask {
    ctx: Arc<WorkerContext>,
    knobs: Knobs,
}

impl AssignmentTask {
    pub fn new(ctx: Arc<WorkerContext>, knobs: Knobs) -> AssignmentTask {
        AssignmentTask { ctx, knobs }
    }

    async fn run_once(&mut self, log: &Logger) {
        let ctx = &self.ctx;
        let mut sets = ctx.nodes.lock().await;
        let mut changed = false;

        // refresh targets; a read error keeps the previous values
        match rcc_common::targets::read_file(&ctx.config.targets_file) {
            Ok(targets) => sets.apply_targets(targets),
            Err(error) => {
                warn!(log, "could not read targets file";
                    "path" => %ctx.config.targets_file, "error" => %error);
            }
        }

        let (want_mountain, want_river) = sets.shortfall(
            self.knobs.max_acquire_mountain,
            self.knobs.max_acquire_river,
        );
        if want_mountain > 0 || want_river > 0 {
            let request = AcquireRequest {
                nummtn: want_mountain as u32,
                numrvr: want_river as u32,
                xname: ctx.placement.xname.clone(),
                alias: ctx.placement.alias.clone(),
            };
            match ctx.data.acquire(&ctx.identity.id, &request).await {
                Ok(assigned) => {
                    if !assigned.is_empty() {
                        info!(log, "acquired nodes";
                            "count" => assigned.len());
                        for node in assigned {
                            sets.insert(node);
                        }
                        changed = true;
                    }
                }
                Err(error) => {
                    warn!(log, "acquire failed"; "error" => %error);
                }
            }
        } else {
            info!(log, "at capacity, nothing to acquire";
                "river" => sets.river_count(),
                "mountain" => sets.mountain_count());
        }

        // over target?  evict back down and give the nodes back
        let evicted = sets.rebalance();
        if !evicted.is_empty() {
            info!(log, "rebalancing"; "evicting" => evicted.len());
            for node in &evicted {
                ctx.tailers.stop_tailing(&node.node_name).await;
            }
            match ctx.data.release(&ctx.identity.id, &evicted).await {
                Ok(released) => {
                    info!(log, "released nodes"; "count" => released);
                }
                Err(error) => {
                    // the nodes are already out of the local maps; the
                    // registry will expire them if this never succeeds
                    warn!(log, "release failed"; "error" => %error);
                }
            }
            changed = true;
        }

        drop(sets);
        if changed {
            // membership changed: regenerate configuration and restart
            self.ctx.mux.signal_term();
        }
    }
}

impl BackgroundTask for AssignmentTask {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        self.run_once(log).boxed()
    }
}
