// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The heartbeat loop
//!
//! Reports everything this worker believes it owns to the registry on a
//! fixed period.  The registry answers with the nodes that belong to
//! someone else (or must be given up under the self-monitor policy);
//! those are dropped locally and the supervisor restarts the
//! multiplexer.

use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::background::BackgroundTask;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::sync::Arc;

use crate::context::WorkerContext;

pub struct HeartbeatTask {
    ctx: Arc<WorkerContext>,
}

impl HeartbeatTask {
    pub fn new(ctx: Arc<WorkerContext>) -> HeartbeatTask {
        HeartbeatTask { ctx }
    }

    async fn run_once(&mut self, log: &Logger) {
        let ctx = &self.ctx;
        let mut sets = ctx.nodes.lock().await;
        let nodes = sets.all_nodes();
        debug!(log, "sending heartbeat"; "nodes" => nodes.len());
        ctx.set_last_heartbeat(chrono::Utc::now());

        let dropped = match ctx
            .data
            .heartbeat(&ctx.identity.id, nodes, &ctx.placement.xname)
            .await
        {
            Ok(dropped) => dropped,
            Err(error) => {
                warn!(log, "heartbeat failed"; "error" => %error);
                return;
            }
        };
        if dropped.is_empty() {
            return;
        }

        info!(log, "registry dropped nodes"; "count" => dropped.len());
        for node in &dropped {
            sets.remove(&node.node_name);
            ctx.tailers.stop_tailing(&node.node_name).await;
        }
        drop(sets);
        self.ctx.mux.signal_term();
    }
}

impl BackgroundTask for HeartbeatTask {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        self.run_once(log).boxed()
    }
}
