// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stale-heartbeat sweeps
//!
//! A worker that dies without releasing its nodes leaves rows with aging
//! heartbeats.  This task periodically asks the registry to expire them
//! so surviving workers can pick the consoles back up.

use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::background::BackgroundTask;
use slog::Logger;
use slog::debug;
use slog::warn;

pub struct HeartbeatSweeper {
    data: rcc_data_client::Client,
    stale_minutes: u64,
}

impl HeartbeatSweeper {
    pub fn new(
        data: rcc_data_client::Client,
        stale_minutes: u64,
    ) -> HeartbeatSweeper {
        HeartbeatSweeper { data, stale_minutes }
    }
}

impl BackgroundTask for HeartbeatSweeper {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        async move {
            debug!(log, "sweeping stale heartbeats";
                "stale_minutes" => self.stale_minutes);
            if let Err(error) =
                self.data.clear_stale(self.stale_minutes).await
            {
                warn!(log, "stale-heartbeat sweep failed";
                    "error" => %error);
            }
        }
        .boxed()
    }
}
