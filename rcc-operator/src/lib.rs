// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RCC operator
//!
//! Singleton control loop for the console fleet: discovers hardware from
//! the HSM, keeps the ownership registry's inventory in sync, scales the
//! worker replica set to the inventory, maintains the mountain console
//! keypair, and answers cluster-wide placement queries.

pub mod autoscaler;
pub mod config;
pub mod context;
pub mod hsm;
mod http_entrypoints;
pub mod inventory;
pub mod keys;
pub mod location;
pub mod orchestrator;
pub mod sweeper;

use slog::o;
use std::sync::Arc;

pub use config::Config;
pub use context::ServerContext;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

pub type Server = dropshot::HttpServer<Arc<ServerContext>>;

pub fn start_server(
    context: Arc<ServerContext>,
    dropshot_config: &dropshot::ConfigDropshot,
    log: &slog::Logger,
) -> Result<Server, StartError> {
    dropshot::ServerBuilder::new(
        http_entrypoints::api(),
        context,
        log.new(o!("component" => "dropshot")),
    )
    .config(dropshot_config.clone())
    .start()
    .map_err(StartError::InitializeHttpServer)
}
