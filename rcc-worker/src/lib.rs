// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RCC worker
//!
//! One replica of the horizontally scaled console service.  Claims a
//! subset of nodes from the ownership registry, keeps them heartbeated,
//! supervises the local console multiplexer over them, and aggregates and
//! rotates their console logs.

pub mod aggregator;
pub mod assignment;
pub mod config;
pub mod context;
pub mod credentials;
pub mod heartbeat;
pub mod monitor;
pub mod mux;
pub mod mux_config;
pub mod nodes;
pub mod operator_client;
pub mod rotation;

mod http_entrypoints;

use slog::o;
use std::sync::Arc;

pub use config::Config;
pub use context::WorkerContext;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

pub type Server = dropshot::HttpServer<Arc<WorkerContext>>;

pub fn start_server(
    context: Arc<WorkerContext>,
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
