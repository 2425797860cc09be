// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RCC ownership registry
//!
//! The authority on which worker serves which node's console.  See
//! `datastore` for the registry semantics and `http_entrypoints` for the
//! wire surface.

use slog::o;
use std::sync::Arc;

pub mod config;
mod context;
pub mod datastore;
mod http_entrypoints;

pub use config::Config;
pub use context::ServerContext;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

pub type Server = dropshot::HttpServer<Arc<ServerContext>>;

/// Start the dropshot server over an already-initialized store.
pub fn start_server(
    store: Arc<dyn datastore::OwnershipStore>,
    dropshot_config: &dropshot::ConfigDropshot,
    log: &slog::Logger,
) -> Result<Server, StartError> {
    let context = ServerContext::new(
        store,
        log.new(o!("component" => "ServerContext")),
    );
    dropshot::ServerBuilder::new(
        http_entrypoints::api(),
        Arc::new(context),
        log.new(o!("component" => "dropshot")),
    )
    .config(dropshot_config.clone())
    .start()
    .map_err(StartError::InitializeHttpServer)
}
