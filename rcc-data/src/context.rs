// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::Logger;
use std::sync::Arc;

use crate::datastore::OwnershipStore;

/// Shared state available to every request handler.
pub struct ServerContext {
    pub store: Arc<dyn OwnershipStore>,
    pub log: Logger,
}

impl ServerContext {
    pub fn new(store: Arc<dyn OwnershipStore>, log: Logger) -> ServerContext {
        ServerContext { store, log }
    }
}
