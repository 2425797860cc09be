// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the RCC ownership registry

use anyhow::Context;
use anyhow::anyhow;
use camino::Utf8PathBuf;
use clap::Parser;
use rcc_data::datastore::MemStore;
use rcc_data::datastore::PgStore;
use rcc_data::datastore::OwnershipStore;
use slog::info;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let mut config = rcc_data::Config::from_file(&args.config_file)
        .context("loading configuration")?;
    config.database.apply_env();

    let log = config
        .log
        .to_logger("rcc-data")
        .context("failed to create logger")?;

    let store: Arc<dyn OwnershipStore> = if rcc_common::env::debug_mode() {
        info!(log, "DEBUG mode: using in-memory store");
        Arc::new(MemStore::new())
    } else {
        Arc::new(
            PgStore::connect(&config.database, log.clone())
                .await
                .context("connecting to database")?,
        )
    };

    let server = rcc_data::start_server(store, &config.dropshot, &log)?;
    info!(log, "ownership registry listening";
        "address" => %server.local_addr());
    server.await.map_err(|message| anyhow!("server exited: {}", message))
}
