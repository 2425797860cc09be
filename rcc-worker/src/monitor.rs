// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Credential change detection
//!
//! BMC passwords and the console keypair can rotate upstream at any
//! time.  This loop compares the on-disk key files (by hash) and a fresh
//! password fetch against what the last configuration was built with;
//! any difference restarts the multiplexer, which regenerates its
//! configuration from fresh material.

use camino::Utf8Path;
use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::background::BackgroundTask;
use sha2::Digest;
use sha2::Sha256;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::Arc;

use crate::context::WorkerContext;

/// How often credentials are checked.
pub const MONITOR_PERIOD_SECS: u64 = 30;

pub struct CredentialMonitor {
    ctx: Arc<WorkerContext>,
    last_private_hash: Option<[u8; 32]>,
    last_public_hash: Option<[u8; 32]>,
}

impl CredentialMonitor {
    pub fn new(ctx: Arc<WorkerContext>) -> CredentialMonitor {
        CredentialMonitor {
            ctx,
            last_private_hash: None,
            last_public_hash: None,
        }
    }

    async fn run_once(&mut self, log: &Logger) {
        let mut restart = false;
        if self.console_keys_changed(log).await {
            info!(log, "console keypair changed, restarting multiplexer");
            restart = true;
        }
        if self.passwords_changed(log).await {
            info!(log, "BMC passwords changed, restarting multiplexer");
            restart = true;
        }
        if restart {
            self.ctx.mux.signal_term();
        }
    }

    /// Hash both key files and compare against the previous pass.  The
    /// first observation only records hashes; a keypair appearing is not
    /// a change.
    async fn console_keys_changed(&mut self, log: &Logger) -> bool {
        // keys are irrelevant without key-ssh consoles
        {
            let sets = self.ctx.nodes.lock().await;
            if sets.key_ssh.is_empty() {
                return false;
            }
        }

        let private =
            match hash_file(&self.ctx.console_keys.private_key_path()) {
                Ok(hash) => hash,
                Err(error) => {
                    warn!(log, "could not hash private key";
                        "error" => %error);
                    return false;
                }
            };
        let public =
            match hash_file(&self.ctx.console_keys.public_key_path()) {
                Ok(hash) => hash,
                Err(error) => {
                    warn!(log, "could not hash public key";
                        "error" => %error);
                    return false;
                }
            };

        let changed = match (self.last_private_hash, self.last_public_hash) {
            (Some(last_private), Some(last_public)) => {
                last_private != private || last_public != public
            }
            _ => false,
        };
        self.last_private_hash = Some(private);
        self.last_public_hash = Some(public);
        changed
    }

    /// Refetch passwords once (no retries, to keep the lock hold short)
    /// and compare with what the last configuration used.
    async fn passwords_changed(&mut self, log: &Logger) -> bool {
        let ctx = &self.ctx;
        let previous = ctx.last_passwords.lock().unwrap().clone();
        if previous.is_empty() {
            // nothing has been configured yet
            return false;
        }

        let sets = ctx.nodes.lock().await;
        let bmcs: Vec<String> = sets
            .river
            .values()
            .chain(sets.password_ssh.values())
            .map(|n| n.bmc_name.clone())
            .collect();
        drop(sets);
        if bmcs.is_empty() {
            return false;
        }

        let current = match ctx.secrets.bmc_credentials(&bmcs).await {
            Ok(current) => current,
            Err(error) => {
                warn!(log, "credential check fetch failed";
                    "error" => %error);
                return false;
            }
        };

        for bmc in &bmcs {
            let Some(current_creds) = current.get(bmc) else {
                warn!(log, "missing credentials during change check";
                    "bmc" => bmc);
                continue;
            };
            match previous.get(bmc) {
                Some(previous_creds) if previous_creds == current_creds => {}
                _ => return true,
            }
        }
        false
    }
}

fn hash_file(path: &Utf8Path) -> std::io::Result<[u8; 32]> {
    let contents = std::fs::read(path)?;
    Ok(Sha256::digest(&contents).into())
}

impl BackgroundTask for CredentialMonitor {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        self.run_once(log).boxed()
    }
}
