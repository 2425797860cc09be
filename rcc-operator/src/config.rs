// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator configuration: config file plus environment knobs

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use rcc_common::env::int_from_env;
use serde::Deserialize;
use slog::Logger;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Addresses of the external collaborators and shared files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// ownership registry base URL
    pub data_url: String,
    /// hardware state manager base URL
    pub hsm_url: String,
    /// switch configuration service base URL (public key deployment)
    pub scs_url: String,
    /// location service base URL (xname/alias mapping)
    pub location_url: String,
    /// orchestrator base URL (replica control, placement)
    pub orchestrator_url: String,
    /// secret store base URL (console keypair)
    pub secret_store_url: String,
    /// per-worker targets file on the shared volume
    pub targets_file: Utf8PathBuf,
    /// directory holding the mountain console keypair
    pub key_dir: Utf8PathBuf,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            data_url: "http://rcc-data".to_string(),
            hsm_url: "http://cray-smd".to_string(),
            scs_url: "http://cray-scsd".to_string(),
            location_url: "http://cray-sls".to_string(),
            orchestrator_url: "http://rcc-orchestrator".to_string(),
            secret_store_url: "http://secret-store:8200/v1".to_string(),
            targets_file: Utf8PathBuf::from(
                "/var/log/console/TargetNodes.txt",
            ),
            key_dir: Utf8PathBuf::from("/var/log/console"),
        }
    }
}

/// Environment-derived tuning, fixed for the life of the process.
#[derive(Clone, Copy, Debug)]
pub struct Knobs {
    /// seconds between hardware reconcile passes
    pub hardware_update_sec: u64,
    /// seconds between stale-heartbeat sweeps
    pub heartbeat_check_sec: u64,
    /// heartbeat age (minutes) at which ownership expires
    pub heartbeat_stale_minutes: u64,
}

impl Knobs {
    pub fn from_env(log: &Logger) -> Knobs {
        Knobs {
            hardware_update_sec: int_from_env(
                log,
                "HARDWARE_UPDATE_SEC_FREQ",
                30,
                10,
                14400,
            ),
            heartbeat_check_sec: int_from_env(
                log,
                "HEARTBEAT_CHECK_SEC_FREQ",
                15,
                10,
                300,
            ),
            heartbeat_stale_minutes: int_from_env(
                log,
                "HEARTBEAT_STALE_DURATION_MINUTES",
                3,
                1,
                60,
            ),
        }
    }
}

/// Per-worker connection caps.  Seeded from the environment, adjustable at
/// runtime through the `setMaxNodesPerPod` endpoint.
#[derive(Debug)]
pub struct MaxNodesPerWorker {
    mountain: AtomicU64,
    river: AtomicU64,
}

impl MaxNodesPerWorker {
    pub fn from_env(log: &Logger) -> MaxNodesPerWorker {
        MaxNodesPerWorker {
            mountain: AtomicU64::new(int_from_env(
                log,
                "MAX_MTN_NODES_PER_POD",
                750,
                5,
                1500,
            )),
            river: AtomicU64::new(int_from_env(
                log,
                "MAX_RVR_NODES_PER_POD",
                2000,
                5,
                4000,
            )),
        }
    }

    pub fn mountain(&self) -> u64 {
        self.mountain.load(Ordering::Relaxed)
    }

    pub fn river(&self) -> u64 {
        self.river.load(Ordering::Relaxed)
    }

    /// Runtime override; values are pinned into the allowed ranges and the
    /// pinned values returned.
    pub fn set(&self, mountain: u64, river: u64) -> (u64, u64) {
        let mountain = mountain.clamp(2, 750);
        let river = river.clamp(2, 2000);
        self.mountain.store(mountain, Ordering::Relaxed);
        self.river.store(river, Ordering::Relaxed);
        (mountain, river)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.as_std_path().into(), err }
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.as_std_path().into(),
            err,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    #[test]
    fn max_nodes_pinning() {
        let log = Logger::root(slog::Discard, o!());
        let maxes = MaxNodesPerWorker::from_env(&log);
        assert_eq!(maxes.set(1, 1), (2, 2));
        assert_eq!(maxes.set(10_000, 10_000), (750, 2000));
        assert_eq!(maxes.set(300, 1200), (300, 1200));
        assert_eq!(maxes.mountain(), 300);
        assert_eq!(maxes.river(), 1200);
    }
}
