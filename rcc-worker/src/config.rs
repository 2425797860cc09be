// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker configuration: config file, environment knobs, identity

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use rand::Rng;
use rcc_common::env::int_from_env;
use serde::Deserialize;
use slog::Logger;
use slog::info;
use slog::warn;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Addresses of collaborators and the file locations this worker uses.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// ownership registry base URL
    pub data_url: String,
    /// operator base URL (placement lookup)
    pub operator_url: String,
    /// switch configuration service base URL
    pub scs_url: String,
    /// secret store base URL
    pub secret_store_url: String,
    /// per-worker targets file on the shared volume
    pub targets_file: Utf8PathBuf,
    /// directory holding the mountain console keypair
    pub key_dir: Utf8PathBuf,
    /// base multiplexer configuration, copied verbatim
    pub base_conf_file: Utf8PathBuf,
    /// generated multiplexer configuration
    pub conf_file: Utf8PathBuf,
    /// directory where the multiplexer writes per-node console logs
    pub console_log_dir: Utf8PathBuf,
    /// directory for the per-worker aggregation log
    pub agg_log_dir: Utf8PathBuf,
    /// where rotated logs are moved
    pub log_backup_dir: Utf8PathBuf,
    /// generated logrotate configuration
    pub logrotate_conf_file: Utf8PathBuf,
    /// logrotate state file
    pub logrotate_state_file: Utf8PathBuf,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            data_url: "http://rcc-data".to_string(),
            operator_url: "http://rcc-operator".to_string(),
            scs_url: "http://cray-scsd".to_string(),
            secret_store_url: "http://secret-store:8200/v1".to_string(),
            targets_file: Utf8PathBuf::from(
                "/var/log/console/TargetNodes.txt",
            ),
            key_dir: Utf8PathBuf::from("/var/log/console"),
            base_conf_file: Utf8PathBuf::from("/app/conman_base.conf"),
            conf_file: Utf8PathBuf::from("/etc/conman.conf"),
            console_log_dir: Utf8PathBuf::from("/var/log/conman"),
            agg_log_dir: Utf8PathBuf::from("/tmp/consoleAgg"),
            log_backup_dir: Utf8PathBuf::from("/var/log/conman.old"),
            logrotate_conf_file: Utf8PathBuf::from("/app/logrotate.conman"),
            logrotate_state_file: Utf8PathBuf::from("/tmp/rot_conman.state"),
        }
    }
}

/// Environment-derived tuning, fixed for the life of the process.
#[derive(Clone, Copy, Debug)]
pub struct Knobs {
    /// seconds between heartbeats to the registry
    pub heartbeat_send_sec: u64,
    /// seconds between assignment cycles
    pub node_update_sec: u64,
    /// most mountain-budget nodes claimed in one cycle
    pub max_acquire_mountain: u64,
    /// most river nodes claimed in one cycle
    pub max_acquire_river: u64,
}

impl Knobs {
    pub fn from_env(log: &Logger) -> Knobs {
        Knobs {
            heartbeat_send_sec: int_from_env(
                log,
                "HEARTBEAT_SEND_FREQ_SEC",
                30,
                5,
                300,
            ),
            node_update_sec: int_from_env(
                log,
                "NODE_UPDATE_FREQ_SEC",
                30,
                10,
                600,
            ),
            max_acquire_mountain: int_from_env(
                log,
                "MAX_ACQUIRE_PER_UPDATE_MTN",
                200,
                5,
                2000,
            ),
            max_acquire_river: int_from_env(
                log,
                "MAX_ACQUIRE_PER_UPDATE_RVR",
                500,
                5,
                4000,
            ),
        }
    }
}

/// This worker's identity within the replica set.
#[derive(Clone, Debug)]
pub struct Identity {
    /// full replica name, e.g. `rcc-worker-4`
    pub name: String,
    /// trailing id token, e.g. `4`
    pub id: String,
}

impl Identity {
    /// Identity comes from `MY_POD_NAME`; without it (development runs)
    /// a random id keeps replicas from colliding in the registry.
    pub fn from_env(log: &Logger) -> Identity {
        let name = match std::env::var("MY_POD_NAME") {
            Ok(name) if !name.is_empty() => {
                info!(log, "worker name found"; "name" => &name);
                name
            }
            _ => {
                let name = format!(
                    "rcc-worker-{}",
                    rand::rng().random_range(1000..3000)
                );
                warn!(log, "MY_POD_NAME not set, using random identity";
                    "name" => &name);
                name
            }
        };
        let id = match name.rsplit_once('-') {
            Some((_, id)) if !id.is_empty() => id.to_string(),
            _ => {
                warn!(log, "unexpected worker name format"; "name" => &name);
                name.clone()
            }
        };
        Identity { name, id }
    }

    /// The aggregation log is per worker, named after the replica.
    pub fn agg_log_file(&self, agg_dir: &Utf8Path) -> Utf8PathBuf {
        agg_dir.join(format!("consoleAgg-{}.log", self.name))
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
    fn identity_parses_trailing_token() {
        let log = Logger::root(slog::Discard, o!());
        std::env::set_var("MY_POD_NAME", "rcc-worker-17");
        let identity = Identity::from_env(&log);
        assert_eq!(identity.name, "rcc-worker-17");
        assert_eq!(identity.id, "17");
        std::env::remove_var("MY_POD_NAME");

        let identity = Identity::from_env(&log);
        assert!(identity.name.starts_with("rcc-worker-"));
        assert_eq!(
            identity.agg_log_file(Utf8Path::new("/tmp/consoleAgg")),
            Utf8PathBuf::from(format!(
                "/tmp/consoleAgg/consoleAgg-{}.log",
                identity.name
            ))
        );
    }
}
