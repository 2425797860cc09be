// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with ownership registry configuration

use camino::Utf8Path;
use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use rcc_common::env::string_from_env;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub database: DbConfig,
}

/// Database connection parameters.  The config file provides defaults;
/// the `POSTGRES_*` environment variables override them, with the
/// password only ever coming from the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_name")]
    pub dbname: String,
}

fn default_db_host() -> String {
    "rcc-data-postgres".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_user() -> String {
    "console".to_string()
}
fn default_db_name() -> String {
    "service_db".to_string()
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            dbname: default_db_name(),
        }
    }
}

impl DbConfig {
    /// Fold in `POSTGRES_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.host = string_from_env("POSTGRES_HOST", &self.host);
        self.user = string_from_env("POSTGRES_USER", &self.user);
        self.dbname = string_from_env("POSTGRES_DB", &self.dbname);
        if let Ok(port) = std::env::var("POSTGRES_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }

    /// Connection string for tokio-postgres.  The password comes from
    /// `POSTGRES_PASSWD` and is appended last so the rest can be logged.
    pub fn connection_string(&self) -> String {
        let mut conn = format!(
            "sslmode=disable host={} port={} user={} dbname={}",
            self.host, self.port, self.user, self.dbname
        );
        if let Ok(password) = std::env::var("POSTGRES_PASSWD") {
            conn.push_str(&format!(" password={}", password));
        }
        conn
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
