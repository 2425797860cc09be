// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Credential handling: BMC passwords, the console keypair, and key
//! deployment
//!
//! River and Paradise consoles authenticate with per-BMC passwords from
//! the secret store, fetched en masse on every configuration rebuild.
//! Key-SSH consoles use the fleet keypair: the private key comes from the
//! secret store (or a local fallback generator), the public half is
//! pushed to each BMC through the switch configuration service.

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use rcc_common::api::NodeInfo;
use serde_json::json;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

/// Retries when the secret store returns fewer password entries than
/// asked for; it may simply not be populated yet.
pub const PASSWORD_MAX_TRIES: u32 = 15;
pub const PASSWORD_RETRY_PAUSE: Duration = Duration::from_secs(10);

/// Secret-store name of the console private key, and the type requested
/// when it must be created.
const CONSOLE_KEY_NAME: &str = "mountain-bmc-console";
const CONSOLE_KEY_ALG: &str = "rsa-2048";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("request to secret store failed")]
    Request(#[from] reqwest::Error),
    #[error("secret store returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("secret store response missing {field}")]
    MissingField { field: &'static str },
    #[error("failed to stage key material")]
    Io(#[from] std::io::Error),
    #[error("ssh-keygen failed: {stderr}")]
    Keygen { stderr: String },
}

/// Read-only credential source.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Passwords for a set of BMCs.  Missing entries are simply absent
    /// from the result.
    async fn bmc_credentials(
        &self,
        bmcs: &[String],
    ) -> Result<BTreeMap<String, BmcCredentials>, SecretError>;

    /// The console private key, created in the store on first use.
    async fn console_private_key(&self) -> Result<String, SecretError>;
}

/// Secret store client speaking the vault-style protocol: kv reads for
/// BMC passwords, transit export for the console key.
pub struct VaultSecretStore {
    base_url: String,
    token_file: Utf8PathBuf,
    client: reqwest::Client,
    log: Logger,
}

impl VaultSecretStore {
    pub fn new(
        base_url: &str,
        token_file: &Utf8Path,
        log: Logger,
    ) -> VaultSecretStore {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        VaultSecretStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            token_file: token_file.to_owned(),
            client,
            log,
        }
    }

    async fn login(&self) -> Result<String, SecretError> {
        let jwt = tokio::fs::read_to_string(&self.token_file).await?;
        let url = format!("{}/auth/kubernetes/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "jwt": jwt.trim(),
                "role": "ssh-user-certs-compute",
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SecretError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: serde_json::Value = response.json().await?;
        body.pointer("/auth/client_token")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or(SecretError::MissingField { field: "auth.client_token" })
    }

    async fn read_bmc(
        &self,
        token: &str,
        bmc: &str,
    ) -> Result<Option<BmcCredentials>, SecretError> {
        let url = format!("{}/secret/hms-creds/{}", self.base_url, bmc);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: serde_json::Value = response.json().await?;
                let username = body
                    .pointer("/data/Username")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string();
                let password = body
                    .pointer("/data/Password")
                    .and_then(|p| p.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(BmcCredentials { username, password }))
            }
            status => Err(SecretError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn export_console_key(
        &self,
        token: &str,
    ) -> Result<Option<String>, SecretError> {
        let url = format!(
            "{}/transit/export/signing-key/{}",
            self.base_url, CONSOLE_KEY_NAME
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: serde_json::Value = response.json().await?;
                body.pointer("/data/keys/1")
                    .and_then(|k| k.as_str())
                    .filter(|k| !k.is_empty())
                    .map(|k| Some(k.to_string()))
                    .ok_or(SecretError::MissingField {
                        field: "data.keys.1",
                    })
            }
            status => Err(SecretError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn bmc_credentials(
        &self,
        bmcs: &[String],
    ) -> Result<BTreeMap<String, BmcCredentials>, SecretError> {
        let token = self.login().await?;
        let mut credentials = BTreeMap::new();
        for bmc in bmcs {
            match self.read_bmc(&token, bmc).await? {
                Some(creds) => {
                    credentials.insert(bmc.clone(), creds);
                }
                None => {
                    warn!(self.log, "no credentials in store for BMC";
                        "bmc" => bmc);
                }
            }
        }
        Ok(credentials)
    }

    async fn console_private_key(&self) -> Result<String, SecretError> {
        let token = self.login().await?;
        if let Some(key) = self.export_console_key(&token).await? {
            return Ok(key);
        }

        info!(self.log, "console key missing, asking the store to generate";
            "name" => CONSOLE_KEY_NAME, "type" => CONSOLE_KEY_ALG);
        let url =
            format!("{}/transit/keys/{}", self.base_url, CONSOLE_KEY_NAME);
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &token)
            .json(&json!({
                "type": CONSOLE_KEY_ALG,
                "exportable": "true",
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SecretError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        self.export_console_key(&token)
            .await?
            .ok_or(SecretError::MissingField { field: "data.keys.1" })
    }
}

/// Credential source stand-in for `DEBUG=TRUE` and tests.
#[derive(Default)]
pub struct FakeSecretStore {
    credentials: std::sync::Mutex<BTreeMap<String, BmcCredentials>>,
}

impl FakeSecretStore {
    pub fn set_credentials(&self, bmc: &str, username: &str, password: &str) {
        self.credentials.lock().unwrap().insert(
            bmc.to_string(),
            BmcCredentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn bmc_credentials(
        &self,
        bmcs: &[String],
    ) -> Result<BTreeMap<String, BmcCredentials>, SecretError> {
        let known = self.credentials.lock().unwrap();
        Ok(bmcs
            .iter()
            .filter_map(|bmc| {
                known.get(bmc).map(|c| (bmc.clone(), c.clone()))
            })
            .collect())
    }

    async fn console_private_key(&self) -> Result<String, SecretError> {
        Ok("debug-only-console-key".to_string())
    }
}

/// Fetch passwords, retrying while the store returns fewer entries than
/// requested.  After the retry budget is spent, proceed with what came
/// back; nodes without credentials get no console line and a warning.
pub async fn passwords_with_retries(
    log: &Logger,
    store: &dyn SecretStore,
    bmcs: &[String],
    max_tries: u32,
    pause: Duration,
) -> BTreeMap<String, BmcCredentials> {
    let mut last = BTreeMap::new();
    for attempt in 1..=max_tries {
        match store.bmc_credentials(bmcs).await {
            Ok(credentials) => {
                if bmcs.iter().all(|bmc| credentials.contains_key(bmc)) {
                    return credentials;
                }
                warn!(log, "credential fetch came back short";
                    "attempt" => attempt,
                    "returned" => credentials.len(),
                    "requested" => bmcs.len());
                last = credentials;
            }
            Err(error) => {
                warn!(log, "credential fetch failed";
                    "attempt" => attempt, "error" => %error);
            }
        }
        if attempt < max_tries {
            tokio::time::sleep(pause).await;
        }
    }
    warn!(log, "proceeding with incomplete credentials";
        "returned" => last.len(), "requested" => bmcs.len());
    last
}

/// The console keypair staged on the shared volume.
pub struct ConsoleKeys {
    key_dir: Utf8PathBuf,
}

impl ConsoleKeys {
    pub fn new(key_dir: &Utf8Path) -> ConsoleKeys {
        ConsoleKeys { key_dir: key_dir.to_owned() }
    }

    pub fn private_key_path(&self) -> Utf8PathBuf {
        self.key_dir.join("conman.key")
    }

    pub fn public_key_path(&self) -> Utf8PathBuf {
        self.key_dir.join("conman.key.pub")
    }

    /// Make sure the keypair exists on disk before the multiplexer starts
    /// any Key-SSH console.  Prefers the secret store; falls back to a
    /// locally generated keypair so consoles keep working without it.
    pub async fn ensure_present(
        &self,
        log: &Logger,
        store: &dyn SecretStore,
    ) -> Result<(), SecretError> {
        if self.private_key_path().exists()
            && self.public_key_path().exists()
        {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.key_dir).await?;

        match store.console_private_key().await {
            Ok(private_key) => {
                info!(log, "staging console keypair from the secret store");
                write_restricted(&self.private_key_path(), &private_key)
                    .await?;
                let output = tokio::process::Command::new("ssh-keygen")
                    .arg("-yf")
                    .arg(self.private_key_path().as_str())
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(SecretError::Keygen {
                        stderr: String::from_utf8_lossy(&output.stderr)
                            .to_string(),
                    });
                }
                write_restricted(
                    &self.public_key_path(),
                    &String::from_utf8_lossy(&output.stdout),
                )
                .await
            }
            Err(error) => {
                warn!(log, "secret store unavailable, generating keypair";
                    "error" => %error);
                let _ = tokio::fs::remove_file(self.private_key_path()).await;
                let _ = tokio::fs::remove_file(self.public_key_path()).await;
                let output = tokio::process::Command::new("ssh-keygen")
                    .args(["-q", "-t", "rsa", "-b", "2048", "-N", ""])
                    .arg("-f")
                    .arg(self.private_key_path().as_str())
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(SecretError::Keygen {
                        stderr: String::from_utf8_lossy(&output.stderr)
                            .to_string(),
                    });
                }
                tokio::fs::set_permissions(
                    self.private_key_path(),
                    std::fs::Permissions::from_mode(0o600),
                )
                .await?;
                Ok(())
            }
        }
    }
}

async fn write_restricted(
    path: &Utf8Path,
    contents: &str,
) -> Result<(), SecretError> {
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(0o600),
    )
    .await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum KeySinkError {
    #[error("request to switch configuration service failed")]
    Request(#[from] reqwest::Error),
    #[error("switch configuration service returned {status}")]
    Status { status: reqwest::StatusCode },
}

/// Sink that pushes the public console key to BMCs.
#[async_trait]
pub trait KeySink: Send + Sync {
    /// Deploy to the given BMC FQDNs; returns the FQDNs that succeeded.
    async fn deploy(
        &self,
        targets: &[String],
        public_key: &str,
    ) -> Result<BTreeSet<String>, KeySinkError>;
}

pub struct HttpKeySink {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl HttpKeySink {
    pub fn new(base_url: &str, log: Logger) -> HttpKeySink {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpKeySink {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            log,
        }
    }
}

#[async_trait]
impl KeySink for HttpKeySink {
    async fn deploy(
        &self,
        targets: &[String],
        public_key: &str,
    ) -> Result<BTreeSet<String>, KeySinkError> {
        #[derive(serde::Deserialize)]
        struct Target {
            #[serde(rename = "Xname")]
            xname: String,
            #[serde(rename = "StatusCode")]
            status_code: u16,
            #[serde(rename = "StatusMsg", default)]
            status_msg: String,
        }
        #[derive(serde::Deserialize)]
        struct Reply {
            #[serde(rename = "Targets", default)]
            targets: Vec<Target>,
        }

        let url = format!("{}/v1/bmc/loadcfg", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "Targets": targets,
                "Params": { "SSHConsoleKey": public_key },
                "Force": false,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeySinkError::Status { status });
        }
        let reply: Reply = response.json().await?;
        let mut succeeded = BTreeSet::new();
        for target in reply.targets {
            if target.status_code == 204 {
                info!(self.log, "deployed console key";
                    "bmc" => &target.xname);
                succeeded.insert(target.xname);
            } else {
                warn!(self.log, "console key deployment failed";
                    "bmc" => &target.xname,
                    "status" => target.status_code,
                    "message" => &target.status_msg);
            }
        }
        Ok(succeeded)
    }
}

/// Sink stand-in that accepts everything.
pub struct FakeKeySink;

#[async_trait]
impl KeySink for FakeKeySink {
    async fn deploy(
        &self,
        targets: &[String],
        _public_key: &str,
    ) -> Result<BTreeSet<String>, KeySinkError> {
        Ok(targets.iter().cloned().collect())
    }
}

/// Per-worker record of which Key-SSH BMCs still need the public key.
/// The supervisor feeds it the currently owned nodes; each configuration
/// pass retries whatever has not yet succeeded.
#[derive(Default)]
pub struct KeyDeploymentState {
    pending: BTreeSet<String>,
    deployed: BTreeSet<String>,
}

impl KeyDeploymentState {
    /// Note currently owned Key-SSH nodes; BMCs already deployed to are
    /// not retried.
    pub fn note_nodes<'a>(
        &mut self,
        nodes: impl Iterator<Item = &'a NodeInfo>,
    ) {
        for node in nodes {
            if !self.deployed.contains(&node.bmc_fqdn) {
                self.pending.insert(node.bmc_fqdn.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Attempt delivery to everything pending; successes move to the
    /// deployed set, failures stay for the next pass.
    pub async fn flush(
        &mut self,
        log: &Logger,
        sink: &dyn KeySink,
        public_key: &str,
    ) {
        if self.pending.is_empty() {
            return;
        }
        let targets: Vec<String> = self.pending.iter().cloned().collect();
        match sink.deploy(&targets, public_key).await {
            Ok(succeeded) => {
                for bmc in succeeded {
                    self.pending.remove(&bmc);
                    self.deployed.insert(bmc);
                }
                if !self.pending.is_empty() {
                    warn!(log, "key deployment incomplete";
                        "remaining" => self.pending.len());
                }
            }
            Err(error) => {
                warn!(log, "key deployment call failed";
                    "error" => %error);
            }
        }
    }
}
