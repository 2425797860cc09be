// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mountain console keypair management and deployment
//!
//! Key-SSH consoles authenticate with a fleet-wide ssh keypair.  The
//! private key lives in the secret store (generated there on first use)
//! and is staged to the shared volume; the public key is derived locally
//! and pushed to each Key-SSH BMC through the switch configuration
//! service.  Deployment failures are retried per target with backoff.

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use rcc_common::api::ConnectionMethod;
use rcc_common::api::NodeInfo;
use serde::Deserialize;
use serde_json::json;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;

/// File names of the keypair on the shared volume.
pub const PRIVATE_KEY_FILE: &str = "conman.key";
pub const PUBLIC_KEY_FILE: &str = "conman.key.pub";

/// Name under which the secret store keeps the console private key.
const SECRET_KEY_NAME: &str = "mountain-bmc-console";
/// Key type requested when the secret store must generate the key.
const SECRET_KEY_ALG: &str = "rsa-2048";

/// How many queued nodes the reconciler may buffer for deployment.
pub const DEPLOY_QUEUE_DEPTH: usize = 100;

/// Pause between deployment retries after a failure.
const DEPLOY_RETRY_PAUSE: Duration = Duration::from_secs(60);
/// Quiet period used to batch queued nodes into one deployment call.
const DEPLOY_BATCH_QUIET: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
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

/// Source of the console private key.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the private key, asking the store to generate it first if it
    /// does not exist yet.
    async fn private_key(&self) -> Result<String, KeyError>;
}

/// Secret store client speaking the transit-key protocol.
pub struct HttpKeySource {
    base_url: String,
    token_file: Utf8PathBuf,
    client: reqwest::Client,
    log: Logger,
}

impl HttpKeySource {
    pub fn new(
        base_url: &str,
        token_file: &Utf8Path,
        log: Logger,
    ) -> HttpKeySource {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpKeySource {
            base_url: base_url.trim_end_matches('/').to_string(),
            token_file: token_file.to_owned(),
            client,
            log,
        }
    }

    async fn authenticate(&self) -> Result<String, KeyError> {
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
            return Err(KeyError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: serde_json::Value = response.json().await?;
        body.get("auth")
            .and_then(|auth| auth.get("client_token"))
            .and_then(|token| token.as_str())
            .map(str::to_string)
            .ok_or(KeyError::MissingField { field: "auth.client_token" })
    }

    async fn export_key(
        &self,
        token: &str,
    ) -> Result<Option<String>, KeyError> {
        let url = format!(
            "{}/transit/export/signing-key/{}",
            self.base_url, SECRET_KEY_NAME
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
                body.get("data")
                    .and_then(|data| data.get("keys"))
                    .and_then(|keys| keys.get("1"))
                    .and_then(|key| key.as_str())
                    .filter(|key| !key.is_empty())
                    .map(|key| Some(key.to_string()))
                    .ok_or(KeyError::MissingField { field: "data.keys.1" })
            }
            status => Err(KeyError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn generate_key(&self, token: &str) -> Result<(), KeyError> {
        info!(self.log, "asking secret store to generate the console key";
            "name" => SECRET_KEY_NAME, "type" => SECRET_KEY_ALG);
        let url =
            format!("{}/transit/keys/{}", self.base_url, SECRET_KEY_NAME);
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", token)
            .json(&json!({
                "type": SECRET_KEY_ALG,
                "exportable": "true",
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeyError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn private_key(&self) -> Result<String, KeyError> {
        let token = self.authenticate().await?;
        if let Some(key) = self.export_key(&token).await? {
            return Ok(key);
        }
        // the key does not exist yet: generate, then export again
        self.generate_key(&token).await?;
        self.export_key(&token)
            .await?
            .ok_or(KeyError::MissingField { field: "data.keys.1" })
    }
}

/// Key source stand-in for `DEBUG=TRUE` and tests.
pub struct FakeKeySource(pub String);

#[async_trait]
impl KeySource for FakeKeySource {
    async fn private_key(&self) -> Result<String, KeyError> {
        Ok(self.0.clone())
    }
}

/// Per-target outcome of a deployment call.
#[derive(Clone, Debug, Deserialize)]
pub struct DeployStatus {
    #[serde(rename = "Xname")]
    pub xname: String,
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "StatusMsg", default)]
    pub status_msg: String,
}

#[derive(Debug, thiserror::Error)]
pub enum KeySinkError {
    #[error("request to switch configuration service failed")]
    Request(#[from] reqwest::Error),
    #[error("switch configuration service returned {status}")]
    Status { status: reqwest::StatusCode },
}

/// Sink that pushes public keys to BMCs.
#[async_trait]
pub trait KeySink: Send + Sync {
    async fn deploy(
        &self,
        targets: &[String],
        public_key: &str,
    ) -> Result<Vec<DeployStatus>, KeySinkError>;
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
    ) -> Result<Vec<DeployStatus>, KeySinkError> {
        #[derive(Deserialize)]
        struct Reply {
            #[serde(rename = "Targets", default)]
            targets: Vec<DeployStatus>,
        }
        info!(self.log, "deploying console key";
            "targets" => targets.len());
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
        for target in &reply.targets {
            if target.status_code == 204 {
                info!(self.log, "deployed console key";
                    "bmc" => &target.xname);
            } else {
                warn!(self.log, "console key deployment failed";
                    "bmc" => &target.xname,
                    "status" => target.status_code,
                    "message" => &target.status_msg);
            }
        }
        Ok(reply.targets)
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
    ) -> Result<Vec<DeployStatus>, KeySinkError> {
        Ok(targets
            .iter()
            .map(|t| DeployStatus {
                xname: t.clone(),
                status_code: 204,
                status_msg: "OK".to_string(),
            })
            .collect())
    }
}

/// The on-disk keypair on the shared volume.
pub struct KeyMaterial {
    key_dir: Utf8PathBuf,
}

impl KeyMaterial {
    pub fn new(key_dir: &Utf8Path) -> KeyMaterial {
        KeyMaterial { key_dir: key_dir.to_owned() }
    }

    pub fn private_key_path(&self) -> Utf8PathBuf {
        self.key_dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> Utf8PathBuf {
        self.key_dir.join(PUBLIC_KEY_FILE)
    }

    /// Make sure both key files exist, fetching the private key from the
    /// secret store (or, failing that, generating a keypair locally so
    /// consoles keep working without it).
    pub async fn ensure_keypair(
        &self,
        log: &Logger,
        source: &dyn KeySource,
    ) -> Result<(), KeyError> {
        if self.private_key_path().exists()
            && self.public_key_path().exists()
        {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.key_dir).await?;

        match source.private_key().await {
            Ok(private_key) => {
                info!(log, "staging console key from the secret store");
                self.write_private_key(&private_key).await?;
                self.derive_public_key().await
            }
            Err(error) => {
                warn!(log,
                    "secret store unavailable, generating a local keypair";
                    "error" => %error);
                self.generate_local_keypair().await
            }
        }
    }

    async fn write_private_key(&self, key: &str) -> Result<(), KeyError> {
        let path = self.private_key_path();
        tokio::fs::write(&path, key).await?;
        tokio::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(0o600),
        )
        .await?;
        Ok(())
    }

    async fn derive_public_key(&self) -> Result<(), KeyError> {
        let output = tokio::process::Command::new("ssh-keygen")
            .arg("-yf")
            .arg(self.private_key_path().as_str())
            .output()
            .await?;
        if !output.status.success() {
            return Err(KeyError::Keygen {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let path = self.public_key_path();
        tokio::fs::write(&path, &output.stdout).await?;
        tokio::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(0o600),
        )
        .await?;
        Ok(())
    }

    async fn generate_local_keypair(&self) -> Result<(), KeyError> {
        let private = self.private_key_path();
        // ssh-keygen refuses to overwrite; clear any partial state first
        let _ = tokio::fs::remove_file(&private).await;
        let _ = tokio::fs::remove_file(self.public_key_path()).await;
        let output = tokio::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "rsa", "-b", "2048", "-N", ""])
            .arg("-f")
            .arg(private.as_str())
            .output()
            .await?;
        if !output.status.success() {
            return Err(KeyError::Keygen {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        tokio::fs::set_permissions(
            &private,
            std::fs::Permissions::from_mode(0o600),
        )
        .await?;
        Ok(())
    }
}

/// Consumes newly discovered Key-SSH nodes and pushes the public key to
/// their BMCs, batching bursts and retrying failed targets.
pub struct KeyDeployer {
    rx: mpsc::Receiver<NodeInfo>,
    sink: std::sync::Arc<dyn KeySink>,
    material: KeyMaterial,
    shutdown: watch::Receiver<bool>,
    log: Logger,
}

impl KeyDeployer {
    pub fn new(
        rx: mpsc::Receiver<NodeInfo>,
        sink: std::sync::Arc<dyn KeySink>,
        key_dir: &Utf8Path,
        shutdown: watch::Receiver<bool>,
        log: Logger,
    ) -> KeyDeployer {
        KeyDeployer {
            rx,
            sink,
            material: KeyMaterial::new(key_dir),
            shutdown,
            log,
        }
    }

    pub async fn run(mut self) {
        // nodes awaiting deployment, keyed by node name
        let mut pending: BTreeMap<String, NodeInfo> = BTreeMap::new();
        loop {
            tokio::select! {
                node = self.rx.recv() => {
                    let Some(node) = node else { return };
                    if node.class.connection_method()
                        == ConnectionMethod::KeySsh
                    {
                        pending.insert(node.node_name.clone(), node);
                    }
                }
                _ = tokio::time::sleep(DEPLOY_BATCH_QUIET),
                    if !pending.is_empty() =>
                {
                    let before = pending.len();
                    pending = self.deploy_batch(pending).await;
                    if !pending.is_empty() {
                        warn!(self.log, "key deployment incomplete";
                            "attempted" => before,
                            "remaining" => pending.len());
                        tokio::time::sleep(DEPLOY_RETRY_PAUSE).await;
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn deploy_batch(
        &self,
        pending: BTreeMap<String, NodeInfo>,
    ) -> BTreeMap<String, NodeInfo> {
        let public_key =
            match tokio::fs::read_to_string(self.material.public_key_path())
                .await
            {
                Ok(key) => key,
                Err(error) => {
                    warn!(self.log, "public key not readable yet";
                        "error" => %error);
                    return pending;
                }
            };

        // one deployment per BMC covers every node behind it
        let mut nodes_by_bmc: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in pending.values() {
            nodes_by_bmc
                .entry(node.bmc_fqdn.clone())
                .or_default()
                .push(node.node_name.clone());
        }
        let targets: Vec<String> = nodes_by_bmc.keys().cloned().collect();

        let statuses = match self.sink.deploy(&targets, &public_key).await {
            Ok(statuses) => statuses,
            Err(error) => {
                warn!(self.log, "key deployment call failed";
                    "error" => %error);
                return pending;
            }
        };

        let mut pending = pending;
        for status in statuses {
            if status.status_code == 204 {
                if let Some(nodes) = nodes_by_bmc.get(&status.xname) {
                    for node in nodes {
                        pending.remove(node);
                    }
                }
            }
        }
        pending
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rcc_common::api::NodeClass;
    use slog::o;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn node(name: &str, bmc: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: bmc.to_string(),
            bmc_fqdn: format!("{}.local", bmc),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    /// Sink that fails nominated BMCs.
    struct FlakySink {
        fail: Vec<String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl KeySink for FlakySink {
        async fn deploy(
            &self,
            targets: &[String],
            _public_key: &str,
        ) -> Result<Vec<DeployStatus>, KeySinkError> {
            self.calls.lock().unwrap().push(targets.to_vec());
            Ok(targets
                .iter()
                .map(|t| DeployStatus {
                    xname: t.clone(),
                    status_code: if self.fail.contains(t) { 500 } else { 204 },
                    status_msg: String::new(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn failed_targets_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir =
            camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
                .unwrap();
        std::fs::write(key_dir.join(PUBLIC_KEY_FILE), "ssh-rsa AAAA test")
            .unwrap();

        let sink = Arc::new(FlakySink {
            fail: vec!["b1.local".to_string()],
            calls: Mutex::new(Vec::new()),
        });
        let (_tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let deployer = KeyDeployer::new(
            rx,
            Arc::clone(&sink) as Arc<dyn KeySink>,
            &key_dir,
            shutdown_rx,
            test_logger(),
        );

        let mut pending = BTreeMap::new();
        for n in [
            node("x0n0", "b0", NodeClass::Mountain),
            node("x0n1", "b0", NodeClass::Mountain),
            node("x1n0", "b1", NodeClass::Hill),
        ] {
            pending.insert(n.node_name.clone(), n);
        }

        let remaining = deployer.deploy_batch(pending).await;
        // both nodes behind the healthy BMC are done; the failed BMC's
        // node remains for retry
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("x1n0"));
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["b0.local", "b1.local"]);
    }
}
