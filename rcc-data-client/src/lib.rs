// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the RCC ownership registry (`rcc-data`)
//!
//! Both the operator (inventory sync, expire sweeps, node lookups) and the
//! workers (claim/heartbeat/release) talk to the registry through this
//! client.  Every call carries a client-side deadline; the registry itself
//! imposes none.

use rcc_common::api::AcquireRequest;
use rcc_common::api::ActiveWorkers;
use rcc_common::api::HeartbeatRequest;
use rcc_common::api::Message;
use rcc_common::api::NodeInfo;
use reqwest::StatusCode;
use slog::Logger;
use slog::debug;
use std::time::Duration;

/// Default deadline applied to every registry call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to ownership registry failed")]
    Request(#[from] reqwest::Error),
    #[error("ownership registry returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("unexpected response body {body:?}")]
    UnexpectedBody { body: String },
}

#[derive(Clone)]
pub struct Client {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    /// `base_url` addresses the service root (e.g.
    /// `http://rcc-data`); the `/v1` prefix is appended here.
    pub fn new(base_url: &str, log: Logger) -> Client {
        Client::with_timeout(base_url, DEFAULT_TIMEOUT, log)
    }

    pub fn with_timeout(
        base_url: &str,
        timeout: Duration,
        log: Logger,
    ) -> Client {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Client {
            base_url: format!("{}/v1", base_url.trim_end_matches('/')),
            client,
            log,
        }
    }

    /// PUT the full (or incremental) inventory; returns how many rows were
    /// newly created.
    pub async fn upsert_inventory(
        &self,
        nodes: &[NodeInfo],
    ) -> Result<u64, Error> {
        let url = format!("{}/inventory", self.base_url);
        let response = self.client.put(&url).json(nodes).send().await?;
        let response = check_status(response).await?;
        if response.status() == StatusCode::CREATED {
            parse_count(&response.json::<Message>().await?.message, "created=")
        } else {
            // 200 with no body: nothing was created
            Ok(0)
        }
    }

    /// Delete nodes that have left the system entirely; returns the number
    /// of rows removed.
    pub async fn delete_inventory(
        &self,
        nodes: &[NodeInfo],
    ) -> Result<u64, Error> {
        let url = format!("{}/inventory", self.base_url);
        let response = self.client.delete(&url).json(nodes).send().await?;
        let response = check_status(response).await?;
        parse_count(&response.json::<Message>().await?.message, "deleted=")
    }

    /// Ask the registry for up to `nummtn` mountain-budget nodes and
    /// `numrvr` river nodes; the returned records are now owned by
    /// `worker_id`.
    pub async fn acquire(
        &self,
        worker_id: &str,
        request: &AcquireRequest,
    ) -> Result<Vec<NodeInfo>, Error> {
        let url = format!("{}/consolepod/{}/acquire", self.base_url, worker_id);
        debug!(
            self.log,
            "acquiring nodes";
            "worker" => worker_id,
            "nummtn" => request.nummtn,
            "numrvr" => request.numrvr,
        );
        let response = self.client.post(&url).json(request).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Refresh ownership of `nodes`; the response lists nodes this worker
    /// must drop.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        nodes: Vec<NodeInfo>,
        location: &str,
    ) -> Result<Vec<NodeInfo>, Error> {
        let url =
            format!("{}/consolepod/{}/heartbeat", self.base_url, worker_id);
        let body = HeartbeatRequest {
            curr_nodes: nodes,
            pod_location: location.to_string(),
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Give nodes back for re-assignment; returns how many rows were
    /// released.
    pub async fn release(
        &self,
        worker_id: &str,
        nodes: &[NodeInfo],
    ) -> Result<u64, Error> {
        let url = format!("{}/consolepod/{}/release", self.base_url, worker_id);
        let response = self.client.post(&url).json(nodes).send().await?;
        let response = check_status(response).await?;
        parse_count(&response.json::<Message>().await?.message, "deleted=")
    }

    /// Expire ownership of every node whose heartbeat is older than
    /// `minutes`.
    pub async fn clear_stale(&self, minutes: u64) -> Result<(), Error> {
        let url = format!("{}/consolepod/{}/clear", self.base_url, minutes);
        let response = self.client.delete(&url).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Look up a node and its current owner.  `Ok(None)` means the node is
    /// not in the inventory at all.
    pub async fn lookup_node(
        &self,
        node_name: &str,
    ) -> Result<Option<NodeInfo>, Error> {
        let url = format!("{}/consolepod/{}", self.base_url, node_name);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(response).await?.json().await?))
    }

    /// Number of workers the registry currently considers active.
    pub async fn active_workers(&self) -> Result<u64, Error> {
        let url = format!("{}/activepods", self.base_url);
        let response = self.client.get(&url).send().await?;
        let counts: ActiveWorkers =
            check_status(response).await?.json().await?;
        Ok(counts.numactivepods)
    }

    /// Liveness probe; any 2xx counts.
    pub async fn liveness(&self) -> Result<(), Error> {
        let url = format!("{}/liveness", self.base_url);
        let response = self.client.get(&url).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Message>(&body)
        .map(|m| m.message)
        .unwrap_or(body);
    Err(Error::Status { status, message })
}

// Responses report counts as "created=N" / "deleted=N" messages.
fn parse_count(message: &str, prefix: &str) -> Result<u64, Error> {
    message
        .strip_prefix(prefix)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| Error::UnexpectedBody { body: message.to_string() })
}

#[cfg(test)]
mod test {
    use super::*;
    use httptest::Expectation;
    use httptest::matchers::request;
    use httptest::responders::json_encoded;
    use httptest::responders::status_code;
    use rcc_common::api::NodeClass;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn node(name: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: "x3000c0s1b0".to_string(),
            bmc_fqdn: "x3000c0s1b0.local".to_string(),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    #[test]
    fn count_parsing() {
        assert_eq!(parse_count("created=12", "created=").unwrap(), 12);
        assert_eq!(parse_count("deleted=0", "deleted=").unwrap(), 0);
        assert!(parse_count("created=x", "created=").is_err());
        assert!(parse_count("twelve", "created=").is_err());
    }

    #[tokio::test]
    async fn acquire_decodes_nodes() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/v1/consolepod/7/acquire",
            ))
            .respond_with(json_encoded(vec![node(
                "x3000c0s1b0n0",
                NodeClass::River,
            )])),
        );

        let client = Client::new(&server.url_str(""), test_logger());
        let got = client
            .acquire(
                "7",
                &AcquireRequest {
                    nummtn: 0,
                    numrvr: 1,
                    xname: String::new(),
                    alias: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].node_name, "x3000c0s1b0n0");
    }

    #[tokio::test]
    async fn upsert_handles_both_statuses() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/v1/inventory"))
                .times(2)
                .respond_with(
                    status_code(201)
                        .append_header("content-type", "application/json")
                        .body(r#"{"message":"created=3"}"#),
                ),
        );
        let client = Client::new(&server.url_str(""), test_logger());
        let nodes = vec![node("x3000c0s1b0n0", NodeClass::Hill)];
        assert_eq!(client.upsert_inventory(&nodes).await.unwrap(), 3);
        assert_eq!(client.upsert_inventory(&nodes).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn lookup_maps_404_to_none() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/consolepod/x9999c0s0b0n0",
            ))
            .respond_with(status_code(404)),
        );
        let client = Client::new(&server.url_str(""), test_logger());
        assert!(client.lookup_node("x9999c0s0b0n0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errors_surface_the_message() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/v1/consolepod/7/release",
            ))
            .respond_with(
                status_code(500)
                    .append_header("content-type", "application/json")
                    .body(r#"{"message":"db is unhappy"}"#),
            ),
        );
        let client = Client::new(&server.url_str(""), test_logger());
        match client.release("7", &[]).await {
            Err(Error::Status { status, message }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "db is unhappy");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }
}
