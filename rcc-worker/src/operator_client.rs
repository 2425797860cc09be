// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the operator's placement API
//!
//! A worker needs to know where it is running (the xname of its host
//! node) so the registry can apply the self-monitor policy.  The mapping
//! is not always available immediately after startup, so the fetch blocks
//! with retries.

use serde::Deserialize;
use slog::Logger;
use slog::info;
use slog::warn;
use std::time::Duration;

/// How long to wait between placement lookup attempts.
pub const PLACEMENT_RETRY_PAUSE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OperatorClientError {
    #[error("request to operator failed")]
    Request(#[from] reqwest::Error),
}

/// Where this worker runs, per the operator.  An empty xname means the
/// alias could not be mapped; the self-monitor policy simply never
/// triggers in that case.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WorkerPlacement {
    #[serde(rename = "podname", default)]
    pub worker: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub xname: String,
}

pub struct OperatorClient {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl OperatorClient {
    pub fn new(base_url: &str, log: Logger) -> OperatorClient {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        OperatorClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            log,
        }
    }

    pub async fn placement(
        &self,
        worker: &str,
    ) -> Result<WorkerPlacement, OperatorClientError> {
        let url = format!("{}/location/{}", self.base_url, worker);
        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Fetch placement, retrying until the operator answers.  Worker
    /// startup blocks on this.
    pub async fn placement_blocking(
        &self,
        worker: &str,
    ) -> WorkerPlacement {
        loop {
            match self.placement(worker).await {
                Ok(placement) => {
                    info!(self.log, "placement resolved";
                        "alias" => &placement.alias,
                        "xname" => &placement.xname);
                    return placement;
                }
                Err(error) => {
                    warn!(self.log,
                        "failed to retrieve placement from operator, \
                         retrying";
                        "pause_secs" => PLACEMENT_RETRY_PAUSE.as_secs(),
                        "error" => %error);
                    tokio::time::sleep(PLACEMENT_RETRY_PAUSE).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use httptest::Expectation;
    use httptest::matchers::request;
    use httptest::responders::json_encoded;
    use serde_json::json;
    use slog::o;

    #[tokio::test]
    async fn placement_decodes() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/location/rcc-worker-3",
            ))
            .respond_with(json_encoded(json!({
                "podname": "rcc-worker-3",
                "alias": "nid000012",
                "xname": "x3000c0s13b0n0",
            }))),
        );
        let client = OperatorClient::new(
            &server.url_str(""),
            Logger::root(slog::Discard, o!()),
        );
        let placement = client.placement("rcc-worker-3").await.unwrap();
        assert_eq!(placement.alias, "nid000012");
        assert_eq!(placement.xname, "x3000c0s13b0n0");
    }
}
