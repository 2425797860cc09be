// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestrator interface: worker replica control and placement
//!
//! The orchestrator owns the worker replica set.  The operator only ever
//! needs three things from it: how many replicas exist, to request a
//! different count, and which cluster node a given worker landed on.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("request to orchestrator failed")]
    Request(#[from] reqwest::Error),
    #[error("worker {0:?} has no placement")]
    UnknownWorker(String),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Current size of the worker replica set.
    async fn replica_count(&self) -> Result<u64, OrchestratorError>;

    /// Request the replica set be scaled to `replicas`.
    async fn set_replica_count(
        &self,
        replicas: u64,
    ) -> Result<(), OrchestratorError>;

    /// Alias of the cluster node a worker is placed on.
    async fn worker_location_alias(
        &self,
        worker: &str,
    ) -> Result<String, OrchestratorError>;
}

#[derive(Deserialize, Serialize)]
struct ScaleBody {
    replicas: u64,
}

#[derive(Deserialize)]
struct PlacementBody {
    alias: String,
}

pub struct HttpOrchestrator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOrchestrator {
    pub fn new(base_url: &str) -> HttpOrchestrator {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpOrchestrator {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn replica_count(&self) -> Result<u64, OrchestratorError> {
        let url = format!("{}/v1/workers/scale", self.base_url);
        let body: ScaleBody = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.replicas)
    }

    async fn set_replica_count(
        &self,
        replicas: u64,
    ) -> Result<(), OrchestratorError> {
        let url = format!("{}/v1/workers/scale", self.base_url);
        self.client
            .put(&url)
            .json(&ScaleBody { replicas })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn worker_location_alias(
        &self,
        worker: &str,
    ) -> Result<String, OrchestratorError> {
        let url =
            format!("{}/v1/workers/{}/placement", self.base_url, worker);
        let body: PlacementBody = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.alias)
    }
}

/// Orchestrator stand-in for `DEBUG=TRUE` and tests.
pub struct FakeOrchestrator {
    replicas: Mutex<u64>,
    placements: Mutex<BTreeMap<String, String>>,
}

impl FakeOrchestrator {
    pub fn new(replicas: u64) -> FakeOrchestrator {
        FakeOrchestrator {
            replicas: Mutex::new(replicas),
            placements: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn place(&self, worker: &str, alias: &str) {
        self.placements
            .lock()
            .unwrap()
            .insert(worker.to_string(), alias.to_string());
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn replica_count(&self) -> Result<u64, OrchestratorError> {
        Ok(*self.replicas.lock().unwrap())
    }

    async fn set_replica_count(
        &self,
        replicas: u64,
    ) -> Result<(), OrchestratorError> {
        *self.replicas.lock().unwrap() = replicas;
        Ok(())
    }

    async fn worker_location_alias(
        &self,
        worker: &str,
    ) -> Result<String, OrchestratorError> {
        self.placements
            .lock()
            .unwrap()
            .get(worker)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::UnknownWorker(worker.to_string())
            })
    }
}
