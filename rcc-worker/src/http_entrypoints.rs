// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker HTTP surface: probes and health statistics

use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::RequestContext;
use dropshot::endpoint;
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;

use crate::context::WorkerContext;

type WorkerApiDescription = dropshot::ApiDescription<Arc<WorkerContext>>;

pub fn api() -> WorkerApiDescription {
    fn register_endpoints(
        api: &mut WorkerApiDescription,
    ) -> Result<(), String> {
        api.register(liveness).map_err(|e| e.to_string())?;
        api.register(readiness).map_err(|e| e.to_string())?;
        api.register(health).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = WorkerApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[endpoint { method = GET, path = "/liveness" }]
async fn liveness(
    _rqctx: RequestContext<Arc<WorkerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent())
}

/// Readiness reflects whether the supervisor can generate configuration;
/// persistent disk trouble demotes the worker instead of killing it.
#[endpoint { method = GET, path = "/readiness" }]
async fn readiness(
    rqctx: RequestContext<Arc<WorkerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    if !apictx.is_ready() {
        return Err(HttpError::for_unavail(
            None,
            "worker has not completed a configuration pass".to_string(),
        ));
    }
    Ok(HttpResponseUpdatedNoContent())
}

/// Worker health statistics for administrators.
#[derive(Debug, Serialize, JsonSchema)]
struct HealthResponse {
    num_mtn: String,
    num_rvr: String,
    target_mtn: String,
    target_rvr: String,
    last_heartbeat: String,
    mux_state: String,
}

#[endpoint { method = GET, path = "/health" }]
async fn health(
    rqctx: RequestContext<Arc<WorkerContext>>,
) -> Result<HttpResponseOk<HealthResponse>, HttpError> {
    let apictx = rqctx.context();
    let sets = apictx.nodes.lock().await;
    let fmt_target = |target: Option<u64>| match target {
        Some(target) => target.to_string(),
        None => "-1".to_string(),
    };
    let response = HealthResponse {
        num_mtn: sets.mountain_count().to_string(),
        num_rvr: sets.river_count().to_string(),
        target_mtn: fmt_target(sets.target_mountain),
        target_rvr: fmt_target(sets.target_river),
        last_heartbeat: apictx
            .last_heartbeat()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "None".to_string()),
        mux_state: apictx.mux.state().as_str().to_string(),
    };
    Ok(HttpResponseOk(response))
}
