// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator HTTP API: health, placement, and scale queries

use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Path;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use dropshot::endpoint;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::warn;
use std::sync::Arc;

use crate::context::ServerContext;

type OperatorApiDescription = dropshot::ApiDescription<Arc<ServerContext>>;

pub fn api() -> OperatorApiDescription {
    fn register_endpoints(
        api: &mut OperatorApiDescription,
    ) -> Result<(), String> {
        api.register(liveness).map_err(|e| e.to_string())?;
        api.register(readiness).map_err(|e| e.to_string())?;
        api.register(health).map_err(|e| e.to_string())?;
        api.register(worker_location).map_err(|e| e.to_string())?;
        api.register(replicas).map_err(|e| e.to_string())?;
        api.register(set_max_nodes_per_pod).map_err(|e| e.to_string())?;
        api.register(get_node_pod).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = OperatorApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[endpoint { method = GET, path = "/liveness" }]
async fn liveness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint { method = GET, path = "/readiness" }]
async fn readiness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent())
}

/// Operator health statistics for administrators.
#[derive(Debug, Serialize, JsonSchema)]
struct HealthResponse {
    consoles: String,
    hardwareupdatesec: String,
    hardwareupdate: String,
    nodepods: String,
    rvrnodesperpod: String,
    mtnnodesperpod: String,
    maxrvrnodesperpod: String,
    maxmtnnodesperpod: String,
    heartbeatcheck: String,
    heartbeatstale: String,
}

#[endpoint { method = GET, path = "/health" }]
async fn health(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<HealthResponse>, HttpError> {
    let apictx = rqctx.context();
    let status = *apictx.status.lock().unwrap();
    let fmt_opt = |value: Option<u64>| match value {
        Some(value) => value.to_string(),
        None => "-1".to_string(),
    };
    Ok(HttpResponseOk(HealthResponse {
        consoles: fmt_opt(status.console_count.map(|c| c as u64)),
        hardwareupdatesec: apictx.knobs.hardware_update_sec.to_string(),
        hardwareupdate: status
            .hardware_update_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "Unknown".to_string()),
        nodepods: fmt_opt(status.replica_count),
        rvrnodesperpod: fmt_opt(status.targets.map(|t| t.river)),
        mtnnodesperpod: fmt_opt(status.targets.map(|t| t.mountain)),
        maxrvrnodesperpod: apictx.max_nodes.river().to_string(),
        maxmtnnodesperpod: apictx.max_nodes.mountain().to_string(),
        heartbeatcheck: apictx.knobs.heartbeat_check_sec.to_string(),
        heartbeatstale: apictx.knobs.heartbeat_stale_minutes.to_string(),
    }))
}

#[derive(Deserialize, JsonSchema)]
struct WorkerPathParam {
    worker: String,
}

/// Where a worker is placed in the cluster.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WorkerLocation {
    pub podname: String,
    pub alias: String,
    pub xname: String,
}

/// Resolve a worker's placement: the orchestrator names the cluster node
/// alias it landed on, the location service maps that alias to an xname.
#[endpoint { method = GET, path = "/location/{worker}" }]
async fn worker_location(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<WorkerPathParam>,
) -> Result<HttpResponseOk<WorkerLocation>, HttpError> {
    let apictx = rqctx.context();
    let worker = path.into_inner().worker;

    let alias = apictx
        .orchestrator
        .worker_location_alias(&worker)
        .await
        .map_err(|error| {
            HttpError::for_internal_error(format!(
                "error retrieving worker placement: {:#}",
                error
            ))
        })?;

    let mappings =
        apictx.location.xname_aliases().await.map_err(|error| {
            HttpError::for_internal_error(format!(
                "error retrieving xname mappings: {:#}",
                error
            ))
        })?;

    let xname = mappings
        .iter()
        .find(|m| m.alias == alias)
        .map(|m| m.xname.clone())
        .unwrap_or_default();
    if xname.is_empty() {
        warn!(apictx.log, "no xname mapping for worker placement";
            "worker" => &worker, "alias" => &alias);
    }

    Ok(HttpResponseOk(WorkerLocation { podname: worker, alias, xname }))
}

#[derive(Debug, Serialize, JsonSchema)]
struct ReplicasResponse {
    replicas: u64,
}

#[endpoint { method = GET, path = "/replicas" }]
async fn replicas(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<ReplicasResponse>, HttpError> {
    let apictx = rqctx.context();
    let replicas =
        apictx.orchestrator.replica_count().await.map_err(|error| {
            HttpError::for_internal_error(format!(
                "error retrieving worker replica count: {:#}",
                error
            ))
        })?;
    Ok(HttpResponseOk(ReplicasResponse { replicas }))
}

/// Administrative override of the per-worker connection caps.
#[derive(Debug, Deserialize, JsonSchema)]
struct SetMaxNodesBody {
    #[serde(rename = "maxRvr")]
    max_rvr: u64,
    #[serde(rename = "maxMtn")]
    max_mtn: u64,
}

#[derive(Debug, Serialize, JsonSchema)]
struct SetMaxNodesResponse {
    maxrvrnodesperpod: u64,
    maxmtnnodesperpod: u64,
}

/// Override the per-worker caps; values are pinned to the allowed ranges
/// and take effect on the next reconcile pass.
#[endpoint { method = PATCH, path = "/v0/setMaxNodesPerPod" }]
async fn set_max_nodes_per_pod(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<SetMaxNodesBody>,
) -> Result<HttpResponseOk<SetMaxNodesResponse>, HttpError> {
    let apictx = rqctx.context();
    let request = body.into_inner();
    let (mountain, river) =
        apictx.max_nodes.set(request.max_mtn, request.max_rvr);
    info!(apictx.log, "max nodes per worker overridden";
        "mountain" => mountain, "river" => river);
    Ok(HttpResponseOk(SetMaxNodesResponse {
        maxrvrnodesperpod: river,
        maxmtnnodesperpod: mountain,
    }))
}

#[derive(Deserialize, JsonSchema)]
struct NodePodQuery {
    xname: String,
}

#[derive(Debug, Serialize, JsonSchema)]
struct NodePodResponse {
    podname: String,
}

/// Which worker serves a node's console.
#[endpoint { method = GET, path = "/v0/getNodePod" }]
async fn get_node_pod(
    rqctx: RequestContext<Arc<ServerContext>>,
    query: Query<NodePodQuery>,
) -> Result<HttpResponseOk<NodePodResponse>, HttpError> {
    let apictx = rqctx.context();
    let xname = query.into_inner().xname;
    let node =
        apictx.data.lookup_node(&xname).await.map_err(|error| {
            HttpError::for_internal_error(format!(
                "error querying ownership registry: {:#}",
                error
            ))
        })?;
    let Some(node) = node else {
        return Err(HttpError::for_not_found(
            None,
            format!("node {} not found", xname),
        ));
    };
    Ok(HttpResponseOk(NodePodResponse {
        podname: format!(
            "{}-{}",
            apictx.worker_set, node.node_console_name
        ),
    }))
}
