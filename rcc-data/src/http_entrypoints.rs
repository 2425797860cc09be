// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP surface of the ownership registry
//!
//! The API is internal to the fleet: the operator maintains the inventory
//! and sweeps stale heartbeats, the workers claim/heartbeat/release.

use dropshot::Body;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Path;
use dropshot::RequestContext;
use dropshot::TypedBody;
use dropshot::endpoint;
use http::Response;
use http::StatusCode;
use http::header;
use rcc_common::api::AcquireRequest;
use rcc_common::api::ActiveWorkers;
use rcc_common::api::HeartbeatRequest;
use rcc_common::api::Message;
use rcc_common::api::NodeInfo;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use std::sync::Arc;

use crate::context::ServerContext;
use crate::datastore::StoreError;

type DataApiDescription = dropshot::ApiDescription<Arc<ServerContext>>;

pub fn api() -> DataApiDescription {
    fn register_endpoints(api: &mut DataApiDescription) -> Result<(), String> {
        api.register(liveness).map_err(|e| e.to_string())?;
        api.register(readiness).map_err(|e| e.to_string())?;
        api.register(v1_liveness).map_err(|e| e.to_string())?;
        api.register(v1_readiness).map_err(|e| e.to_string())?;
        api.register(inventory_put).map_err(|e| e.to_string())?;
        api.register(inventory_delete).map_err(|e| e.to_string())?;
        api.register(consolepod_acquire).map_err(|e| e.to_string())?;
        api.register(consolepod_heartbeat).map_err(|e| e.to_string())?;
        api.register(consolepod_release).map_err(|e| e.to_string())?;
        api.register(consolepod_clear).map_err(|e| e.to_string())?;
        api.register(consolepod_lookup).map_err(|e| e.to_string())?;
        api.register(active_pods).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = DataApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

fn store_error(error: StoreError) -> HttpError {
    HttpError::for_internal_error(format!("{:#}", error))
}

fn json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
) -> Result<Response<Body>, HttpError> {
    let body = serde_json::to_string(body)
        .map_err(|e| HttpError::for_internal_error(e.to_string()))?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())?)
}

fn empty_response(status: StatusCode) -> Result<Response<Body>, HttpError> {
    Ok(Response::builder().status(status).body(Body::empty())?)
}

#[derive(Deserialize, JsonSchema)]
struct PodPathParam {
    /// worker id, node name, or duration depending on the operation
    id: String,
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

#[endpoint { method = GET, path = "/v1/liveness" }]
async fn v1_liveness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint { method = GET, path = "/v1/readiness" }]
async fn v1_readiness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent())
}

/// Ensure an inventory row exists for every node in the list.
///
/// Responds 201 with `created=N` when any rows were created, 200
/// otherwise.
#[endpoint { method = PUT, path = "/v1/inventory" }]
async fn inventory_put(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<Vec<NodeInfo>>,
) -> Result<Response<Body>, HttpError> {
    let apictx = rqctx.context();
    let nodes = body.into_inner();
    for node in &nodes {
        node.validate().map_err(|e| {
            HttpError::for_bad_request(None, format!("{:#}", e))
        })?;
    }
    let created = apictx
        .store
        .upsert_inventory(&nodes)
        .await
        .map_err(store_error)?;
    info!(apictx.log, "inventory update";
        "offered" => nodes.len(), "created" => created);
    if created > 0 {
        json_response(
            StatusCode::CREATED,
            &Message { message: format!("created={}", created) },
        )
    } else {
        empty_response(StatusCode::OK)
    }
}

/// Remove nodes that are no longer in the system at all.
#[endpoint { method = DELETE, path = "/v1/inventory" }]
async fn inventory_delete(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<Vec<NodeInfo>>,
) -> Result<HttpResponseOk<Message>, HttpError> {
    let apictx = rqctx.context();
    let names: Vec<String> =
        body.into_inner().into_iter().map(|n| n.node_name).collect();
    let deleted = apictx
        .store
        .delete_inventory(&names)
        .await
        .map_err(store_error)?;
    info!(apictx.log, "inventory delete";
        "offered" => names.len(), "deleted" => deleted);
    Ok(HttpResponseOk(Message { message: format!("deleted={}", deleted) }))
}

/// Assign unowned nodes to a worker, up to the requested per-class counts.
#[endpoint { method = POST, path = "/v1/consolepod/{id}/acquire" }]
async fn consolepod_acquire(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PodPathParam>,
    body: TypedBody<AcquireRequest>,
) -> Result<HttpResponseOk<Vec<NodeInfo>>, HttpError> {
    let apictx = rqctx.context();
    let worker = path.into_inner().id;
    let request = body.into_inner();
    let assigned = apictx
        .store
        .claim(&worker, request.nummtn, request.numrvr)
        .await
        .map_err(store_error)?;
    Ok(HttpResponseOk(assigned))
}

/// Refresh ownership; the response lists nodes the worker must drop.
#[endpoint { method = POST, path = "/v1/consolepod/{id}/heartbeat" }]
async fn consolepod_heartbeat(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PodPathParam>,
    body: TypedBody<HeartbeatRequest>,
) -> Result<HttpResponseOk<Vec<NodeInfo>>, HttpError> {
    let apictx = rqctx.context();
    let worker = path.into_inner().id;
    let request = body.into_inner();
    let dropped = apictx
        .store
        .heartbeat(&worker, &request.pod_location, &request.curr_nodes)
        .await
        .map_err(store_error)?;
    Ok(HttpResponseOk(dropped))
}

/// Release nodes back for re-assignment.
#[endpoint { method = POST, path = "/v1/consolepod/{id}/release" }]
async fn consolepod_release(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PodPathParam>,
    body: TypedBody<Vec<NodeInfo>>,
) -> Result<HttpResponseOk<Message>, HttpError> {
    let apictx = rqctx.context();
    let worker = path.into_inner().id;
    let names: Vec<String> =
        body.into_inner().into_iter().map(|n| n.node_name).collect();
    let released = apictx
        .store
        .release(&worker, &names)
        .await
        .map_err(store_error)?;
    info!(apictx.log, "released nodes";
        "worker" => &worker, "count" => released);
    Ok(HttpResponseOk(Message { message: format!("deleted={}", released) }))
}

/// Expire ownership wherever the heartbeat is older than the duration (in
/// minutes) in the path.  Responds 204 when anything was expired, 200
/// otherwise.
#[endpoint { method = DELETE, path = "/v1/consolepod/{id}/clear" }]
async fn consolepod_clear(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PodPathParam>,
) -> Result<Response<Body>, HttpError> {
    let apictx = rqctx.context();
    let raw = path.into_inner().id;
    let minutes: u64 = raw.parse().map_err(|_| {
        HttpError::for_bad_request(
            None,
            format!("{} is not a valid duration", raw),
        )
    })?;
    let expired =
        apictx.store.expire_stale(minutes).await.map_err(store_error)?;
    info!(apictx.log, "expired stale nodes";
        "minutes" => minutes, "count" => expired);
    if expired > 0 {
        empty_response(StatusCode::NO_CONTENT)
    } else {
        empty_response(StatusCode::OK)
    }
}

/// Find the worker serving a node's console.  Responds 404 (with an empty
/// `nodeconsolename`) for nodes not in the inventory.
#[endpoint { method = GET, path = "/v1/consolepod/{id}" }]
async fn consolepod_lookup(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PodPathParam>,
) -> Result<Response<Body>, HttpError> {
    let apictx = rqctx.context();
    let name = path.into_inner().id;
    match apictx.store.lookup_node(&name).await.map_err(store_error)? {
        Some(node) => json_response(StatusCode::OK, &node),
        None => {
            let unknown = NodeInfo {
                node_name: name,
                bmc_name: String::new(),
                bmc_fqdn: String::new(),
                class: rcc_common::api::NodeClass::River,
                nid: 0,
                role: String::new(),
                node_console_name: String::new(),
            };
            json_response(StatusCode::NOT_FOUND, &unknown)
        }
    }
}

/// Number of workers currently considered active.
#[endpoint { method = GET, path = "/v1/activepods" }]
async fn active_pods(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<ActiveWorkers>, HttpError> {
    let apictx = rqctx.context();
    Ok(HttpResponseOk(ActiveWorkers {
        numactivepods: apictx.store.active_worker_count().await,
    }))
}
