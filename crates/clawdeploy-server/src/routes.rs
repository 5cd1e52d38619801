use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::LifecycleError;
use crate::instance_config::InstanceSpec;
use crate::lifecycle::DEFAULT_LOG_TAIL;
use crate::models::instance::Instance;
use crate::rate_limit::RetryAfter;
use crate::reconciler::SyncReport;
use crate::State;

pub const OWNER_HEADER: &str = "x-owner-id";
pub const SYNC_SECRET_HEADER: &str = "x-sync-secret";
const MAX_LOG_TAIL: usize = 5_000;

type HandlerResult<T> = Result<T, (StatusCode, String)>;

#[derive(Debug, Serialize)]
pub struct InstancesResponse {
    pub instances: Vec<Instance>,
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub instance: Instance,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub error: &'static str,
    pub retry_after: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub database: &'static str,
    pub docker: &'static str,
}

pub fn router(state: State) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/:id", get(get_instance).delete(delete_instance))
        .route("/instances/:id/update", post(update_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/logs", get(instance_logs))
        .route("/admin/sync", post(admin_sync))
        .fallback(fallback)
        .layer(Extension(state))
}

fn owner_id(headers: &HeaderMap) -> HandlerResult<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()))
}

/// Charges one mutating request against the owner's budget.
fn rate_limit(state: &State, owner: &str) -> Result<(), Response> {
    state.rate_limiter.check(owner).map_err(too_many_requests)
}

fn too_many_requests(retry: RetryAfter) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry.secs.to_string())],
        Json(RateLimitedResponse {
            error: "Too many requests",
            retry_after: retry.secs,
        }),
    )
        .into_response()
}

fn sync_authorized(state: &State, headers: &HeaderMap) -> bool {
    let Some(expected) = state.sync_secret.as_deref() else {
        return false;
    };
    headers
        .get(SYNC_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|given| given == expected)
}

pub async fn health_check(Extension(state): Extension<State>) -> Json<HealthResponse> {
    let database = match state.controller.store().ping().await {
        Ok(()) => "connected",
        Err(e) => {
            error!(error = %format!("{e:#}"), "database ping failed");
            "disconnected"
        }
    };
    let docker = match state.controller.runtime().ping().await {
        Ok(()) => "connected",
        Err(e) => {
            error!(error = %e, "docker ping failed");
            "disconnected"
        }
    };
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        database,
        docker,
    })
}

pub async fn list_instances(
    Extension(state): Extension<State>,
    headers: HeaderMap,
) -> HandlerResult<Json<InstancesResponse>> {
    let owner = owner_id(&headers)?;
    match state.controller.list(&owner).await {
        Ok(instances) => Ok(Json(InstancesResponse { instances })),
        Err(e) => Err(handle_lifecycle_error("list_instances", e)),
    }
}

pub async fn create_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Json(spec): Json<InstanceSpec>,
) -> Result<(StatusCode, Json<InstanceResponse>), Response> {
    let owner = owner_id(&headers).map_err(IntoResponse::into_response)?;
    rate_limit(&state, &owner)?;
    match state.controller.create(&owner, spec).await {
        Ok(instance) => Ok((StatusCode::CREATED, Json(InstanceResponse { instance }))),
        Err(e) => Err(handle_lifecycle_error("create_instance", e).into_response()),
    }
}

pub async fn get_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HandlerResult<Json<InstanceResponse>> {
    let owner = owner_id(&headers)?;
    match state.controller.get(&owner, &id).await {
        Ok(instance) => Ok(Json(InstanceResponse { instance })),
        Err(e) => Err(handle_lifecycle_error("get_instance", e)),
    }
}

pub async fn delete_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HandlerResult<Json<DeleteResponse>> {
    let owner = owner_id(&headers)?;
    match state.controller.delete(&owner, &id).await {
        Ok(()) => Ok(Json(DeleteResponse { id, deleted: true })),
        Err(e) => Err(handle_lifecycle_error("delete_instance", e)),
    }
}

pub async fn update_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HandlerResult<Json<InstanceResponse>> {
    let owner = owner_id(&headers)?;
    match state.controller.update(&owner, &id).await {
        Ok(instance) => Ok(Json(InstanceResponse { instance })),
        Err(e) => Err(handle_lifecycle_error("update_instance", e)),
    }
}

pub async fn stop_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<InstanceResponse>, Response> {
    let owner = owner_id(&headers).map_err(IntoResponse::into_response)?;
    rate_limit(&state, &owner)?;
    match state.controller.stop(&owner, &id).await {
        Ok(instance) => Ok(Json(InstanceResponse { instance })),
        Err(e) => Err(handle_lifecycle_error("stop_instance", e).into_response()),
    }
}

pub async fn instance_logs(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> HandlerResult<Json<LogsResponse>> {
    let owner = owner_id(&headers)?;
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL);
    match state.controller.logs(&owner, &id, tail).await {
        Ok(logs) => Ok(Json(LogsResponse { logs })),
        Err(e) => Err(handle_lifecycle_error("instance_logs", e)),
    }
}

pub async fn admin_sync(
    Extension(state): Extension<State>,
    headers: HeaderMap,
) -> HandlerResult<Json<SyncReport>> {
    if !sync_authorized(&state, &headers) {
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()));
    }
    match state.reconciler.reconcile_once().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(handle_anyhow_error("admin_sync", e)),
    }
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}

pub(crate) fn lifecycle_status(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::InstanceNotFound(_) | LifecycleError::Ownership(_) => StatusCode::NOT_FOUND,
        LifecycleError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        LifecycleError::InstanceBusy(_)
        | LifecycleError::MissingContainer(_)
        | LifecycleError::MissingGatewayToken(_) => StatusCode::CONFLICT,
        LifecycleError::PortExhaustion { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::Runtime(_)
        | LifecycleError::Store(_)
        | LifecycleError::Storage(_)
        | LifecycleError::Rebuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn handle_lifecycle_error(function: &str, err: LifecycleError) -> (StatusCode, String) {
    let status = lifecycle_status(&err);
    if status.is_server_error() {
        error!("Error in {function}: {err}");
    } else {
        debug!("Rejected {function}: {err}");
    }
    (status, err.to_string())
}

pub(crate) fn handle_anyhow_error(function: &str, err: anyhow::Error) -> (StatusCode, String) {
    error!("Error in {function}: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}"))
}
