//! API request handlers

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{InstanceId, InstanceSpec};
use crate::{ErrorKind, Orchestrator};
use super::types::*;

pub type AppState = Arc<Orchestrator>;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

// === Health ===

pub async fn health(State(orch): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instances: orch.list_instances().len(),
    })
}

// === Instances ===

pub async fn provision(
    State(orch): State<AppState>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ProvisionResponse>)> {
    let Json(req) = body.map_err(rejected)?;
    let spec = InstanceSpec::from(req);
    let id = orch.provision(spec).await.map_err(to_api_error)?;
    Ok((StatusCode::CREATED, Json(ProvisionResponse { id: id.to_string() })))
}

pub async fn list_instances(State(orch): State<AppState>) -> Json<ListInstancesResponse> {
    Json(ListInstancesResponse {
        instances: orch
            .list_instances()
            .into_iter()
            .map(|id| id.to_string())
            .collect(),
    })
}

pub async fn get_instance(
    State(orch): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceResponse>> {
    let info = orch
        .get_instance(&InstanceId::from(id))
        .map_err(to_api_error)?;
    Ok(Json(info.into()))
}

pub async fn deprovision(
    State(orch): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DeprovisionQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let Query(query) = query.map_err(rejected)?;
    let timeout = query.timeout_millis.map(Duration::from_millis);
    orch.deprovision(&InstanceId::from(id), timeout)
        .await
        .map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// === Logs ===

pub async fn get_logs(
    State(orch): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LogsResponse>> {
    let logs = orch
        .get_logs(&InstanceId::from(id))
        .map_err(to_api_error)?;
    Ok(Json(LogsResponse { logs }))
}

/// One `log` event per record until the instance is torn down
pub async fn stream_logs(
    State(orch): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = orch
        .stream_logs(&InstanceId::from(id))
        .map_err(to_api_error)?;

    let events = subscription.into_stream().map(|record| {
        let event = Event::default()
            .event("log")
            .json_data(&record)
            .unwrap_or_else(|_| Event::default().event("log").data("{}"));
        Ok(event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// === Ports ===

pub async fn publish_port(
    State(orch): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PublishPortRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = body.map_err(rejected)?;
    orch.publish_service_port(&InstanceId::from(id), req.host_port, req.guest_port)
        .await
        .map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// === Drain ===

pub async fn drain(State(orch): State<AppState>) -> StatusCode {
    orch.drain().await;
    StatusCode::NO_CONTENT
}

// === Helpers ===

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::FailedPrecondition => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Undecodable bodies and query strings are the caller's fault
fn rejected(rejection: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    to_api_error(crate::Error::InvalidArgument(rejection.to_string()))
}

fn to_api_error(e: crate::Error) -> (StatusCode, Json<ApiError>) {
    let kind = e.kind();
    if kind == ErrorKind::Internal {
        tracing::error!(error = %e, "Request failed");
    }

    (status_for(kind), Json(ApiError {
        error: kind.to_string(),
        message: e.to_string(),
    }))
}
