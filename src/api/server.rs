//! Server-agent routes beyond plain CRUD: build log, traces, invoke.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRef, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::api::jobs::LogQuery;
use crate::error::{FleetError, Result};
use crate::jobs::{JobRecord, JobRepository, LogPage, ServerJob, ServerState};

#[derive(Clone)]
pub struct ServerApiState {
    pub repository: Arc<JobRepository<ServerJob>>,
    /// Used for invoke passthrough requests.
    pub http: reqwest::Client,
}

impl ServerApiState {
    pub fn new(repository: Arc<JobRepository<ServerJob>>) -> Self {
        Self {
            repository,
            http: reqwest::Client::new(),
        }
    }
}

impl FromRef<ServerApiState> for Arc<JobRepository<ServerJob>> {
    fn from_ref(state: &ServerApiState) -> Self {
        state.repository.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct InvokeQuery {
    #[serde(default)]
    pub path: String,
}

pub async fn build_log(
    State(state): State<ServerApiState>,
    Path(id): Path<u64>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>> {
    let job = state
        .repository
        .find(id)
        .await
        .ok_or(FleetError::JobNotFound(id))?;
    Ok(Json(job.build_log.page(query.skip)))
}

/// Ask the lifecycle loop to collect a trace of the running process.
pub async fn request_trace(
    State(state): State<ServerApiState>,
    Path(id): Path<u64>,
) -> Result<StatusCode> {
    state
        .repository
        .modify(id, |job| {
            if job.state != ServerState::Running {
                return Err(FleetError::NotRunning(id));
            }
            job.trace_path = None;
            job.transition(ServerState::TraceCollecting).map(|_| ())
        })
        .await
        .ok_or(FleetError::JobNotFound(id))??;

    tracing::info!(job_id = id, "Trace requested");
    Ok(StatusCode::ACCEPTED)
}

pub async fn download_trace(
    State(state): State<ServerApiState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse> {
    let job = state
        .repository
        .find(id)
        .await
        .ok_or(FleetError::JobNotFound(id))?;

    let path = match (job.state, &job.trace_path) {
        (ServerState::TraceCollected, Some(path)) => path.clone(),
        _ => return Err(FleetError::TraceUnavailable(id)),
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| FleetError::TraceUnavailable(id))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Bytes::from(bytes),
    ))
}

/// Forward a GET to the running application and relay its response.
pub async fn invoke(
    State(state): State<ServerApiState>,
    Path(id): Path<u64>,
    Query(query): Query<InvokeQuery>,
) -> Result<impl IntoResponse> {
    let job = state
        .repository
        .find(id)
        .await
        .ok_or(FleetError::JobNotFound(id))?;

    if !job.state.is_running() {
        return Err(FleetError::NotRunning(id));
    }

    let target = format!("http://localhost:{}/{}", job.port, query.path.trim_start_matches('/'));
    tracing::debug!(job_id = id, target = %target, "Invoking application");

    let response = state.http.get(&target).send().await?;
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response.bytes().await?;
    Ok((status, body))
}
