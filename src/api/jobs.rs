//! CRUD handlers shared by the server and client agents.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::error::{FleetError, Result};
use crate::jobs::{JobRecord, JobRepository, LogPage};

/// Absolute line cursor for log reads.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub skip: u64,
}

pub async fn list<J: JobRecord>(State(repository): State<Arc<JobRepository<J>>>) -> Json<Vec<J>> {
    Json(repository.all().await)
}

pub async fn create<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    payload: std::result::Result<Json<J>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(description) = payload.map_err(|e| FleetError::InvalidJob(e.body_text()))?;
    let job = repository.create(description).await?;
    let id = job.id();

    tracing::info!(job_id = id, "Job created");
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, format!("/jobs/{}", id))],
        Json(job),
    ))
}

/// Reading a job counts as driver contact.
pub async fn read<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    Path(id): Path<u64>,
) -> Result<Json<J>> {
    Ok(Json(repository.touch(id).await?))
}

pub async fn touch<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    Path(id): Path<u64>,
) -> Result<StatusCode> {
    repository.touch(id).await?;
    Ok(StatusCode::OK)
}

pub async fn update<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    Path(id): Path<u64>,
    payload: std::result::Result<Json<J>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(mut replacement) = payload.map_err(|e| FleetError::InvalidJob(e.body_text()))?;
    replacement.set_id(id);
    let job = repository.update(replacement).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn delete<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    Path(id): Path<u64>,
) -> Result<StatusCode> {
    if repository.mark_deleting(id).await? {
        tracing::info!(job_id = id, "Job marked for deletion");
    }
    Ok(StatusCode::ACCEPTED)
}

pub async fn output<J: JobRecord>(
    State(repository): State<Arc<JobRepository<J>>>,
    Path(id): Path<u64>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>> {
    let job = repository.find(id).await.ok_or(FleetError::JobNotFound(id))?;
    Ok(Json(job.output().page(query.skip)))
}
