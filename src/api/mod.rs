//! HTTP surface of the agents. Handlers are thin wrappers over the
//! repository; all process work happens in the lifecycle loop.

pub mod jobs;
pub mod server;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::error::FleetError;
use crate::jobs::{ClientJob, JobRepository, ServerJob};

pub use server::ServerApiState;

impl FleetError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::JobNotFound(_) | FleetError::TraceUnavailable(_) => StatusCode::NOT_FOUND,
            FleetError::InvalidJob(_) => StatusCode::BAD_REQUEST,
            FleetError::InvalidTransition { .. } | FleetError::NotRunning(_) => {
                StatusCode::CONFLICT
            }
            FleetError::RepositoryFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Routes of the server agent.
pub fn server_router(state: ServerApiState) -> Router {
    Router::new()
        .route(
            "/jobs",
            get(jobs::list::<ServerJob>).post(jobs::create::<ServerJob>),
        )
        .route(
            "/jobs/{id}",
            get(jobs::read::<ServerJob>)
                .put(jobs::update::<ServerJob>)
                .delete(jobs::delete::<ServerJob>),
        )
        .route("/jobs/{id}/touch", get(jobs::touch::<ServerJob>))
        .route("/jobs/{id}/output", get(jobs::output::<ServerJob>))
        .route("/jobs/{id}/buildlog", get(server::build_log))
        .route(
            "/jobs/{id}/trace",
            get(server::download_trace).post(server::request_trace),
        )
        .route("/jobs/{id}/invoke", get(server::invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes of the client agent.
pub fn client_router(repository: Arc<JobRepository<ClientJob>>) -> Router {
    Router::new()
        .route(
            "/jobs",
            get(jobs::list::<ClientJob>).post(jobs::create::<ClientJob>),
        )
        .route(
            "/jobs/{id}",
            get(jobs::read::<ClientJob>)
                .put(jobs::update::<ClientJob>)
                .delete(jobs::delete::<ClientJob>),
        )
        .route("/jobs/{id}/touch", get(jobs::touch::<ClientJob>))
        .route("/jobs/{id}/output", get(jobs::output::<ClientJob>))
        .layer(TraceLayer::new_for_http())
        .with_state(repository)
}
