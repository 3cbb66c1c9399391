use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Job repository is at capacity ({0} jobs)")]
    RepositoryFull(usize),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: u64, from: String, to: String },

    #[error("Job {0} is not running")]
    NotRunning(u64),

    #[error("No trace available for job {0}")]
    TraceUnavailable(u64),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error("Trace collection failed: {0}")]
    Trace(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
