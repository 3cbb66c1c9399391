//! Job records and the in-memory store shared by the HTTP surface and the
//! lifecycle loop.

pub mod client_job;
pub mod record;
pub mod repository;
pub mod rolling_log;
pub mod server_job;

pub use client_job::{ClientJob, ClientState};
pub use record::{JobRecord, JobState};
pub use repository::JobRepository;
pub use rolling_log::{LogPage, RollingLog};
pub use server_job::{Attachment, ServerCounter, ServerJob, ServerState, Source};
