//! Polling loops that turn job state into process actions.
//!
//! One loop runs per agent and owns at most one job at a time. Each tick:
//!
//! 1. Sweeps the repository: silent drivers send their jobs to `Deleting`,
//!    and `Deleting` jobs nobody owns are removed
//! 2. Picks the next `Waiting` job when nothing is owned, preferring the
//!    session of the previous job
//! 3. Advances the owned job according to its state
//!
//! Launches run in a spawned task so a slow build never stalls the sweep.
//! Supervisor errors are written to the job record and never leave a tick.

pub mod client;
pub mod liveness;
pub mod server;

pub use client::ClientLifecycle;
pub use liveness::LivenessPolicy;
pub use server::ServerLifecycle;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::{FleetError, Result};
use crate::jobs::{JobRecord, JobRepository, JobState};
use crate::supervisor::{ProcessHandle, ProcessSupervisor, StopOutcome};

/// The process side of the owned job.
#[derive(Debug, Default)]
pub(crate) enum Process {
    #[default]
    None,
    Launching(JoinHandle<Result<ProcessHandle>>),
    Attached(ProcessHandle),
}

impl Process {
    pub(crate) fn handle(&self) -> Option<&ProcessHandle> {
        match self {
            Process::Attached(handle) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn is_launching(&self) -> bool {
        matches!(self, Process::Launching(_))
    }

    /// Outcome of the launch task once it has finished.
    pub(crate) async fn finished_launch(&mut self) -> Option<Result<ProcessHandle>> {
        match self {
            Process::Launching(task) if task.is_finished() => {}
            _ => return None,
        }
        let Process::Launching(task) = std::mem::take(self) else {
            return None;
        };
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(FleetError::Internal(format!("launch task failed: {}", e))),
        })
    }

    /// Stop whatever is running. A launch in flight is cancelled; if it had
    /// already produced a process, that process is stopped too.
    pub(crate) async fn shutdown(&mut self, supervisor: &ProcessSupervisor) -> Option<StopOutcome> {
        match std::mem::take(self) {
            Process::None => None,
            Process::Launching(task) => {
                task.abort();
                match task.await {
                    Ok(Ok(handle)) => Some(supervisor.stop(handle).await),
                    _ => None,
                }
            }
            Process::Attached(handle) => Some(supervisor.stop(handle).await),
        }
    }
}

/// Apply the liveness rule and drop `Deleting` jobs other than `owned`.
pub(crate) async fn sweep<J: JobRecord>(
    repository: &JobRepository<J>,
    liveness: &LivenessPolicy,
    owned: Option<u64>,
) {
    let now = Utc::now();
    for job in repository.all().await {
        let id = job.id();

        if job.state() == J::State::DELETING {
            if owned != Some(id) && repository.remove(id).await.is_some() {
                tracing::info!(job_id = id, "Job removed");
            }
            continue;
        }

        if liveness.is_expired(&job, now) {
            // Re-checked under the lock: a touch may have landed since the snapshot
            let reclaimed = repository
                .modify(id, |job| {
                    liveness.is_expired(job, now) && matches!(job.transition(J::State::DELETING), Ok(true))
                })
                .await
                .unwrap_or(false);
            if reclaimed {
                tracing::warn!(
                    job_id = id,
                    timeout_secs = liveness.timeout().num_seconds(),
                    "Driver went silent, deleting job"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::{ClientJob, ClientState};

    #[tokio::test]
    async fn sweep_reclaims_silent_jobs_and_spares_owned() {
        let repository = JobRepository::new();
        let silent = repository.add(ClientJob::new("wrk", "http://s")).await.unwrap();
        let owned = repository.add(ClientJob::new("wrk", "http://s")).await.unwrap();
        let stale = Utc::now() - chrono::Duration::seconds(120);
        for id in [silent.id, owned.id] {
            repository
                .modify(id, |job| {
                    job.state = ClientState::Completed;
                    job.last_driver_communication_utc = stale;
                })
                .await;
        }

        let policy = LivenessPolicy::new(Duration::from_secs(30));
        sweep(&repository, &policy, Some(owned.id)).await;
        assert_eq!(repository.find(silent.id).await.unwrap().state, ClientState::Deleting);
        assert_eq!(repository.find(owned.id).await.unwrap().state, ClientState::Deleting);

        sweep(&repository, &policy, Some(owned.id)).await;
        assert!(repository.find(silent.id).await.is_none());
        assert!(repository.find(owned.id).await.is_some());
    }

    #[tokio::test]
    async fn waiting_jobs_are_never_reclaimed() {
        let repository = JobRepository::new();
        let job = repository.add(ClientJob::new("wrk", "http://s")).await.unwrap();
        repository
            .modify(job.id, |job| {
                job.last_driver_communication_utc = Utc::now() - chrono::Duration::hours(1);
            })
            .await;

        sweep(&repository, &LivenessPolicy::new(Duration::from_secs(1)), None).await;
        assert_eq!(repository.find(job.id).await.unwrap().state, ClientState::Waiting);
    }

    #[tokio::test]
    async fn shutdown_of_nothing_is_a_noop() {
        let mut process = Process::None;
        let supervisor = ProcessSupervisor::new(Duration::from_millis(10));
        assert!(process.shutdown(&supervisor).await.is_none());
        assert!(process.finished_launch().await.is_none());
    }
}
