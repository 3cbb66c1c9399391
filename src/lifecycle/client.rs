use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, LifecycleConfig};
use crate::jobs::{ClientJob, ClientState, JobRecord, JobRepository};
use crate::lifecycle::{sweep, LivenessPolicy, Process};
use crate::supervisor::ClientLauncher;

/// Drives load-generation workers. A worker is `Running` once spawned and
/// ends `Completed` (exit code 0) or `Failed`.
pub struct ClientLifecycle {
    repository: Arc<JobRepository<ClientJob>>,
    launcher: ClientLauncher,
    config: LifecycleConfig,
    liveness: LivenessPolicy,

    current: Option<u64>,
    current_session: Option<String>,
    last_session: Option<String>,
    process: Process,
}

impl ClientLifecycle {
    pub fn new(
        repository: Arc<JobRepository<ClientJob>>,
        launcher: ClientLauncher,
        config: &AgentConfig,
    ) -> Self {
        Self {
            repository,
            launcher,
            liveness: LivenessPolicy::new(config.lifecycle.liveness_timeout()),
            config: config.lifecycle.clone(),
            current: None,
            current_session: None,
            last_session: None,
            process: Process::None,
        }
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(tick_ms = self.config.tick_interval_ms, "Client lifecycle started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        self.stop_process().await;
        tracing::info!("Client lifecycle stopped");
    }

    pub async fn tick(&mut self) {
        sweep(&self.repository, &self.liveness, self.current).await;

        if self.current.is_none() {
            self.pick_next().await;
        }
        let Some(id) = self.current else {
            return;
        };

        let Some(job) = self.repository.find(id).await else {
            tracing::warn!(job_id = id, "Owned job vanished from the repository");
            self.stop_process().await;
            self.release();
            return;
        };

        match job.state {
            ClientState::Waiting => self.start(job).await,
            ClientState::Starting => self.check_startup(id).await,
            ClientState::Running => self.check_running(&job).await,
            ClientState::Completed | ClientState::Failed => {
                self.stop_process().await;
                self.release();
            }
            ClientState::Deleting => {
                tracing::info!(job_id = id, "Tearing down worker");
                self.stop_process().await;
                self.repository.remove(id).await;
                self.release();
                tracing::info!(job_id = id, "Job removed");
            }
        }
    }

    async fn pick_next(&mut self) {
        let Some(job) = self.repository.next_waiting(self.last_session.as_deref()).await else {
            return;
        };
        tracing::info!(job_id = job.id, executable = %job.executable, "Picked up worker");
        self.current = Some(job.id);
        self.current_session = job.session_id.clone();
    }

    async fn start(&mut self, job: ClientJob) {
        let id = job.id;
        let snapshot = self
            .repository
            .modify(id, |job| match job.transition(ClientState::Starting) {
                Ok(true) => Some(job.clone()),
                _ => None,
            })
            .await
            .flatten();
        let Some(snapshot) = snapshot else {
            return;
        };

        let launcher = self.launcher.clone();
        self.process = Process::Launching(tokio::spawn(async move {
            launcher.launch(&snapshot).await
        }));
    }

    async fn check_startup(&mut self, id: u64) {
        match self.process.finished_launch().await {
            Some(Ok(handle)) => {
                let pid = handle.pid();
                let started = self
                    .repository
                    .modify(id, |job| {
                        job.process_id = Some(pid);
                        if matches!(job.transition(ClientState::Running), Ok(true)) {
                            job.started_utc = Some(Utc::now());
                            true
                        } else {
                            false
                        }
                    })
                    .await
                    .unwrap_or(false);
                self.process = Process::Attached(handle);
                if started {
                    tracing::info!(job_id = id, pid, "Worker running");
                }
            }
            Some(Err(e)) => self.fail(id, e.to_string()).await,
            None if !self.process.is_launching() => {
                self.fail(id, "no process attached to starting worker".into()).await
            }
            None => {}
        }
    }

    async fn check_running(&mut self, job: &ClientJob) {
        let id = job.id;
        let Some(handle) = self.process.handle() else {
            self.fail(id, "process handle lost".into()).await;
            return;
        };

        let status = handle.status();
        if status.exited {
            let exit_code = status.exit_code;
            let completed = exit_code == Some(0);
            self.repository
                .modify(id, |job| {
                    job.exit_code = exit_code;
                    let next = if completed {
                        ClientState::Completed
                    } else {
                        job.error = Some(match exit_code {
                            Some(code) => format!("worker exited with code {}", code),
                            None => "worker killed by signal".to_string(),
                        });
                        ClientState::Failed
                    };
                    if let Err(e) = job.transition(next) {
                        tracing::debug!(job_id = id, error = %e, "Worker outcome not recorded");
                    }
                })
                .await;
            tracing::info!(job_id = id, exit_code = ?exit_code, "Worker finished");
            self.stop_process().await;
            self.release();
            return;
        }

        if self.over_budget(job) {
            self.fail(
                id,
                format!(
                    "worker exceeded warmup + duration ({}s + {}s)",
                    job.warmup_secs, job.duration_secs
                ),
            )
            .await;
        }
    }

    /// Whether a timed worker has outlived its run plus the configured slack.
    fn over_budget(&self, job: &ClientJob) -> bool {
        if job.duration_secs == 0 {
            return false;
        }
        let Some(started) = job.started_utc else {
            return false;
        };
        let budget = std::time::Duration::from_secs(job.warmup_secs.saturating_add(job.duration_secs))
            .saturating_add(self.config.client_duration_slack());
        let Ok(budget) = chrono::Duration::from_std(budget) else {
            return false;
        };
        Utc::now() - started > budget
    }

    async fn fail(&mut self, id: u64, error: String) {
        tracing::warn!(job_id = id, error = %error, "Worker failed");
        self.repository
            .modify(id, |job| {
                if matches!(job.transition(ClientState::Failed), Ok(true)) {
                    job.error = Some(error);
                }
            })
            .await;
        self.stop_process().await;
        self.release();
    }

    async fn stop_process(&mut self) {
        let supervisor = self.launcher.supervisor().clone();
        if let Some(outcome) = self.process.shutdown(&supervisor).await {
            tracing::debug!(job_id = ?self.current, outcome = ?outcome, "Worker stopped");
        }
    }

    fn release(&mut self) {
        self.current = None;
        self.last_session = self.current_session.take();
    }
}
