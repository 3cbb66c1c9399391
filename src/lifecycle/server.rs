use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, LifecycleConfig, ScenarioTable};
use crate::error::{FleetError, Result};
use crate::jobs::{JobRecord, JobRepository, ServerJob, ServerState};
use crate::lifecycle::{sweep, LivenessPolicy, Process};
use crate::supervisor::{
    CounterSampler, ServerLauncher, SnapshotTraceCollector, TraceCollector,
};

/// Drives server jobs from `Waiting` to removal.
pub struct ServerLifecycle {
    repository: Arc<JobRepository<ServerJob>>,
    launcher: ServerLauncher,
    tracer: Arc<dyn TraceCollector>,
    config: LifecycleConfig,
    scenarios: ScenarioTable,
    hostname: String,
    liveness: LivenessPolicy,
    sampler: CounterSampler,

    current: Option<u64>,
    current_session: Option<String>,
    last_session: Option<String>,
    process: Process,
    trace_task: Option<JoinHandle<Result<PathBuf>>>,
}

impl ServerLifecycle {
    pub fn new(
        repository: Arc<JobRepository<ServerJob>>,
        launcher: ServerLauncher,
        config: &AgentConfig,
    ) -> Self {
        let lifecycle = config.lifecycle.clone();
        Self {
            repository,
            launcher,
            tracer: Arc::new(SnapshotTraceCollector),
            liveness: LivenessPolicy::new(lifecycle.liveness_timeout()),
            sampler: CounterSampler::new(lifecycle.counter_interval()),
            config: lifecycle,
            scenarios: config.scenarios.clone(),
            hostname: config.hostname.clone(),
            current: None,
            current_session: None,
            last_session: None,
            process: Process::None,
            trace_task: None,
        }
    }

    pub fn with_trace_collector(mut self, tracer: Arc<dyn TraceCollector>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Id of the job this loop currently owns.
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Tick until `shutdown` fires, then stop the owned process.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_ms = self.config.tick_interval_ms,
            liveness_ms = self.config.liveness_timeout_ms,
            "Server lifecycle started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        self.stop_process().await;
        tracing::info!("Server lifecycle stopped");
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
            ServerState::Waiting => self.start(job).await,
            ServerState::Starting => self.check_startup(&job).await,
            ServerState::Running | ServerState::TraceCollected => {
                self.check_running(&job).await;
            }
            ServerState::TraceCollecting => {
                if self.check_running(&job).await {
                    self.check_trace(&job).await;
                }
            }
            ServerState::Failed | ServerState::NotSupported => {
                self.stop_process().await;
                self.release();
            }
            ServerState::Deleting => self.teardown(id).await,
        }
    }

    async fn pick_next(&mut self) {
        let Some(job) = self.repository.next_waiting(self.last_session.as_deref()).await else {
            return;
        };
        tracing::info!(job_id = job.id, scenario = %job.scenario, "Picked up job");
        self.current = Some(job.id);
        self.current_session = job.session_id.clone();
    }

    async fn start(&mut self, job: ServerJob) {
        let id = job.id;

        let Some(path) = self.scenarios.path(&job.scenario) else {
            self.repository
                .modify(id, |job| {
                    if matches!(job.transition(ServerState::NotSupported), Ok(true)) {
                        job.error = Some(format!("scenario '{}' is not supported", job.scenario));
                    }
                })
                .await;
            tracing::info!(job_id = id, scenario = %job.scenario, "Scenario not supported");
            self.release();
            return;
        };
        let url = format!("http://{}:{}{}", self.hostname, job.port, path);

        let snapshot = self
            .repository
            .modify(id, |job| match job.transition(ServerState::Starting) {
                Ok(true) => {
                    job.url = Some(url);
                    Some(job.clone())
                }
                _ => None,
            })
            .await
            .flatten();

        // Lost a race with the driver; the next tick sees the new state
        let Some(snapshot) = snapshot else {
            return;
        };

        tracing::info!(job_id = id, url = ?snapshot.url, "Starting job");
        let launcher = self.launcher.clone();
        self.process = Process::Launching(tokio::spawn(async move {
            launcher.launch(&snapshot).await
        }));
    }

    async fn check_startup(&mut self, job: &ServerJob) {
        let id = job.id;

        if let Some(result) = self.process.finished_launch().await {
            match result {
                Ok(handle) => {
                    let pid = handle.pid();
                    self.repository
                        .modify(id, |job| job.process_id = Some(pid))
                        .await;
                    self.process = Process::Attached(handle);
                }
                Err(e) => {
                    self.fail(id, e.to_string()).await;
                    return;
                }
            }
        }

        let Some(handle) = self.process.handle() else {
            if !self.process.is_launching() {
                self.fail(id, "no process attached to starting job".into()).await;
            }
            return;
        };

        let status = handle.status();
        if status.ready {
            if let Some(Ok(true)) = self
                .repository
                .modify(id, |job| job.transition(ServerState::Running))
                .await
            {
                tracing::info!(job_id = id, pid = handle.pid(), "Application ready");
                self.sampler.reset();
            }
        } else if status.exited {
            let error = exit_message("exited before becoming ready", status.exit_code, job);
            self.fail(id, error).await;
        }
    }

    /// Returns false if the job was failed.
    async fn check_running(&mut self, job: &ServerJob) -> bool {
        let id = job.id;
        let Some(handle) = self.process.handle() else {
            self.fail(id, "process handle lost".into()).await;
            return false;
        };

        let status = handle.status();
        if status.exited {
            let error = exit_message("exited unexpectedly", status.exit_code, job);
            self.fail(id, error).await;
            return false;
        }

        if let Some(counter) = self.sampler.sample_due(handle.pid()) {
            let limit = self.config.max_counter_samples;
            self.repository
                .modify(id, |job| job.record_counter(counter, limit))
                .await;
        }
        true
    }

    async fn check_trace(&mut self, job: &ServerJob) {
        let id = job.id;

        let Some(task) = self.trace_task.as_ref() else {
            let Some(dir) = self.process.handle().and_then(|h| h.working_dir()) else {
                self.fail(id, "no working directory to collect a trace into".into()).await;
                return;
            };
            let dir = dir.to_path_buf();
            let tracer = self.tracer.clone();
            let snapshot = job.clone();
            tracing::info!(job_id = id, "Collecting trace");
            self.trace_task = Some(tokio::spawn(async move {
                tracer.collect(&snapshot, &dir).await
            }));
            return;
        };

        if !task.is_finished() {
            return;
        }
        let Some(task) = self.trace_task.take() else {
            return;
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(FleetError::Trace(format!("trace task failed: {}", e))),
        };

        match result {
            Ok(path) => {
                tracing::info!(job_id = id, path = %path.display(), "Trace collected");
                self.repository
                    .modify(id, |job| {
                        if matches!(job.transition(ServerState::TraceCollected), Ok(true)) {
                            job.trace_path = Some(path);
                        }
                    })
                    .await;
            }
            Err(e) => self.fail(id, e.to_string()).await,
        }
    }

    /// Record the error, stop the process and give up ownership. The record
    /// stays visible until the driver deletes it or goes silent.
    async fn fail(&mut self, id: u64, error: String) {
        tracing::warn!(job_id = id, error = %error, "Job failed");
        self.repository
            .modify(id, |job| {
                if matches!(job.transition(ServerState::Failed), Ok(true)) {
                    job.error = Some(error);
                }
            })
            .await;
        self.stop_process().await;
        self.release();
    }

    async fn teardown(&mut self, id: u64) {
        tracing::info!(job_id = id, "Tearing down job");
        self.stop_process().await;
        self.repository.remove(id).await;
        self.release();
        tracing::info!(job_id = id, "Job removed");
    }

    async fn stop_process(&mut self) {
        if let Some(task) = self.trace_task.take() {
            task.abort();
        }
        let supervisor = self.launcher.supervisor().clone();
        if let Some(outcome) = self.process.shutdown(&supervisor).await {
            tracing::debug!(job_id = ?self.current, outcome = ?outcome, "Process stopped");
        }
    }

    fn release(&mut self) {
        self.current = None;
        self.last_session = self.current_session.take();
        self.sampler.reset();
    }
}

fn exit_message(what: &str, exit_code: Option<i32>, job: &ServerJob) -> String {
    let mut message = match exit_code {
        Some(code) => format!("process {} with code {}", what, code),
        None => format!("process {} (killed by signal)", what),
    };
    if let Some(last) = job.output.last_line() {
        message.push_str(": ");
        message.push_str(&last);
    }
    message
}
