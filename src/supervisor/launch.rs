use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::error::{FleetError, Result};
use crate::jobs::{Attachment, ClientJob, ServerJob};
use crate::supervisor::process::{LaunchSpec, ProcessHandle, ProcessSupervisor, Readiness};
use crate::supervisor::source::SourceResolver;

/// Environment variable telling the benchmarked application where to listen.
pub const SERVER_URLS_VAR: &str = "SERVER_URLS";

/// Creates the per-job working directory under `root` (system temp if unset).
fn job_workdir(root: Option<&Path>, kind: &str, id: u64) -> Result<TempDir> {
    let prefix = format!("benchfleet-{}-{}-", kind, id);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

/// Attachments are plain file names; anything that could escape the working
/// directory is rejected.
fn write_attachment(dir: &Path, attachment: &Attachment) -> Result<PathBuf> {
    let name = Path::new(&attachment.filename);
    let mut components = name.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => {
            return Err(FleetError::Attachment(format!(
                "invalid file name {:?}",
                attachment.filename
            )))
        }
    }

    let path = dir.join(name);
    std::fs::write(&path, &attachment.content)
        .map_err(|e| FleetError::Attachment(format!("{}: {}", attachment.filename, e)))?;
    Ok(path)
}

/// Runs the full launch sequence for a server job: working directory,
/// attachments, source resolution, spawn.
#[derive(Clone)]
pub struct ServerLauncher {
    supervisor: ProcessSupervisor,
    resolver: Arc<dyn SourceResolver>,
    work_root: Option<PathBuf>,
    ready_marker: String,
}

impl ServerLauncher {
    pub fn new(
        supervisor: ProcessSupervisor,
        resolver: Arc<dyn SourceResolver>,
        ready_marker: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            resolver,
            work_root: None,
            ready_marker: ready_marker.into(),
        }
    }

    pub fn with_work_root(mut self, root: Option<PathBuf>) -> Self {
        self.work_root = root;
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// The returned handle owns the working directory; it is removed when the
    /// handle is stopped or dropped.
    pub async fn launch(&self, job: &ServerJob) -> Result<ProcessHandle> {
        let workdir = job_workdir(self.work_root.as_deref(), "job", job.id)?;

        for attachment in &job.attachments {
            let path = write_attachment(workdir.path(), attachment)?;
            tracing::debug!(job_id = job.id, path = %path.display(), "Attachment written");
        }

        let program = self.resolver.resolve(job).await?;

        let mut environment = job.environment_variables.clone();
        environment.insert(
            SERVER_URLS_VAR.to_string(),
            format!("http://0.0.0.0:{}", job.port),
        );

        let spec = LaunchSpec::new(program, job.output.clone())
            .with_arguments(job.arguments.clone())
            .with_environment(environment)
            .in_dir(workdir.path())
            .ready_on(Readiness::Marker(self.ready_marker.clone()));

        let mut handle = self.supervisor.start(spec).await?;
        handle.attach_workdir(workdir);
        Ok(handle)
    }
}

/// Spawns load-generation workers. Workers have no readiness marker.
#[derive(Debug, Clone)]
pub struct ClientLauncher {
    supervisor: ProcessSupervisor,
    work_root: Option<PathBuf>,
}

impl ClientLauncher {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self {
            supervisor,
            work_root: None,
        }
    }

    pub fn with_work_root(mut self, root: Option<PathBuf>) -> Self {
        self.work_root = root;
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub async fn launch(&self, job: &ClientJob) -> Result<ProcessHandle> {
        let workdir = job_workdir(self.work_root.as_deref(), "worker", job.id)?;

        let spec = LaunchSpec::new(&job.executable, job.output.clone())
            .with_arguments(job.arguments.clone())
            .with_environment(job.worker_environment())
            .in_dir(workdir.path())
            .ready_on(Readiness::OnSpawn);

        let mut handle = self.supervisor.start(spec).await?;
        handle.attach_workdir(workdir);
        Ok(handle)
    }
}
