use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{FleetError, Result};
use crate::jobs::{RollingLog, ServerJob, Source};

/// Turns a job's [`Source`] into a program that can be launched.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Build output goes to `job.build_log`.
    async fn resolve(&self, job: &ServerJob) -> Result<PathBuf>;
}

/// Resolves sources that already live on this machine.
///
/// `repository` is a local directory and `project` the executable inside it
/// (or an absolute path). When `build_command` is set it runs through `sh -c`
/// in the repository first. Consecutive jobs of one session with an identical
/// source reuse the previous build.
#[derive(Debug, Default)]
pub struct LocalSourceResolver {
    last_build: Mutex<Option<CachedBuild>>,
}

#[derive(Debug, Clone)]
struct CachedBuild {
    session_id: String,
    source: Source,
    program: PathBuf,
}

impl LocalSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cached(&self, job: &ServerJob) -> Option<PathBuf> {
        let session_id = job.session_id.as_deref()?;
        let cache = self.last_build.lock().await;
        cache
            .as_ref()
            .filter(|b| b.session_id == session_id && b.source == job.source)
            .map(|b| b.program.clone())
    }

    async fn remember(&self, job: &ServerJob, program: &Path) {
        let mut cache = self.last_build.lock().await;
        *cache = job.session_id.as_ref().map(|session_id| CachedBuild {
            session_id: session_id.clone(),
            source: job.source.clone(),
            program: program.to_path_buf(),
        });
    }
}

#[async_trait]
impl SourceResolver for LocalSourceResolver {
    async fn resolve(&self, job: &ServerJob) -> Result<PathBuf> {
        if let Some(program) = self.cached(job).await {
            tracing::info!(job_id = job.id, program = %program.display(), "Reusing session build");
            job.build_log.add_line(format!("Reusing build {}", program.display()));
            return Ok(program);
        }

        let source = &job.source;
        let repository = PathBuf::from(&source.repository);
        if !repository.is_dir() {
            return Err(FleetError::Build(format!(
                "repository {} is not a directory",
                repository.display()
            )));
        }

        if !source.branch_or_commit.is_empty() {
            job.build_log.add_line(format!(
                "Using {} at {} as checked out",
                repository.display(),
                source.branch_or_commit
            ));
        }

        if let Some(build_command) = &source.build_command {
            run_build(job.id, &repository, build_command, &job.build_log).await?;
        }

        let project = Path::new(&source.project);
        let program = if project.is_absolute() {
            project.to_path_buf()
        } else {
            repository.join(project)
        };

        if !program.exists() {
            return Err(FleetError::Build(format!(
                "project {} not found",
                program.display()
            )));
        }

        self.remember(job, &program).await;
        Ok(program)
    }
}

async fn run_build(job_id: u64, repository: &Path, build_command: &str, log: &RollingLog) -> Result<()> {
    tracing::info!(job_id, command = build_command, "Building");
    log.add_line(format!("> {}", build_command));

    let output = Command::new("sh")
        .arg("-c")
        .arg(build_command)
        .current_dir(repository)
        .output()
        .await
        .map_err(|e| FleetError::Build(format!("failed to run build: {}", e)))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log.add_line(line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        log.add_line(line);
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(FleetError::Build(format!(
            "`{}` exited with {:?}",
            build_command,
            output.status.code()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_in(dir: &Path, project: &str, build: Option<&str>) -> ServerJob {
        ServerJob::new(
            "plaintext",
            Source {
                repository: dir.display().to_string(),
                project: project.to_string(),
                build_command: build.map(str::to_string),
                ..Source::default()
            },
        )
    }

    #[tokio::test]
    async fn resolves_relative_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app"), "").unwrap();

        let resolver = LocalSourceResolver::new();
        let program = resolver.resolve(&job_in(dir.path(), "app", None)).await.unwrap();
        assert_eq!(program, dir.path().join("app"));
    }

    #[tokio::test]
    async fn missing_repository_is_a_build_error() {
        let resolver = LocalSourceResolver::new();
        let job = job_in(Path::new("/nonexistent/benchfleet"), "app", None);
        assert!(matches!(resolver.resolve(&job).await, Err(FleetError::Build(_))));
    }

    #[tokio::test]
    async fn build_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "app", Some("echo compiling && touch app"));

        let resolver = LocalSourceResolver::new();
        resolver.resolve(&job).await.unwrap();

        let lines = job.build_log.get(0);
        assert!(lines.iter().any(|l| l == "compiling"));
    }

    #[tokio::test]
    async fn failing_build_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "app", Some("echo broken >&2; exit 7"));

        let resolver = LocalSourceResolver::new();
        let err = resolver.resolve(&job).await.unwrap_err();
        assert!(err.to_string().contains("Some(7)"));
        assert_eq!(job.build_log.last_line().as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn session_reuses_previous_build() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("builds");
        let build = format!("echo x >> {} && touch app", counter.display());

        let resolver = LocalSourceResolver::new();
        let first = job_in(dir.path(), "app", Some(&build)).with_session("s1");
        let second = job_in(dir.path(), "app", Some(&build)).with_session("s1");
        let other = job_in(dir.path(), "app", Some(&build)).with_session("s2");

        resolver.resolve(&first).await.unwrap();
        resolver.resolve(&second).await.unwrap();
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);

        resolver.resolve(&other).await.unwrap();
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 2);
    }
}
