use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{FleetError, Result};
use crate::jobs::RollingLog;

/// Upper bound on waiting for a process after it was force-killed.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How long output readers may lag behind the exit; forked children can keep
/// the pipes open.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// How a launched process proves it is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready once a captured output line contains this substring.
    Marker(String),
    /// Ready as soon as the process is spawned.
    OnSpawn,
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub readiness: Readiness,
    /// Receives every stdout and stderr line.
    pub output: Arc<RollingLog>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, output: Arc<RollingLog>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            readiness: Readiness::OnSpawn,
            output,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn ready_on(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

/// Latest observation of a supervised process, published by its reader and
/// waiter tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessStatus {
    pub ready: bool,
    pub exited: bool,
    pub exit_code: Option<i32>,
}

/// Ownership of a running process.
///
/// Dropping the handle kills the process and removes its working directory.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    status: watch::Receiver<ProcessStatus>,
    kill_tx: Option<oneshot::Sender<()>>,
    workdir: Option<TempDir>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    /// Tie a working directory's lifetime to this process.
    pub fn attach_workdir(&mut self, workdir: TempDir) {
        self.workdir = Some(workdir);
    }

    /// Wait until the readiness condition is met or the process exits.
    pub async fn wait_ready(&mut self) -> ProcessStatus {
        let status = self.status.wait_for(|s| s.ready || s.exited).await.map(|s| *s);
        status.unwrap_or_else(|_| self.status())
    }

    pub async fn wait_exit(&mut self) -> ProcessStatus {
        let status = self.status.wait_for(|s| s.exited).await.map(|s| *s);
        status.unwrap_or_else(|_| self.status())
    }

    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited.
    AlreadyExited,
    /// The process exited within the grace period.
    Graceful,
    /// The process was force-killed after the grace period.
    Killed,
    /// The process survived the kill; it was abandoned.
    Unresponsive,
}

/// Launches external processes and tears them down.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawn the process described by `spec` and start capturing its output.
    ///
    /// The child runs in its own process group so that stopping it also
    /// reaches anything it forked.
    pub async fn start(&self, spec: LaunchSpec) -> Result<ProcessHandle> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.arguments)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| FleetError::Launch(format!("{}: {}", spec.program.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| FleetError::Launch("process exited before its id was read".into()))?;

        let marker = match &spec.readiness {
            Readiness::Marker(marker) => Some(marker.clone()),
            Readiness::OnSpawn => None,
        };
        let (status_tx, status_rx) = watch::channel(ProcessStatus {
            ready: marker.is_none(),
            ..ProcessStatus::default()
        });
        let status_tx = Arc::new(status_tx);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_lines(
                stdout,
                spec.output.clone(),
                marker.clone(),
                status_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_lines(
                stderr,
                spec.output.clone(),
                marker,
                status_tx.clone(),
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(child, pid, readers, kill_rx, status_tx));

        tracing::info!(pid, program = %spec.program.display(), "Process started");

        Ok(ProcessHandle {
            pid,
            status: status_rx,
            kill_tx: Some(kill_tx),
            workdir: None,
        })
    }

    /// Interrupt the process, then kill it if it outlives the grace period.
    ///
    /// Safe to call on a handle whose process already exited. The wait after
    /// the kill is bounded, so a process stuck in the kernel cannot wedge the
    /// caller.
    pub async fn stop(&self, mut handle: ProcessHandle) -> StopOutcome {
        let pid = handle.pid;
        if handle.status().exited {
            // The leader is gone but anything it forked still holds the group
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            return StopOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        signal_group(pid, nix::sys::signal::Signal::SIGINT);
        #[cfg(not(unix))]
        handle.force_kill();

        if tokio::time::timeout(self.grace_period, handle.wait_exit())
            .await
            .is_ok()
        {
            // Stragglers left in the group
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            tracing::info!(pid, "Process stopped");
            return StopOutcome::Graceful;
        }

        tracing::warn!(
            pid,
            grace_ms = self.grace_period.as_millis() as u64,
            "Process ignored interrupt, killing"
        );

        #[cfg(unix)]
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        handle.force_kill();

        if tokio::time::timeout(KILL_WAIT, handle.wait_exit())
            .await
            .is_ok()
        {
            StopOutcome::Killed
        } else {
            tracing::error!(pid, "Process did not exit after kill");
            StopOutcome::Unresponsive
        }
    }
}

async fn capture_lines<R>(
    stream: R,
    log: Arc<RollingLog>,
    marker: Option<String>,
    status: Arc<watch::Sender<ProcessStatus>>,
) where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stream).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r');
                let is_marker = marker.as_deref().is_some_and(|m| line.contains(m));
                log.add_line(line);
                if is_marker {
                    status.send_if_modified(|s| !std::mem::replace(&mut s.ready, true));
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Output stream failed");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
    kill_rx: oneshot::Receiver<()>,
    status: Arc<watch::Sender<ProcessStatus>>,
) {
    // A dropped handle counts as a kill request
    let result = tokio::select! {
        result = child.wait() => result,
        _ = kill_rx => {
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, error = %e, "Kill request for exited process");
            }
            child.wait().await
        }
    };

    let exit_code = match result {
        Ok(exit) => exit.code(),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to wait for process");
            None
        }
    };

    // Exit is published only after the output is captured
    let drain = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN, drain).await.is_err() {
        tracing::debug!(pid, "Output still open after exit");
    }

    tracing::debug!(pid, exit_code = ?exit_code, "Process exited");
    status.send_modify(|s| {
        s.exited = true;
        s.exit_code = exit_code;
    });
}

/// Send `signal` to the process group led by `pid`. Returns false if the
/// group no longer exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, signal = ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}
