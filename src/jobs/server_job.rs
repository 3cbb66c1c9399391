use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::jobs::record::{JobRecord, JobState};
use crate::jobs::rolling_log::RollingLog;

pub const DEFAULT_SERVER_PORT: u16 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerState {
    #[default]
    Waiting,
    Starting,
    Running,
    Failed,
    NotSupported,
    TraceCollecting,
    TraceCollected,
    Deleting,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Waiting => "Waiting",
            ServerState::Starting => "Starting",
            ServerState::Running => "Running",
            ServerState::Failed => "Failed",
            ServerState::NotSupported => "NotSupported",
            ServerState::TraceCollecting => "TraceCollecting",
            ServerState::TraceCollected => "TraceCollected",
            ServerState::Deleting => "Deleting",
        };
        f.write_str(name)
    }
}

impl JobState for ServerState {
    const INITIAL: Self = ServerState::Waiting;
    const DELETING: Self = ServerState::Deleting;

    fn can_transition_to(self, next: Self) -> bool {
        use ServerState::*;
        match (self, next) {
            (Deleting, _) => false,
            (_, Deleting) => true,
            (Waiting, Starting) | (Waiting, NotSupported) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Failed) | (Running, TraceCollecting) => true,
            (TraceCollecting, TraceCollected) | (TraceCollecting, Failed) => true,
            (TraceCollected, Failed) => true,
            _ => false,
        }
    }

    fn is_liveness_checked(self) -> bool {
        matches!(
            self,
            ServerState::Running
                | ServerState::TraceCollecting
                | ServerState::TraceCollected
                | ServerState::Failed
                | ServerState::NotSupported
        )
    }
}

impl ServerState {
    /// States in which the benchmarked process is expected to be alive.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ServerState::Running | ServerState::TraceCollecting | ServerState::TraceCollected
        )
    }
}

/// Where the benchmarked application comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    /// Local checkout holding the application.
    pub repository: String,
    pub branch_or_commit: String,
    /// Executable to launch, relative to `repository` unless absolute.
    pub project: String,
    /// Shell command run in `repository` before launching.
    pub build_command: Option<String>,
}

/// A file written into the job's working directory before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content: String,
}

/// Resource usage sample of the benchmarked process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCounter {
    pub timestamp: DateTime<Utc>,
    pub working_set: u64,
    pub cpu_usage: f32,
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerJob {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub state: ServerState,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub last_driver_communication_utc: DateTime<Utc>,

    // Written by the supervisor
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    #[serde(default)]
    pub server_counters: Vec<ServerCounter>,
    #[serde(skip)]
    pub build_log: Arc<RollingLog>,
    #[serde(skip)]
    pub output: Arc<RollingLog>,
}

impl ServerJob {
    pub fn new(scenario: impl Into<String>, source: Source) -> Self {
        Self {
            id: 0,
            state: ServerState::Waiting,
            scenario: scenario.into(),
            source,
            arguments: Vec::new(),
            environment_variables: BTreeMap::new(),
            port: DEFAULT_SERVER_PORT,
            session_id: None,
            attachments: Vec::new(),
            last_driver_communication_utc: Utc::now(),
            url: None,
            process_id: None,
            error: None,
            trace_path: None,
            server_counters: Vec::new(),
            build_log: Arc::default(),
            output: Arc::default(),
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, content: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content: content.into(),
        });
        self
    }

    /// Append a resource sample, dropping the oldest ones beyond `limit`.
    pub fn record_counter(&mut self, counter: ServerCounter, limit: usize) {
        self.server_counters.push(counter);
        let excess = self.server_counters.len().saturating_sub(limit);
        self.server_counters.drain(..excess);
    }
}

impl JobRecord for ServerJob {
    type State = ServerState;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn set_state(&mut self, state: ServerState) {
        self.state = state;
    }

    fn last_driver_communication_utc(&self) -> DateTime<Utc> {
        self.last_driver_communication_utc
    }

    fn set_last_driver_communication_utc(&mut self, at: DateTime<Utc>) {
        self.last_driver_communication_utc = at;
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn output(&self) -> &RollingLog {
        &self.output
    }

    fn validate(&self) -> Result<()> {
        if self.source.repository.trim().is_empty() {
            return Err(FleetError::InvalidJob("source.repository is required".into()));
        }
        if self.source.project.trim().is_empty() {
            return Err(FleetError::InvalidJob("source.project is required".into()));
        }
        Ok(())
    }

    fn merge_update(&mut self, replacement: Self) {
        let ServerJob {
            scenario,
            source,
            arguments,
            environment_variables,
            port,
            session_id,
            attachments,
            ..
        } = replacement;

        self.scenario = scenario;
        self.source = source;
        self.arguments = arguments;
        self.environment_variables = environment_variables;
        self.port = port;
        self.session_id = session_id;
        self.attachments = attachments;
    }

    fn reset_runtime(&mut self, log_capacity: usize) {
        self.url = None;
        self.process_id = None;
        self.error = None;
        self.trace_path = None;
        self.server_counters.clear();
        self.build_log = Arc::new(RollingLog::new(log_capacity));
        self.output = Arc::new(RollingLog::new(log_capacity));
    }
}
