use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::jobs::record::{JobRecord, JobState};
use crate::jobs::rolling_log::RollingLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClientState {
    #[default]
    Waiting,
    Starting,
    Running,
    Completed,
    Failed,
    Deleting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Waiting => "Waiting",
            ClientState::Starting => "Starting",
            ClientState::Running => "Running",
            ClientState::Completed => "Completed",
            ClientState::Failed => "Failed",
            ClientState::Deleting => "Deleting",
        };
        f.write_str(name)
    }
}

impl JobState for ClientState {
    const INITIAL: Self = ClientState::Waiting;
    const DELETING: Self = ClientState::Deleting;

    fn can_transition_to(self, next: Self) -> bool {
        use ClientState::*;
        match (self, next) {
            (Deleting, _) => false,
            (_, Deleting) => true,
            (Waiting, Starting) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }

    fn is_liveness_checked(self) -> bool {
        matches!(
            self,
            ClientState::Running | ClientState::Completed | ClientState::Failed
        )
    }
}

/// A load-generation worker run on behalf of a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJob {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub state: ClientState,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Load generator to launch.
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Address of the server under test.
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub warmup_secs: u64,
    /// Zero means the worker decides when to stop.
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub last_driver_communication_utc: DateTime<Utc>,

    // Written by the supervisor
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_utc: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub output: Arc<RollingLog>,
}

impl ClientJob {
    pub fn new(executable: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            id: 0,
            state: ClientState::Waiting,
            session_id: None,
            executable: executable.into(),
            arguments: Vec::new(),
            environment_variables: BTreeMap::new(),
            server_url: server_url.into(),
            connections: 0,
            threads: 0,
            warmup_secs: 0,
            duration_secs: 0,
            last_driver_communication_utc: Utc::now(),
            process_id: None,
            exit_code: None,
            error: None,
            started_utc: None,
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

    pub fn with_duration(mut self, warmup_secs: u64, duration_secs: u64) -> Self {
        self.warmup_secs = warmup_secs;
        self.duration_secs = duration_secs;
        self
    }

    /// Variables describing the load to generate, passed to the worker.
    pub fn worker_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.environment_variables.clone();
        env.insert("BENCH_SERVER_URL".into(), self.server_url.clone());
        env.insert("BENCH_CONNECTIONS".into(), self.connections.to_string());
        env.insert("BENCH_THREADS".into(), self.threads.to_string());
        env.insert("BENCH_WARMUP".into(), self.warmup_secs.to_string());
        env.insert("BENCH_DURATION".into(), self.duration_secs.to_string());
        env
    }
}

impl JobRecord for ClientJob {
    type State = ClientState;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, state: ClientState) {
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
        if self.executable.trim().is_empty() {
            return Err(FleetError::InvalidJob("executable is required".into()));
        }
        Ok(())
    }

    fn merge_update(&mut self, replacement: Self) {
        let ClientJob {
            session_id,
            executable,
            arguments,
            environment_variables,
            server_url,
            connections,
            threads,
            warmup_secs,
            duration_secs,
            ..
        } = replacement;

        self.session_id = session_id;
        self.executable = executable;
        self.arguments = arguments;
        self.environment_variables = environment_variables;
        self.server_url = server_url;
        self.connections = connections;
        self.threads = threads;
        self.warmup_secs = warmup_secs;
        self.duration_secs = duration_secs;
    }

    fn reset_runtime(&mut self, log_capacity: usize) {
        self.process_id = None;
        self.exit_code = None;
        self.error = None;
        self.started_utc = None;
        self.output = Arc::new(RollingLog::new(log_capacity));
    }
}
