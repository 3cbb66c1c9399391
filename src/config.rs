use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::rolling_log::DEFAULT_LOG_CAPACITY;

/// Readiness marker printed by the benchmarked applications.
pub const DEFAULT_READY_MARKER: &str = "Application started";

/// Maps scenario names to the URL path the driver should load.
///
/// Lookups are case-insensitive. A scenario missing from the table cannot run
/// on this agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioTable {
    paths: BTreeMap<String, String>,
}

impl Default for ScenarioTable {
    fn default() -> Self {
        Self::empty()
            .with_scenario("plaintext", "/plaintext")
            .with_scenario("json", "/json")
            .with_scenario("fortunes", "/fortunes")
            .with_scenario("dbsingle", "/db")
            .with_scenario("dbmulti", "/queries")
            .with_scenario("updates", "/updates")
            .with_scenario("mvcplaintext", "/mvc/plaintext")
            .with_scenario("mvcjson", "/mvc/json")
            .with_scenario("staticfiles", "/file.txt")
            .with_scenario("default", "/")
    }
}

impl ScenarioTable {
    pub fn empty() -> Self {
        Self {
            paths: BTreeMap::new(),
        }
    }

    pub fn with_scenario(mut self, name: &str, path: &str) -> Self {
        self.paths.insert(name.to_ascii_lowercase(), path.to_string());
        self
    }

    pub fn path(&self, scenario: &str) -> Option<&str> {
        self.paths
            .get(&scenario.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn supports(&self, scenario: &str) -> bool {
        self.path(scenario).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }
}

/// Timing and matching rules of the lifecycle loop.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Polling interval of the loop
    pub tick_interval_ms: u64,
    /// Driver silence after which a job is reclaimed
    pub liveness_timeout_ms: u64,
    /// Time between the interrupt and the force-kill when stopping
    pub stop_grace_period_ms: u64,
    /// Substring that proves the server process is ready
    pub ready_marker: String,
    /// Interval between resource samples of the running server process
    pub counter_interval_ms: u64,
    /// Samples kept per job; older ones are dropped
    pub max_counter_samples: usize,
    /// Extra time a client worker gets beyond warmup + duration
    pub client_duration_slack_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            liveness_timeout_ms: 30_000,
            stop_grace_period_ms: 5_000,
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            counter_interval_ms: 1_000,
            max_counter_samples: 600,
            client_duration_slack_ms: 30_000,
        }
    }
}

impl LifecycleConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn counter_interval(&self) -> Duration {
        Duration::from_millis(self.counter_interval_ms)
    }

    pub fn client_duration_slack(&self) -> Duration {
        Duration::from_millis(self.client_duration_slack_ms)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Name under which launched applications are reachable
    pub hostname: String,
    pub max_jobs: usize,
    pub log_capacity: usize,
    /// Parent directory for per-job working directories (system temp if unset)
    pub work_root: Option<PathBuf>,
    pub lifecycle: LifecycleConfig,
    pub scenarios: ScenarioTable,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:5010"
                .parse()
                .expect("default listen address is valid"),
            hostname: "localhost".to_string(),
            max_jobs: 10_000,
            log_capacity: DEFAULT_LOG_CAPACITY,
            work_root: None,
            lifecycle: LifecycleConfig::default(),
            scenarios: ScenarioTable::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_scenario(mut self, name: &str, path: &str) -> Self {
        self.scenarios = self.scenarios.with_scenario(name, path);
        self
    }
}
