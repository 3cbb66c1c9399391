use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::jobs::{ServerCounter, ServerJob};

/// Captures a trace of a running server process into its working directory.
#[async_trait]
pub trait TraceCollector: Send + Sync {
    async fn collect(&self, job: &ServerJob, working_dir: &Path) -> Result<PathBuf>;
}

/// Writes the resource counters and retained output collected so far to
/// `trace-{id}.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotTraceCollector;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceSnapshot<'a> {
    job_id: u64,
    scenario: &'a str,
    process_id: Option<u32>,
    collected_utc: DateTime<Utc>,
    counters: &'a [ServerCounter],
    output: Vec<String>,
    discarded_lines: u64,
}

#[async_trait]
impl TraceCollector for SnapshotTraceCollector {
    async fn collect(&self, job: &ServerJob, working_dir: &Path) -> Result<PathBuf> {
        let snapshot = TraceSnapshot {
            job_id: job.id,
            scenario: &job.scenario,
            process_id: job.process_id,
            collected_utc: Utc::now(),
            counters: &job.server_counters,
            output: job.output.get(0),
            discarded_lines: job.output.discarded(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let path = working_dir.join(format!("trace-{}.json", job.id));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FleetError::Trace(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}
