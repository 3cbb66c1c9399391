use std::time::{Duration, Instant};

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::jobs::ServerCounter;

/// Periodic CPU and working-set sampling of a single process.
///
/// CPU usage is computed between two refreshes, so the first sample of a
/// process always reports zero.
pub struct CounterSampler {
    system: System,
    interval: Duration,
    last_sample: Option<Instant>,
}

impl CounterSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            system: System::new(),
            interval,
            last_sample: None,
        }
    }

    /// Forget the previous process so the next sample is taken immediately.
    pub fn reset(&mut self) {
        self.last_sample = None;
    }

    /// Sample `pid` if the interval has elapsed since the last sample.
    pub fn sample_due(&mut self, pid: u32) -> Option<ServerCounter> {
        let now = Instant::now();
        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_sample = Some(now);
        self.sample(pid)
    }

    /// `None` once the process is gone.
    pub fn sample(&mut self, pid: u32) -> Option<ServerCounter> {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;
        Some(ServerCounter {
            timestamp: Utc::now(),
            working_set: process.memory(),
            cpu_usage: process.cpu_usage(),
        })
    }
}
