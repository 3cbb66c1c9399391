use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::jobs::JobRecord;

/// Reclaims jobs whose driver stopped touching them.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    timeout: chrono::Duration,
}

impl LivenessPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    /// Whether `job` is in a checked state and has been silent past the timeout.
    pub fn is_expired<J: JobRecord>(&self, job: &J, now: DateTime<Utc>) -> bool {
        job.is_abandoned(now, self.timeout)
    }
}
