use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::jobs::rolling_log::RollingLog;

/// A job state enum with a fixed transition graph.
pub trait JobState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// State assigned on creation.
    const INITIAL: Self;
    /// Universal "tear down and forget" state.
    const DELETING: Self;

    /// Whether `self -> next` is an edge of the state graph.
    fn can_transition_to(self, next: Self) -> bool;

    /// States reclaimed by the liveness rule when the driver goes silent.
    fn is_liveness_checked(self) -> bool;
}

/// Common surface of server and client job records.
///
/// Records are plain values; the repository owns them and all mutation goes
/// through its lock.
pub trait JobRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type State: JobState;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);

    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);

    fn last_driver_communication_utc(&self) -> DateTime<Utc>;
    fn set_last_driver_communication_utc(&mut self, at: DateTime<Utc>);

    fn session_id(&self) -> Option<&str>;

    /// Captured stdout and stderr of the job's process.
    fn output(&self) -> &RollingLog;

    /// Reject descriptions missing required fields.
    fn validate(&self) -> Result<()>;

    /// Copy the descriptive fields of a driver-supplied replacement.
    ///
    /// State, heartbeat and supervisor-written fields are left alone.
    fn merge_update(&mut self, replacement: Self);

    /// Clear supervisor-written fields and allocate fresh output buffers.
    fn reset_runtime(&mut self, log_capacity: usize);

    /// Reset a freshly received description for insertion.
    fn accept(&mut self, now: DateTime<Utc>, log_capacity: usize) {
        self.set_id(0);
        self.set_state(Self::State::INITIAL);
        self.set_last_driver_communication_utc(now);
        self.reset_runtime(log_capacity);
    }

    /// Record driver contact. The timestamp never moves backwards.
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_driver_communication_utc() {
            self.set_last_driver_communication_utc(now);
        }
    }

    /// Move to `next` if the state graph allows it.
    ///
    /// Returns `Ok(false)` when the job is already in `next`.
    fn transition(&mut self, next: Self::State) -> Result<bool> {
        let current = self.state();
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                id: self.id(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.set_state(next);
        Ok(true)
    }

    /// Whether the driver has been silent for longer than `timeout`.
    fn is_abandoned(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.state().is_liveness_checked()
            && now.signed_duration_since(self.last_driver_communication_utc()) > timeout
    }
}
