//! Process supervision for benchmarked applications and load workers.
//!
//! - **Process**: spawn in a dedicated process group, capture output into a
//!   [`RollingLog`](crate::jobs::RollingLog), detect readiness, stop with
//!   interrupt-then-kill
//! - **Source**: turn a job's source descriptor into a runnable program
//! - **Launch**: per-job working directory, attachments, environment
//! - **Sampling / trace**: resource counters and trace snapshots of a running
//!   server process
//!
//! # Launch Flow
//!
//! 1. [`ServerLauncher::launch`] creates the working directory and writes
//!    attachments
//! 2. The [`SourceResolver`] builds the source and returns the program path
//! 3. [`ProcessSupervisor::start`] spawns it; reader tasks publish readiness
//!    once the marker line shows up
//! 4. [`ProcessSupervisor::stop`] interrupts the group, then kills it after the
//!    grace period
//!
//! # Security Note
//!
//! Programs and build commands run with the agent's privileges, unsandboxed.

pub mod launch;
pub mod process;
pub mod sampler;
pub mod source;
pub mod trace;

pub use launch::{ClientLauncher, ServerLauncher};
pub use process::{
    LaunchSpec, ProcessHandle, ProcessStatus, ProcessSupervisor, Readiness, StopOutcome,
};
pub use sampler::CounterSampler;
pub use source::{LocalSourceResolver, SourceResolver};
pub use trace::{SnapshotTraceCollector, TraceCollector};
