use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_CAPACITY: usize = 1_000;

/// Bounded FIFO of text lines captured from a supervised process.
///
/// Once `capacity` lines are held, each append evicts the oldest line and
/// bumps the discard counter. Readers page through the log with an absolute
/// cursor (`skip`); a cursor that points into the discarded prefix simply
/// starts at the oldest retained line, and the caller compares its cursor
/// with [`RollingLog::discarded`] to detect the gap.
///
/// The mutex covers exactly this instance's buffer, discard count and last
/// line.
#[derive(Debug)]
pub struct RollingLog {
    capacity: usize,
    inner: Mutex<LogBuffer>,
}

#[derive(Debug, Default)]
struct LogBuffer {
    lines: VecDeque<String>,
    discarded: u64,
    last_line: Option<String>,
}

/// A slice of a log as returned to drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub lines: Vec<String>,
    pub discarded: u64,
}

impl Default for RollingLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl RollingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LogBuffer::default()),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, LogBuffer> {
        // A panic while holding the lock cannot leave the buffer half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one line, evicting the oldest one when full.
    pub fn add_line(&self, line: impl Into<String>) {
        let line = line.into();
        let mut buffer = self.buffer();
        if buffer.lines.len() >= self.capacity {
            buffer.lines.pop_front();
            buffer.discarded += 1;
        }
        buffer.last_line = Some(line.clone());
        buffer.lines.push_back(line);
    }

    /// Lines from absolute position `skip` onwards.
    pub fn get(&self, skip: u64) -> Vec<String> {
        let buffer = self.buffer();
        let start = skip.saturating_sub(buffer.discarded) as usize;
        buffer.lines.iter().skip(start).cloned().collect()
    }

    pub fn page(&self, skip: u64) -> LogPage {
        let buffer = self.buffer();
        let start = skip.saturating_sub(buffer.discarded) as usize;
        LogPage {
            lines: buffer.lines.iter().skip(start).cloned().collect(),
            discarded: buffer.discarded,
        }
    }

    /// Number of lines evicted so far.
    pub fn discarded(&self) -> u64 {
        self.buffer().discarded
    }

    pub fn last_line(&self) -> Option<String> {
        self.buffer().last_line.clone()
    }

    pub fn len(&self) -> usize {
        self.buffer().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().lines.is_empty()
    }

    /// Lines ever appended, retained or not.
    pub fn total(&self) -> u64 {
        let buffer = self.buffer();
        buffer.discarded + buffer.lines.len() as u64
    }

    pub fn clear(&self) {
        let mut buffer = self.buffer();
        buffer.lines.clear();
        buffer.discarded = 0;
        buffer.last_line = None;
    }
}
