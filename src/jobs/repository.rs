use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{FleetError, Result};
use crate::jobs::record::{JobRecord, JobState};
use crate::jobs::rolling_log::DEFAULT_LOG_CAPACITY;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// In-memory store of job records keyed by an auto-incrementing id.
///
/// Every operation takes the single lock for its own duration only, so HTTP
/// handlers and the lifecycle loop interleave freely. [`JobRepository::all`]
/// returns clones so callers can do slow work without holding the lock.
#[derive(Debug)]
pub struct JobRepository<J: JobRecord> {
    inner: RwLock<Store<J>>,
    max_jobs: usize,
    log_capacity: usize,
}

#[derive(Debug)]
struct Store<J> {
    jobs: BTreeMap<u64, J>,
    next_id: u64,
}

impl<J: JobRecord> Default for JobRepository<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobRecord> JobRepository<J> {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_JOBS, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_limits(max_jobs: usize, log_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Store {
                jobs: BTreeMap::new(),
                next_id: 1,
            }),
            max_jobs,
            log_capacity,
        }
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    /// Validate a driver description, reset it to its initial state and store it.
    pub async fn create(&self, mut job: J) -> Result<J> {
        job.validate()?;
        job.accept(Utc::now(), self.log_capacity);
        self.add(job).await
    }

    /// Store a job under a fresh id. Ids are never reused.
    pub async fn add(&self, mut job: J) -> Result<J> {
        let mut store = self.inner.write().await;
        if store.jobs.len() >= self.max_jobs {
            return Err(FleetError::RepositoryFull(self.max_jobs));
        }
        let id = store.next_id;
        store.next_id += 1;
        job.set_id(id);
        store.jobs.insert(id, job.clone());
        Ok(job)
    }

    pub async fn find(&self, id: u64) -> Option<J> {
        self.inner.read().await.jobs.get(&id).cloned()
    }

    /// Snapshot of every job, ordered by id.
    pub async fn all(&self) -> Vec<J> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    /// Replace the description of an existing job and record driver contact.
    ///
    /// Supervisor-owned fields survive. The only state a driver may request
    /// is `Deleting`; anything else in the payload is ignored, as is its
    /// heartbeat timestamp.
    pub async fn update(&self, job: J) -> Result<J> {
        job.validate()?;
        let id = job.id();
        let requested = job.state();
        let now = Utc::now();

        let mut store = self.inner.write().await;
        let existing = store.jobs.get_mut(&id).ok_or(FleetError::JobNotFound(id))?;
        existing.merge_update(job);
        existing.touch(now);

        if requested == J::State::DELETING {
            existing.transition(J::State::DELETING)?;
        } else if requested != existing.state() {
            tracing::warn!(
                job_id = id,
                requested = %requested,
                state = %existing.state(),
                "Ignoring state change in update"
            );
        }
        Ok(existing.clone())
    }

    pub async fn remove(&self, id: u64) -> Option<J> {
        self.inner.write().await.jobs.remove(&id)
    }

    /// Run `f` against the stored job while holding the lock.
    pub async fn modify<R>(&self, id: u64, f: impl FnOnce(&mut J) -> R) -> Option<R> {
        let mut store = self.inner.write().await;
        store.jobs.get_mut(&id).map(f)
    }

    /// Record driver contact and return the refreshed job.
    pub async fn touch(&self, id: u64) -> Result<J> {
        let now = Utc::now();
        self.modify(id, |job| {
            job.touch(now);
            job.clone()
        })
        .await
        .ok_or(FleetError::JobNotFound(id))
    }

    pub async fn transition(&self, id: u64, state: J::State) -> Result<bool> {
        self.modify(id, |job| job.transition(state))
            .await
            .ok_or(FleetError::JobNotFound(id))?
    }

    /// Request teardown. Repeated calls are no-ops.
    pub async fn mark_deleting(&self, id: u64) -> Result<bool> {
        self.transition(id, J::State::DELETING).await
    }

    /// Oldest job in the initial state, preferring the given session.
    pub async fn next_waiting(&self, session_id: Option<&str>) -> Option<J> {
        let store = self.inner.read().await;
        let mut waiting = store
            .jobs
            .values()
            .filter(|job| job.state() == J::State::INITIAL);

        match session_id {
            Some(session) => {
                let candidates: Vec<&J> = waiting.collect();
                candidates
                    .iter()
                    .find(|job| job.session_id() == Some(session))
                    .or_else(|| candidates.first())
                    .map(|job| (*job).clone())
            }
            None => waiting.next().cloned(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}
