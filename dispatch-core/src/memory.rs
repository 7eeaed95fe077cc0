use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{JobError, QueueError};
use crate::registry::JobResult;
use crate::retention::RetentionPolicy;
use crate::store::JobStore;
use crate::types::{Job, JobCategory, JobId, JobState, NewJob};

// Stand-in visibility for delays too large to represent
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn visible_after(delay: Duration) -> (DateTime<Utc>, Instant) {
    let scheduled_at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let now = Instant::now();
    let ready_at = now
        .checked_add(delay)
        .unwrap_or_else(|| now + FAR_FUTURE);
    (scheduled_at, ready_at)
}

struct Entry {
    job: Job,
    // Visibility on the tokio clock, so delays follow a paused runtime in tests
    ready_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn held(&mut self, id: JobId, lock_id: Uuid) -> Result<&mut Entry, QueueError> {
        let entry = self.jobs.get_mut(&id).ok_or(JobError::UnknownJob(id))?;
        if entry.job.state != JobState::Active || entry.job.lock_id != Some(lock_id) {
            return Err(JobError::InvalidLock {
                id,
                lock_id: Some(lock_id),
            }
            .into());
        }
        Ok(entry)
    }
}

/// A `JobStore` kept in process memory. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation leaves Inner consistent before it can panic
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(
        &self,
        id: JobId,
        lock_id: Uuid,
        state: JobState,
        result: Option<JobResult>,
        error: Option<&str>,
    ) -> Result<Job, QueueError> {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let entry = inner.held(id, lock_id)?;

        entry.seq = seq;
        entry.job.state = state;
        entry.job.lock_id = None;
        entry.job.finished_at = Some(Utc::now());
        if result.is_some() {
            entry.job.result = result;
        }
        if let Some(error) = error {
            entry.job.last_error = Some(error.to_owned());
        }

        Ok(entry.job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, new_job: NewJob) -> Result<Job, QueueError> {
        let now = Utc::now();
        let (scheduled_at, ready_at) = visible_after(new_job.delay);

        let job = Job {
            id: new_job.id,
            category: new_job.category,
            state: JobState::Pending,
            priority: new_job.priority,
            attempt: 0,
            max_attempts: new_job.max_attempts,
            payload: new_job.payload,
            result: None,
            last_error: None,
            lock_id: None,
            created_at: now,
            scheduled_at,
            started_at: None,
            finished_at: None,
        };

        let mut inner = self.lock();
        let seq = inner.next_seq();
        inner.jobs.insert(
            job.id,
            Entry {
                job: job.clone(),
                ready_at,
                seq,
            },
        );

        Ok(job)
    }

    async fn claim(&self, category: JobCategory) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();

        let next = inner
            .jobs
            .values()
            .filter(|entry| {
                entry.job.category == category
                    && entry.job.state == JobState::Pending
                    && entry.ready_at <= now
            })
            .min_by_key(|entry| (entry.job.priority, entry.ready_at, entry.seq))
            .map(|entry| entry.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        entry.job.state = JobState::Active;
        entry.job.attempt += 1;
        entry.job.started_at = Some(Utc::now());
        entry.job.lock_id = Some(Uuid::now_v7());

        Ok(Some(entry.job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        lock_id: Uuid,
        result: JobResult,
    ) -> Result<Job, QueueError> {
        self.finish(id, lock_id, JobState::Completed, Some(result), None)
    }

    async fn retry(
        &self,
        id: JobId,
        lock_id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let entry = inner.held(id, lock_id)?;

        let (scheduled_at, ready_at) = visible_after(delay);

        entry.seq = seq;
        entry.ready_at = ready_at;
        entry.job.state = JobState::Pending;
        entry.job.lock_id = None;
        entry.job.scheduled_at = scheduled_at;
        entry.job.last_error = Some(error.to_owned());

        Ok(entry.job.clone())
    }

    async fn fail(&self, id: JobId, lock_id: Uuid, error: &str) -> Result<Job, QueueError> {
        self.finish(id, lock_id, JobState::Failed, None, Some(error))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.lock().jobs.get(&id).map(|entry| entry.job.clone()))
    }

    async fn next_ready_in(&self, category: JobCategory) -> Result<Option<Duration>, QueueError> {
        let now = Instant::now();
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|entry| entry.job.category == category && entry.job.state == JobState::Pending)
            .map(|entry| entry.ready_at.saturating_duration_since(now))
            .min())
    }

    async fn prune(
        &self,
        category: JobCategory,
        state: JobState,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        if !state.is_finished() || policy.is_unbounded() {
            return Ok(0);
        }

        let mut inner = self.lock();

        let mut finished: Vec<(DateTime<Utc>, u64, JobId)> = inner
            .jobs
            .values()
            .filter(|entry| entry.job.category == category && entry.job.state == state)
            .map(|entry| {
                (
                    entry.job.finished_at.unwrap_or(entry.job.created_at),
                    entry.seq,
                    entry.job.id,
                )
            })
            .collect();
        // Most recently finished first
        finished.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for (rank, (finished_at, _, id)) in finished.into_iter().enumerate() {
            if !policy.retains(rank, finished_at, now) && inner.jobs.remove(&id).is_some() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn count(&self, category: JobCategory, state: JobState) -> Result<u64, QueueError> {
        let count = self
            .lock()
            .jobs
            .values()
            .filter(|entry| entry.job.category == category && entry.job.state == state)
            .count();
        Ok(count as u64)
    }
}
