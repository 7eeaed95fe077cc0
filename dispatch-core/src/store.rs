use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::registry::JobResult;
use crate::retention::RetentionPolicy;
use crate::types::{Job, JobCategory, JobId, JobState, NewJob};

/// Persistence behind every queue. Implementations must make each operation atomic: no two
/// callers may claim the same job, and a finished job is only ever touched by `prune`.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a pending job, invisible to `claim` until `new_job.delay` elapses.
    async fn insert(&self, new_job: NewJob) -> Result<Job, QueueError>;

    /// Take the next ready job of `category`: lowest priority value first, then earliest
    /// visibility time, then enqueue order. The job comes back active with a fresh lock id
    /// and its attempt counter incremented.
    async fn claim(&self, category: JobCategory) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: JobId, lock_id: Uuid, result: JobResult)
        -> Result<Job, QueueError>;

    /// Return an active job to pending, visible again after `delay`.
    async fn retry(
        &self,
        id: JobId,
        lock_id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueError>;

    async fn fail(&self, id: JobId, lock_id: Uuid, error: &str) -> Result<Job, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Time until the earliest delayed pending job of `category` becomes visible.
    /// `Some(Duration::ZERO)` means a job is ready now; `None` means nothing is pending.
    async fn next_ready_in(&self, category: JobCategory) -> Result<Option<Duration>, QueueError>;

    /// Delete finished jobs of `category` in `state` that `policy` no longer retains.
    async fn prune(
        &self,
        category: JobCategory,
        state: JobState,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    async fn count(&self, category: JobCategory, state: JobState) -> Result<u64, QueueError>;
}
