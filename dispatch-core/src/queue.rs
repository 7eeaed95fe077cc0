use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, QueueClosedError, QueueError};
use crate::metrics_consts::*;
use crate::registry::{JobPayload, JobResult};
use crate::retention::RetentionPolicy;
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{ClaimedJob, Job, JobCategory, JobId, JobState, NewJob};

/// Execution policy shared by every job of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub default_priority: i16,
    pub completed_retention: RetentionPolicy,
    pub failed_retention: RetentionPolicy,
    /// How long `Queue::close` waits for claimed jobs to finish.
    pub close_timeout: Duration,
}

impl QueueOptions {
    pub fn for_category(category: JobCategory) -> Self {
        Self {
            max_attempts: 3,
            retry_policy: RetryPolicy::default(),
            default_priority: category.default_priority(),
            completed_retention: RetentionPolicy::completed_default(),
            failed_retention: RetentionPolicy::failed_default(),
            close_timeout: Duration::from_secs(30),
        }
    }

    pub fn retention(&self, state: JobState) -> Option<&RetentionPolicy> {
        match state {
            JobState::Completed => Some(&self.completed_retention),
            JobState::Failed => Some(&self.failed_retention),
            JobState::Pending | JobState::Active => None,
        }
    }
}

/// Per-job overrides of the queue's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Option<i16>,
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What happened to a job reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Attempts remain: the job is pending again and becomes visible after `delay`.
    Retry { delay: Duration },
    /// The last attempt failed: the job is permanently failed.
    Failed,
}

/// A named queue holding the jobs of one category.
///
/// Producers enqueue, workers claim and report back. Every claimed job is counted as active
/// until it is completed or failed, which is what `close` waits for.
pub struct Queue {
    category: JobCategory,
    options: QueueOptions,
    store: Arc<dyn JobStore>,
    // Enqueues hold this for reading, so close can wait for the ones in flight
    gate: RwLock<()>,
    closed: AtomicBool,
    active: AtomicUsize,
    ready: Notify,
    idle: Notify,
}

impl Queue {
    pub fn new(category: JobCategory, options: QueueOptions, store: Arc<dyn JobStore>) -> Self {
        Self {
            category,
            options,
            store,
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            ready: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of jobs claimed from this queue and not yet reported back.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Enqueue a job with the queue's default priority and attempts.
    pub async fn enqueue(&self, payload: impl Into<JobPayload>) -> Result<JobId, QueueError> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    pub async fn enqueue_with(
        &self,
        payload: impl Into<JobPayload>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let _gate = self.gate.read().await;
        if self.is_closed() {
            return Err(QueueClosedError {
                queue: self.category,
            }
            .into());
        }

        let payload = payload.into();
        if payload.category() != self.category {
            return Err(QueueError::CategoryMismatch {
                expected: self.category,
                got: payload.category(),
            });
        }
        payload
            .validate()
            .map_err(|reason| QueueError::InvalidPayload {
                category: self.category,
                reason,
            })?;

        let max_attempts = options.max_attempts.unwrap_or(self.options.max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".to_owned(),
            ));
        }

        let job = self
            .store
            .insert(NewJob {
                id: Uuid::now_v7(),
                category: self.category,
                priority: options.priority.unwrap_or(self.options.default_priority),
                max_attempts,
                payload,
                delay: options.delay.unwrap_or_default(),
            })
            .await?;

        metrics::counter!(JOBS_ENQUEUED, "category" => self.category.as_str()).increment(1);
        debug!(
            job_id = %job.id,
            category = %self.category,
            priority = job.priority,
            "enqueued job"
        );
        self.ready.notify_waiters();

        Ok(job.id)
    }

    /// Enqueue an untyped payload, parsed against this queue's payload schema.
    pub async fn enqueue_json(
        &self,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let payload = JobPayload::from_json(self.category, payload).map_err(|error| {
            QueueError::InvalidPayload {
                category: self.category,
                reason: error.to_string(),
            }
        })?;

        self.enqueue_with(payload, options).await
    }

    /// Resolves when a job is enqueued or the queue closes. Only waiters registered before the
    /// event are woken, so enable the future before checking for work.
    pub fn notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    /// Claim the next ready job, if any. Closed queues hand out nothing.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        // Counted before the closed check, so close never misses a claim racing with it
        self.active.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.release();
            return Ok(None);
        }

        match self.store.claim(self.category).await {
            Ok(Some(job)) => {
                self.report_active();
                Ok(Some(ClaimedJob::new(job)))
            }
            Ok(None) => {
                self.release();
                Ok(None)
            }
            Err(error) => {
                self.release();
                Err(error)
            }
        }
    }

    pub async fn complete(&self, job: ClaimedJob, result: JobResult) -> Result<Job, QueueError> {
        let job = job.into_job();
        let outcome = self.complete_held(&job, result).await;
        self.release();

        if outcome.is_ok() {
            metrics::counter!(JOBS_COMPLETED, "category" => self.category.as_str()).increment(1);
        }
        outcome
    }

    async fn complete_held(&self, job: &Job, result: JobResult) -> Result<Job, QueueError> {
        if result.category() != self.category {
            return Err(QueueError::CategoryMismatch {
                expected: self.category,
                got: result.category(),
            });
        }
        let lock_id = held_lock(job)?;
        self.store.complete(job.id, lock_id, result).await
    }

    /// Record a failed attempt. The job is retried after the queue's backoff while attempts
    /// remain, and permanently failed otherwise.
    pub async fn fail(
        &self,
        job: ClaimedJob,
        error: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let job = job.into_job();
        let outcome = self.fail_held(&job, error).await;
        self.release();

        match &outcome {
            Ok(FailureDisposition::Retry { delay }) => {
                metrics::counter!(JOBS_RETRIED, "category" => self.category.as_str())
                    .increment(1);
                debug!(
                    job_id = %job.id,
                    category = %self.category,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, retrying"
                );
            }
            Ok(FailureDisposition::Failed) => {
                metrics::counter!(JOBS_FAILED, "category" => self.category.as_str()).increment(1);
                warn!(
                    job_id = %job.id,
                    category = %self.category,
                    attempt = job.attempt,
                    error,
                    "job failed permanently"
                );
            }
            Err(_) => {}
        }

        outcome
    }

    async fn fail_held(&self, job: &Job, error: &str) -> Result<FailureDisposition, QueueError> {
        let lock_id = held_lock(job)?;

        if job.has_attempts_remaining() {
            let delay = self.options.retry_policy.retry_interval(job.attempt);
            self.store.retry(job.id, lock_id, error, delay).await?;
            Ok(FailureDisposition::Retry { delay })
        } else {
            self.store.fail(job.id, lock_id, error).await?;
            Ok(FailureDisposition::Failed)
        }
    }

    /// Time until the next delayed job becomes visible, `None` when nothing is pending.
    pub async fn next_ready_in(&self) -> Result<Option<Duration>, QueueError> {
        self.store.next_ready_in(self.category).await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self
            .store
            .get(id)
            .await?
            .filter(|job| job.category == self.category))
    }

    pub async fn count(&self, state: JobState) -> Result<u64, QueueError> {
        self.store.count(self.category, state).await
    }

    /// Delete finished jobs in `state` that fall outside this queue's retention.
    pub async fn prune(&self, state: JobState, now: DateTime<Utc>) -> Result<u64, QueueError> {
        match self.options.retention(state) {
            Some(policy) => self.store.prune(self.category, state, policy, now).await,
            None => Ok(0),
        }
    }

    /// Stop accepting jobs and handing them out, then wait for in-flight enqueues and every
    /// claimed job to be reported back. Calling it again only waits.
    pub async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(category = %self.category, "closing queue");
        }
        self.ready.notify_waiters();

        let timeout = self.options.close_timeout;
        let drained = tokio::time::timeout(timeout, async {
            drop(self.gate.write().await);

            loop {
                let idle = self.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();

                if self.active() == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!(category = %self.category, "queue closed");
                Ok(())
            }
            Err(_) => Err(QueueError::DrainTimeout {
                queue: self.category,
                timeout,
                active: self.active(),
            }),
        }
    }

    fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.idle.notify_waiters();
        }
        self.report_active();
    }

    fn report_active(&self) {
        metrics::gauge!(QUEUE_ACTIVE_JOBS, "category" => self.category.as_str())
            .set(self.active() as f64);
    }
}

fn held_lock(job: &Job) -> Result<Uuid, QueueError> {
    job.lock_id.ok_or_else(|| {
        JobError::InvalidLock {
            id: job.id,
            lock_id: None,
        }
        .into()
    })
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("category", &self.category)
            .field("closed", &self.is_closed())
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}
