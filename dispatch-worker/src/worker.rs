use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dispatch_core::metrics_consts::*;
use dispatch_core::{ClaimedJob, FailureDisposition, JobCategory, Queue, QueueError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::events::{EventListeners, JobEvent};
use crate::handler::{BoxedHandler, HandlerError};
use crate::health::{ComponentStatus, HealthHandle};
use crate::limiter::{RateLimit, StartLimiter};

/// How a worker drains its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Maximum number of jobs running at once.
    pub concurrency: u32,
    /// Maximum number of job starts per sliding window.
    pub rate_limit: Option<RateLimit>,
    /// Upper bound on how long an idle worker waits before looking for work again.
    pub poll_interval: Duration,
}

impl WorkerOptions {
    pub fn for_category(category: JobCategory) -> Self {
        let (concurrency, rate_limit) = match category {
            JobCategory::Email => (5, RateLimit::per_minute(100)),
            JobCategory::Analytics => (3, None),
            JobCategory::Ai => (2, RateLimit::per_minute(10)),
            JobCategory::Export => (2, None),
            JobCategory::Notification => (5, None),
        };

        Self {
            concurrency,
            rate_limit,
            poll_interval: Duration::from_millis(100),
        }
    }
}

// First store error seen by any of the worker's tasks
type Failure = Arc<Mutex<Option<QueueError>>>;

/// A worker bound to one queue and one handler.
pub struct Worker {
    queue: Arc<Queue>,
    handler: BoxedHandler,
    options: WorkerOptions,
    limiter: Option<StartLimiter>,
    listeners: EventListeners,
    liveness: Option<HealthHandle>,
    shutdown: CancellationToken,
    failure: Failure,
}

impl Worker {
    pub fn new(
        queue: Arc<Queue>,
        handler: BoxedHandler,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        if handler.category() != queue.category() {
            return Err(WorkerError::CategoryMismatch {
                queue: queue.category(),
                handler: handler.category(),
            });
        }

        Ok(Self {
            queue,
            handler,
            limiter: options.rate_limit.map(StartLimiter::new),
            options,
            listeners: EventListeners::new(),
            liveness: None,
            shutdown: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_listeners(mut self, listeners: EventListeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Report to a health registry from the worker loop, and every half deadline while the
    /// worker waits on its rate limit or its running jobs.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Stop when `shutdown` is cancelled, in addition to `stop`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn category(&self) -> JobCategory {
        self.queue.category()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// A token that stops this worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming jobs. `run` returns once the jobs already started have finished or been
    /// aborted.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run this worker until it is stopped or its queue closes, then wait for every job it
    /// started. Handler failures never stop the worker; a failing store does.
    ///
    /// Jobs still running one close timeout after the worker stopped are aborted and recorded
    /// as failed attempts, and `run` returns `WorkerError::DrainTimeout`.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let category = self.category();
        let concurrency = self.options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency as usize));
        // Cancelled by a stop request, or internally by a store error
        let halt = self.shutdown.child_token();
        // Cancelled once running jobs outlive the drain
        let abort = CancellationToken::new();

        let report_semaphore_utilization = || {
            metrics::gauge!(WORKER_SATURATION, "category" => category.as_str()).set(
                1f64 - semaphore.available_permits() as f64 / f64::from(concurrency),
            );
        };

        info!(
            %category,
            concurrency,
            rate_limit = ?self.options.rate_limit,
            "starting worker"
        );

        loop {
            report_semaphore_utilization();
            self.report_healthy();

            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                permit = self.heartbeat(semaphore.clone().acquire_owned()) => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.next_job(&halt).await {
                Ok(Some(job)) => self.spawn_job(job, permit, halt.clone(), abort.clone()),
                Ok(None) => break,
                Err(error) => {
                    record_failure(&self.failure, &halt, self.liveness.as_ref(), error);
                    break;
                }
            }
        }

        debug!(%category, "worker waiting for running jobs");
        let timeout = self.queue.options().close_timeout;
        let mut abandoned = None;
        if !self.drain(&semaphore, concurrency, timeout).await {
            let active = concurrency as usize - semaphore.available_permits();
            warn!(%category, active, ?timeout, "aborting jobs still running after drain timeout");
            abort.cancel();
            if !self.drain(&semaphore, concurrency, timeout).await {
                warn!(%category, "aborted jobs did not report back");
            }
            abandoned = Some(active);
        }
        report_semaphore_utilization();

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(error) = failure {
            error!(%category, %error, "worker stopped after a store failure");
            return Err(WorkerError::Queue(error));
        }

        if let Some(active) = abandoned {
            if let Some(liveness) = &self.liveness {
                liveness.report_status(ComponentStatus::Unhealthy);
            }
            error!(%category, active, "worker stopped with jobs still running");
            return Err(WorkerError::DrainTimeout {
                category,
                timeout,
                active,
            });
        }

        if let Some(liveness) = &self.liveness {
            liveness.deregister();
        }
        info!(%category, "worker stopped");
        Ok(())
    }

    /// Wait up to `timeout` for every permit to come back. Returns whether they all did.
    async fn drain(&self, semaphore: &Semaphore, concurrency: u32, timeout: Duration) -> bool {
        let drained = self.heartbeat(semaphore.acquire_many(concurrency));
        match tokio::time::timeout(timeout, drained).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => {
                warn!(category = %self.category(), "worker semaphore closed before jobs finished");
                true
            }
            Err(_) => false,
        }
    }

    /// Await `future`, reporting healthy every half liveness deadline until it resolves.
    async fn heartbeat<F: Future>(&self, future: F) -> F::Output {
        let Some(liveness) = &self.liveness else {
            return future.await;
        };
        tokio::pin!(future);

        // tokio intervals reject a zero period
        let period = (liveness.deadline() / 2).max(Duration::from_millis(1));
        let mut beats = tokio::time::interval(period);
        beats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut future => return output,
                _ = beats.tick() => self.report_healthy(),
            }
        }
    }

    /// Wait for the next job this worker may start. `None` means stop.
    async fn next_job(&self, halt: &CancellationToken) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            if halt.is_cancelled() || self.queue.is_closed() {
                return Ok(None);
            }

            if let Some(limiter) = &self.limiter {
                let wait = limiter.wait_time();
                if !wait.is_zero() {
                    metrics::counter!(WORKER_RATE_LIMITED, "category" => self.category().as_str())
                        .increment(1);
                    debug!(category = %self.category(), ?wait, "rate limited");
                    tokio::select! {
                        _ = halt.cancelled() => return Ok(None),
                        _ = self.heartbeat(limiter.until_ready()) => {},
                    }
                    continue;
                }
            }

            // Registered before claiming, so an enqueue racing with an empty claim still wakes us
            let notified = self.queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.queue.claim().await? {
                if let Some(limiter) = &self.limiter {
                    limiter.record_start();
                }
                return Ok(Some(job));
            }
            if self.queue.is_closed() {
                return Ok(None);
            }

            let wait = match self.queue.next_ready_in().await? {
                Some(ready_in) if !ready_in.is_zero() => ready_in.min(self.options.poll_interval),
                _ => self.options.poll_interval,
            };
            self.report_healthy();

            tokio::select! {
                _ = halt.cancelled() => return Ok(None),
                _ = &mut notified => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    /// Run `job` on its own task, holding `permit` until the outcome is recorded.
    fn spawn_job(
        &self,
        job: ClaimedJob,
        permit: OwnedSemaphorePermit,
        halt: CancellationToken,
        abort: CancellationToken,
    ) {
        let failure = self.failure.clone();
        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let listeners = self.listeners.clone();
        let liveness = self.liveness.clone();
        let category = queue.category();
        let id = job.job().id;
        let attempt = job.job().attempt;

        metrics::counter!(JOBS_STARTED, "category" => category.as_str()).increment(1);
        debug!(job_id = %id, %category, attempt, "starting job");

        tokio::spawn(async move {
            let started = Instant::now();
            let payload = job.job().payload.clone();

            // The handler runs on a task of its own, so a panic is caught here as a JoinError
            let mut task = tokio::spawn(async move { handler.handle(payload).await });
            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = abort.cancelled() => {
                    warn!(job_id = %id, %category, "aborting job");
                    task.abort();
                    task.await
                }
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => Err(HandlerError::new(if join_error.is_panic() {
                    format!("handler panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "job aborted before it finished".to_owned()
                })),
            };

            metrics::histogram!(JOB_DURATION, "category" => category.as_str())
                .record(started.elapsed().as_secs_f64());

            let reported = match outcome {
                Ok(result) => queue
                    .complete(job, result)
                    .await
                    .map(|_| Some(JobEvent::Completed { id, category })),
                Err(handler_error) => {
                    debug!(
                        job_id = %id,
                        %category,
                        attempt,
                        error = %handler_error,
                        "job attempt failed"
                    );
                    queue
                        .fail(job, &handler_error.message)
                        .await
                        .map(|disposition| match disposition {
                            FailureDisposition::Retry { .. } => None,
                            FailureDisposition::Failed => Some(JobEvent::Failed {
                                id,
                                category,
                                error: handler_error.message,
                            }),
                        })
                }
            };

            match reported {
                Ok(Some(event)) => listeners.emit(&event),
                Ok(None) => {}
                Err(error) => {
                    error!(job_id = %id, %category, %error, "failed to record job outcome");
                    record_failure(&failure, &halt, liveness.as_ref(), error);
                }
            }

            drop(permit);
        });
    }

    // A store failure already reported the worker unhealthy, and that must stick
    fn report_healthy(&self) {
        let failed = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if let Some(liveness) = self.liveness.as_ref().filter(|_| !failed) {
            liveness.report_healthy();
        }
    }
}

fn record_failure(
    failure: &Failure,
    halt: &CancellationToken,
    liveness: Option<&HealthHandle>,
    error: QueueError,
) {
    metrics::counter!(WORKER_STORE_ERRORS).increment(1);
    if let Some(liveness) = liveness {
        liveness.report_status(ComponentStatus::Unhealthy);
    }

    let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(error);
    }
    halt.cancel();
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic payload".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let email = WorkerOptions::for_category(JobCategory::Email);
        assert_eq!(email.concurrency, 5);
        assert_eq!(email.rate_limit, RateLimit::new(100, Duration::from_millis(60_000)));
        assert_eq!(email.poll_interval, Duration::from_millis(100));

        let ai = WorkerOptions::for_category(JobCategory::Ai);
        assert_eq!(ai.concurrency, 2);
        assert_eq!(ai.rate_limit, RateLimit::new(10, Duration::from_millis(60_000)));

        assert_eq!(WorkerOptions::for_category(JobCategory::Analytics).concurrency, 3);
        assert_eq!(WorkerOptions::for_category(JobCategory::Export).concurrency, 2);
        assert_eq!(WorkerOptions::for_category(JobCategory::Notification).concurrency, 5);
        assert_eq!(WorkerOptions::for_category(JobCategory::Export).rate_limit, None);
    }

    #[test]
    fn test_panic_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic payload");
    }
}
