use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::registry::{AiJob, AiOutput, AiResult, AiTask, EmailJob, EmailKind, EmailResult};
use dispatch_core::{
    DatabaseError, EnqueueOptions, Job, JobCategory, JobId, JobResult, JobState, JobStore,
    MemoryStore, NewJob, Queue, QueueError, QueueOptions, RetentionPolicy,
};
use dispatch_worker::error::WorkerError;
use dispatch_worker::events::{EventListeners, JobEvent};
use dispatch_worker::handler::{handler_fn, BoxedHandler, HandlerError};
use dispatch_worker::health::HealthRegistry;
use dispatch_worker::limiter::RateLimit;
use dispatch_worker::worker::{Worker, WorkerOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn queue(category: JobCategory) -> Arc<Queue> {
    Arc::new(Queue::new(
        category,
        QueueOptions::for_category(category),
        Arc::new(MemoryStore::new()),
    ))
}

fn options(concurrency: u32, rate_limit: Option<RateLimit>) -> WorkerOptions {
    WorkerOptions {
        concurrency,
        rate_limit,
        poll_interval: Duration::from_millis(100),
    }
}

fn welcome(to: &str) -> EmailJob {
    EmailJob {
        kind: EmailKind::Welcome,
        to: to.to_owned(),
        subject: "Hi".to_owned(),
        template: "t1".to_owned(),
        variables: HashMap::new(),
        attachments: None,
    }
}

fn summary() -> AiJob {
    AiJob {
        task: AiTask::GenerateSummary,
        survey_id: Some("s1".to_owned()),
        response_id: None,
        input: Some("great product".to_owned()),
        options: None,
    }
}

/// Listeners forwarding every terminal event to the returned channel.
fn forward_events() -> (EventListeners, mpsc::UnboundedReceiver<JobEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut listeners = EventListeners::new();
    {
        let tx = tx.clone();
        listeners.on_completed(move |event| drop(tx.send(event.clone())));
    }
    listeners.on_failed(move |event| drop(tx.send(event.clone())));
    (listeners, rx)
}

fn spawn(worker: Worker) -> (JoinHandle<Result<(), WorkerError>>, CancellationToken) {
    let stop = worker.shutdown_token();
    (tokio::spawn(async move { worker.run().await }), stop)
}

async fn next_events(rx: &mut mpsc::UnboundedReceiver<JobEvent>, count: usize) -> Vec<JobEvent> {
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        events.push(rx.recv().await.expect("event channel closed"));
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_welcome_email_completes_with_one_invocation() {
    let queue = queue(JobCategory::Email);
    let invocations = Arc::new(AtomicUsize::new(0));

    let handler = {
        let invocations = invocations.clone();
        BoxedHandler::new(handler_fn(move |job: EmailJob| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                assert_eq!(job.to, "a@b.com");
                Ok::<_, HandlerError>(EmailResult::sent("m-42"))
            }
        }))
    };

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(1, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    let id = queue.enqueue(welcome("a@b.com")).await.unwrap();
    assert_eq!(
        next_events(&mut events, 1).await,
        vec![JobEvent::Completed {
            id,
            category: JobCategory::Email
        }]
    );

    let job = queue.job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 1);
    match job.result {
        Some(JobResult::Email(EmailResult {
            success: true,
            message_id: Some(message_id),
            ..
        })) => assert!(!message_id.is_empty()),
        other => panic!("unexpected result {other:?}"),
    }

    stop.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ai_job_succeeds_after_two_retries_with_growing_delays() {
    let queue = queue(JobCategory::Ai);
    let starts = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let starts = starts.clone();
        BoxedHandler::new(handler_fn(move |job: AiJob| {
            let starts = starts.clone();
            async move {
                let attempt = {
                    let mut starts = starts.lock().unwrap();
                    starts.push(Instant::now());
                    starts.len()
                };
                if attempt < 3 {
                    return Err(HandlerError::new(format!("model overloaded ({attempt})")));
                }
                Ok(AiResult {
                    success: true,
                    result: job.input.map(AiOutput::Text),
                    tokens: None,
                    error: None,
                })
            }
        }))
    };

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(2, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    let id = queue
        .enqueue_with(summary(), EnqueueOptions::new().max_attempts(3))
        .await
        .unwrap();
    assert_eq!(
        next_events(&mut events, 1).await,
        vec![JobEvent::Completed {
            id,
            category: JobCategory::Ai
        }]
    );

    let job = queue.job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 3);
    assert_eq!(
        job.result,
        Some(JobResult::Ai(AiResult {
            success: true,
            result: Some(AiOutput::Text("great product".to_owned())),
            tokens: None,
            error: None,
        }))
    );

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    let first_delay = starts[1] - starts[0];
    let second_delay = starts[2] - starts[1];
    assert!(first_delay >= Duration::from_secs(1), "{first_delay:?}");
    assert!(second_delay >= Duration::from_secs(2), "{second_delay:?}");
    assert!(second_delay > first_delay);

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_runs_max_attempts_times() {
    let queue = queue(JobCategory::Email);
    let invocations = Arc::new(AtomicUsize::new(0));

    let handler = {
        let invocations = invocations.clone();
        BoxedHandler::new(handler_fn(move |_: EmailJob| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<EmailResult, _>(HandlerError::new("smtp unavailable"))
            }
        }))
    };

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(1, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    let id = queue.enqueue(welcome("a@b.com")).await.unwrap();
    assert_eq!(
        next_events(&mut events, 1).await,
        vec![JobEvent::Failed {
            id,
            category: JobCategory::Email,
            error: "smtp unavailable".to_owned(),
        }]
    );

    // Long past any further backoff, nothing else runs
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let job = queue.job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 3);
    assert_eq!(job.last_error.as_deref(), Some("smtp unavailable"));

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_holds_across_five_jobs() {
    let queue = queue(JobCategory::Email);
    let running_now = Arc::new(AtomicUsize::new(0));
    let most_running = Arc::new(AtomicUsize::new(0));

    let handler = {
        let running_now = running_now.clone();
        let most_running = most_running.clone();
        BoxedHandler::new(handler_fn(move |_: EmailJob| {
            let running_now = running_now.clone();
            let most_running = most_running.clone();
            async move {
                let current = running_now.fetch_add(1, Ordering::SeqCst) + 1;
                most_running.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                running_now.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(EmailResult::sent("m"))
            }
        }))
    };

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.enqueue(welcome(&format!("user{i}@b.com"))).await.unwrap());
    }

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(2, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    let mut finished: Vec<JobId> = next_events(&mut events, 5)
        .await
        .iter()
        .map(JobEvent::id)
        .collect();
    finished.sort();
    ids.sort();
    assert_eq!(finished, ids);
    assert_eq!(most_running.load(Ordering::SeqCst), 2);
    assert_eq!(queue.count(JobState::Completed).await.unwrap(), 5);

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_job_runs_first() {
    let low = ("b@b.com", 3);
    let high = ("a@b.com", 1);

    for enqueued in [[low, high], [high, low]] {
        let queue = queue(JobCategory::Email);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let order = order.clone();
            BoxedHandler::new(handler_fn(move |job: EmailJob| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(job.to);
                    Ok::<_, HandlerError>(EmailResult::sent("m"))
                }
            }))
        };

        for (to, priority) in enqueued {
            queue
                .enqueue_with(welcome(to), EnqueueOptions::new().priority(priority))
                .await
                .unwrap();
        }

        let (listeners, mut events) = forward_events();
        let worker = Worker::new(queue.clone(), handler, options(1, None))
            .unwrap()
            .with_listeners(listeners);
        let (running, stop) = spawn(worker);

        next_events(&mut events, 2).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["a@b.com", "b@b.com"],
            "enqueued as {enqueued:?}"
        );

        stop.cancel();
        running.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_caps_starts_per_window() {
    let queue = queue(JobCategory::Email);
    let starts = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let starts = starts.clone();
        BoxedHandler::new(handler_fn(move |_: EmailJob| {
            let starts = starts.clone();
            async move {
                starts.lock().unwrap().push(Instant::now());
                Ok::<_, HandlerError>(EmailResult::sent("m"))
            }
        }))
    };

    for i in 0..7 {
        queue.enqueue(welcome(&format!("user{i}@b.com"))).await.unwrap();
    }

    let limit = RateLimit::new(3, Duration::from_millis(1000));
    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(5, limit))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    next_events(&mut events, 7).await;
    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 7);
    for window in starts.windows(4) {
        assert!(
            window[3] - window[0] >= Duration::from_millis(1000),
            "four starts within one window: {window:?}"
        );
    }

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_fails_the_job_and_worker_keeps_going() {
    let queue = queue(JobCategory::Email);

    let handler = BoxedHandler::new(handler_fn(|job: EmailJob| async move {
        if job.to == "boom@b.com" {
            panic!("template missing");
        }
        Ok::<_, HandlerError>(EmailResult::sent("m"))
    }));

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(1, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, stop) = spawn(worker);

    let broken = queue
        .enqueue_with(welcome("boom@b.com"), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();
    let fine = queue.enqueue(welcome("a@b.com")).await.unwrap();

    let events = next_events(&mut events, 2).await;
    assert!(events.contains(&JobEvent::Failed {
        id: broken,
        category: JobCategory::Email,
        error: "handler panicked: template missing".to_owned(),
    }));
    assert!(events.contains(&JobEvent::Completed {
        id: fine,
        category: JobCategory::Email,
    }));

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_worker_stops_when_queue_closes() {
    let queue = queue(JobCategory::Email);
    let handler = BoxedHandler::new(handler_fn(|_: EmailJob| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, HandlerError>(EmailResult::sent("m"))
    }));

    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(1, None))
        .unwrap()
        .with_listeners(listeners);
    let (running, _stop) = spawn(worker);

    let in_flight = queue.enqueue(welcome("a@b.com")).await.unwrap();
    while queue.active() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Close waits for the claimed job, and the worker exits on its own
    queue.close().await.unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(
        next_events(&mut events, 1).await,
        vec![JobEvent::Completed {
            id: in_flight,
            category: JobCategory::Email
        }]
    );
}

#[tokio::test]
async fn test_mismatched_handler_is_rejected() {
    let handler = BoxedHandler::new(handler_fn(|_: AiJob| async move {
        Err::<AiResult, _>(HandlerError::new("unreachable"))
    }));

    assert!(matches!(
        Worker::new(queue(JobCategory::Email), handler, options(1, None)),
        Err(WorkerError::CategoryMismatch {
            queue: JobCategory::Email,
            handler: JobCategory::Ai
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_worker_stays_live() {
    let queue = queue(JobCategory::Email);
    let handler = BoxedHandler::new(handler_fn(|_: EmailJob| async move {
        Ok::<_, HandlerError>(EmailResult::sent("m"))
    }));
    for i in 0..3 {
        queue.enqueue(welcome(&format!("user{i}@b.com"))).await.unwrap();
    }

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("worker-email".to_owned(), Duration::from_secs(30));
    let limit = RateLimit::new(1, Duration::from_secs(60));
    let worker = Worker::new(queue.clone(), handler, options(5, limit))
        .unwrap()
        .with_liveness(liveness);
    let (running, stop) = spawn(worker);

    // Past the liveness deadline, while the next start is still 15s away
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(queue.count(JobState::Completed).await.unwrap(), 1);
    let status = registry.get_status();
    assert!(status.healthy, "{status:?}");

    stop.cancel();
    running.await.unwrap().unwrap();
    assert!(registry.get_status().components.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_worker_busy_with_a_long_job_stays_live() {
    let queue = queue(JobCategory::Email);
    let handler = BoxedHandler::new(handler_fn(|_: EmailJob| async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok::<_, HandlerError>(EmailResult::sent("m"))
    }));

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("worker-email".to_owned(), Duration::from_secs(30));
    let (listeners, mut events) = forward_events();
    let worker = Worker::new(queue.clone(), handler, options(1, None))
        .unwrap()
        .with_listeners(listeners)
        .with_liveness(liveness);
    let (running, stop) = spawn(worker);

    let id = queue.enqueue(welcome("a@b.com")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(queue.active(), 1);
    let status = registry.get_status();
    assert!(status.healthy, "{status:?}");

    assert_eq!(
        next_events(&mut events, 1).await,
        vec![JobEvent::Completed {
            id,
            category: JobCategory::Email
        }]
    );
    assert!(registry.get_status().healthy);

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_worker_aborts_jobs_outliving_the_close_timeout() {
    let queue = Arc::new(Queue::new(
        JobCategory::Email,
        QueueOptions {
            close_timeout: Duration::from_secs(1),
            ..QueueOptions::for_category(JobCategory::Email)
        },
        Arc::new(MemoryStore::new()),
    ));
    let handler = BoxedHandler::new(handler_fn(|_: EmailJob| {
        std::future::pending::<Result<EmailResult, HandlerError>>()
    }));

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("worker-email".to_owned(), Duration::from_secs(30));
    let worker = Worker::new(queue.clone(), handler, options(2, None))
        .unwrap()
        .with_liveness(liveness);
    let (running, stop) = spawn(worker);

    let id = queue.enqueue(welcome("a@b.com")).await.unwrap();
    while queue.active() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stopped_at = Instant::now();
    stop.cancel();
    let error = running
        .await
        .unwrap()
        .expect_err("worker waited on a handler that never returns");

    assert!(stopped_at.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        error,
        WorkerError::DrainTimeout {
            category: JobCategory::Email,
            active: 1,
            ..
        }
    ));
    assert!(!registry.get_status().healthy);

    // The aborted attempt is recorded, so the job is retried by the next worker
    assert_eq!(queue.active(), 0);
    let job = queue.job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.last_error.as_deref(), Some("job aborted before it finished"));
}

/// A store whose database went away.
struct UnreachableStore;

fn unreachable() -> QueueError {
    QueueError::Database(DatabaseError::QueryError {
        command: "SELECT".to_owned(),
        error: sqlx::Error::PoolClosed,
    })
}

#[async_trait]
impl JobStore for UnreachableStore {
    async fn insert(&self, _: NewJob) -> Result<Job, QueueError> {
        Err(unreachable())
    }

    async fn claim(&self, _: JobCategory) -> Result<Option<Job>, QueueError> {
        Err(unreachable())
    }

    async fn complete(&self, _: JobId, _: Uuid, _: JobResult) -> Result<Job, QueueError> {
        Err(unreachable())
    }

    async fn retry(&self, _: JobId, _: Uuid, _: &str, _: Duration) -> Result<Job, QueueError> {
        Err(unreachable())
    }

    async fn fail(&self, _: JobId, _: Uuid, _: &str) -> Result<Job, QueueError> {
        Err(unreachable())
    }

    async fn get(&self, _: JobId) -> Result<Option<Job>, QueueError> {
        Err(unreachable())
    }

    async fn next_ready_in(&self, _: JobCategory) -> Result<Option<Duration>, QueueError> {
        Err(unreachable())
    }

    async fn prune(
        &self,
        _: JobCategory,
        _: JobState,
        _: &RetentionPolicy,
        _: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        Err(unreachable())
    }

    async fn count(&self, _: JobCategory, _: JobState) -> Result<u64, QueueError> {
        Err(unreachable())
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_stops_the_worker() {
    let queue = Arc::new(Queue::new(
        JobCategory::Email,
        QueueOptions::for_category(JobCategory::Email),
        Arc::new(UnreachableStore),
    ));
    let handler = BoxedHandler::new(handler_fn(|_: EmailJob| async move {
        Ok::<_, HandlerError>(EmailResult::sent("m"))
    }));

    let worker = Worker::new(queue, handler, options(2, None)).unwrap();
    let error = worker.run().await.expect_err("worker ignored a dead store");

    assert!(matches!(
        error,
        WorkerError::Queue(QueueError::Database(DatabaseError::QueryError { .. }))
    ));
}
