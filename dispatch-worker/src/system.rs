//! # JobSystem
//!
//! Process-wide entry point: one queue per category, the workers draining them, the janitor
//! applying retention, and the shutdown sequence tying them together.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dispatch_core::metrics_consts::JANITOR_ERRORS;
use dispatch_core::{
    EnqueueOptions, Janitor, JobCategory, JobId, JobPayload, JobStore, MemoryStore, PgStore,
    PoolConfig, Queue, QueueError, QueueOptions, StoreTarget,
};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::events::{EventListeners, JobEvent};
use crate::handler::{BoxedHandler, HandlerSet};
use crate::health::{ComponentStatus, HealthRegistry};
use crate::worker::{Worker, WorkerOptions};

/// Per-category policies and which categories get a worker.
#[derive(Debug, Clone)]
pub struct SystemSettings {
    pub queue_options: HashMap<JobCategory, QueueOptions>,
    pub worker_options: HashMap<JobCategory, WorkerOptions>,
    /// Categories a worker may be started for. The others are enqueue-only.
    pub enabled_workers: Vec<JobCategory>,
    /// How long a worker may go without reporting before liveness fails.
    pub liveness_deadline: Duration,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            queue_options: JobCategory::ALL
                .into_iter()
                .map(|category| (category, QueueOptions::for_category(category)))
                .collect(),
            worker_options: JobCategory::ALL
                .into_iter()
                .map(|category| (category, WorkerOptions::for_category(category)))
                .collect(),
            enabled_workers: JobCategory::ALL.to_vec(),
            liveness_deadline: Duration::from_secs(30),
        }
    }
}

impl SystemSettings {
    pub fn queue_options(&self, category: JobCategory) -> QueueOptions {
        self.queue_options
            .get(&category)
            .cloned()
            .unwrap_or_else(|| QueueOptions::for_category(category))
    }

    pub fn worker_options(&self, category: JobCategory) -> WorkerOptions {
        self.worker_options
            .get(&category)
            .copied()
            .unwrap_or_else(|| WorkerOptions::for_category(category))
    }

    pub fn worker_enabled(&self, category: JobCategory) -> bool {
        self.enabled_workers.contains(&category)
    }
}

struct RunningWorker {
    category: JobCategory,
    handle: JoinHandle<Result<(), WorkerError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct JobSystem {
    // Indexed by JobCategory::index
    queues: Vec<Arc<Queue>>,
    settings: SystemSettings,
    listeners: Mutex<EventListeners>,
    workers: Mutex<Vec<RunningWorker>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    stop_workers: CancellationToken,
    stop_janitor: CancellationToken,
    liveness: HealthRegistry,
}

impl JobSystem {
    pub fn new(store: Arc<dyn JobStore>, settings: SystemSettings) -> Self {
        let queues = JobCategory::ALL
            .into_iter()
            .map(|category| {
                Arc::new(Queue::new(
                    category,
                    settings.queue_options(category),
                    store.clone(),
                ))
            })
            .collect();

        Self {
            queues,
            settings,
            listeners: Mutex::new(EventListeners::logging()),
            workers: Mutex::new(Vec::new()),
            janitor: Mutex::new(None),
            stop_workers: CancellationToken::new(),
            stop_janitor: CancellationToken::new(),
            liveness: HealthRegistry::new("liveness"),
        }
    }

    /// Build a system on the store `target` selects. Postgres targets reuse `pool` for every
    /// setting but the url, and are migrated before use.
    pub async fn connect(
        target: StoreTarget,
        pool: PoolConfig,
        settings: SystemSettings,
    ) -> Result<Self, QueueError> {
        let store: Arc<dyn JobStore> = match target {
            StoreTarget::Postgres(db_url) => {
                let store = PgStore::new(&PoolConfig { db_url, ..pool }).await?;
                store.run_migrations().await?;
                info!("connected to postgres job store");
                Arc::new(store)
            }
            StoreTarget::Memory => {
                warn!("using in-memory job store, jobs will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::new(store, settings))
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn queue(&self, category: JobCategory) -> &Arc<Queue> {
        &self.queues[category.index()]
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    /// Enqueue a payload on the queue of its category.
    pub async fn enqueue(
        &self,
        payload: impl Into<JobPayload>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let payload = payload.into();
        self.queue(payload.category())
            .enqueue_with(payload, options)
            .await
    }

    /// Listen for completed jobs on every worker started after this call.
    pub fn on_completed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        lock(&self.listeners).on_completed(listener);
    }

    /// Listen for permanently failed jobs on every worker started after this call.
    pub fn on_failed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        lock(&self.listeners).on_failed(listener);
    }

    /// Start a worker draining the queue of `category` with `handler`.
    pub fn start_worker(
        &self,
        category: JobCategory,
        handler: BoxedHandler,
        options: WorkerOptions,
    ) -> Result<(), WorkerError> {
        let worker = Worker::new(self.queue(category).clone(), handler, options)?;
        let liveness = self
            .liveness
            .register(format!("worker-{category}"), self.settings.liveness_deadline);
        let worker = worker
            .with_listeners(lock(&self.listeners).clone())
            .with_liveness(liveness)
            .with_shutdown(self.stop_workers.child_token());

        let handle = tokio::spawn(async move { worker.run().await });
        lock(&self.workers).push(RunningWorker { category, handle });
        Ok(())
    }

    /// Start a worker for every enabled category with a handler in `handlers`.
    /// Returns the categories that got one.
    pub fn start_all_workers(
        &self,
        handlers: &HandlerSet,
    ) -> Result<Vec<JobCategory>, WorkerError> {
        let mut started = Vec::new();

        for category in JobCategory::ALL {
            match handlers.get(category) {
                Some(handler) if self.settings.worker_enabled(category) => {
                    self.start_worker(
                        category,
                        handler.clone(),
                        self.settings.worker_options(category),
                    )?;
                    started.push(category);
                }
                Some(_) => info!(%category, "worker disabled, queue is enqueue-only"),
                None => info!(%category, "no handler registered, queue is enqueue-only"),
            }
        }

        info!(workers = ?started, "workers started");
        Ok(started)
    }

    /// Periodically delete finished jobs that fall outside their queue's retention.
    pub fn start_janitor(&self, interval: Duration) {
        // tokio intervals reject a zero period
        let interval = interval.max(Duration::from_millis(1));
        let janitor = Janitor::new(self.queues.clone());
        let stop = self.stop_janitor.clone();
        let liveness = self
            .liveness
            .register("janitor".to_owned(), interval + self.settings.liveness_deadline);

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                match janitor.run_once().await {
                    Ok(_) => liveness.report_healthy(),
                    Err(error) => {
                        metrics::counter!(JANITOR_ERRORS).increment(1);
                        error!(%error, "janitor run failed");
                        liveness.report_status(ComponentStatus::Unhealthy);
                    }
                }
            }

            liveness.deregister();
        });

        if let Some(previous) = lock(&self.janitor).replace(handle) {
            previous.abort();
        }
    }

    /// Close every queue concurrently and wait until all of them are quiesced.
    pub async fn close_all_queues(&self) -> Result<(), QueueError> {
        let results = join_all(self.queues.iter().map(|queue| queue.close())).await;

        let mut first_error = None;
        for error in results.into_iter().filter_map(Result::err) {
            error!(%error, "queue did not close cleanly");
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stop every worker and wait for the jobs they started. Jobs outliving their queue's
    /// close timeout are aborted.
    pub async fn stop_workers(&self) -> Result<(), WorkerError> {
        self.stop_workers.cancel();
        let workers = std::mem::take(&mut *lock(&self.workers));

        let (categories, handles): (Vec<_>, Vec<_>) = workers
            .into_iter()
            .map(|worker| (worker.category, worker.handle))
            .unzip();

        let mut first_error = None;
        for (category, joined) in categories.into_iter().zip(join_all(handles).await) {
            let result = match joined {
                Ok(result) => result,
                Err(error) => Err(WorkerError::Join { category, error }),
            };
            if let Err(error) = result {
                error!(%category, %error, "worker failed");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: refuse new jobs, let claimed ones finish, then stop the workers and
    /// the janitor. Bounded by twice the longest close timeout.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!("shutting down job system");
        let closed = self.close_all_queues().await;
        let stopped = self.stop_workers().await;

        self.stop_janitor.cancel();
        let janitor = lock(&self.janitor).take();
        if let Some(janitor) = janitor {
            if let Err(error) = janitor.await {
                warn!(%error, "janitor task did not finish cleanly");
            }
        }

        closed?;
        stopped?;
        info!("job system shut down");
        Ok(())
    }

    /// Health of the workers and the janitor, for a liveness probe.
    pub fn liveness(&self) -> &HealthRegistry {
        &self.liveness
    }
}
