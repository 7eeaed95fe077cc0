use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::metrics_consts::*;
use crate::queue::Queue;
use crate::types::JobState;

// The janitor reports its own metrics, this is mostly for testing purposes
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CleanupResult {
    pub completed: u64,
    pub failed: u64,
}

/// Applies each queue's retention policies to its finished jobs.
pub struct Janitor {
    queues: Vec<Arc<Queue>>,
}

impl Janitor {
    pub fn new(queues: Vec<Arc<Queue>>) -> Self {
        Self { queues }
    }

    pub async fn run_once(&self) -> Result<CleanupResult, QueueError> {
        self.run_once_at(Utc::now()).await
    }

    /// Run a cleanup pass as if the current time were `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<CleanupResult, QueueError> {
        debug!("Running janitor loop");
        let start = Instant::now();
        metrics::counter!(JANITOR_RUNS).increment(1);

        let mut total = CleanupResult::default();
        for queue in &self.queues {
            let category = queue.category().as_str();

            let completed = queue.prune(JobState::Completed, now).await?;
            metrics::counter!(JANITOR_COMPLETED_DELETED, "category" => category)
                .increment(completed);

            let failed = queue.prune(JobState::Failed, now).await?;
            metrics::counter!(JANITOR_FAILED_DELETED, "category" => category).increment(failed);

            if completed > 0 || failed > 0 {
                info!(category, completed, failed, "deleted finished jobs");
            }

            total.completed += completed;
            total.failed += failed;
        }

        metrics::histogram!(JANITOR_DURATION).record(start.elapsed().as_secs_f64());
        debug!("Janitor loop complete");
        Ok(total)
    }
}
