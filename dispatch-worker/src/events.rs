use std::fmt;
use std::sync::Arc;

use dispatch_core::{JobCategory, JobId};
use tracing::{info, warn};

/// Terminal outcomes a worker reports for the jobs it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Completed {
        id: JobId,
        category: JobCategory,
    },
    /// Only sent once no attempts remain. Retried failures are not events.
    Failed {
        id: JobId,
        category: JobCategory,
        error: String,
    },
}

impl JobEvent {
    pub fn id(&self) -> JobId {
        match self {
            JobEvent::Completed { id, .. } | JobEvent::Failed { id, .. } => *id,
        }
    }

    pub fn category(&self) -> JobCategory {
        match self {
            JobEvent::Completed { category, .. } | JobEvent::Failed { category, .. } => *category,
        }
    }
}

pub type Listener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Callbacks run on the worker task right after a job reaches a terminal state.
#[derive(Clone, Default)]
pub struct EventListeners {
    completed: Vec<Listener>,
    failed: Vec<Listener>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listeners that log every terminal outcome.
    pub fn logging() -> Self {
        let mut listeners = Self::new();
        listeners.on_completed(|event| {
            info!(job_id = %event.id(), category = %event.category(), "job completed");
        });
        listeners.on_failed(|event| {
            if let JobEvent::Failed {
                id,
                category,
                error,
            } = event
            {
                warn!(job_id = %id, %category, error = %error, "job failed");
            }
        });
        listeners
    }

    pub fn on_completed(&mut self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.completed.push(Arc::new(listener));
    }

    pub fn on_failed(&mut self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.failed.push(Arc::new(listener));
    }

    pub fn emit(&self, event: &JobEvent) {
        let listeners = match event {
            JobEvent::Completed { .. } => &self.completed,
            JobEvent::Failed { .. } => &self.failed,
        };
        for listener in listeners {
            listener(event);
        }
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("completed", &self.completed.len())
            .field("failed", &self.failed.len())
            .finish()
    }
}
