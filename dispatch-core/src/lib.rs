// Data model, queues and backing stores for background job dispatch. Nothing in this crate
// executes jobs: workers live in dispatch-worker.

// Types
mod types;
pub use types::ClaimedJob;
pub use types::Job;
pub use types::JobCategory;
pub use types::JobId;
pub use types::JobState;
pub use types::NewJob;

// Per-category payload and result contracts
pub mod registry;
pub use registry::JobKind;
pub use registry::JobPayload;
pub use registry::JobResult;

// Errors
mod error;
// Errors about a single job - unknown ids, lost locks
pub use error::JobError;
// Errors about the queue itself - closure, bad input, postgres/network errors
pub use error::{DatabaseError, ParseError, QueueClosedError, QueueError};

// Policies
pub mod retention;
pub mod retry;
pub use retention::RetentionPolicy;
pub use retry::RetryPolicy;

// Backing stores
mod store;
pub use store::JobStore;
mod memory;
pub use memory::MemoryStore;
mod pg;
pub use pg::PgStore;

// Queue
mod queue;
pub use queue::{EnqueueOptions, FailureDisposition, Queue, QueueOptions};

// Janitor
mod janitor;
pub use janitor::{CleanupResult, Janitor};

// Config
mod config;
pub use config::{PoolConfig, StoreTarget, DEFAULT_DATABASE_URL};

pub mod metrics_consts;
