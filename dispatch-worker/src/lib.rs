pub mod app;
pub mod config;
pub mod dry_run;
pub mod error;
pub mod events;
pub mod handler;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod system;
pub mod worker;
