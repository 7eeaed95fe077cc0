use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use dispatch_core::{JobCategory, PoolConfig, QueueOptions, RetryPolicy, StoreTarget};
use envconfig::Envconfig;

use crate::limiter::RateLimit;
use crate::system::SystemSettings;
use crate::worker::WorkerOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    /// Unset, malformed or unsupported values fall back to the local postgres default.
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub close_timeout: EnvMsDuration,

    #[envconfig(default = "3600")]
    pub cleanup_interval_secs: u64,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "email,export,analytics,ai,notification")]
    pub enabled_workers: CategoryList,

    #[envconfig(default = "3")]
    pub max_attempts: u32,

    #[envconfig(default = "5")]
    pub email_concurrency: u32,

    #[envconfig(default = "3")]
    pub analytics_concurrency: u32,

    #[envconfig(default = "2")]
    pub ai_concurrency: u32,

    #[envconfig(default = "2")]
    pub export_concurrency: u32,

    #[envconfig(default = "5")]
    pub notification_concurrency: u32,

    #[envconfig(default = "100/60000")]
    pub email_rate_limit: EnvRateLimit,

    #[envconfig(default = "")]
    pub analytics_rate_limit: EnvRateLimit,

    #[envconfig(default = "10/60000")]
    pub ai_rate_limit: EnvRateLimit,

    #[envconfig(default = "")]
    pub export_rate_limit: EnvRateLimit,

    #[envconfig(default = "")]
    pub notification_rate_limit: EnvRateLimit,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_target(&self) -> StoreTarget {
        StoreTarget::from_url(self.database_url.as_deref())
    }

    /// Pool settings. The url is filled in from `store_target`.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: Some(self.max_pg_connections),
            ..PoolConfig::new(String::new())
        }
    }

    pub fn cleanup_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    fn concurrency(&self, category: JobCategory) -> u32 {
        match category {
            JobCategory::Email => self.email_concurrency,
            JobCategory::Analytics => self.analytics_concurrency,
            JobCategory::Ai => self.ai_concurrency,
            JobCategory::Export => self.export_concurrency,
            JobCategory::Notification => self.notification_concurrency,
        }
    }

    fn rate_limit(&self, category: JobCategory) -> Option<RateLimit> {
        match category {
            JobCategory::Email => self.email_rate_limit.0,
            JobCategory::Analytics => self.analytics_rate_limit.0,
            JobCategory::Ai => self.ai_rate_limit.0,
            JobCategory::Export => self.export_rate_limit.0,
            JobCategory::Notification => self.notification_rate_limit.0,
        }
    }

    pub fn settings(&self) -> SystemSettings {
        let retry_policy = self.retry_policy.provide();

        let queue_options: HashMap<_, _> = JobCategory::ALL
            .into_iter()
            .map(|category| {
                let options = QueueOptions {
                    max_attempts: self.max_attempts.max(1),
                    retry_policy: retry_policy.clone(),
                    close_timeout: self.close_timeout.0,
                    ..QueueOptions::for_category(category)
                };
                (category, options)
            })
            .collect();

        let worker_options: HashMap<_, _> = JobCategory::ALL
            .into_iter()
            .map(|category| {
                let options = WorkerOptions {
                    concurrency: self.concurrency(category).max(1),
                    rate_limit: self.rate_limit(category),
                    poll_interval: self.poll_interval.0,
                };
                (category, options)
            })
            .collect();

        SystemSettings {
            queue_options,
            worker_options,
            enabled_workers: self.enabled_workers.0.clone(),
            liveness_deadline: self.liveness_deadline.0,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "600000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated categories, e.g. `email,ai`. Empty means none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryList(pub Vec<JobCategory>);

impl FromStr for CategoryList {
    type Err = dispatch_core::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut categories = Vec::new();
        for category in s.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let category = category.parse::<JobCategory>()?;
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        Ok(CategoryList(categories))
    }
}

/// `max_starts/window_ms`, e.g. `100/60000`. Empty means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvRateLimit(pub Option<RateLimit>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvRateLimitError;

impl FromStr for EnvRateLimit {
    type Err = ParseEnvRateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(EnvRateLimit(None));
        }

        let (max_starts, window_ms) = s.split_once('/').ok_or(ParseEnvRateLimitError)?;
        let max_starts = max_starts
            .trim()
            .parse::<u32>()
            .map_err(|_| ParseEnvRateLimitError)?;
        let window_ms = window_ms
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseEnvRateLimitError)?;

        RateLimit::new(max_starts, time::Duration::from_millis(window_ms))
            .map(|limit| EnvRateLimit(Some(limit)))
            .ok_or(ParseEnvRateLimitError)
    }
}
