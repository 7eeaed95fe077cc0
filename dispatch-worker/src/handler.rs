//! # Handlers
//!
//! The typed contract between a worker and the code that actually performs a job.
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_core::{JobCategory, JobKind, JobPayload, JobResult};
use thiserror::Error;

/// A handler failure. The message becomes the job's failure record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        // Alternate formatting keeps the whole context chain on one line
        Self::new(format!("{error:#}"))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Performs jobs of kind `K`.
#[async_trait]
pub trait JobHandler<K: JobKind>: Send + Sync + 'static {
    async fn handle(&self, payload: K) -> Result<K::Output, HandlerError>;
}

/// A `JobHandler` built from an async closure, see `handler_fn`.
pub struct FnHandler<K, F> {
    f: F,
    _kind: PhantomData<fn(K)>,
}

/// Wrap an async closure taking a payload and returning its result as a `JobHandler`.
pub fn handler_fn<K, F, Fut>(f: F) -> FnHandler<K, F>
where
    K: JobKind,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<K::Output, HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _kind: PhantomData,
    }
}

#[async_trait]
impl<K, F, Fut> JobHandler<K> for FnHandler<K, F>
where
    K: JobKind,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<K::Output, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: K) -> Result<K::Output, HandlerError> {
        (self.f)(payload).await
    }
}

/// Type-erased handler, so workers of every category share one implementation.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle(&self, payload: JobPayload) -> Result<JobResult, HandlerError>;
}

struct Typed<K, H> {
    handler: H,
    _kind: PhantomData<fn(K)>,
}

#[async_trait]
impl<K, H> ErasedHandler for Typed<K, H>
where
    K: JobKind,
    H: JobHandler<K>,
{
    async fn handle(&self, payload: JobPayload) -> Result<JobResult, HandlerError> {
        let payload = K::from_payload(payload).map_err(|other| {
            HandlerError::new(format!(
                "{} handler received a {} payload",
                K::CATEGORY,
                other.category()
            ))
        })?;
        let output = self.handler.handle(payload).await?;
        Ok(K::into_result(output))
    }
}

/// A handler bound to the category of its payload type.
#[derive(Clone)]
pub struct BoxedHandler {
    category: JobCategory,
    inner: Arc<dyn ErasedHandler>,
}

impl BoxedHandler {
    pub fn new<K, H>(handler: H) -> Self
    where
        K: JobKind,
        H: JobHandler<K>,
    {
        Self {
            category: K::CATEGORY,
            inner: Arc::new(Typed {
                handler,
                _kind: PhantomData::<fn(K)>,
            }),
        }
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    pub async fn handle(&self, payload: JobPayload) -> Result<JobResult, HandlerError> {
        self.inner.handle(payload).await
    }
}

impl std::fmt::Debug for BoxedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedHandler")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// At most one handler per category. Categories without one are enqueue-only.
#[derive(Default, Clone, Debug)]
pub struct HandlerSet {
    handlers: HashMap<JobCategory, BoxedHandler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `K::CATEGORY`, replacing any previous one.
    pub fn register<K, H>(&mut self, handler: H) -> &mut Self
    where
        K: JobKind,
        H: JobHandler<K>,
    {
        self.handlers.insert(K::CATEGORY, BoxedHandler::new(handler));
        self
    }

    pub fn get(&self, category: JobCategory) -> Option<&BoxedHandler> {
        self.handlers.get(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = JobCategory> + '_ {
        self.handlers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::registry::{AiJob, AiOutput, AiResult, AiTask, EmailJob, EmailKind};

    fn summary_job() -> AiJob {
        AiJob {
            task: AiTask::GenerateSummary,
            survey_id: Some("s1".to_owned()),
            response_id: None,
            input: Some("great product".to_owned()),
            options: None,
        }
    }

    #[tokio::test]
    async fn test_boxed_handler_round_trips_typed_values() {
        let handler = BoxedHandler::new(handler_fn(|job: AiJob| async move {
            Ok::<_, HandlerError>(AiResult {
                success: true,
                result: job.input.map(AiOutput::Text),
                tokens: None,
                error: None,
            })
        }));
        assert_eq!(handler.category(), JobCategory::Ai);

        let result = handler.handle(summary_job().into()).await.unwrap();
        assert_eq!(
            result,
            JobResult::Ai(AiResult {
                success: true,
                result: Some(AiOutput::Text("great product".to_owned())),
                tokens: None,
                error: None,
            })
        );
    }

    #[tokio::test]
    async fn test_boxed_handler_rejects_other_categories() {
        let handler = BoxedHandler::new(handler_fn(|_: AiJob| async move {
            Err::<AiResult, _>(HandlerError::new("unreachable"))
        }));

        let email = EmailJob {
            kind: EmailKind::Welcome,
            to: "a@b.com".to_owned(),
            subject: "Hi".to_owned(),
            template: "t1".to_owned(),
            variables: Default::default(),
            attachments: None,
        };
        let error = handler.handle(email.into()).await.unwrap_err();
        assert_eq!(error.message, "ai handler received a email payload");
    }

    #[test]
    fn test_handler_errors_keep_context() {
        let error = anyhow::anyhow!("connection refused").context("sending email");
        assert_eq!(
            HandlerError::from(error).message,
            "sending email: connection refused"
        );
        assert_eq!(HandlerError::from("boom").to_string(), "boom");
    }

    #[test]
    fn test_handler_set_keeps_one_handler_per_category() {
        let mut handlers = HandlerSet::new();
        assert!(handlers.is_empty());

        handlers
            .register::<AiJob, _>(handler_fn(|_: AiJob| async move {
                Err::<AiResult, _>(HandlerError::new("first"))
            }))
            .register::<AiJob, _>(handler_fn(|_: AiJob| async move {
                Err::<AiResult, _>(HandlerError::new("second"))
            }));

        assert_eq!(handlers.categories().collect::<Vec<_>>(), vec![JobCategory::Ai]);
        assert!(handlers.get(JobCategory::Ai).is_some());
        assert!(handlers.get(JobCategory::Email).is_none());
    }
}
