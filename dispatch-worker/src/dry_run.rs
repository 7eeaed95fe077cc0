//! Handlers that log each job and report success without calling any provider.
//!
//! The binary serves every category with these until real integrations are registered,
//! which keeps queues draining and makes the dispatch path observable end to end.
use std::collections::HashMap;

use dispatch_core::registry::{
    AiJob, AiOutput, AiResult, AnalyticsJob, AnalyticsResult, EmailJob, EmailResult, ExportJob,
    ExportResult, NotificationJob, NotificationResult,
};
use tracing::info;
use uuid::Uuid;

use crate::handler::{handler_fn, HandlerError, HandlerSet};

pub fn handlers() -> HandlerSet {
    let mut handlers = HandlerSet::new();
    handlers
        .register::<EmailJob, _>(handler_fn(email))
        .register::<ExportJob, _>(handler_fn(export))
        .register::<AnalyticsJob, _>(handler_fn(analytics))
        .register::<AiJob, _>(handler_fn(ai))
        .register::<NotificationJob, _>(handler_fn(notification));
    handlers
}

async fn email(job: EmailJob) -> Result<EmailResult, HandlerError> {
    info!(kind = ?job.kind, template = %job.template, "dry run: email");
    Ok(EmailResult::sent(format!("dry-run-{}", Uuid::now_v7())))
}

async fn export(job: ExportJob) -> Result<ExportResult, HandlerError> {
    info!(format = ?job.format, survey_id = %job.survey_id, "dry run: export");
    Ok(ExportResult {
        success: true,
        file_url: None,
        file_name: Some(format!("{}.{}", job.survey_id, job.format.extension())),
        size: Some(0),
        error: None,
    })
}

async fn analytics(job: AnalyticsJob) -> Result<AnalyticsResult, HandlerError> {
    info!(kind = ?job.kind, survey_id = ?job.survey_id, "dry run: analytics");
    Ok(AnalyticsResult {
        success: true,
        metrics: Some(HashMap::new()),
        error: None,
    })
}

async fn ai(job: AiJob) -> Result<AiResult, HandlerError> {
    info!(task = ?job.task, survey_id = ?job.survey_id, "dry run: ai");
    Ok(AiResult {
        success: true,
        result: job.input.map(AiOutput::Text),
        tokens: None,
        error: None,
    })
}

async fn notification(job: NotificationJob) -> Result<NotificationResult, HandlerError> {
    info!(channel = ?job.channel, user_id = %job.user_id, "dry run: notification");
    Ok(NotificationResult {
        success: true,
        delivered: Some(false),
        error: None,
    })
}
