//! # Registry
//!
//! The payload a producer supplies and the result a handler returns, for every job category.
//! Field names follow the camelCase JSON the application sends, and each payload's `type`
//! field is a closed enum rather than a free string.
use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::JobCategory;

/// Ties a payload type to its category and to the result type its handler produces.
pub trait JobKind: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const CATEGORY: JobCategory;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn into_payload(self) -> JobPayload;

    /// Extract this payload type, handing the payload back untouched on a category mismatch.
    fn from_payload(payload: JobPayload) -> Result<Self, JobPayload>;

    fn into_result(output: Self::Output) -> JobResult;

    fn from_result(result: JobResult) -> Result<Self::Output, JobResult>;
}

macro_rules! job_kind {
    ($payload:ty, $output:ty, $variant:ident) => {
        impl JobKind for $payload {
            const CATEGORY: JobCategory = JobCategory::$variant;
            type Output = $output;

            fn into_payload(self) -> JobPayload {
                JobPayload::$variant(self)
            }

            fn from_payload(payload: JobPayload) -> Result<Self, JobPayload> {
                match payload {
                    JobPayload::$variant(payload) => Ok(payload),
                    other => Err(other),
                }
            }

            fn into_result(output: Self::Output) -> JobResult {
                JobResult::$variant(output)
            }

            fn from_result(result: JobResult) -> Result<Self::Output, JobResult> {
                match result {
                    JobResult::$variant(output) => Ok(output),
                    other => Err(other),
                }
            }
        }

        impl From<$payload> for JobPayload {
            fn from(payload: $payload) -> Self {
                JobPayload::$variant(payload)
            }
        }

        impl From<$output> for JobResult {
            fn from(output: $output) -> Self {
                JobResult::$variant(output)
            }
        }
    };
}

job_kind!(EmailJob, EmailResult, Email);
job_kind!(ExportJob, ExportResult, Export);
job_kind!(AnalyticsJob, AnalyticsResult, Analytics);
job_kind!(AiJob, AiResult, Ai);
job_kind!(NotificationJob, NotificationResult, Notification);

/// Every payload a queue can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum JobPayload {
    Email(EmailJob),
    Export(ExportJob),
    Analytics(AnalyticsJob),
    Ai(AiJob),
    Notification(NotificationJob),
}

impl JobPayload {
    pub fn category(&self) -> JobCategory {
        match self {
            JobPayload::Email(_) => JobCategory::Email,
            JobPayload::Export(_) => JobCategory::Export,
            JobPayload::Analytics(_) => JobCategory::Analytics,
            JobPayload::Ai(_) => JobCategory::Ai,
            JobPayload::Notification(_) => JobCategory::Notification,
        }
    }

    /// Parse an untyped producer payload against the schema of `category`.
    pub fn from_json(category: JobCategory, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match category {
            JobCategory::Email => JobPayload::Email(serde_json::from_value(value)?),
            JobCategory::Export => JobPayload::Export(serde_json::from_value(value)?),
            JobCategory::Analytics => JobPayload::Analytics(serde_json::from_value(value)?),
            JobCategory::Ai => JobPayload::Ai(serde_json::from_value(value)?),
            JobCategory::Notification => {
                JobPayload::Notification(serde_json::from_value(value)?)
            }
        })
    }

    /// Reject payloads that deserialize fine but cannot possibly be executed.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobPayload::Email(job) => job.validate(),
            JobPayload::Export(job) => job.validate(),
            JobPayload::Analytics(job) => job.validate(),
            JobPayload::Ai(job) => job.validate(),
            JobPayload::Notification(job) => job.validate(),
        }
    }
}

/// Every result a handler can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum JobResult {
    Email(EmailResult),
    Export(ExportResult),
    Analytics(AnalyticsResult),
    Ai(AiResult),
    Notification(NotificationResult),
}

impl JobResult {
    pub fn category(&self) -> JobCategory {
        match self {
            JobResult::Email(_) => JobCategory::Email,
            JobResult::Export(_) => JobCategory::Export,
            JobResult::Analytics(_) => JobCategory::Analytics,
            JobResult::Ai(_) => JobCategory::Ai,
            JobResult::Notification(_) => JobCategory::Notification,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            JobResult::Email(result) => result.success,
            JobResult::Export(result) => result.success,
            JobResult::Analytics(result) => result.success,
            JobResult::Ai(result) => result.success,
            JobResult::Notification(result) => result.success,
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

// Email

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmailKind {
    Welcome,
    SurveyInvite,
    SurveyReminder,
    PasswordReset,
    Notification,
}

/// Primitive template variable: string, number or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::Text(value.to_owned())
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Integer(value)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentEncoding {
    #[serde(rename = "base64")]
    Base64,
    #[serde(rename = "utf-8")]
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content: String,
    pub encoding: AttachmentEncoding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub to: String,
    pub subject: String,
    pub template: String,
    pub variables: HashMap<String, TemplateValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl EmailJob {
    fn validate(&self) -> Result<(), String> {
        require("to", &self.to)?;
        if !self.to.contains('@') {
            return Err(format!("{} is not an email address", self.to));
        }
        require("subject", &self.subject)?;
        require("template", &self.template)?;

        for attachment in self.attachments.iter().flatten() {
            require("attachment filename", &attachment.filename)?;
            if attachment.encoding == AttachmentEncoding::Base64
                && BASE64.decode(attachment.content.as_bytes()).is_err()
            {
                return Err(format!(
                    "attachment {} is not valid base64",
                    attachment.filename
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmailResult {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }
}

// Export

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Pdf,
    Excel,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Excel => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_metadata: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_analytics: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    #[serde(rename = "type")]
    pub format: ExportFormat,
    pub survey_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<ExportFilters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ExportOptions>,
}

impl ExportJob {
    fn validate(&self) -> Result<(), String> {
        require("surveyId", &self.survey_id)?;
        require("userId", &self.user_id)?;

        if let Some(ExportFilters {
            start_date: Some(start),
            end_date: Some(end),
            ..
        }) = &self.filters
        {
            if start > end {
                return Err("filters.startDate is after filters.endDate".to_owned());
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Analytics

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalyticsKind {
    AggregateDaily,
    AggregateWeekly,
    CalculateNps,
    SentimentSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsJob {
    #[serde(rename = "type")]
    pub kind: AnalyticsKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

impl AnalyticsJob {
    fn validate(&self) -> Result<(), String> {
        match &self.date_range {
            Some(range) if range.start > range.end => {
                Err("dateRange.start is after dateRange.end".to_owned())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// AI

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AiTask {
    SentimentAnalysis,
    GenerateSummary,
    CategorizeResponses,
    GenerateQuestions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiJob {
    #[serde(rename = "type")]
    pub task: AiTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<AiOptions>,
}

impl AiJob {
    fn validate(&self) -> Result<(), String> {
        match &self.options {
            Some(AiOptions {
                max_tokens: Some(0),
                ..
            }) => Err("options.maxTokens must be greater than zero".to_owned()),
            _ => Ok(()),
        }
    }
}

/// Completion output: plain text, or a JSON object for structured tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AiOutput {
    Text(String),
    Structured(Map<String, Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AiOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Notification

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationChannel {
    Push,
    InApp,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub url: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
}

impl NotificationJob {
    fn validate(&self) -> Result<(), String> {
        require("userId", &self.user_id)?;
        require("title", &self.title)?;
        require("body", &self.body)?;
        if let Some(action) = &self.action {
            require("action.url", &action.url)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
