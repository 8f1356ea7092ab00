//! Persistence of execution history.
//!
//! Every dispatched run writes one record when it starts and completes it once the run ends.
//! The scheduler logs persistence failures and carries on; a history store that is down never
//! stops pipelines from running.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    executor::ExecutionResult,
    job::{ExecutionId, JobContext, JobStatus, TriggeredBy},
    pipeline::Args,
};

pub mod memory;

pub use memory::{HistoryEntry, HistoryQuery, InMemoryHistory};

/// Lines of stderr kept as the error trace of a failed run.
const TRACE_LINES: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("No history record for execution {0}")]
    UnknownExecution(ExecutionId),
    #[error("History store unavailable: {0}")]
    Unavailable(String),
    #[error("History store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("History store in bad state")]
    BadState,
}

/// Written when a run is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    /// Identifier of the trigger the run was fired from.
    pub job_id: String,
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub status: JobStatus,
    pub priority: u8,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// The `mode` argument of the run, if it has one.
    pub mode: Option<String>,
    pub parameters: Args,
    pub attempt: u16,
    pub max_attempts: u16,
    pub triggered_by: TriggeredBy,
    pub host: String,
}

impl HistoryRecord {
    pub fn running(context: &JobContext, host: impl Into<String>) -> Self {
        let parameters = context.args();
        Self {
            job_id: context.pipeline_name.clone(),
            pipeline_name: context.pipeline_name.clone(),
            execution_id: context.execution_id,
            status: JobStatus::Running,
            priority: context.priority,
            scheduled_at: context.scheduled_at,
            started_at: context.started_at.unwrap_or_else(Utc::now),
            mode: parameters
                .get("mode")
                .and_then(|mode| mode.as_str())
                .map(ToOwned::to_owned),
            parameters,
            attempt: context.attempt,
            max_attempts: context.max_attempts(),
            triggered_by: context.triggered_by.clone(),
            host: host.into(),
        }
    }
}

/// Written when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRecord {
    pub status: JobStatus,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub records_processed: Option<u64>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Tail of the run's stderr when it failed.
    pub error_trace: Option<String>,
}

impl CompletionRecord {
    pub fn from_result(result: &ExecutionResult) -> Self {
        let error_trace = (!result.success && !result.stderr.trim().is_empty()).then(|| {
            let lines = result.stderr.lines().collect::<Vec<_>>();
            lines[lines.len().saturating_sub(TRACE_LINES)..].join("\n")
        });
        Self {
            status: result.status(),
            completed_at: Utc::now(),
            duration: result.duration,
            records_processed: result.records_processed,
            exit_code: Some(result.exit_code),
            error_message: result.error.clone(),
            error_trace,
        }
    }

    /// A run that failed before its process was started.
    pub fn failed(error_message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: JobStatus::Failed,
            completed_at: Utc::now(),
            duration,
            records_processed: None,
            exit_code: None,
            error_message: Some(error_message.into()),
            error_trace: None,
        }
    }
}

/// Where execution history is persisted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_start(&self, record: HistoryRecord) -> Result<(), HistoryError>;

    async fn record_completion(
        &self,
        execution_id: ExecutionId,
        completion: CompletionRecord,
    ) -> Result<(), HistoryError>;
}
