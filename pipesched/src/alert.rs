//! Alert requests emitted when runs fail.
//!
//! Delivery is somebody else's problem: the scheduler hands an [`AlertSink`] a structured alert
//! and moves on. Errors returned by a sink are logged and otherwise ignored.
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::job::ExecutionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("Failed to deliver alert: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAlert {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub error_message: String,
    pub attempt: u16,
    pub max_attempts: u16,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAlert {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub error_message: String,
    pub attempt: u16,
    pub max_attempts: u16,
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutAlert {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub timeout_seconds: u64,
}

/// Any alert, as recorded by [`crate::testing::RecordingAlertSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    Failure(FailureAlert),
    Retry(RetryAlert),
    Timeout(TimeoutAlert),
}

impl Alert {
    pub fn pipeline_name(&self) -> &str {
        match self {
            Self::Failure(alert) => &alert.pipeline_name,
            Self::Retry(alert) => &alert.pipeline_name,
            Self::Timeout(alert) => &alert.pipeline_name,
        }
    }
}

/// Receives alert requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_failure_alert(&self, alert: FailureAlert) -> Result<(), AlertError>;

    async fn send_retry_alert(&self, alert: RetryAlert) -> Result<(), AlertError>;

    async fn send_timeout_alert(&self, alert: TimeoutAlert) -> Result<(), AlertError>;
}

/// Emits alerts as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send_failure_alert(&self, alert: FailureAlert) -> Result<(), AlertError> {
        tracing::error!(
            pipeline = %alert.pipeline_name,
            execution_id = %alert.execution_id,
            attempt = alert.attempt,
            max_attempts = alert.max_attempts,
            duration = ?alert.duration,
            "Pipeline {} failed on attempt {}/{}: {}",
            alert.pipeline_name,
            alert.attempt,
            alert.max_attempts,
            alert.error_message,
        );
        Ok(())
    }

    async fn send_retry_alert(&self, alert: RetryAlert) -> Result<(), AlertError> {
        tracing::warn!(
            pipeline = %alert.pipeline_name,
            execution_id = %alert.execution_id,
            attempt = alert.attempt,
            max_attempts = alert.max_attempts,
            retry_delay_seconds = alert.retry_delay_seconds,
            "Pipeline {} will be retried in {}s: {}",
            alert.pipeline_name,
            alert.retry_delay_seconds,
            alert.error_message,
        );
        Ok(())
    }

    async fn send_timeout_alert(&self, alert: TimeoutAlert) -> Result<(), AlertError> {
        tracing::error!(
            pipeline = %alert.pipeline_name,
            execution_id = %alert.execution_id,
            timeout_seconds = alert.timeout_seconds,
            "Pipeline {} timed out after {}s",
            alert.pipeline_name,
            alert.timeout_seconds,
        );
        Ok(())
    }
}
