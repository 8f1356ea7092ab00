//! A single scheduled or attempted pipeline run.
use std::{fmt::Display, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{Args, PipelineDefinition};

/// Unique identifier of one execution attempt.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExecutionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created by a trigger fire and awaiting its admission check.
    Pending,
    /// Blocked by a dependency, conflict or budget and waiting in the pending list.
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Failed with attempts to spare; a re-fire has been scheduled.
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Schedule,
    Retry,
    /// Re-dispatched from the pending list once it was no longer blocked.
    Queue,
    Manual(String),
}

impl Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => f.write_str("scheduler"),
            Self::Retry => f.write_str("retry"),
            Self::Queue => f.write_str("queue"),
            Self::Manual(user) => write!(f, "manual:{user}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub priority: u8,
    pub scheduled_at: DateTime<Utc>,
    /// Starts at 1.
    pub attempt: u16,
    pub status: JobStatus,
    pub definition: Arc<PipelineDefinition>,
    pub started_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    /// Arguments overriding the definition's defaults for this run.
    pub overrides: Args,
    pub triggered_by: TriggeredBy,
}

impl JobContext {
    pub fn new(definition: Arc<PipelineDefinition>, triggered_by: TriggeredBy) -> Self {
        Self {
            pipeline_name: definition.name.clone(),
            execution_id: ExecutionId::new(),
            priority: definition.priority,
            scheduled_at: Utc::now(),
            attempt: 1,
            status: JobStatus::Pending,
            definition,
            started_at: None,
            queued_at: None,
            overrides: Args::new(),
            triggered_by,
        }
    }

    pub fn with_attempt(self, attempt: u16) -> Self {
        Self { attempt, ..self }
    }

    pub fn with_overrides(self, overrides: Args) -> Self {
        Self { overrides, ..self }
    }

    pub fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub fn max_attempts(&self) -> u16 {
        self.definition.retry.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        !self.definition.retry.should_retry(self.attempt)
    }

    /// Arguments the entry point is invoked with.
    pub fn args(&self) -> Args {
        self.definition.merged_args(&self.overrides)
    }

    /// The next attempt of this run: a fresh execution id, same arguments.
    pub fn next_attempt(&self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            scheduled_at,
            attempt: self.attempt.saturating_add(1),
            status: JobStatus::Pending,
            started_at: None,
            queued_at: None,
            triggered_by: TriggeredBy::Retry,
            ..self.clone()
        }
    }

    pub(crate) fn mark_queued(&mut self) {
        self.status = JobStatus::Queued;
        self.queued_at.get_or_insert_with(Utc::now);
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }
}
