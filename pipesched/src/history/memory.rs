//! Provides an in memory implementation of [`HistoryStore`].
//!
//! History is kept for the lifetime of the process only. It backs the local demo and tests, and
//! is not meant as the record of a production deployment.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{ExecutionId, JobStatus, TriggeredBy};

use super::{CompletionRecord, HistoryError, HistoryRecord, HistoryStore};

/// A started run and, once it has ended, how it ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub record: HistoryRecord,
    pub completion: Option<CompletionRecord>,
}

impl HistoryEntry {
    pub fn status(&self) -> JobStatus {
        self.completion
            .as_ref()
            .map_or(self.record.status, |completion| completion.status)
    }
}

/// Filters over [`HistoryEntry`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryQuery<'a> {
    Not(Box<HistoryQuery<'a>>),
    And(Vec<HistoryQuery<'a>>),
    Or(Vec<HistoryQuery<'a>>),
    PipelineEquals(&'a str),
    ExecutionIdEquals(ExecutionId),
    StatusEqual(JobStatus),
    AttemptEqual(u16),
    TriggeredBy(TriggeredBy),
    StartedBefore(DateTime<Utc>),
    StartedAfter(DateTime<Utc>),
}

impl HistoryQuery<'_> {
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        match self {
            Self::Not(inner) => !inner.matches(entry),
            Self::And(inner) => inner.iter().all(|query| query.matches(entry)),
            Self::Or(inner) => inner.iter().any(|query| query.matches(entry)),
            Self::PipelineEquals(name) => entry.record.pipeline_name == *name,
            Self::ExecutionIdEquals(id) => entry.record.execution_id == *id,
            Self::StatusEqual(status) => entry.status() == *status,
            Self::AttemptEqual(attempt) => entry.record.attempt == *attempt,
            Self::TriggeredBy(triggered_by) => entry.record.triggered_by == *triggered_by,
            Self::StartedBefore(at) => entry.record.started_at < *at,
            Self::StartedAfter(at) => entry.record.started_at > *at,
        }
    }
}

/// An in memory implementation of [`HistoryStore`].
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    entries: Arc<RwLock<Vec<HistoryEntry>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in the order runs started.
    pub fn all(&self) -> Vec<HistoryEntry> {
        self.query(&HistoryQuery::And(Vec::new()))
    }

    pub fn query(&self, query: &HistoryQuery<'_>) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| query.matches(entry))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn for_pipeline(&self, pipeline_name: &str) -> Vec<HistoryEntry> {
        self.query(&HistoryQuery::PipelineEquals(pipeline_name))
    }

    pub fn get(&self, execution_id: ExecutionId) -> Option<HistoryEntry> {
        self.query(&HistoryQuery::ExecutionIdEquals(execution_id))
            .into_iter()
            .next()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn record_start(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        self.entries
            .write()
            .map_err(|_| HistoryError::BadState)?
            .push(HistoryEntry {
                record,
                completion: None,
            });
        Ok(())
    }

    async fn record_completion(
        &self,
        execution_id: ExecutionId,
        completion: CompletionRecord,
    ) -> Result<(), HistoryError> {
        let mut entries = self.entries.write().map_err(|_| HistoryError::BadState)?;
        let entry = entries
            .iter_mut()
            .rev()
            .find(|entry| entry.record.execution_id == execution_id)
            .ok_or(HistoryError::UnknownExecution(execution_id))?;
        entry.completion = Some(completion);
        Ok(())
    }
}
