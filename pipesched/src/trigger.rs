//! The interface to whatever fires pipelines on a schedule.
//!
//! The scheduler never parses schedules or keeps timers itself; it registers callbacks with a
//! [`TriggerEngine`]. [`LocalTriggerEngine`] is an in-process implementation backed by tokio
//! timers.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

use crate::{config::ConfigError, pipeline::Trigger};

mod local;

pub use local::LocalTriggerEngine;

/// Invoked each time a trigger fires.
pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Cannot schedule {job_id}: {source}")]
    Invalid {
        job_id: String,
        #[source]
        source: ConfigError,
    },
    #[error("{0} has a manual trigger and cannot be scheduled")]
    NotRecurring(String),
    #[error("Trigger engine is shut down")]
    ShutDown,
}

/// Fires callbacks on recurring schedules or at one-off instants.
///
/// Implementations run at most one invocation per job id at a time: a fire that comes due while
/// the previous invocation for the same id is still running is skipped.
#[async_trait]
pub trait TriggerEngine: Send + Sync {
    /// Calls `callback` every time `trigger` fires, replacing any job registered as `job_id`.
    fn register(
        &self,
        job_id: &str,
        trigger: &Trigger,
        callback: JobCallback,
    ) -> Result<(), TriggerError>;

    /// Stops `job_id` from firing again. Returns whether it was registered.
    fn remove(&self, job_id: &str) -> bool;

    /// Calls `callback` once at `run_at`, or straight away if that is in the past.
    fn add_one_shot(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        callback: JobCallback,
    ) -> Result<(), TriggerError>;

    /// Ids of the recurring jobs currently registered.
    fn registered(&self) -> Vec<String>;

    /// Stops firing anything, optionally waiting for running callbacks to return.
    async fn shutdown(&self, wait: bool);
}

/// Wraps an async closure as a [`JobCallback`].
pub fn callback<F, Fut>(f: F) -> JobCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) })
}
