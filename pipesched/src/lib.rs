//! Scheduling and supervision core for data-pipeline jobs.
//!
//! Pipelines are external programs described by a
//! [`PipelineDefinition`](pipeline::PipelineDefinition). A [`SchedulingEngine`] fires them on
//! cron or interval triggers and supervises each run as a child process with a timeout.
//! Before a run starts it must clear its dependencies and conflicts and get its share of named
//! resources such as the database connection pool. Failures are retried with exponential
//! backoff.
//!
//! ```no_run
//! use pipesched::{config::FileConfigSource, SchedulingEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = FileConfigSource::new("pipelines.toml");
//! let engine = SchedulingEngine::builder(source.engine_config().await?, source).build();
//! engine.start().await?;
//! // ...
//! engine.stop(true).await;
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod alert;
pub mod backoff;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod executor;
pub mod history;
pub mod job;
pub mod pipeline;
pub mod prelude;
pub mod resource;
pub mod testing;
pub mod trigger;

pub use engine::SchedulingEngine;

use config::ConfigError;
use history::HistoryError;
use resource::ResourceError;
use trigger::TriggerError;

#[derive(Debug, Error)]
pub enum PipeschedError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Error registering triggers: {0}")]
    Trigger(#[from] TriggerError),
    #[error("Error accessing resources: {0}")]
    Resource(#[from] ResourceError),
    #[error("Error accessing execution history: {0}")]
    History(#[from] HistoryError),
    #[error("Unknown pipeline {0}")]
    UnknownPipeline(String),
    #[error("Pipeline {0} is disabled")]
    PipelineDisabled(String),
    #[error("Scheduling engine is not running")]
    NotRunning,
    #[error("Scheduling engine has already been started")]
    AlreadyStarted,
}
