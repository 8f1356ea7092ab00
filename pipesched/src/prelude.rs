//! The purpose of this module is to alleviate the need to import many of the `[pipesched]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use pipesched::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::{ConfigSource, EngineConfig, FileConfigSource, StaticConfigSource};
pub use crate::engine::{EngineState, EngineStatus, PendingJob};
pub use crate::executor::{ExecutionResult, PipelineExecutor};
pub use crate::job::{ExecutionId, JobContext, JobStatus, TriggeredBy};
pub use crate::pipeline::{Args, EntryPoint, PipelineDefinition, RetryPolicy, Trigger};
pub use crate::resource::ResourceManager;
pub use crate::SchedulingEngine;
