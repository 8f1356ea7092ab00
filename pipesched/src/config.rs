//! Engine settings and the source pipeline definitions are loaded from.
//!
//! Definitions come from a [`ConfigSource`], which also reports a content hash so the engine can
//! poll for changes cheaply. Two sources are provided: [`FileConfigSource`] reads a TOML file and
//! [`StaticConfigSource`] holds definitions in memory.
//!
//! A configuration file looks like:
//!
//! ```toml
//! [scheduler]
//! admission_timeout_seconds = 300
//! max_workers = 4
//!
//! [scheduler.resources]
//! db_pool = 10
//! http_api = 3
//!
//! [[pipelines]]
//! name = "crm_sync"
//! priority = 2
//! trigger = { type = "cron", expression = "0 2 * * *" }
//! entry_point = { program = "python", args = ["-m", "pipelines.crm"] }
//! resource_group = "http_api"
//! max_db_connections = 2
//! conflicts_with = ["billing_export"]
//! ```
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{pipeline::PipelineDefinition, resource::DB_POOL};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Pipeline {0} is declared more than once")]
    DuplicatePipeline(String),
    #[error("Pipeline {pipeline} references unknown pipeline {reference}")]
    UnknownPipeline { pipeline: String, reference: String },
    #[error("Pipeline dependencies form a cycle between {pipelines:?}")]
    DependencyCycle { pipelines: Vec<String> },
    #[error("Invalid pipeline {pipeline}: {reason}")]
    InvalidPipeline { pipeline: String, reason: String },
    #[error("Invalid trigger {trigger}: {reason}")]
    InvalidTrigger { trigger: String, reason: String },
    #[error("Configuration source in bad state")]
    BadState,
}

/// Settings for the scheduling engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a run may wait for its resource slots before it is failed.
    pub admission_timeout_seconds: u64,
    pub reload_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Upper bound on concurrently dispatched fires.
    pub max_workers: usize,
    /// Time a terminated pipeline gets to exit before it is killed.
    pub kill_grace_period_seconds: u64,
    pub stream_poll_interval_millis: u64,
    /// Longest wait for a single history store or alert sink call.
    pub sink_timeout_seconds: u64,
    /// Capacity of each named resource. `db_pool` is also the database connection budget.
    pub resources: BTreeMap<String, usize>,
    /// Recorded on history rows. Falls back to the `HOSTNAME` environment variable.
    pub host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission_timeout_seconds: 300,
            reload_interval_seconds: 10,
            heartbeat_interval_seconds: 30,
            max_workers: 10,
            kill_grace_period_seconds: 5,
            stream_poll_interval_millis: 250,
            sink_timeout_seconds: 30,
            resources: BTreeMap::from([(DB_POOL.to_owned(), Self::DEFAULT_DB_POOL)]),
            host: None,
        }
    }
}

impl EngineConfig {
    pub const DEFAULT_DB_POOL: usize = 10;

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_seconds)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_seconds)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_millis)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_seconds)
    }

    /// The database connection budget shared by all running pipelines.
    pub fn db_connection_budget(&self) -> u32 {
        self.resources
            .get(DB_POOL)
            .copied()
            .unwrap_or(Self::DEFAULT_DB_POOL)
            .try_into()
            .unwrap_or(u32::MAX)
    }

    pub fn with_resource(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.resources.insert(name.into(), limit);
        self
    }

    pub fn with_admission_timeout(self, timeout: Duration) -> Self {
        Self {
            admission_timeout_seconds: timeout.as_secs(),
            ..self
        }
    }

    pub fn with_max_workers(self, max_workers: usize) -> Self {
        Self {
            max_workers,
            ..self
        }
    }

    pub fn with_kill_grace_period(self, grace_period: Duration) -> Self {
        Self {
            kill_grace_period_seconds: grace_period.as_secs(),
            ..self
        }
    }

    pub fn with_sink_timeout(self, timeout: Duration) -> Self {
        Self {
            sink_timeout_seconds: timeout.as_secs(),
            ..self
        }
    }

    pub fn host_name(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_owned())
    }
}

/// The definitions currently published by a [`ConfigSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSet {
    pub definitions: Vec<PipelineDefinition>,
    /// Changes whenever the underlying definitions change.
    pub hash: u64,
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<PipelineSet, ConfigError>;

    /// Hash of the current content, used to detect changes without parsing.
    async fn content_hash(&self) -> Result<u64, ConfigError> {
        Ok(self.load().await?.hash)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduler: EngineConfig,
    #[serde(default)]
    pipelines: Vec<PipelineDefinition>,
}

/// Reads `[scheduler]` settings and `[[pipelines]]` from a TOML file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `[scheduler]` section, or defaults if it is absent.
    pub async fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let contents = self.read().await?;
        Ok(toml::from_str::<ConfigFile>(&String::from_utf8_lossy(&contents))?.scheduler)
    }

    async fn read(&self) -> Result<Vec<u8>, ConfigError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<PipelineSet, ConfigError> {
        let contents = self.read().await?;
        let file: ConfigFile = toml::from_str(&String::from_utf8_lossy(&contents))?;
        Ok(PipelineSet {
            definitions: file.pipelines,
            hash: fxhash::hash64(&contents),
        })
    }

    async fn content_hash(&self) -> Result<u64, ConfigError> {
        Ok(fxhash::hash64(&self.read().await?))
    }
}

/// Definitions held in memory that can be swapped at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    current: Arc<RwLock<PipelineSet>>,
}

impl Default for PipelineSet {
    fn default() -> Self {
        Self::from_definitions(vec![])
    }
}

impl PipelineSet {
    pub fn from_definitions(definitions: Vec<PipelineDefinition>) -> Self {
        let hash = serde_json::to_vec(&definitions)
            .map(|bytes| fxhash::hash64(&bytes))
            .unwrap_or_default();
        Self { definitions, hash }
    }
}

impl StaticConfigSource {
    pub fn new(definitions: Vec<PipelineDefinition>) -> Self {
        Self {
            current: Arc::new(RwLock::new(PipelineSet::from_definitions(definitions))),
        }
    }

    pub fn replace(&self, definitions: Vec<PipelineDefinition>) -> Result<(), ConfigError> {
        *self.current.write().map_err(|_| ConfigError::BadState)? =
            PipelineSet::from_definitions(definitions);
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<PipelineSet, ConfigError> {
        Ok(self
            .current
            .read()
            .map_err(|_| ConfigError::BadState)?
            .clone())
    }
}
