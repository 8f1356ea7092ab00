//! Static pipeline declarations.
//!
//! A [`PipelineDefinition`] is loaded from a [`crate::config::ConfigSource`], validated into a
//! [`PipelineRegistry`], and treated as immutable until the next configuration reload.
use std::{collections::BTreeMap, fmt::Display, str::FromStr, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{
    backoff::{BackoffStrategy, Strategy},
    config::ConfigError,
};

mod registry;

pub use registry::PipelineRegistry;

/// Arguments passed to a pipeline's entry point, rendered as `--key value` pairs.
pub type Args = BTreeMap<String, serde_json::Value>;

/// The most urgent priority a pipeline can declare.
pub const HIGHEST_PRIORITY: u8 = 1;
/// The least urgent priority a pipeline can declare.
pub const LOWEST_PRIORITY: u8 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub trigger: Trigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 1 (most urgent) to 10.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    /// Name of the capacity pool (see [`crate::resource::ResourceManager`]) a run holds one slot
    /// of while executing.
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub max_db_connections: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub default_args: Args,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u8 {
    5
}

fn default_timeout_seconds() -> u64 {
    3600
}

impl PipelineDefinition {
    /// A minimal, enabled, manually triggered definition.
    pub fn new(name: impl Into<String>, entry_point: EntryPoint) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            trigger: Trigger::Manual,
            enabled: true,
            priority: default_priority(),
            depends_on: vec![],
            conflicts_with: vec![],
            resource_group: None,
            max_db_connections: 0,
            timeout_seconds: default_timeout_seconds(),
            retry: RetryPolicy::default(),
            entry_point,
            default_args: Args::new(),
        }
    }

    pub fn with_trigger(self, trigger: Trigger) -> Self {
        Self { trigger, ..self }
    }

    pub fn with_priority(self, priority: u8) -> Self {
        Self { priority, ..self }
    }

    pub fn with_depends_on<S: ToString>(self, depends_on: impl IntoIterator<Item = S>) -> Self {
        Self {
            depends_on: depends_on.into_iter().map(|s| s.to_string()).collect(),
            ..self
        }
    }

    pub fn with_conflicts_with<S: ToString>(
        self,
        conflicts_with: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            conflicts_with: conflicts_with.into_iter().map(|s| s.to_string()).collect(),
            ..self
        }
    }

    pub fn with_resource_group(self, resource_group: impl Into<String>) -> Self {
        Self {
            resource_group: Some(resource_group.into()),
            ..self
        }
    }

    pub fn with_max_db_connections(self, max_db_connections: u32) -> Self {
        Self {
            max_db_connections,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_seconds: timeout.as_secs(),
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn with_default_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.default_args.insert(key.into(), value);
        self
    }

    pub fn disabled(self) -> Self {
        Self {
            enabled: false,
            ..self
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Default arguments overlaid with `overrides`.
    pub fn merged_args(&self, overrides: &Args) -> Args {
        let mut args = self.default_args.clone();
        args.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        args
    }
}

/// When a pipeline fires on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A cron expression, either the classic five fields or the six/seven field form with
    /// seconds.
    Cron { expression: String },
    /// Fires every `seconds`.
    Interval { seconds: u64 },
    /// Never fires on its own; only runs through [`crate::SchedulingEngine::run_now`].
    Manual,
}

impl Trigger {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self::Interval {
            seconds: interval.as_secs(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Checks the trigger can actually be scheduled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
            Self::Interval { seconds: 0 } => Err(ConfigError::InvalidTrigger {
                trigger: self.to_string(),
                reason: "interval must be at least one second".to_owned(),
            }),
            Self::Interval { .. } | Self::Manual => Ok(()),
        }
    }
}

impl Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron { expression } => write!(f, "cron({expression})"),
            Self::Interval { seconds } => write!(f, "every {seconds}s"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Parses a cron expression, accepting the five field form by pinning seconds to zero.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ConfigError> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    };
    cron::Schedule::from_str(&normalized).map_err(|err| ConfigError::InvalidTrigger {
        trigger: format!("cron({expression})"),
        reason: err.to_string(),
    })
}

/// How many times a failing pipeline is attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u16 {
    3
}

fn default_base_delay_seconds() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_seconds: default_base_delay_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u16, base_delay_seconds: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_seconds,
            backoff_multiplier,
        }
    }

    /// A policy that never retries.
    pub const fn never() -> Self {
        Self::new(1, 0, 1.0)
    }

    /// Whether a run that failed on `attempt` gets another go.
    pub fn should_retry(&self, attempt: u16) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before re-firing after `attempt` failed: `base × multiplier^(attempt - 1)`.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let base = TimeDelta::seconds(i64::try_from(self.base_delay_seconds).unwrap_or(i64::MAX));
        BackoffStrategy::exponential(base, self.backoff_multiplier).backoff(attempt)
    }
}

/// The program a pipeline runs, resolved when the configuration is loaded.
///
/// The child is invoked as `<program> [args...] [--flag] [--key value ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn with_args<S: Into<String>>(self, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Runs `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").with_args(["-c".to_owned(), script.into()])
    }
}

impl Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        self.args.iter().try_for_each(|arg| write!(f, " {arg}"))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn retry_delays_follow_the_multiplier() {
        let policy = RetryPolicy::new(4, 60, 2.0);

        let delays = (1..=3).map(|a| policy.delay(a)).collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![
                TimeDelta::seconds(60),
                TimeDelta::seconds(120),
                TimeDelta::seconds(240)
            ]
        );
    }

    #[test]
    fn should_retry_until_attempts_are_exhausted() {
        let policy = RetryPolicy::new(3, 1, 2.0);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::never().should_retry(1));
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert_matches!(
            parse_cron("not a cron"),
            Err(ConfigError::InvalidTrigger { .. })
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert_matches!(
            Trigger::Interval { seconds: 0 }.validate(),
            Err(ConfigError::InvalidTrigger { .. })
        );
        assert!(Trigger::every(Duration::from_secs(30)).validate().is_ok());
        assert!(Trigger::Manual.validate().is_ok());
    }

    #[test]
    fn overrides_take_precedence_over_default_args() {
        let definition = PipelineDefinition::new("sync", EntryPoint::new("sync"))
            .with_default_arg("mode", json!("incremental"))
            .with_default_arg("dry_run", json!(false));
        let overrides = Args::from([("mode".to_owned(), json!("full"))]);

        let args = definition.merged_args(&overrides);

        assert_eq!(args["mode"], json!("full"));
        assert_eq!(args["dry_run"], json!(false));
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let definition: PipelineDefinition = toml::from_str(
            r#"
            name = "crm_sync"
            trigger = { type = "cron", expression = "0 2 * * *" }
            entry_point = { program = "python", args = ["-m", "pipelines.crm"] }
            "#,
        )
        .unwrap();

        assert!(definition.enabled);
        assert_eq!(definition.priority, 5);
        assert_eq!(definition.display_name(), "crm_sync");
        assert_eq!(definition.retry, RetryPolicy::default());
        assert_eq!(definition.timeout(), Duration::from_secs(3600));
        assert_eq!(definition.trigger, Trigger::cron("0 2 * * *"));
    }
}
