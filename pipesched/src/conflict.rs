//! Tracks running pipelines and decides whether another may start alongside them.
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use serde::Serialize;

use crate::{
    config::ConfigError,
    job::{ExecutionId, JobContext, JobStatus},
    pipeline::PipelineDefinition,
};

const RECENT_COMPLETIONS: usize = 100;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictCheck {
    pub can_start: bool,
    pub reason: String,
    /// Running pipelines responsible for the refusal.
    pub blocking_jobs: Vec<String>,
}

impl ConflictCheck {
    fn allowed() -> Self {
        Self {
            can_start: true,
            reason: "no conflicts".to_owned(),
            blocking_jobs: Vec::new(),
        }
    }

    fn blocked(reason: impl Into<String>, blocking_jobs: Vec<String>) -> Self {
        Self {
            can_start: false,
            reason: reason.into(),
            blocking_jobs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningJob {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub priority: u8,
    pub attempt: u16,
    pub max_db_connections: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Gatekeeper for admissions based on dependencies, conflicts and the database budget.
///
/// Only refuses new admissions; a job already running is never affected.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    state: Arc<Mutex<RunningSet>>,
    db_connection_budget: u32,
}

#[derive(Debug, Default)]
struct RunningSet {
    running: FxHashMap<String, RunningJob>,
    completions: VecDeque<Completion>,
}

impl RunningSet {
    fn check(&self, name: &str, definition: &PipelineDefinition, budget: u32) -> ConflictCheck {
        if self.running.contains_key(name) {
            return ConflictCheck::blocked(
                format!("{name} is already running"),
                vec![name.to_owned()],
            );
        }

        let dependencies = self.running_among(&definition.depends_on);
        if !dependencies.is_empty() {
            return ConflictCheck::blocked(
                format!("waiting for dependency: {}", dependencies.join(", ")),
                dependencies,
            );
        }

        let conflicts = self.running_among(&definition.conflicts_with);
        if !conflicts.is_empty() {
            return ConflictCheck::blocked(
                format!("conflicting pipeline running: {}", conflicts.join(", ")),
                conflicts,
            );
        }

        let in_use = self
            .running
            .values()
            .map(|job| job.max_db_connections)
            .sum::<u32>();
        let required = definition.max_db_connections;
        if in_use.saturating_add(required) > budget {
            let mut holders = self
                .running
                .values()
                .filter(|job| job.max_db_connections > 0)
                .map(|job| job.pipeline_name.clone())
                .collect::<Vec<_>>();
            holders.sort();
            return ConflictCheck::blocked(
                format!(
                    "database connection budget exceeded: {in_use} in use + {required} required > {budget}"
                ),
                holders,
            );
        }

        ConflictCheck::allowed()
    }

    fn running_among(&self, names: &[String]) -> Vec<String> {
        let mut running = names
            .iter()
            .filter(|name| self.running.contains_key(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        running.sort();
        running.dedup();
        running
    }

    fn insert(&mut self, context: &mut JobContext) {
        context.mark_running();
        let job = RunningJob {
            pipeline_name: context.pipeline_name.clone(),
            execution_id: context.execution_id,
            priority: context.priority,
            attempt: context.attempt,
            max_db_connections: context.definition.max_db_connections,
            started_at: context.started_at.unwrap_or_else(Utc::now),
        };
        if let Some(previous) = self.running.insert(job.pipeline_name.clone(), job) {
            tracing::warn!(
                pipeline = %previous.pipeline_name,
                execution_id = %previous.execution_id,
                "Replaced running entry for {}",
                previous.pipeline_name
            );
        }
    }
}

impl ConflictResolver {
    pub fn new(db_connection_budget: u32) -> Self {
        Self {
            state: Default::default(),
            db_connection_budget,
        }
    }

    pub fn db_connection_budget(&self) -> u32 {
        self.db_connection_budget
    }

    fn state(&self) -> MutexGuard<'_, RunningSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `name` may start now given what is running.
    pub fn can_start(&self, name: &str, definition: &PipelineDefinition) -> ConflictCheck {
        self.state()
            .check(name, definition, self.db_connection_budget)
    }

    /// Records the job as running and stamps its start time.
    ///
    /// Callers must have seen [`ConflictResolver::can_start`] succeed; prefer
    /// [`ConflictResolver::try_register_start`] which checks and registers under one lock.
    pub fn register_start(&self, context: &mut JobContext) {
        self.state().insert(context);
        tracing::debug!(
            pipeline = %context.pipeline_name,
            execution_id = %context.execution_id,
            "Registered start of {}",
            context.pipeline_name
        );
    }

    /// Checks admission and, if allowed, registers the job as running in one step.
    pub fn try_register_start(&self, context: &mut JobContext) -> ConflictCheck {
        let mut state = self.state();
        let check = state.check(
            &context.pipeline_name,
            &context.definition,
            self.db_connection_budget,
        );
        if check.can_start {
            state.insert(context);
        }
        check
    }

    /// Removes `name` from the running set, returning what was removed.
    pub fn register_complete(&self, name: &str, status: JobStatus) -> Option<RunningJob> {
        let mut state = self.state();
        let job = state.running.remove(name)?;
        if state.completions.len() == RECENT_COMPLETIONS {
            state.completions.pop_front();
        }
        state.completions.push_back(Completion {
            pipeline_name: job.pipeline_name.clone(),
            execution_id: job.execution_id,
            status,
            started_at: job.started_at,
            completed_at: Utc::now(),
        });
        tracing::debug!(pipeline = name, %status, "Registered completion of {name}");
        Some(job)
    }

    /// The most urgent pending job that could start right now.
    ///
    /// Lower priority numbers win; ties go to the earliest scheduled time.
    pub fn next_runnable<'a>(&self, pending: &'a [JobContext]) -> Option<&'a JobContext> {
        let state = self.state();
        pending
            .iter()
            .filter(|context| {
                state
                    .check(
                        &context.pipeline_name,
                        &context.definition,
                        self.db_connection_budget,
                    )
                    .can_start
            })
            .min_by_key(|context| (context.priority, context.scheduled_at))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().running.contains_key(name)
    }

    /// Running jobs, oldest first.
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let mut jobs = self.state().running.values().cloned().collect::<Vec<_>>();
        jobs.sort_by(|a, b| {
            (a.started_at, &a.pipeline_name).cmp(&(b.started_at, &b.pipeline_name))
        });
        jobs
    }

    pub fn recent_completions(&self) -> Vec<Completion> {
        self.state().completions.iter().cloned().collect()
    }

    /// Forgets every running job, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let cleared = state.running.len();
        state.running.clear();
        cleared
    }

    /// A recommended execution order honouring `depends_on`.
    ///
    /// Among pipelines whose dependencies are all placed, the most urgent goes first, then by
    /// name. References to pipelines outside `definitions` are ignored. This is a report only;
    /// ordering at runtime comes from the dependency rule of [`ConflictResolver::can_start`].
    pub fn dependency_order<'a>(
        definitions: impl IntoIterator<Item = &'a PipelineDefinition>,
    ) -> Result<Vec<String>, ConfigError> {
        let definitions = definitions
            .into_iter()
            .map(|definition| (definition.name.as_str(), definition))
            .collect::<BTreeMap<_, _>>();

        let mut in_degree = BTreeMap::new();
        let mut dependents = BTreeMap::<&str, Vec<&str>>::new();
        for (name, definition) in &definitions {
            let mut degree = 0;
            for dependency in &definition.depends_on {
                if definitions.contains_key(dependency.as_str()) {
                    degree += 1;
                    dependents.entry(dependency.as_str()).or_default().push(*name);
                }
            }
            in_degree.insert(*name, degree);
        }

        let mut ready = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| Reverse((definitions[name].priority, *name)))
            .collect::<BinaryHeap<_>>();

        let mut order = Vec::with_capacity(definitions.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_owned());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((definitions[dependent].priority, *dependent)));
                    }
                }
            }
        }

        if order.len() < definitions.len() {
            let pipelines = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_owned())
                .collect();
            return Err(ConfigError::DependencyCycle { pipelines });
        }

        Ok(order)
    }
}
