//! The scheduling engine.
//!
//! A [`SchedulingEngine`] registers every enabled, recurring pipeline with a [`TriggerEngine`].
//! Each fire goes through the same steps:
//!
//! 1. admission by the [`ConflictResolver`]; a blocked job is parked on the pending list,
//! 2. a "running" history record,
//! 3. the pipeline's resource group slot and its database connections from the
//!    [`ResourceManager`], each waited for up to the admission timeout,
//! 4. execution by the [`PipelineExecutor`] under the pipeline's timeout,
//! 5. the completion record, alerts, and a retry one-shot if attempts remain,
//! 6. a drain of the pending list, re-dispatching the most urgent job that can now start.
//!
//! History and alert failures are logged and never stop a run. History calls are bounded by
//! [`EngineConfig::sink_timeout`] and alerts are delivered in the background.
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::instrument;

use crate::{
    alert::{
        Alert, AlertError, AlertSink, FailureAlert, LoggingAlertSink, RetryAlert, TimeoutAlert,
    },
    config::{ConfigSource, EngineConfig},
    conflict::{ConflictResolver, RunningJob},
    executor::{ExecutionResult, OutputBuffer, PipelineExecutor, ProcessLauncher},
    history::{CompletionRecord, HistoryError, HistoryRecord, HistoryStore, InMemoryHistory},
    job::{ExecutionId, JobContext, JobStatus, TriggeredBy},
    pipeline::{Args, PipelineRegistry},
    resource::{ResourceError, ResourceManager, ResourcePermit, ResourceUsage, DB_POOL},
    trigger::{self, JobCallback, LocalTriggerEngine, TriggerEngine, TriggerError},
    PipeschedError,
};

mod tasks;

use tasks::BackgroundTask;

/// Lifecycle of a [`SchedulingEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A job waiting on the pending list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJob {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub priority: u8,
    pub attempt: u16,
    pub triggered_by: TriggeredBy,
    pub scheduled_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    /// Why admission was refused when the job was queued.
    pub reason: String,
    pub blocking_jobs: Vec<String>,
}

/// Point in time view of an engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub running: Vec<RunningJob>,
    pub pending: Vec<PendingJob>,
    pub resources: Vec<ResourceUsage>,
    /// Trigger ids of the scheduled pipelines.
    pub scheduled: Vec<String>,
}

/// Schedules and supervises pipeline runs.
///
/// Cloning is cheap; clones drive the same engine. Triggers only hold the engine weakly, so
/// dropping the last clone stops scheduling: later fires find no engine and do nothing.
#[derive(Clone)]
pub struct SchedulingEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SchedulingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.inner.lifecycle();
        f.debug_struct("SchedulingEngine")
            .field("state", &lifecycle.state)
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

/// Builds a [`SchedulingEngine`].
///
/// Anything not supplied gets a local default: resources from [`EngineConfig::resources`],
/// an [`InMemoryHistory`], a [`LoggingAlertSink`], a [`LocalTriggerEngine`] with
/// [`EngineConfig::max_workers`] workers, and real child processes.
pub struct SchedulingEngineBuilder {
    config: EngineConfig,
    source: Box<dyn ConfigSource>,
    resources: Option<ResourceManager>,
    history: Option<Arc<dyn HistoryStore>>,
    alerts: Option<Arc<dyn AlertSink>>,
    triggers: Option<Arc<dyn TriggerEngine>>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
}

impl SchedulingEngineBuilder {
    pub fn with_resources(self, resources: ResourceManager) -> Self {
        Self {
            resources: Some(resources),
            ..self
        }
    }

    pub fn with_history(self, history: impl HistoryStore + 'static) -> Self {
        Self {
            history: Some(Arc::new(history)),
            ..self
        }
    }

    pub fn with_alerts(self, alerts: impl AlertSink + 'static) -> Self {
        Self {
            alerts: Some(Arc::new(alerts)),
            ..self
        }
    }

    pub fn with_trigger_engine(self, triggers: impl TriggerEngine + 'static) -> Self {
        Self {
            triggers: Some(Arc::new(triggers)),
            ..self
        }
    }

    pub fn with_launcher(self, launcher: impl ProcessLauncher + 'static) -> Self {
        Self {
            launcher: Some(Arc::new(launcher)),
            ..self
        }
    }

    /// The database connection budget is the `db_pool` limit of the resources in use, so an
    /// injected [`ResourceManager`] that has one overrides [`EngineConfig::resources`].
    pub fn build(self) -> SchedulingEngine {
        let resources = self
            .resources
            .unwrap_or_else(|| ResourceManager::new(self.config.resources.clone()));
        let budget = match resources.usage(DB_POOL) {
            Ok(usage) => u32::try_from(usage.limit).unwrap_or(u32::MAX),
            Err(_) => {
                let budget = self.config.db_connection_budget();
                resources.set_limit(DB_POOL, budget as usize);
                budget
            }
        };

        let executor = match self.launcher {
            Some(launcher) => PipelineExecutor::with_launcher(launcher),
            None => PipelineExecutor::default(),
        }
        .with_kill_grace_period(self.config.kill_grace_period())
        .with_poll_interval(self.config.stream_poll_interval());

        let triggers = self
            .triggers
            .unwrap_or_else(|| Arc::new(LocalTriggerEngine::new(self.config.max_workers)));

        SchedulingEngine {
            inner: Arc::new(EngineInner {
                host: self.config.host_name(),
                source: self.source,
                resources,
                conflicts: ConflictResolver::new(budget),
                executor,
                history: self
                    .history
                    .unwrap_or_else(|| Arc::new(InMemoryHistory::new())),
                alerts: self.alerts.unwrap_or_else(|| Arc::new(LoggingAlertSink)),
                triggers,
                loaded: Default::default(),
                pending: Default::default(),
                lifecycle: Mutex::new(Lifecycle {
                    state: EngineState::Created,
                    started_at: None,
                    last_heartbeat: None,
                }),
                cancellation: CancellationToken::new(),
                tasks: TaskTracker::new(),
                config: self.config,
            }),
        }
    }
}

impl SchedulingEngine {
    pub fn builder(
        config: EngineConfig,
        source: impl ConfigSource + 'static,
    ) -> SchedulingEngineBuilder {
        SchedulingEngineBuilder {
            config,
            source: Box::new(source),
            resources: None,
            history: None,
            alerts: None,
            triggers: None,
            launcher: None,
        }
    }

    /// Loads the pipelines, registers their triggers and starts the heartbeat and reload tasks.
    pub async fn start(&self) -> Result<(), PipeschedError> {
        self.inner.expect_created()?;
        let (registry, hash) = self.inner.load().await?;
        let pipelines = registry.len();
        let scheduled = self.inner.install(registry, hash)?;

        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.state != EngineState::Created {
                return Err(PipeschedError::AlreadyStarted);
            }
            let now = Utc::now();
            lifecycle.state = EngineState::Running;
            lifecycle.started_at = Some(now);
            lifecycle.last_heartbeat = Some(now);
        }

        for task in [BackgroundTask::Heartbeat, BackgroundTask::Reload] {
            task.spawn(
                Arc::downgrade(&self.inner),
                &self.inner.tasks,
                self.inner.cancellation.clone(),
            );
        }

        tracing::info!(
            pipelines,
            scheduled,
            host = %self.inner.host,
            "Scheduling engine started with {pipelines} pipelines, {scheduled} scheduled"
        );
        Ok(())
    }

    /// Stops the engine.
    ///
    /// With `wait`, fires already in progress are allowed to finish before the remaining
    /// executions are cancelled. Runs still waiting for resources end as cancelled without
    /// starting, and queued jobs are dropped. Calling this more than once is a no-op.
    pub async fn stop(&self, wait: bool) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if matches!(
                lifecycle.state,
                EngineState::Stopping | EngineState::Stopped
            ) {
                return;
            }
            lifecycle.state = EngineState::Stopping;
        }
        tracing::info!(wait, "Stopping scheduling engine");

        self.inner.cancellation.cancel();
        self.inner.triggers.shutdown(wait).await;
        let cancelled = self.inner.executor.cancel_all();
        let dropped = std::mem::take(&mut *self.inner.pending()).len();
        let cleared = self.inner.conflicts.clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        self.inner.lifecycle().state = EngineState::Stopped;
        tracing::info!(
            cancelled,
            dropped,
            cleared,
            "Scheduling engine stopped"
        );
    }

    /// Runs `name` now, outside its schedule.
    ///
    /// The run goes through the same admission as a scheduled fire: it either starts straight
    /// away or joins the pending list.
    pub fn run_now(
        &self,
        name: &str,
        overrides: Args,
        triggered_by: TriggeredBy,
    ) -> Result<ExecutionId, PipeschedError> {
        if !self.inner.is_accepting() {
            return Err(PipeschedError::NotRunning);
        }
        let definition = self
            .inner
            .registry()
            .get(name)
            .ok_or_else(|| PipeschedError::UnknownPipeline(name.to_owned()))?;
        if !definition.enabled {
            return Err(PipeschedError::PipelineDisabled(name.to_owned()));
        }

        let context = JobContext::new(definition, triggered_by).with_overrides(overrides);
        let execution_id = context.execution_id;
        tracing::info!(
            pipeline = name,
            %execution_id,
            triggered_by = %context.triggered_by,
            "Run of {name} requested"
        );
        self.inner.submit_now(context)?;
        Ok(execution_id)
    }

    /// Cancels a queued or running execution. Returns whether it was found.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        let removed = {
            let mut pending = self.inner.pending();
            pending
                .iter()
                .position(|queued| queued.context.execution_id == execution_id)
                .map(|index| pending.remove(index))
        };
        if let Some(mut queued) = removed {
            queued.context.status = JobStatus::Cancelled;
            tracing::info!(
                pipeline = %queued.context.pipeline_name,
                %execution_id,
                "Cancelled queued run of {}",
                queued.context.pipeline_name
            );
            return true;
        }
        self.inner.executor.cancel(execution_id)
    }

    /// Jobs waiting for admission, in the order they were queued.
    pub fn pending_jobs(&self) -> Vec<PendingJob> {
        self.inner.pending().iter().map(QueuedJob::describe).collect()
    }

    pub fn running(&self) -> Vec<RunningJob> {
        self.inner.conflicts.running_jobs()
    }

    /// Live output of a running execution.
    pub fn output(&self, execution_id: ExecutionId) -> Option<OutputBuffer> {
        self.inner.executor.output(execution_id)
    }

    /// The loaded pipelines.
    pub fn pipelines(&self) -> Arc<PipelineRegistry> {
        self.inner.registry()
    }

    /// A recommended execution order of the loaded pipelines honouring their dependencies.
    pub fn dependency_order(&self) -> Result<Vec<String>, PipeschedError> {
        let registry = self.inner.registry();
        Ok(ConflictResolver::dependency_order(
            registry.iter().map(|definition| definition.as_ref()),
        )?)
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn status(&self) -> Result<EngineStatus, PipeschedError> {
        let (state, started_at, last_heartbeat) = {
            let lifecycle = self.inner.lifecycle();
            (
                lifecycle.state,
                lifecycle.started_at,
                lifecycle.last_heartbeat,
            )
        };
        Ok(EngineStatus {
            state,
            started_at,
            last_heartbeat,
            running: self.running(),
            pending: self.pending_jobs(),
            resources: self.inner.resources.usage_all()?,
            scheduled: self
                .inner
                .registry()
                .scheduled()
                .map(|definition| definition.name.clone())
                .collect(),
        })
    }

    /// Re-reads the configuration source and swaps in the new pipelines if it changed.
    ///
    /// Runs already in progress keep the definition they started with. Returns whether a new
    /// configuration was installed. An invalid configuration leaves the current one in place.
    pub async fn reload_if_changed(&self) -> Result<bool, PipeschedError> {
        self.inner.reload_if_changed().await
    }
}

struct EngineInner {
    config: EngineConfig,
    host: String,
    source: Box<dyn ConfigSource>,
    resources: ResourceManager,
    conflicts: ConflictResolver,
    executor: PipelineExecutor,
    history: Arc<dyn HistoryStore>,
    alerts: Arc<dyn AlertSink>,
    triggers: Arc<dyn TriggerEngine>,
    loaded: RwLock<Loaded>,
    pending: Mutex<Vec<QueuedJob>>,
    lifecycle: Mutex<Lifecycle>,
    cancellation: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Default)]
struct Loaded {
    registry: Arc<PipelineRegistry>,
    hash: Option<u64>,
}

struct Lifecycle {
    state: EngineState,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

struct QueuedJob {
    context: JobContext,
    reason: String,
    blocking_jobs: Vec<String>,
}

impl QueuedJob {
    fn describe(&self) -> PendingJob {
        let context = &self.context;
        PendingJob {
            pipeline_name: context.pipeline_name.clone(),
            execution_id: context.execution_id,
            priority: context.priority,
            attempt: context.attempt,
            triggered_by: context.triggered_by.clone(),
            scheduled_at: context.scheduled_at,
            queued_at: context.queued_at,
            reason: self.reason.clone(),
            blocking_jobs: self.blocking_jobs.clone(),
        }
    }
}

/// Whether a dispatched job still has to pass admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Required,
    Granted,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

impl EngineInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Vec<QueuedJob>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> Arc<PipelineRegistry> {
        Arc::clone(
            &self
                .loaded
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .registry,
        )
    }

    fn loaded_hash(&self) -> Option<u64> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hash
    }

    fn is_accepting(&self) -> bool {
        self.lifecycle().state == EngineState::Running
    }

    fn expect_created(&self) -> Result<(), PipeschedError> {
        match self.lifecycle().state {
            EngineState::Created => Ok(()),
            _ => Err(PipeschedError::AlreadyStarted),
        }
    }

    fn beat(&self) {
        let now = Utc::now();
        self.lifecycle().last_heartbeat = Some(now);
        tracing::trace!(host = %self.host, "Heartbeat at {now}");
    }

    async fn load(&self) -> Result<(PipelineRegistry, u64), PipeschedError> {
        let set = self.source.load().await?;
        let registry =
            PipelineRegistry::new(set.definitions, self.conflicts.db_connection_budget())?;
        registry.check_resource_groups(&self.resources)?;
        Ok((registry, set.hash))
    }

    async fn reload_if_changed(self: &Arc<Self>) -> Result<bool, PipeschedError> {
        if !self.is_accepting() {
            return Err(PipeschedError::NotRunning);
        }
        let hash = self.source.content_hash().await?;
        if self.loaded_hash() == Some(hash) {
            return Ok(false);
        }

        let (registry, hash) = self.load().await?;
        let pipelines = registry.len();
        let scheduled = self.install(registry, hash)?;
        tracing::info!(
            pipelines,
            scheduled,
            "Reloaded pipeline configuration with {pipelines} pipelines, {scheduled} scheduled"
        );
        Ok(true)
    }

    /// Swaps in `registry` and re-registers the recurring triggers. Returns how many there are.
    fn install(
        self: &Arc<Self>,
        registry: PipelineRegistry,
        hash: u64,
    ) -> Result<usize, TriggerError> {
        let registry = Arc::new(registry);
        let previous = {
            let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(
                &mut *loaded,
                Loaded {
                    registry: Arc::clone(&registry),
                    hash: Some(hash),
                },
            )
        };

        for definition in previous.registry.scheduled() {
            self.triggers.remove(&definition.name);
        }

        let mut scheduled = 0;
        for definition in registry.scheduled() {
            self.triggers.register(
                &definition.name,
                &definition.trigger,
                self.schedule_callback(&definition.name),
            )?;
            tracing::debug!(
                pipeline = %definition.name,
                trigger = %definition.trigger,
                "Scheduled {}",
                definition.name
            );
            scheduled += 1;
        }
        Ok(scheduled)
    }

    fn schedule_callback(self: &Arc<Self>, name: &str) -> JobCallback {
        let engine = Arc::downgrade(self);
        let name = name.to_owned();
        trigger::callback(move || {
            let engine = Weak::clone(&engine);
            let name = name.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.on_schedule(&name).await;
                }
            }
        })
    }

    async fn on_schedule(self: Arc<Self>, name: &str) {
        let Some(definition) = self.registry().get(name).filter(|definition| definition.enabled)
        else {
            tracing::debug!(
                pipeline = name,
                "Ignoring fire of unknown or disabled pipeline {name}"
            );
            return;
        };
        let context = JobContext::new(definition, TriggeredBy::Schedule);
        self.dispatch(context, Admission::Required).await;
    }

    /// Fires `context` once at `run_at` through the trigger engine.
    fn schedule(
        self: &Arc<Self>,
        job_id: String,
        run_at: DateTime<Utc>,
        context: JobContext,
        admission: Admission,
    ) -> Result<(), TriggerError> {
        let engine = Arc::downgrade(self);
        let callback = trigger::callback(move || {
            let engine = Weak::clone(&engine);
            let context = context.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.dispatch(context, admission).await;
                }
            }
        });
        self.triggers.add_one_shot(&job_id, run_at, callback)
    }

    fn submit_now(self: &Arc<Self>, context: JobContext) -> Result<(), TriggerError> {
        let Some(context) = self.admit(context) else {
            return Ok(());
        };
        let name = context.pipeline_name.clone();
        let job_id = format!("{name}:manual:{}", context.execution_id);
        self.schedule(job_id, Utc::now(), context, Admission::Granted)
            .inspect_err(|_| {
                self.conflicts.register_complete(&name, JobStatus::Cancelled);
            })
    }

    fn dispatch(
        self: Arc<Self>,
        context: JobContext,
        admission: Admission,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !self.is_accepting() {
                tracing::debug!(
                    pipeline = %context.pipeline_name,
                    execution_id = %context.execution_id,
                    "Engine is not running, dropping run of {}",
                    context.pipeline_name
                );
                if admission == Admission::Granted {
                    self.conflicts
                        .register_complete(&context.pipeline_name, JobStatus::Cancelled);
                }
                return;
            }
            let context = match admission {
                Admission::Granted => context,
                Admission::Required => match self.admit(context) {
                    Some(context) => context,
                    None => return,
                },
            };
            self.run(context).await;
        })
    }

    /// Registers `context` as running, or queues it if it may not start yet.
    fn admit(&self, mut context: JobContext) -> Option<JobContext> {
        let check = self.conflicts.try_register_start(&mut context);
        if check.can_start {
            return Some(context);
        }

        let mut pending = self.pending();
        if context.triggered_by == TriggeredBy::Schedule
            && pending.iter().any(|queued| {
                queued.context.pipeline_name == context.pipeline_name
                    && queued.context.triggered_by == TriggeredBy::Schedule
            })
        {
            tracing::debug!(
                pipeline = %context.pipeline_name,
                "Scheduled run of {} is already queued, skipping this fire",
                context.pipeline_name
            );
            return None;
        }

        tracing::info!(
            pipeline = %context.pipeline_name,
            execution_id = %context.execution_id,
            reason = %check.reason,
            blocking_jobs = ?check.blocking_jobs,
            "Queued {}: {}",
            context.pipeline_name,
            check.reason
        );
        context.mark_queued();
        pending.push(QueuedJob {
            context,
            reason: check.reason,
            blocking_jobs: check.blocking_jobs,
        });
        None
    }

    #[instrument(
        skip_all,
        fields(
            pipeline = %context.pipeline_name,
            execution_id = %context.execution_id,
            attempt = context.attempt,
        )
    )]
    async fn run(self: &Arc<Self>, context: JobContext) {
        let definition = Arc::clone(&context.definition);
        let name = context.pipeline_name.as_str();
        let execution_id = context.execution_id;

        let _ = self
            .bounded(
                self.history
                    .record_start(HistoryRecord::running(&context, &self.host)),
            )
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to record start of {name}: {err}")
            });

        let admitted_at = Instant::now();
        let acquired = tokio::select! {
            acquired = self.acquire_resources(&context) => Some(acquired),
            _ = self.cancellation.cancelled() => None,
        };
        let result = match acquired {
            // Checked again once the slots are ours: `stop` may have begun while waiting.
            Some(Ok(_permits)) if self.is_accepting() => {
                tracing::info!(entry_point = %definition.entry_point, "Starting {name}");
                let result = self
                    .executor
                    .execute_streaming(
                        &definition.entry_point,
                        &context.args(),
                        execution_id,
                        definition.timeout(),
                    )
                    .await;
                self.executor.discard_output(execution_id);
                result
            }
            Some(Ok(_)) | None => {
                tracing::info!("Engine stopped before {name} could start");
                ExecutionResult::cancelled_before_start(admitted_at.elapsed())
            }
            Some(Err(err)) => {
                tracing::warn!(?err, "Could not acquire resources for {name}: {err}");
                ExecutionResult::not_started(err.to_string(), admitted_at.elapsed())
            }
        };

        let status = result.status();
        let _ = self
            .bounded(
                self.history
                    .record_completion(execution_id, CompletionRecord::from_result(&result)),
            )
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to record completion of {name}: {err}")
            });
        self.conflicts.register_complete(name, status);

        match status {
            JobStatus::Completed => tracing::info!(
                records_processed = ?result.records_processed,
                duration = ?result.duration,
                "Pipeline {name} completed"
            ),
            JobStatus::Cancelled => tracing::info!("Pipeline {name} was cancelled"),
            _ => self.handle_failure(&context, &result),
        }

        self.drain();
    }

    /// Takes the resource group slot, then the database connections.
    async fn acquire_resources(
        &self,
        context: &JobContext,
    ) -> Result<Vec<ResourcePermit>, ResourceError> {
        let definition = &context.definition;
        let timeout = self.config.admission_timeout();
        let mut permits = Vec::with_capacity(2);
        if let Some(group) = &definition.resource_group {
            permits.push(
                self.resources
                    .acquire(group, 1, timeout, &context.pipeline_name)
                    .await?,
            );
        }
        if definition.max_db_connections > 0 {
            permits.push(
                self.resources
                    .acquire(
                        DB_POOL,
                        definition.max_db_connections as usize,
                        timeout,
                        &context.pipeline_name,
                    )
                    .await?,
            );
        }
        Ok(permits)
    }

    /// Waits up to the sink timeout for a history store call.
    async fn bounded(
        &self,
        call: impl Future<Output = Result<(), HistoryError>>,
    ) -> Result<(), HistoryError> {
        let timeout = self.config.sink_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(HistoryError::Timeout(timeout)))
    }

    /// Delivers `alert` in the background so a slow sink never holds up scheduling.
    fn send_alert(&self, alert: Alert) {
        let alerts = Arc::clone(&self.alerts);
        let timeout = self.config.sink_timeout();
        self.tasks.spawn(async move {
            let pipeline = alert.pipeline_name().to_owned();
            let delivery = async {
                match alert {
                    Alert::Failure(alert) => alerts.send_failure_alert(alert).await,
                    Alert::Retry(alert) => alerts.send_retry_alert(alert).await,
                    Alert::Timeout(alert) => alerts.send_timeout_alert(alert).await,
                }
            };
            match tokio::time::timeout(timeout, delivery).await {
                Ok(delivered) => {
                    let _ = delivered.inspect_err(log_alert_error);
                }
                Err(_elapsed) => tracing::error!(
                    pipeline = %pipeline,
                    ?timeout,
                    "Alert sink did not respond within {timeout:?} for {pipeline}"
                ),
            }
        });
    }

    fn handle_failure(self: &Arc<Self>, context: &JobContext, result: &ExecutionResult) {
        let definition = &context.definition;
        let name = &context.pipeline_name;
        let error_message = result
            .error
            .clone()
            .unwrap_or_else(|| format!("Pipeline exited with code {}", result.exit_code));
        tracing::error!(
            exit_code = result.exit_code,
            termination = ?result.termination,
            "Pipeline {name} failed on attempt {}/{}: {error_message}",
            context.attempt,
            context.max_attempts(),
        );

        self.send_alert(if result.timed_out() {
            Alert::Timeout(TimeoutAlert {
                pipeline_name: name.clone(),
                execution_id: context.execution_id,
                timeout_seconds: definition.timeout_seconds,
            })
        } else {
            Alert::Failure(FailureAlert {
                pipeline_name: name.clone(),
                execution_id: context.execution_id,
                error_message: error_message.clone(),
                attempt: context.attempt,
                max_attempts: context.max_attempts(),
                duration: result.duration,
            })
        });

        if context.is_final_attempt() {
            if context.max_attempts() > 1 {
                tracing::warn!("Giving up on {name} after {} attempts", context.attempt);
            }
            return;
        }
        if !self.is_accepting() {
            return;
        }

        let delay = definition.retry.delay(context.attempt);
        let run_at = Utc::now() + delay;
        let retry = context.next_attempt(run_at);
        self.send_alert(Alert::Retry(RetryAlert {
            pipeline_name: name.clone(),
            execution_id: context.execution_id,
            error_message,
            attempt: context.attempt,
            max_attempts: context.max_attempts(),
            retry_delay_seconds: u64::try_from(delay.num_seconds()).unwrap_or_default(),
        }));

        let job_id = format!("{name}:retry:{}", retry.execution_id);
        tracing::info!(
            retry_execution_id = %retry.execution_id,
            "Retrying {name} at {run_at} as attempt {}",
            retry.attempt
        );
        let _ = self
            .schedule(job_id, run_at, retry, Admission::Required)
            .inspect_err(|err| tracing::error!(?err, "Failed to schedule retry of {name}: {err}"));
    }

    /// Re-dispatches the most urgent queued job that can start now.
    fn drain(self: &Arc<Self>) {
        if !self.is_accepting() {
            return;
        }
        let snapshot = self
            .pending()
            .iter()
            .map(|queued| queued.context.clone())
            .collect::<Vec<_>>();
        let Some(next) = self
            .conflicts
            .next_runnable(&snapshot)
            .map(|context| context.execution_id)
        else {
            return;
        };

        let queued = {
            let mut pending = self.pending();
            let Some(index) = pending
                .iter()
                .position(|queued| queued.context.execution_id == next)
            else {
                return;
            };
            pending.remove(index)
        };

        let mut context = queued.context;
        context.triggered_by = TriggeredBy::Queue;
        let name = context.pipeline_name.clone();
        tracing::debug!(
            pipeline = %name,
            execution_id = %context.execution_id,
            "Dispatching queued run of {name}"
        );
        let job_id = format!("{name}:queue:{}", context.execution_id);
        let _ = self
            .schedule(job_id, Utc::now(), context, Admission::Required)
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to dispatch queued run of {name}: {err}")
            });
    }
}

fn log_alert_error(err: &AlertError) {
    tracing::error!(?err, "Failed to send alert: {err}");
}
