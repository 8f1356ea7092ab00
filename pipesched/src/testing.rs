//! Helpers for testing.
//!
//! - [`FakeLauncher`] and [`FakeProcess`] stand in for real child processes, following the tokio
//!   clock so tests can run with time paused.
//! - [`ManualTriggerEngine`] only fires when a test tells it to.
//! - [`RecordingAlertSink`] keeps every alert it receives.
//! - [`assert_recorded!`] makes assertions about an [`InMemoryHistory`](crate::history::InMemoryHistory).
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io::{self, Cursor},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    alert::{Alert, AlertError, AlertSink, FailureAlert, RetryAlert, TimeoutAlert},
    executor::{OutputPipe, ProcessHandle, ProcessLauncher},
    job::ExecutionId,
    pipeline::Trigger,
    trigger::{JobCallback, TriggerEngine, TriggerError},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A macro for making assertions about recorded history.
///
/// # Example
///
/// ```
/// # use pipesched::prelude::*;
/// # use pipesched::history::{HistoryRecord, HistoryStore, InMemoryHistory};
/// # use pipesched::testing::assert_recorded;
/// # use std::sync::Arc;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let history = InMemoryHistory::new();
/// let definition = Arc::new(PipelineDefinition::new("crm_sync", EntryPoint::new("crm")));
///
/// for attempt in 1..=2 {
///     let context = JobContext::new(definition.clone(), TriggeredBy::Schedule).with_attempt(attempt);
///     history
///         .record_start(HistoryRecord::running(&context, "worker-1"))
///         .await
///         .unwrap();
/// }
///
/// assert_recorded!(in: history, for_pipeline: "crm_sync", with_attempt: 2);
///
/// assert_recorded!(
///     2 records,
///     in: history,
///     for_pipeline: "crm_sync",
///     with_status: JobStatus::Running,
///     triggered_by: TriggeredBy::Schedule,
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_recorded {
    (1 record, in: $history:ident, $($tail:tt)*) => {
        $crate::assert_recorded!(@internal 1 in: $history, $($tail)*);
    };
    ($n:literal records, in: $history:ident, $($tail:tt)*) => {
        $crate::assert_recorded!(@internal $n in: $history, $($tail)*);
    };
    (in: $history:ident, $($tail:tt)*) => {{
        use $crate::history::HistoryQuery;
        let mut queries = Vec::new();
        $crate::assert_recorded!(@query queries; $($tail)*);
        let entries = $history.query(&HistoryQuery::And(queries));
        let all_entries = $history.all();
        assert!(
            !entries.is_empty(),
            "No history recorded {}\n\nAll history:\n{all_entries:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal in: $history:ident, $($tail:tt)*) => {{
        use $crate::history::HistoryQuery;
        let mut queries = Vec::new();
        $crate::assert_recorded!(@query queries; $($tail)*);
        let entries = $history.query(&HistoryQuery::And(queries));
        let all_entries = $history.all();
        assert!(
            entries.len() == $n,
            "Unexpected number of history records {},\n\n\
            Expected {} records, found {} matching:\n\n\
            Matching records:\n\
            {entries:#?}\n\n\
            All history:\n\
            {all_entries:#?}",
            stringify!($($tail)*),
            $n,
            entries.len(),
        );
    }};
    (@query $vec:ident;) => {};
    (@query $vec:ident; for_pipeline: $name:expr $(, $($tail:tt)*)?) => {
        $vec.push(HistoryQuery::PipelineEquals($name));
        $($crate::assert_recorded!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push(HistoryQuery::StatusEqual($status));
        $($crate::assert_recorded!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_attempt: $attempt:expr $(, $($tail:tt)*)?) => {
        $vec.push(HistoryQuery::AttemptEqual($attempt));
        $($crate::assert_recorded!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; triggered_by: $triggered_by:expr $(, $($tail:tt)*)?) => {
        $vec.push(HistoryQuery::TriggeredBy($triggered_by));
        $($crate::assert_recorded!(@query $vec; $($tail)*);)?
    };
}

pub use assert_recorded;

/// A signal sent to a [`FakeProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSignal {
    Terminate,
    Kill,
}

/// Script for a fake child process.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    exit_code: i32,
    /// `None` runs until signalled.
    runtime: Option<Duration>,
    stdout: String,
    stderr: String,
    ignores_terminate: bool,
    loses_track: bool,
}

impl FakeProcess {
    /// Exits with `exit_code` as soon as it is waited on.
    pub fn exits(exit_code: i32) -> Self {
        Self {
            exit_code,
            runtime: Some(Duration::ZERO),
            stdout: String::new(),
            stderr: String::new(),
            ignores_terminate: false,
            loses_track: false,
        }
    }

    /// Runs until terminated or killed.
    pub fn hangs() -> Self {
        Self {
            runtime: None,
            ..Self::exits(0)
        }
    }

    pub fn with_runtime(self, runtime: Duration) -> Self {
        Self {
            runtime: Some(runtime),
            ..self
        }
    }

    pub fn with_stdout(self, stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..self
        }
    }

    pub fn with_stderr(self, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ..self
        }
    }

    /// Only a kill stops this process.
    pub fn ignoring_terminate(self) -> Self {
        Self {
            ignores_terminate: true,
            ..self
        }
    }

    /// Waiting on this process fails with an I/O error.
    pub fn losing_track(self) -> Self {
        Self {
            loses_track: true,
            ..self
        }
    }
}

/// One call to [`FakeLauncher::launch`](ProcessLauncher::launch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    pub execution_id: ExecutionId,
    pub signals: Vec<FakeSignal>,
}

#[derive(Debug)]
struct LaunchRecord {
    program: String,
    args: Vec<String>,
    execution_id: ExecutionId,
    signals: Arc<Mutex<Vec<FakeSignal>>>,
}

/// Launches [`FakeProcess`]es scripted per program.
///
/// Each launch of a program takes the next queued script; the last one is reused for every
/// later launch. Launching a program with no script fails with [`io::ErrorKind::NotFound`].
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    scripts: Arc<Mutex<HashMap<String, VecDeque<FakeProcess>>>>,
    launches: Arc<Mutex<Vec<LaunchRecord>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(self, program: impl Into<String>, process: FakeProcess) -> Self {
        self.push_process(program, process);
        self
    }

    pub fn push_process(&self, program: impl Into<String>, process: FakeProcess) {
        lock(&self.scripts)
            .entry(program.into())
            .or_default()
            .push_back(process);
    }

    pub fn launches(&self) -> Vec<Launch> {
        lock(&self.launches)
            .iter()
            .map(|record| Launch {
                program: record.program.clone(),
                args: record.args.clone(),
                execution_id: record.execution_id,
                signals: lock(&record.signals).clone(),
            })
            .collect()
    }

    pub fn launches_of(&self, program: &str) -> Vec<Launch> {
        self.launches()
            .into_iter()
            .filter(|launch| launch.program == program)
            .collect()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        execution_id: ExecutionId,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let script = {
            let mut scripts = lock(&self.scripts);
            let queue = scripts.get_mut(program).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no such program {program}"))
            })?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, program.to_owned()))?;

        let signals = Arc::default();
        lock(&self.launches).push(LaunchRecord {
            program: program.to_owned(),
            args: args.to_vec(),
            execution_id,
            signals: Arc::clone(&signals),
        });

        let now = Instant::now();
        Ok(Box::new(RunningFake {
            exit_at: script.runtime.map(|runtime| now + runtime),
            stdout: Some(script.stdout.clone().into_bytes()),
            stderr: Some(script.stderr.clone().into_bytes()),
            script,
            signals,
            terminated: false,
            killed: false,
        }))
    }
}

struct RunningFake {
    script: FakeProcess,
    exit_at: Option<Instant>,
    signals: Arc<Mutex<Vec<FakeSignal>>>,
    terminated: bool,
    killed: bool,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

impl RunningFake {
    fn exited(&self) -> Option<i32> {
        if self.killed {
            Some(137)
        } else if self.terminated && !self.script.ignores_terminate {
            Some(143)
        } else {
            self.exit_at
                .filter(|at| *at <= Instant::now())
                .map(|_| self.script.exit_code)
        }
    }
}

#[async_trait]
impl ProcessHandle for RunningFake {
    fn id(&self) -> Option<u32> {
        self.exited().is_none().then_some(4242)
    }

    async fn wait(&mut self, timeout: Duration) -> io::Result<Option<i32>> {
        if let Some(code) = self.exited() {
            return Ok(Some(code));
        }
        if self.script.loses_track {
            return Err(io::Error::other("lost the child process"));
        }
        let deadline = Instant::now() + timeout;
        match self.exit_at {
            Some(at) if at <= deadline => {
                tokio::time::sleep_until(at).await;
                Ok(Some(self.script.exit_code))
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        lock(&self.signals).push(FakeSignal::Terminate);
        self.terminated = true;
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        lock(&self.signals).push(FakeSignal::Kill);
        self.killed = true;
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as OutputPipe)
    }
}

/// A [`TriggerEngine`] that only fires when told to.
///
/// Callbacks run on the calling task, so `fire` returns once the fired job has been handled.
#[derive(Clone, Default)]
pub struct ManualTriggerEngine {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    recurring: BTreeMap<String, (Trigger, JobCallback)>,
    one_shots: BTreeMap<String, (DateTime<Utc>, JobCallback)>,
    shut_down: bool,
}

impl std::fmt::Debug for ManualTriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ManualTriggerEngine")
            .field("recurring", &state.recurring.keys().collect::<Vec<_>>())
            .field("one_shots", &state.one_shots.keys().collect::<Vec<_>>())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl ManualTriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the recurring job `job_id`. Returns whether it was registered.
    pub async fn fire(&self, job_id: &str) -> bool {
        let callback = lock(&self.state)
            .recurring
            .get(job_id)
            .map(|(_, callback)| Arc::clone(callback));
        match callback {
            Some(callback) => {
                callback().await;
                true
            }
            None => false,
        }
    }

    /// Fires and removes every pending one-shot in `run_at` order, including any added while
    /// doing so. Returns how many fired.
    pub async fn fire_one_shots(&self) -> usize {
        let mut fired = 0;
        loop {
            let next = {
                let mut state = lock(&self.state);
                let next = state
                    .one_shots
                    .iter()
                    .min_by_key(|(id, (run_at, _))| (*run_at, (*id).clone()))
                    .map(|(id, _)| id.clone());
                next.and_then(|id| state.one_shots.remove(&id))
            };
            let Some((_, callback)) = next else {
                return fired;
            };
            callback().await;
            fired += 1;
        }
    }

    /// Pending one-shots and when they are due.
    pub fn one_shots(&self) -> Vec<(String, DateTime<Utc>)> {
        lock(&self.state)
            .one_shots
            .iter()
            .map(|(id, (run_at, _))| (id.clone(), *run_at))
            .collect()
    }

    pub fn trigger_of(&self, job_id: &str) -> Option<Trigger> {
        lock(&self.state)
            .recurring
            .get(job_id)
            .map(|(trigger, _)| trigger.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}

#[async_trait]
impl TriggerEngine for ManualTriggerEngine {
    fn register(
        &self,
        job_id: &str,
        trigger: &Trigger,
        callback: JobCallback,
    ) -> Result<(), TriggerError> {
        if !trigger.is_recurring() {
            return Err(TriggerError::NotRecurring(job_id.to_owned()));
        }
        let mut state = lock(&self.state);
        if state.shut_down {
            return Err(TriggerError::ShutDown);
        }
        state
            .recurring
            .insert(job_id.to_owned(), (trigger.clone(), callback));
        Ok(())
    }

    fn remove(&self, job_id: &str) -> bool {
        let mut state = lock(&self.state);
        state.recurring.remove(job_id).is_some() || state.one_shots.remove(job_id).is_some()
    }

    fn add_one_shot(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        callback: JobCallback,
    ) -> Result<(), TriggerError> {
        let mut state = lock(&self.state);
        if state.shut_down {
            return Err(TriggerError::ShutDown);
        }
        state
            .one_shots
            .insert(job_id.to_owned(), (run_at, callback));
        Ok(())
    }

    fn registered(&self) -> Vec<String> {
        lock(&self.state).recurring.keys().cloned().collect()
    }

    async fn shutdown(&self, _wait: bool) {
        let mut state = lock(&self.state);
        state.shut_down = true;
        state.recurring.clear();
        state.one_shots.clear();
    }
}

/// An [`AlertSink`] that keeps every alert.
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
    failing: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records alerts but reports every delivery as failed.
    pub fn failing(self) -> Self {
        Self {
            failing: true,
            ..self
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }

    fn record(&self, alert: Alert) -> Result<(), AlertError> {
        lock(&self.alerts).push(alert);
        if self.failing {
            return Err(AlertError::Delivery("recording sink set to fail".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send_failure_alert(&self, alert: FailureAlert) -> Result<(), AlertError> {
        self.record(Alert::Failure(alert))
    }

    async fn send_retry_alert(&self, alert: RetryAlert) -> Result<(), AlertError> {
        self.record(Alert::Retry(alert))
    }

    async fn send_timeout_alert(&self, alert: TimeoutAlert) -> Result<(), AlertError> {
        self.record(Alert::Timeout(alert))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::trigger::callback;

    #[tokio::test(start_paused = true)]
    async fn fake_processes_follow_the_tokio_clock() {
        let launcher = FakeLauncher::new().with_process(
            "job",
            FakeProcess::exits(3).with_runtime(Duration::from_secs(5)),
        );
        let mut process = launcher.launch("job", &[], ExecutionId::new()).unwrap();

        assert_eq!(process.wait(Duration::from_secs(2)).await.unwrap(), None);
        assert_eq!(process.wait(Duration::from_secs(10)).await.unwrap(), Some(3));
        assert!(process.id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scripts_are_consumed_in_order_and_the_last_is_reused() {
        let launcher = FakeLauncher::new()
            .with_process("job", FakeProcess::exits(1))
            .with_process("job", FakeProcess::exits(0));

        let mut codes = Vec::new();
        for _ in 0..3 {
            let mut process = launcher.launch("job", &[], ExecutionId::new()).unwrap();
            codes.push(process.wait(Duration::ZERO).await.unwrap());
        }

        assert_eq!(codes, vec![Some(1), Some(0), Some(0)]);
        assert_eq!(launcher.launches_of("job").len(), 3);
        assert_eq!(
            launcher
                .launch("other", &[], ExecutionId::new())
                .err()
                .map(|err| err.kind()),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn manual_engine_fires_on_demand() {
        let engine = ManualTriggerEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let job = callback({
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        engine
            .register("a", &Trigger::every(Duration::from_secs(60)), job.clone())
            .unwrap();
        engine.add_one_shot("b", Utc::now(), job).unwrap();

        assert!(engine.fire("a").await);
        assert!(!engine.fire("b").await);
        assert_eq!(engine.fire_one_shots().await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        engine.shutdown(false).await;
        assert!(engine.registered().is_empty());
        assert!(engine.is_shut_down());
    }

    #[tokio::test]
    async fn failing_sink_still_records() {
        let sink = RecordingAlertSink::new().failing();

        let result = sink
            .send_timeout_alert(TimeoutAlert {
                pipeline_name: "crm".to_owned(),
                execution_id: ExecutionId::new(),
                timeout_seconds: 60,
            })
            .await;

        assert!(result.is_err());
        assert_eq!(sink.alerts().len(), 1);
    }
}
