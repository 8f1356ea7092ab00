//! Supervises pipelines running as child processes.
//!
//! [`PipelineExecutor`] spawns an entry point through a [`ProcessLauncher`], enforces its timeout,
//! collects its output and reports everything as an [`ExecutionResult`]. Nothing that goes
//! wrong with the child process is returned as an error: spawn failures, timeouts, crashes and
//! cancellations all become failed results so callers handle every outcome the same way.
//!
//! The executor does not limit concurrency; callers acquire resources before calling
//! [`PipelineExecutor::execute`].
use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::Stream;
use fxhash::FxHashMap;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    job::{ExecutionId, JobStatus},
    pipeline::{Args, EntryPoint},
};

mod command;
mod output;
mod process;

pub use command::command_args;
pub use output::{parse_records_processed, OutputBuffer, OutputLine, OutputStream};
pub use process::{
    OutputPipe, ProcessHandle, ProcessLauncher, TokioLauncher, TokioProcess, EXECUTION_ID_ENV,
};

/// Exit code reported when the process never produced one of its own.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited on its own.
    Exited,
    TimedOut,
    Cancelled,
    /// The process could not be started or supervised.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub records_processed: Option<u64>,
    pub error: Option<String>,
    pub termination: Termination,
}

impl ExecutionResult {
    /// A failed result for an execution that never got as far as a process.
    pub fn not_started(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            exit_code: SYNTHETIC_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            records_processed: None,
            error: Some(error.into()),
            termination: Termination::Failed,
        }
    }

    /// A cancelled result for an execution stopped before its process was started.
    pub fn cancelled_before_start(duration: Duration) -> Self {
        Self {
            termination: Termination::Cancelled,
            ..Self::not_started("Cancelled before the pipeline started", duration)
        }
    }

    /// The status a job with this result ends in.
    pub fn status(&self) -> JobStatus {
        match self.termination {
            Termination::Cancelled => JobStatus::Cancelled,
            _ if self.success => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }
}

#[derive(Debug, Clone, Copy)]
enum Supervision {
    /// One wait for the whole timeout.
    Blocking,
    /// Short waits against an absolute deadline.
    Polling,
}

#[derive(Debug)]
enum Outcome {
    Exited(i32),
    TimedOut,
    Cancelled,
    Lost(io::Error),
}

/// Runs pipelines as supervised child processes.
///
/// Cloning is cheap; clones share the set of tracked executions.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    launcher: Arc<dyn ProcessLauncher>,
    executions: Arc<Mutex<FxHashMap<ExecutionId, CancellationToken>>>,
    outputs: Arc<Mutex<FxHashMap<ExecutionId, OutputBuffer>>>,
    kill_grace_period: Duration,
    poll_interval: Duration,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(TokioLauncher::new())
    }
}

impl PipelineExecutor {
    pub fn new(launcher: impl ProcessLauncher + 'static) -> Self {
        Self::with_launcher(Arc::new(launcher))
    }

    pub fn with_launcher(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            executions: Default::default(),
            outputs: Default::default(),
            kill_grace_period: DEFAULT_KILL_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long a process gets to exit after being asked to terminate before it is killed.
    pub fn with_kill_grace_period(self, kill_grace_period: Duration) -> Self {
        Self {
            kill_grace_period,
            ..self
        }
    }

    /// How often [`PipelineExecutor::execute_streaming`] checks on its process.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            ..self
        }
    }

    /// Runs `entry_point` with `args` and waits for it to exit, be cancelled, or time out.
    #[instrument(skip(self, entry_point, args), fields(program = %entry_point.program))]
    pub async fn execute(
        &self,
        entry_point: &EntryPoint,
        args: &Args,
        execution_id: ExecutionId,
        timeout: Duration,
    ) -> ExecutionResult {
        self.run(
            entry_point,
            args,
            execution_id,
            timeout,
            Supervision::Blocking,
            OutputBuffer::default(),
        )
        .await
    }

    /// Like [`PipelineExecutor::execute`], but the output can be read while the process runs
    /// through [`PipelineExecutor::output`] or [`PipelineExecutor::follow_output`].
    ///
    /// The buffer is kept after the run ends until [`PipelineExecutor::discard_output`].
    #[instrument(skip(self, entry_point, args), fields(program = %entry_point.program))]
    pub async fn execute_streaming(
        &self,
        entry_point: &EntryPoint,
        args: &Args,
        execution_id: ExecutionId,
        timeout: Duration,
    ) -> ExecutionResult {
        let buffer = OutputBuffer::default();
        self.outputs().insert(execution_id, buffer.clone());
        self.run(
            entry_point,
            args,
            execution_id,
            timeout,
            Supervision::Polling,
            buffer,
        )
        .await
    }

    /// Requests termination of a tracked execution.
    ///
    /// The process is sent a terminate signal and killed if it is still running after the grace
    /// period. Returns whether the execution was found.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        match self.executions().get(&execution_id) {
            Some(token) => {
                tracing::info!(%execution_id, "Cancelling execution {execution_id}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every tracked execution, returning how many there were.
    pub fn cancel_all(&self) -> usize {
        let executions = self.executions();
        for token in executions.values() {
            token.cancel();
        }
        if !executions.is_empty() {
            tracing::info!("Cancelling {} executions", executions.len());
        }
        executions.len()
    }

    pub fn is_running(&self, execution_id: ExecutionId) -> bool {
        self.executions().contains_key(&execution_id)
    }

    pub fn running(&self) -> Vec<ExecutionId> {
        self.executions().keys().copied().collect()
    }

    pub fn output(&self, execution_id: ExecutionId) -> Option<OutputBuffer> {
        self.outputs().get(&execution_id).cloned()
    }

    /// Whether a streaming execution is still producing output.
    pub fn is_streaming(&self, execution_id: ExecutionId) -> bool {
        self.output(execution_id)
            .is_some_and(|buffer| !buffer.is_finished())
    }

    pub fn follow_output(
        &self,
        execution_id: ExecutionId,
    ) -> Option<impl Stream<Item = OutputLine> + Send + 'static> {
        self.output(execution_id).map(|buffer| buffer.follow())
    }

    pub fn discard_output(&self, execution_id: ExecutionId) -> Option<OutputBuffer> {
        self.outputs().remove(&execution_id)
    }

    fn executions(&self) -> MutexGuard<'_, FxHashMap<ExecutionId, CancellationToken>> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn outputs(&self) -> MutexGuard<'_, FxHashMap<ExecutionId, OutputBuffer>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, execution_id: ExecutionId) -> Tracked {
        let token = CancellationToken::new();
        self.executions().insert(execution_id, token.clone());
        Tracked {
            executions: Arc::clone(&self.executions),
            execution_id,
            token,
        }
    }

    async fn run(
        &self,
        entry_point: &EntryPoint,
        args: &Args,
        execution_id: ExecutionId,
        timeout: Duration,
        supervision: Supervision,
        buffer: OutputBuffer,
    ) -> ExecutionResult {
        let started = Instant::now();
        let command = command_args(entry_point, args);
        let program = &entry_point.program;

        let mut process = match self.launcher.launch(program, &command, execution_id) {
            Ok(process) => process,
            Err(error) => {
                buffer.finish();
                tracing::error!(%execution_id, ?error, "Failed to start {program}: {error}");
                return ExecutionResult::not_started(
                    format!("Failed to start {program}: {error}"),
                    started.elapsed(),
                );
            }
        };

        let tracked = self.track(execution_id);
        let readers = [
            pump(process.take_stdout(), OutputStream::Stdout, &buffer),
            pump(process.take_stderr(), OutputStream::Stderr, &buffer),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        let outcome = self
            .supervise(process.as_mut(), timeout, supervision, &tracked.token)
            .await;
        let stopped_with = match &outcome {
            Outcome::Exited(_) => None,
            Outcome::TimedOut => {
                tracing::warn!(%execution_id, ?timeout, "{program} timed out after {timeout:?}");
                self.stop(process.as_mut(), execution_id).await
            }
            Outcome::Cancelled => self.stop(process.as_mut(), execution_id).await,
            Outcome::Lost(error) => {
                tracing::error!(%execution_id, ?error, "Lost track of {program}: {error}");
                let _ = process.kill().inspect_err(|error| {
                    tracing::error!(%execution_id, ?error, "Failed to kill {program}: {error}")
                });
                None
            }
        };
        drop(tracked);

        self.drain(readers).await;
        buffer.finish();

        let stdout = buffer.text(OutputStream::Stdout);
        let stderr = buffer.text(OutputStream::Stderr);
        let (exit_code, termination, error) = match outcome {
            Outcome::Exited(0) => (0, Termination::Exited, None),
            Outcome::Exited(code) => (code, Termination::Exited, Some(exit_error(code, &stderr))),
            Outcome::TimedOut => (
                SYNTHETIC_EXIT_CODE,
                Termination::TimedOut,
                Some(format!(
                    "Pipeline timed out after {} seconds",
                    timeout.as_secs()
                )),
            ),
            Outcome::Cancelled => (
                stopped_with.unwrap_or(SYNTHETIC_EXIT_CODE),
                Termination::Cancelled,
                Some("Pipeline was cancelled".to_owned()),
            ),
            Outcome::Lost(error) => (
                SYNTHETIC_EXIT_CODE,
                Termination::Failed,
                Some(format!("Failed while waiting for {program}: {error}")),
            ),
        };

        let result = ExecutionResult {
            success: termination == Termination::Exited && exit_code == 0,
            exit_code,
            records_processed: parse_records_processed(&stdout),
            stdout,
            stderr,
            duration: started.elapsed(),
            error,
            termination,
        };
        tracing::debug!(
            %execution_id,
            success = result.success,
            exit_code = result.exit_code,
            records_processed = result.records_processed,
            ?termination,
            "{program} finished in {:?}",
            result.duration,
        );
        result
    }

    async fn supervise(
        &self,
        process: &mut dyn ProcessHandle,
        timeout: Duration,
        supervision: Supervision,
        cancellation: &CancellationToken,
    ) -> Outcome {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Outcome::TimedOut;
            }
            let slice = match supervision {
                Supervision::Blocking => remaining,
                Supervision::Polling => remaining.min(self.poll_interval),
            };

            tokio::select! {
                _ = cancellation.cancelled() => return Outcome::Cancelled,
                waited = process.wait(slice) => match waited {
                    Ok(Some(code)) => return Outcome::Exited(code),
                    Ok(None) => continue,
                    Err(error) => return Outcome::Lost(error),
                },
            }
        }
    }

    /// Terminates `process`, escalating to a kill after the grace period.
    async fn stop(
        &self,
        process: &mut dyn ProcessHandle,
        execution_id: ExecutionId,
    ) -> Option<i32> {
        let _ = process.terminate().inspect_err(|error| {
            tracing::warn!(%execution_id, ?error, "Failed to terminate {execution_id}: {error}")
        });
        match process.wait(self.kill_grace_period).await {
            Ok(Some(code)) => return Some(code),
            Ok(None) => tracing::warn!(
                %execution_id,
                "{execution_id} still running {:?} after terminate, killing it",
                self.kill_grace_period
            ),
            Err(error) => {
                tracing::warn!(%execution_id, ?error, "Failed to wait for {execution_id}")
            }
        }

        let _ = process.kill().inspect_err(|error| {
            tracing::error!(%execution_id, ?error, "Failed to kill {execution_id}: {error}")
        });
        process.wait(self.kill_grace_period).await.ok().flatten()
    }

    /// Waits for the output readers to see end of file.
    ///
    /// A grandchild can keep a pipe open after its parent died, so readers get one grace
    /// period before being abandoned.
    async fn drain(&self, mut readers: Vec<JoinHandle<()>>) {
        let drained = tokio::time::timeout(
            self.kill_grace_period,
            futures::future::join_all(readers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            tracing::debug!(
                "Abandoning output readers still open after {:?}",
                self.kill_grace_period
            );
            for reader in &readers {
                reader.abort();
            }
        }
    }
}

struct Tracked {
    executions: Arc<Mutex<FxHashMap<ExecutionId, CancellationToken>>>,
    execution_id: ExecutionId,
    token: CancellationToken,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.execution_id);
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn pump(
    pipe: Option<OutputPipe>,
    stream: OutputStream,
    buffer: &OutputBuffer,
) -> Option<JoinHandle<()>> {
    let pipe = pipe?;
    let buffer = buffer.clone();
    Some(tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    buffer.push(stream, text.trim_end_matches(['\r', '\n']).to_owned());
                }
                Err(error) => {
                    tracing::debug!(?error, %stream, "Stopped reading {stream}: {error}");
                    break;
                }
            }
        }
    }))
}

fn exit_error(code: i32, stderr: &str) -> String {
    match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => format!("Pipeline exited with code {code}: {}", line.trim()),
        None => format!("Pipeline exited with code {code}"),
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::testing::{FakeLauncher, FakeProcess, FakeSignal};

    const HOUR: Duration = Duration::from_secs(3600);

    fn fake_executor(launcher: &FakeLauncher) -> PipelineExecutor {
        PipelineExecutor::new(launcher.clone()).with_kill_grace_period(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_reports_records() {
        let launcher = FakeLauncher::new().with_process(
            "sync",
            FakeProcess::exits(0)
                .with_runtime(Duration::from_secs(3))
                .with_stdout("Processed 10 records\nTOTAL: 1,234 records\n"),
        );
        let executor = fake_executor(&launcher);

        let result = executor
            .execute(&EntryPoint::new("sync"), &Args::new(), ExecutionId::new(), HOUR)
            .await;

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.records_processed, Some(1234));
        assert_eq!(result.termination, Termination::Exited);
        assert!(result.duration >= Duration::from_secs(3));
        assert!(result.duration < Duration::from_secs(4));
        assert_eq!(result.status(), JobStatus::Completed);
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn arguments_become_flags() {
        let launcher = FakeLauncher::new().with_process("sync", FakeProcess::exits(0));
        let executor = fake_executor(&launcher);
        let execution_id = ExecutionId::new();
        let args = Args::from([
            ("full".to_owned(), json!(true)),
            ("since".to_owned(), json!("yesterday")),
        ]);

        executor
            .execute(&EntryPoint::new("sync"), &args, execution_id, HOUR)
            .await;

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].args, vec!["--full", "--since", "yesterday"]);
        assert_eq!(launches[0].execution_id, execution_id);
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_fails_with_stderr_context() {
        let launcher = FakeLauncher::new().with_process(
            "sync",
            FakeProcess::exits(2).with_stderr("warming up\nconnection refused\n"),
        );
        let executor = fake_executor(&launcher);

        let result = executor
            .execute(&EntryPoint::new("sync"), &Args::new(), ExecutionId::new(), HOUR)
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(
            result.error.as_deref(),
            Some("Pipeline exited with code 2: connection refused")
        );
        assert_eq!(result.status(), JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_terminates_the_process() {
        let launcher = FakeLauncher::new().with_process("slow", FakeProcess::hangs());
        let executor = fake_executor(&launcher);
        let started = Instant::now();

        let result = executor
            .execute(
                &EntryPoint::new("slow"),
                &Args::new(),
                ExecutionId::new(),
                Duration::from_secs(1),
            )
            .await;

        assert!(!result.success);
        assert!(result.timed_out());
        assert_eq!(result.exit_code, SYNTHETIC_EXIT_CODE);
        assert_eq!(
            result.error.as_deref(),
            Some("Pipeline timed out after 1 seconds")
        );
        assert_eq!(launcher.launches()[0].signals, vec![FakeSignal::Terminate]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_processes_are_killed() {
        let launcher =
            FakeLauncher::new().with_process("stubborn", FakeProcess::hangs().ignoring_terminate());
        let executor = fake_executor(&launcher);

        let result = executor
            .execute(
                &EntryPoint::new("stubborn"),
                &Args::new(),
                ExecutionId::new(),
                Duration::from_secs(1),
            )
            .await;

        assert!(result.timed_out());
        assert_eq!(
            launcher.launches()[0].signals,
            vec![FakeSignal::Terminate, FakeSignal::Kill]
        );
        assert!(result.duration >= Duration::from_secs(6));
        assert!(result.duration < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn processes_that_cannot_be_waited_on_are_killed() {
        let launcher =
            FakeLauncher::new().with_process("lost", FakeProcess::hangs().losing_track());
        let executor = fake_executor(&launcher);
        let execution_id = ExecutionId::new();

        let result = executor
            .execute(&EntryPoint::new("lost"), &Args::new(), execution_id, HOUR)
            .await;

        assert!(!result.success);
        assert_eq!(result.termination, Termination::Failed);
        assert_eq!(result.exit_code, SYNTHETIC_EXIT_CODE);
        assert!(result.error.unwrap().starts_with("Failed while waiting for lost"));
        assert_eq!(launcher.launches()[0].signals, vec![FakeSignal::Kill]);
        assert!(!executor.is_running(execution_id));
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failures_become_failed_results() {
        let executor = fake_executor(&FakeLauncher::new());

        let result = executor
            .execute(&EntryPoint::new("missing"), &Args::new(), ExecutionId::new(), HOUR)
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, SYNTHETIC_EXIT_CODE);
        assert_eq!(result.termination, Termination::Failed);
        assert!(result.error.unwrap().starts_with("Failed to start missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_execution() {
        let launcher = FakeLauncher::new().with_process("slow", FakeProcess::hangs());
        let executor = fake_executor(&launcher);
        let execution_id = ExecutionId::new();

        let running = tokio::spawn({
            let executor = executor.clone();
            async move {
                executor
                    .execute(&EntryPoint::new("slow"), &Args::new(), execution_id, HOUR)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(executor.is_running(execution_id));
        assert!(executor.cancel(execution_id));

        let result = running.await.unwrap();
        assert_eq!(result.termination, Termination::Cancelled);
        assert_eq!(result.exit_code, 143);
        assert_eq!(result.status(), JobStatus::Cancelled);
        assert!(!executor.is_running(execution_id));
        assert!(!executor.cancel(execution_id));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_everything() {
        let launcher = FakeLauncher::new().with_process("slow", FakeProcess::hangs());
        let executor = fake_executor(&launcher);

        let runs = (0..3)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute(&EntryPoint::new("slow"), &Args::new(), ExecutionId::new(), HOUR)
                        .await
                })
            })
            .collect::<Vec<_>>();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(executor.cancel_all(), 3);
        for run in runs {
            assert_eq!(run.await.unwrap().termination, Termination::Cancelled);
        }
        assert!(executor.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_output_is_queryable() {
        let launcher = FakeLauncher::new().with_process(
            "sync",
            FakeProcess::exits(0)
                .with_runtime(Duration::from_secs(2))
                .with_stdout("page 1\npage 2\nrecords_processed: 2\n"),
        );
        let executor = fake_executor(&launcher).with_poll_interval(Duration::from_millis(100));
        let execution_id = ExecutionId::new();

        let running = tokio::spawn({
            let executor = executor.clone();
            async move {
                executor
                    .execute_streaming(&EntryPoint::new("sync"), &Args::new(), execution_id, HOUR)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(executor.is_streaming(execution_id));
        let followed = executor.follow_output(execution_id).unwrap();

        let result = running.await.unwrap();
        assert!(result.success);
        assert_eq!(result.records_processed, Some(2));
        assert!(!executor.is_streaming(execution_id));

        let lines = followed.map(|line| line.line).collect::<Vec<_>>().await;
        assert_eq!(lines, vec!["page 1", "page 2", "records_processed: 2"]);

        assert!(executor.discard_output(execution_id).is_some());
        assert!(executor.output(execution_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_enforces_the_deadline() {
        let launcher = FakeLauncher::new().with_process("slow", FakeProcess::hangs());
        let executor = fake_executor(&launcher).with_poll_interval(Duration::from_millis(300));
        let execution_id = ExecutionId::new();

        let result = executor
            .execute_streaming(
                &EntryPoint::new("slow"),
                &Args::new(),
                execution_id,
                Duration::from_secs(1),
            )
            .await;

        assert!(result.timed_out());
        assert!(executor.output(execution_id).unwrap().is_finished());
    }

    #[cfg(unix)]
    mod real_process {
        use super::*;

        #[tokio::test]
        async fn real_process_reports_total() {
            let executor = PipelineExecutor::default();

            let result = executor
                .execute(
                    &EntryPoint::shell("echo 'TOTAL: 1,234 records'"),
                    &Args::new(),
                    ExecutionId::new(),
                    Duration::from_secs(30),
                )
                .await;

            assert!(result.success);
            assert_eq!(result.records_processed, Some(1234));
            assert_eq!(result.stdout, "TOTAL: 1,234 records");
        }

        #[tokio::test]
        async fn real_process_times_out() {
            let executor =
                PipelineExecutor::default().with_kill_grace_period(Duration::from_secs(1));
            let started = std::time::Instant::now();

            let result = executor
                .execute(
                    &EntryPoint::new("sleep").with_args(["10"]),
                    &Args::new(),
                    ExecutionId::new(),
                    Duration::from_secs(1),
                )
                .await;

            assert!(!result.success);
            assert!(result.error.unwrap().contains("timed out"));
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}
