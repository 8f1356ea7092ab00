//! The capability the executor supervises pipelines through.
use std::{fmt::Debug, io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
};

use crate::job::ExecutionId;

/// Environment variable carrying the execution id into the child process.
pub const EXECUTION_ID_ENV: &str = "PIPESCHED_EXECUTION_ID";

/// A readable output stream of a child process.
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// A running child process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Operating system id, if the process has one and has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Waits up to `timeout` for the process to exit.
    ///
    /// Returns `Ok(None)` if it is still running when `timeout` elapses. A process ended by a
    /// signal reports `128 + signal`. Dropping the returned future must not affect the process.
    async fn wait(&mut self, timeout: Duration) -> io::Result<Option<i32>>;

    /// Asks the process to shut down gracefully.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kills the process.
    fn kill(&mut self) -> io::Result<()>;

    fn take_stdout(&mut self) -> Option<OutputPipe>;

    fn take_stderr(&mut self) -> Option<OutputPipe>;
}

/// Starts child processes.
pub trait ProcessLauncher: Send + Sync + Debug {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        execution_id: ExecutionId,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Launches real operating system processes through [`tokio::process`].
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher {
    working_dir: Option<std::path::PathBuf>,
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(self, working_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            working_dir: Some(working_dir.into()),
        }
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        execution_id: ExecutionId,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env(EXECUTION_ID_ENV, execution_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        tracing::debug!(
            %execution_id,
            program,
            pid = child.id(),
            "Spawned {program} for {execution_id}"
        );
        Ok(Box::new(TokioProcess { child }))
    }
}

#[derive(Debug)]
pub struct TokioProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self, timeout: Duration) -> io::Result<Option<i32>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(exit_code(status?))),
            Err(_elapsed) => Ok(None),
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        // Already reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            result => result,
        }
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.child
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
