//! pipesched-local: runs the pipelines of a TOML file on this machine.
//!
//! ```bash
//! # Follow the schedule until Ctrl-C
//! pipesched-local --config demos/local/pipelines.toml
//!
//! # Run one pipeline now and exit with its outcome
//! pipesched-local --config demos/local/pipelines.toml --run crm_sync --arg full=true
//! ```
use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use pipesched::{
    config::FileConfigSource,
    engine::EngineState,
    history::InMemoryHistory,
    job::{ExecutionId, JobStatus, TriggeredBy},
    pipeline::Args,
    SchedulingEngine,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pipesched-local", version, about)]
struct Cli {
    /// Pipeline configuration file.
    #[arg(short, long, env = "PIPESCHED_CONFIG", default_value = "pipelines.toml")]
    config: PathBuf,

    /// Run this pipeline once instead of following the schedule.
    #[arg(long, value_name = "PIPELINE")]
    run: Option<String>,

    /// Argument for `--run`; values are parsed as JSON where possible.
    #[arg(long = "arg", value_name = "KEY=VALUE", requires = "run")]
    args: Vec<String>,

    /// Give up on `--run` after this many seconds.
    #[arg(long, value_name = "SECONDS", requires = "run")]
    timeout: Option<u64>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let source = FileConfigSource::new(&cli.config);
    let config = source
        .engine_config()
        .await
        .with_context(|| format!("Failed to read {}", cli.config.display()))?;
    let history = InMemoryHistory::new();
    let engine = SchedulingEngine::builder(config, source)
        .with_history(history.clone())
        .build();
    engine.start().await.context("Failed to start the scheduler")?;

    let code = match cli.run {
        Some(name) => {
            let overrides = parse_args(&cli.args)?;
            let execution_id = engine.run_now(&name, overrides, TriggeredBy::Manual(user()))?;
            println!("Started {name} as {execution_id}");
            let timeout = cli.timeout.map(Duration::from_secs);
            tokio::select! {
                status = wait_for(&engine, &history, execution_id, timeout) => match status {
                    Some(status) => report(&history, execution_id, status),
                    None => {
                        eprintln!("Gave up waiting for {execution_id}");
                        engine.cancel(execution_id);
                        ExitCode::FAILURE
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    engine.cancel(execution_id);
                    ExitCode::FAILURE
                }
            }
        }
        None => {
            for name in engine.dependency_order()? {
                tracing::info!("Loaded pipeline {name}");
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            ExitCode::SUCCESS
        }
    };

    engine.stop(true).await;
    Ok(code)
}

fn user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli".to_owned())
}

fn parse_args(raw: &[String]) -> Result<Args> {
    raw.iter()
        .map(|arg| {
            let Some((key, value)) = arg.split_once('=') else {
                bail!("Expected KEY=VALUE, got {arg}");
            };
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
            Ok((key.to_owned(), value))
        })
        .collect()
}

/// Waits for `execution_id` to finish.
///
/// Returns `None` once `timeout` elapses, or if the engine stops without the run finishing.
async fn wait_for(
    engine: &SchedulingEngine,
    history: &InMemoryHistory,
    execution_id: ExecutionId,
    timeout: Option<Duration>,
) -> Option<JobStatus> {
    let waiting = async {
        let mut reported_queued = false;
        loop {
            if let Some(status) = history
                .get(execution_id)
                .and_then(|entry| entry.completion.map(|completion| completion.status))
            {
                return Some(status);
            }
            if engine
                .status()
                .map_or(true, |status| status.state == EngineState::Stopped)
            {
                return None;
            }
            if !reported_queued {
                if let Some(job) = engine
                    .pending_jobs()
                    .into_iter()
                    .find(|job| job.execution_id == execution_id)
                {
                    tracing::info!("{} is queued: {}", job.pipeline_name, job.reason);
                    reported_queued = true;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, waiting).await.ok().flatten(),
        None => waiting.await,
    }
}

fn report(history: &InMemoryHistory, execution_id: ExecutionId, status: JobStatus) -> ExitCode {
    let completion = history
        .get(execution_id)
        .and_then(|entry| entry.completion);
    if let Some(completion) = completion {
        println!(
            "{execution_id} {status} in {:?}, records processed: {}",
            completion.duration,
            completion
                .records_processed
                .map_or_else(|| "unknown".to_owned(), |records| records.to_string()),
        );
        if let Some(error) = completion.error_message {
            eprintln!("{error}");
        }
    }
    match status {
        JobStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
