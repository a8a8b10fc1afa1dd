//! Shell-based step execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepExecutor, StepResult};
use async_trait::async_trait;
use pipewright_core::cancel::CancelSignal;
use pipewright_core::pipeline::StepDefinition;
use pipewright_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable naming the file a step appends `key=value` outputs to.
pub const OUTPUT_FILE_ENV: &str = "PIPEWRIGHT_OUTPUT";

/// How long output readers may keep running after the shell has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs `run:` steps with the step's shell (`<shell> -c <command>`).
pub struct ShellExecutor {
    config: RunnerConfig,
}

impl ShellExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn working_dir(&self, ctx: &StepContext) -> PathBuf {
        match &ctx.step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        }
    }

    async fn execute_command(
        &self,
        command: &str,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancelSignal,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let workdir = self.working_dir(ctx);
        let output_file = std::env::temp_dir().join(format!("pipewright-output-{}", uuid::Uuid::new_v4()));

        info!(
            instance = %ctx.instance,
            step = %ctx.step.name,
            workdir = %workdir.display(),
            "Executing shell command"
        );

        let mut child = Command::new(&ctx.step.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .envs(&ctx.variables)
            .env(OUTPUT_FILE_ENV, &output_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn {}: {}", ctx.step.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".to_string()))?;

        let mut stdout_handle = stream_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let mut stderr_handle = stream_lines(stderr, OutputStream::Stderr, output_tx);

        let deadline = async {
            match ctx.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        // Output draining is part of the step: a background process holding the
        // pipes keeps the step inside its deadline and cancel race.
        let interrupted = tokio::select! {
            status = wait_and_drain(&mut child, &mut stdout_handle, &mut stderr_handle) => Ok(status),
            _ = deadline => Err(Error::StepTimeout {
                seconds: ctx.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        stdout_handle.abort();
        stderr_handle.abort();

        let status = match interrupted {
            Ok(status) => status,
            Err(e) => {
                warn!(instance = %ctx.instance, step = %ctx.step.name, error = %e, "Stopping shell command");
                let _ = child.kill().await;
                remove_output_file(&output_file).await;
                return Err(e);
            }
        };

        let status = status.map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        let outputs = read_outputs(&output_file).await;
        remove_output_file(&output_file).await;

        debug!(exit_code, duration_ms, outputs = outputs.len(), "Command completed");

        Ok(StepResult {
            exit_code,
            success: exit_code == 0,
            duration_ms,
            outputs,
            artifacts: vec![],
        })
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancelSignal,
    ) -> Result<StepResult> {
        let command = ctx
            .step
            .run
            .as_deref()
            .ok_or_else(|| Error::Internal("No command to run".to_string()))?;
        self.execute_command(command, ctx, output_tx, cancel).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.run.is_some() && step.action.is_none()
    }
}

/// Wait for the shell to exit, then give its output readers a bounded window
/// to reach end of stream.
async fn wait_and_drain(
    child: &mut Child,
    stdout: &mut JoinHandle<()>,
    stderr: &mut JoinHandle<()>,
) -> std::io::Result<std::process::ExitStatus> {
    let status = child.wait().await?;
    let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
        let _ = stdout.await;
        let _ = stderr.await;
    })
    .await;
    if drained.is_err() {
        debug!("Output pipes still open after the command exited, detaching readers");
    }
    Ok(status)
}

fn stream_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;
        while let Ok(Some(line)) = lines.next_line().await {
            line_number += 1;
            let output = OutputLine {
                stream,
                content: line,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    })
}

/// Parse `key=value` lines written to the output file. Later keys win.
async fn read_outputs(path: &Path) -> BTreeMap<String, String> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return BTreeMap::new();
    };
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

async fn remove_output_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "Failed to remove step output file");
    }
}
