//! Ordered multi-step commands.
//!
//! Steps run strictly in order, each on its own channel of the same host's
//! connection. The first step with a non-zero exit code stops the pipeline;
//! later steps never start.
//!
//! Every pipeline also stops once its engine shuts down, including one that is
//! between two steps at that moment.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{Result, SshError};
use super::executor::CommandExecutor;
use super::types::{CommandRequest, EXIT_CANCELED, EXIT_SUCCESS, EXIT_TRANSPORT_ERROR};

/// Separates steps in a script string.
pub const STEP_DELIMITER: &str = ";;;";

/// Split a script into trimmed steps, dropping empty ones.
pub fn split_steps(script: &str) -> Vec<String> {
    script
        .split(STEP_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Output of every step that ran, concatenated.
    pub output: String,
    /// Zero, or the exit code of the step that stopped the pipeline.
    pub exit_code: i32,
    pub steps_run: usize,
    pub error: Option<SshError>,
}

impl PipelineResult {
    fn empty() -> Self {
        Self {
            output: String::new(),
            exit_code: EXIT_SUCCESS,
            steps_run: 0,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS && self.error.is_none()
    }

    pub fn into_result(self, host: &str) -> Result<String> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.exit_code != EXIT_SUCCESS {
            return Err(SshError::RemoteExitNonZero {
                host: host.to_string(),
                command: format!("step {}", self.steps_run),
                code: self.exit_code,
            });
        }
        Ok(self.output)
    }
}

/// A pipeline running on its own worker.
pub struct PipelineHandle {
    cancel: CancellationToken,
    result: watch::Receiver<Option<PipelineResult>>,
}

impl PipelineHandle {
    /// Stop the running step and skip the rest. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    pub async fn wait(&self) -> PipelineResult {
        let mut rx = self.result.clone();
        let result = rx.wait_for(Option::is_some).await.ok().and_then(|r| (*r).clone());
        result.unwrap_or_else(|| PipelineResult {
            error: Some(SshError::Transport("pipeline worker ended without a result".into())),
            exit_code: EXIT_TRANSPORT_ERROR,
            ..PipelineResult::empty()
        })
    }
}

#[derive(Clone)]
pub struct CommandPipeline {
    executor: CommandExecutor,
}

impl CommandPipeline {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Run `steps` with the options of `template` (its command text is ignored).
    pub async fn run(&self, steps: &[String], template: &CommandRequest) -> PipelineResult {
        self.run_until(steps, template, &self.stop_token()).await
    }

    /// Split `script` on [`STEP_DELIMITER`] and run the steps.
    pub async fn run_script(&self, script: &str, template: &CommandRequest) -> PipelineResult {
        self.run(&split_steps(script), template).await
    }

    pub fn spawn(&self, steps: Vec<String>, template: CommandRequest) -> PipelineHandle {
        let cancel = self.stop_token();
        let (tx, rx) = watch::channel(None);
        let pipeline = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = pipeline.run_until(&steps, &template, &token).await;
            tx.send_replace(Some(result));
        });
        PipelineHandle { cancel, result: rx }
    }

    fn stop_token(&self) -> CancellationToken {
        self.executor.manager().context().shutdown.child_token()
    }

    async fn run_until(
        &self,
        steps: &[String],
        template: &CommandRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let host = self.executor.manager().host().name.clone();
        let mut result = PipelineResult::empty();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(host = %host, skipped = steps.len() - index, "Pipeline cancelled; skipping remaining steps");
                break;
            }

            let handle = self.executor.spawn(template.for_command(step.as_str()), None);
            let outcome = tokio::select! {
                outcome = handle.wait() => outcome,
                _ = cancel.cancelled() => {
                    handle.cancel();
                    handle.wait().await
                }
            };

            result.steps_run += 1;
            result.output.push_str(&outcome.output);
            if !outcome.success() {
                info!(
                    host = %host,
                    step = index + 1,
                    of = steps.len(),
                    code = outcome.exit_code,
                    "Pipeline stopped"
                );
                result.exit_code = outcome.exit_code;
                result.error = outcome.error;
                return result;
            }
        }

        if cancel.is_cancelled() && result.steps_run < steps.len() {
            result.exit_code = EXIT_CANCELED;
            result.error = Some(SshError::Cancelled {
                host,
                command: format!("step {}", result.steps_run + 1),
            });
        }
        result
    }
}
