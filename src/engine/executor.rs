//! Single-command execution.
//!
//! Every execution runs on its own spawned worker: it opens a fresh channel
//! with a pseudo-terminal (so stdout and stderr interleave in arrival order),
//! streams output through the sentinel scanner, answers sudo prompts, and
//! enforces the wait timeout. Callers either await the result or hold an
//! [`ExecutionHandle`] and get a completion callback.
//!
//! Cancellation is a token checked at every wait; the channel is closed when
//! it fires. Cancelling twice, or after completion, changes nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionManager, RunningCommand};
use super::error::SshError;
use super::prompt::{PromptContext, SecretKind};
use super::scanner::{ScanEvent, SentinelScanner};
use super::sudo::{redact, wrap_sudo};
use super::transcript::TranscriptEntry;
use super::transport::{ChannelEvent, ExecChannel, RemoteConnection};
use super::types::{
    CommandRequest, CommandResult, EXIT_SUCCESS, EXIT_TIMEOUT, EXIT_TRANSPORT_ERROR,
};

/// Invoked on the worker once the result is known.
pub type CompletionCallback = Box<dyn FnOnce(&CommandResult) + Send>;

/// How the read loop ended.
enum Outcome {
    Finished,
    Cancelled,
    TimedOut,
    Lost,
}

/// A command running on its own worker.
pub struct ExecutionHandle {
    id: Uuid,
    host: String,
    command: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    result: watch::Receiver<Option<CommandResult>>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Redacted command text.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request cancellation. A no-op once finished or already cancelled.
    pub fn cancel(&self) {
        if self.is_finished() || self.cancel.is_cancelled() {
            return;
        }
        debug!(host = %self.host, id = %self.id, "Cancelling command");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the result. Can be called any number of times.
    pub async fn wait(&self) -> CommandResult {
        let mut rx = self.result.clone();
        let result = rx.wait_for(Option::is_some).await.ok().and_then(|r| (*r).clone());
        result.unwrap_or_else(|| {
            CommandResult::failed(
                String::new(),
                SshError::Transport("execution worker ended without a result".into()),
            )
        })
    }
}

/// Runs commands on one host.
#[derive(Clone)]
pub struct CommandExecutor {
    manager: Arc<ConnectionManager>,
}

impl CommandExecutor {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run `request` and wait for its result.
    pub async fn execute(&self, request: CommandRequest) -> CommandResult {
        self.spawn(request, None).wait().await
    }

    /// Run `request` on its own worker; `on_complete` runs there when it ends.
    pub fn execute_detached(
        &self,
        request: CommandRequest,
        on_complete: impl FnOnce(&CommandResult) + Send + 'static,
    ) -> ExecutionHandle {
        self.spawn(request, Some(Box::new(on_complete)))
    }

    pub(crate) fn spawn(
        &self,
        request: CommandRequest,
        on_complete: Option<CompletionCallback>,
    ) -> ExecutionHandle {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = CancellationToken::new();
        let command = redact(&request.command, &self.manager.context().credentials.secrets());
        let (tx, rx) = watch::channel(None);

        self.manager.register(RunningCommand {
            id,
            command: command.clone(),
            started_at,
            cancel: cancel.clone(),
        });

        let manager = Arc::clone(&self.manager);
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = Execution::new(&manager, &request, token).run().await;
            manager.unregister(&id);
            if let Some(callback) = on_complete {
                callback(&result);
            }
            tx.send_replace(Some(result));
        });

        ExecutionHandle {
            id,
            host: self.manager.host().name.clone(),
            command,
            started_at,
            cancel,
            result: rx,
        }
    }
}

/// State of one command on its worker.
struct Execution<'a> {
    manager: &'a Arc<ConnectionManager>,
    request: &'a CommandRequest,
    cancel: CancellationToken,
    output: String,
    sudo_prompts: u32,
}

impl<'a> Execution<'a> {
    fn new(
        manager: &'a Arc<ConnectionManager>,
        request: &'a CommandRequest,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            request,
            cancel,
            output: String::new(),
            sudo_prompts: 0,
        }
    }

    fn host_name(&self) -> &str {
        &self.manager.host().name
    }

    /// Command text with every known secret replaced.
    fn shown_command(&self) -> String {
        redact(
            &self.request.command,
            &self.manager.context().credentials.secrets(),
        )
    }

    async fn run(mut self) -> CommandResult {
        let ctx = Arc::clone(self.manager.context());
        let shown = self.shown_command();

        if self.request.dry_run {
            info!(host = %self.host_name(), command = %shown, "Dry run; not executing");
            self.manager.record_dry_run(&shown);
            return CommandResult::completed(String::new(), EXIT_SUCCESS);
        }

        if self.request.show_command {
            ctx.transcript.record(TranscriptEntry::Command {
                host: self.host_name().to_string(),
                command: shown.clone(),
            });
        }

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled(),
            opened = self.manager.open_channel() => opened,
        };
        let (connection, mut channel) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(host = %self.host_name(), command = %shown, "Could not start command: {}", e);
                return CommandResult::failed(String::new(), e);
            }
        };

        let command = if self.manager.host().sudo {
            wrap_sudo(&self.request.command)
        } else {
            self.request.command.clone()
        };
        debug!(host = %self.host_name(), command = %shown, "Executing");

        if let Err(e) = channel.exec(&command, true).await {
            channel.close().await;
            let error = if connection.is_closed() {
                self.manager.mark_lost(&connection).await;
                SshError::RemoteExitNonZero {
                    host: self.host_name().to_string(),
                    command: shown,
                    code: EXIT_TRANSPORT_ERROR,
                }
            } else {
                SshError::ChannelOpen {
                    host: self.host_name().to_string(),
                    reason: format!("exec failed: {e}"),
                }
            };
            return CommandResult::failed(String::new(), error);
        }

        let wait = self.request.timeout.unwrap_or(ctx.config.command_timeout);
        let (outcome, exit_status) = self
            .read_loop(connection.as_ref(), channel.as_mut(), wait)
            .await;
        channel.close().await;

        let shown = self.shown_command();
        let output = std::mem::take(&mut self.output);
        match outcome {
            Outcome::Finished => {
                let code = match exit_status {
                    Some(code) => code as i32,
                    None => {
                        warn!(host = %self.host_name(), command = %shown, "No exit status received");
                        EXIT_TIMEOUT
                    }
                };
                debug!(host = %self.host_name(), code, "Command finished");
                CommandResult::completed(output, code)
            }
            Outcome::Cancelled => {
                info!(host = %self.host_name(), command = %shown, "Command cancelled");
                CommandResult::failed(
                    output,
                    SshError::Cancelled {
                        host: self.host_name().to_string(),
                        command: shown,
                    },
                )
            }
            Outcome::TimedOut => {
                warn!(host = %self.host_name(), command = %shown, ?wait, "Command timed out");
                CommandResult::failed(
                    output,
                    SshError::Timeout {
                        host: self.host_name().to_string(),
                        command: shown,
                        timeout: wait,
                    },
                )
            }
            Outcome::Lost => {
                self.manager.mark_lost(&connection).await;
                CommandResult::failed(
                    output,
                    SshError::RemoteExitNonZero {
                        host: self.host_name().to_string(),
                        command: shown,
                        code: EXIT_TRANSPORT_ERROR,
                    },
                )
            }
        }
    }

    fn cancelled(&self) -> CommandResult {
        CommandResult::failed(
            String::new(),
            SshError::Cancelled {
                host: self.host_name().to_string(),
                command: self.shown_command(),
            },
        )
    }

    async fn read_loop(
        &mut self,
        connection: &dyn RemoteConnection,
        channel: &mut dyn ExecChannel,
        wait: Duration,
    ) -> (Outcome, Option<u32>) {
        let mut scanner = SentinelScanner::new();
        let mut exit_status: Option<u32> = None;

        let outcome = 'read: loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'read Outcome::Cancelled,
                event = tokio::time::timeout(wait, channel.next_event()) => event,
            };

            match event {
                Err(_) => break 'read Outcome::TimedOut,
                Ok(None) => {
                    break 'read if connection.is_closed() {
                        Outcome::Lost
                    } else {
                        Outcome::Finished
                    };
                }
                Ok(Some(ChannelEvent::ExitStatus(code))) => exit_status = Some(code),
                Ok(Some(ChannelEvent::Eof)) => {
                    if exit_status.is_none() {
                        exit_status = self.wait_exit_status(channel).await;
                    }
                    break 'read Outcome::Finished;
                }
                Ok(Some(ChannelEvent::Data(bytes))) => {
                    for event in scanner.feed(&bytes) {
                        match event {
                            ScanEvent::Output(text) => self.emit(text),
                            ScanEvent::SudoPrompt => {
                                if let Err(outcome) = self.answer_sudo(connection, channel).await {
                                    break 'read outcome;
                                }
                                scanner.expect_echo();
                            }
                            ScanEvent::SudoFailed => {
                                debug!(host = %self.host_name(), "sudo rejected the password; clearing cache");
                                self.manager.context().credentials.clear_sudo_password();
                            }
                        }
                    }
                }
            }
        };

        if let Some(rest) = scanner.finish() {
            self.emit(rest);
        }
        (outcome, exit_status)
    }

    /// After end-of-stream, give the exit status a short grace period.
    async fn wait_exit_status(&self, channel: &mut dyn ExecChannel) -> Option<u32> {
        let grace = self.manager.context().config.exit_status_grace;
        tokio::time::timeout(grace, async {
            while let Some(event) = channel.next_event().await {
                if let ChannelEvent::ExitStatus(code) = event {
                    return Some(code);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    fn emit(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        if let Some(callback) = &self.request.on_chunk {
            callback(&text);
        }
        if self.request.show_output {
            self.manager.context().transcript.record(TranscriptEntry::Output {
                host: self.host_name().to_string(),
                text: text.clone(),
            });
        }
        self.output.push_str(&text);
    }

    /// Answer a sudo prompt from the cache or the prompter.
    async fn answer_sudo(
        &mut self,
        connection: &dyn RemoteConnection,
        channel: &mut dyn ExecChannel,
    ) -> Result<(), Outcome> {
        let ctx = Arc::clone(self.manager.context());
        self.sudo_prompts += 1;

        let password = match ctx.credentials.sudo_password() {
            Some(password) => {
                debug!(host = %self.host_name(), "Answering sudo prompt from cache");
                password
            }
            None => {
                let context = PromptContext {
                    host: self.host_name().to_string(),
                    username: self.manager.host().username.clone(),
                    attempt: self.sudo_prompts,
                };
                let answer = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Outcome::Cancelled),
                    answer = ctx.prompter.request_secret(&SecretKind::SudoPassword, &context) => answer,
                };
                match answer {
                    Some(password) => {
                        ctx.credentials.set_sudo_password(password.clone());
                        password
                    }
                    None => {
                        info!(host = %self.host_name(), "sudo password prompt declined");
                        return Err(Outcome::Cancelled);
                    }
                }
            }
        };

        if let Err(e) = channel.write(format!("{password}\n").as_bytes()).await {
            warn!(host = %self.host_name(), "Could not answer sudo prompt: {}", e);
            return Err(if connection.is_closed() {
                Outcome::Lost
            } else {
                Outcome::Finished
            });
        }
        Ok(())
    }
}
