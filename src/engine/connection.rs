//! Per-host connection management.
//!
//! # Architecture
//!
//! - `ConnectionManager`: owns the single live connection of one host, the
//!   in-flight connection attempt, and the registry of running commands.
//! - `EngineContext`: what every manager of one engine shares (configuration,
//!   connector, host-key verifier, prompter, credential cache, transcript).
//!
//! # Connection Attempts
//!
//! A connect or reconnect runs as its own spawned task. Its completion is kept
//! as a shared future, so every caller that arrives while it runs joins the
//! same attempt instead of starting a second one. Command execution joins it
//! with a bound (`EngineConfig::reconnect_wait`) and fails with
//! `NotConnected` rather than queueing indefinitely.
//!
//! A previous connection is always torn down before a new attempt starts.
//! A failed attempt leaves the manager `Failed`; the next call tries again.
//! An explicit disconnect fences the attempt in flight: whatever it was
//! negotiating is dropped and never becomes the host's connection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{Authenticator, CredentialCache};
use super::config::EngineConfig;
use super::error::{Result, SshError};
use super::host_keys::HostKeyVerifier;
use super::prompt::Prompter;
use super::transcript::Transcript;
use super::transport::{Connector, ExecChannel, RemoteConnection};
use super::types::{ConnectionInfo, HostSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticated,
    Failed,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        })
    }
}

/// Shared by every host of one engine.
pub struct EngineContext {
    pub config: EngineConfig,
    pub connector: Arc<dyn Connector>,
    pub verifier: HostKeyVerifier,
    pub prompter: Arc<dyn Prompter>,
    pub credentials: CredentialCache,
    pub transcript: Arc<dyn Transcript>,
    /// Cancelled once the engine shuts down; pipelines stop between steps.
    pub shutdown: CancellationToken,
}

/// A command currently executing on this host.
#[derive(Debug, Clone, Serialize)]
pub struct RunningCommand {
    pub id: Uuid,
    /// Redacted command text.
    pub command: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

pub struct ConnectionManager {
    host: HostSpec,
    ctx: Arc<EngineContext>,
    state: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Arc<dyn RemoteConnection>>>,
    attempt: Mutex<Option<ConnectAttempt>>,
    // cancelled by `disconnect`; replaced for every new attempt
    fence: Mutex<CancellationToken>,
    running: DashMap<Uuid, RunningCommand>,
    last_dry_run: Mutex<Option<String>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    auth_method: Mutex<Option<&'static str>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionManager {
    pub fn new(host: HostSpec, ctx: Arc<EngineContext>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            host,
            ctx,
            state,
            connection: Mutex::new(None),
            attempt: Mutex::new(None),
            fence: Mutex::new(CancellationToken::new()),
            running: DashMap::new(),
            last_dry_run: Mutex::new(None),
            connected_at: Mutex::new(None),
            auth_method: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(host = %self.host.name, from = %previous, to = %state, "Connection state changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Authenticated && self.live_connection().is_some()
    }

    fn live_connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        lock(&self.connection)
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Join the in-flight attempt, or spawn a new one.
    fn attempt(self: &Arc<Self>) -> ConnectAttempt {
        let mut slot = lock(&self.attempt);
        if let Some(attempt) = slot.as_ref()
            && attempt.peek().is_none()
        {
            debug!(host = %self.host.name, "Joining in-flight connection attempt");
            return attempt.clone();
        }

        let fence = CancellationToken::new();
        *lock(&self.fence) = fence.clone();
        let this = Arc::clone(self);
        let worker = tokio::spawn(async move { this.establish(fence).await });
        let attempt = async move {
            match worker.await {
                Ok(result) => result,
                Err(e) => Err(SshError::Transport(format!("connection worker failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        *slot = Some(attempt.clone());
        attempt
    }

    /// Connect and authenticate unless already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.attempt().await
    }

    /// Drop the current connection and establish a new one.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        info!(host = %self.host.name, "Reconnecting");
        self.teardown().await;
        self.attempt().await
    }

    /// A live connection, reconnecting with a bounded wait if there is none.
    pub(crate) async fn ensure_connected(self: &Arc<Self>) -> Result<Arc<dyn RemoteConnection>> {
        if self.state() == ConnectionState::Authenticated
            && let Some(conn) = self.live_connection()
        {
            return Ok(conn);
        }

        let wait = self.ctx.config.reconnect_wait;
        match tokio::time::timeout(wait, self.attempt()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(host = %self.host.name, ?wait, "Connection attempt still running; giving up");
                return Err(SshError::NotConnected {
                    host: self.host.name.clone(),
                });
            }
        }

        self.live_connection().ok_or_else(|| SshError::NotConnected {
            host: self.host.name.clone(),
        })
    }

    async fn establish(&self, fence: CancellationToken) -> Result<()> {
        if fence.is_cancelled() {
            return Err(self.fenced());
        }
        self.teardown().await;
        self.set_state(ConnectionState::Connecting);
        info!(host = %self.host.name, endpoint = %self.host.endpoint(), user = %self.host.username, "Connecting");

        let work = async {
            let mut transport = self
                .ctx
                .connector
                .connect(&self.host, &self.ctx.verifier)
                .await?;
            let method = Authenticator::new(
                &self.host,
                &self.ctx.credentials,
                self.ctx.prompter.as_ref(),
            )
            .authenticate(transport.as_mut())
            .await?;
            Ok::<_, SshError>((transport.into_connection(), method))
        };
        let result = tokio::select! {
            biased;
            _ = fence.cancelled() => {
                info!(host = %self.host.name, "Connection attempt abandoned by disconnect");
                return Err(self.fenced());
            }
            result = work => result,
        };

        match result {
            Ok((connection, method)) => {
                {
                    // `disconnect` cancels the fence before taking this lock
                    let mut slot = lock(&self.connection);
                    if !fence.is_cancelled() {
                        *slot = Some(connection);
                        *lock(&self.connected_at) = Some(Utc::now());
                        *lock(&self.auth_method) = Some(method);
                        self.set_state(ConnectionState::Authenticated);
                        info!(host = %self.host.name, method, "Connected");
                        return Ok(());
                    }
                }
                info!(host = %self.host.name, "Connection attempt abandoned by disconnect");
                connection.disconnect().await;
                Err(self.fenced())
            }
            Err(e) => {
                if fence.is_cancelled() {
                    return Err(self.fenced());
                }
                self.set_state(ConnectionState::Failed);
                match &e {
                    SshError::AuthenticationExhausted { .. } => {
                        error!(host = %self.host.name, "{}", e)
                    }
                    _ => warn!(host = %self.host.name, "Connection attempt failed: {}", e),
                }
                Err(e)
            }
        }
    }

    fn fenced(&self) -> SshError {
        SshError::NotConnected {
            host: self.host.name.clone(),
        }
    }

    async fn teardown(&self) {
        let previous = lock(&self.connection).take();
        *lock(&self.connected_at) = None;
        *lock(&self.auth_method) = None;
        if let Some(connection) = previous {
            connection.disconnect().await;
        }
    }

    /// Tear down `connection` if it is still the current one.
    pub(crate) async fn mark_lost(&self, connection: &Arc<dyn RemoteConnection>) {
        let lost = {
            let mut slot = lock(&self.connection);
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, connection) => slot.take(),
                _ => None,
            }
        };
        if let Some(lost) = lost {
            warn!(host = %self.host.name, "Connection lost; next command reconnects");
            *lock(&self.connected_at) = None;
            *lock(&self.auth_method) = None;
            self.set_state(ConnectionState::Disconnected);
            lost.disconnect().await;
        }
    }

    /// Explicit disconnect: cancels running commands and clears cached credentials.
    pub async fn disconnect(&self) {
        lock(&self.fence).cancel();
        lock(&self.attempt).take();
        let cancelled = self.cancel_running();
        if cancelled > 0 {
            info!(host = %self.host.name, cancelled, "Cancelled running commands");
        }
        self.teardown().await;
        self.ctx.credentials.clear();
        self.set_state(ConnectionState::Disconnected);
        info!(host = %self.host.name, "Disconnected");
    }

    /// Open an execution channel, guarded by the channel-open watchdog.
    pub(crate) async fn open_channel(
        self: &Arc<Self>,
    ) -> Result<(Arc<dyn RemoteConnection>, Box<dyn ExecChannel>)> {
        let connection = self.ensure_connected().await?;
        let limit = self.ctx.config.channel_open_timeout;

        match tokio::time::timeout(limit, connection.open_channel()).await {
            Ok(Ok(channel)) => Ok((connection, channel)),
            Ok(Err(e)) => {
                if connection.is_closed() {
                    self.mark_lost(&connection).await;
                }
                Err(SshError::ChannelOpen {
                    host: self.host.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(host = %self.host.name, ?limit, "Channel open timed out; dropping connection");
                self.mark_lost(&connection).await;
                Err(SshError::ChannelOpen {
                    host: self.host.name.clone(),
                    reason: format!("no channel after {limit:?}"),
                })
            }
        }
    }

    pub(crate) fn register(&self, command: RunningCommand) {
        self.running.insert(command.id, command);
    }

    pub(crate) fn unregister(&self, id: &Uuid) -> Option<RunningCommand> {
        self.running.remove(id).map(|(_, command)| command)
    }

    pub fn running_commands(&self) -> Vec<RunningCommand> {
        self.running.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancel one running command; `false` if it is not running here.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.running.get(id) {
            Some(command) => {
                command.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_running(&self) -> usize {
        let mut count = 0;
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
            count += 1;
        }
        count
    }

    pub(crate) fn record_dry_run(&self, command: &str) {
        *lock(&self.last_dry_run) = Some(command.to_string());
    }

    /// Command text of the most recent dry run on this host.
    pub fn last_dry_run(&self) -> Option<String> {
        lock(&self.last_dry_run).clone()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.name.clone(),
            endpoint: self.host.endpoint(),
            username: self.host.username.clone(),
            state: self.state().to_string(),
            connected_at: *lock(&self.connected_at),
            auth_method: lock(&self.auth_method).map(str::to_string),
            running_commands: self.running.len(),
        }
    }
}
