//! russh implementation of the transport seams.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive and compression settings; no
//!    inactivity timeout, since connections are kept for the engine's lifetime.
//! 2. **Connection Establishment**: TCP connect plus handshake, bounded by the
//!    connect timeout. The host key is checked during the handshake.
//! 3. **Authentication**: driven step by step by the engine's authenticator
//!    through [`AuthTransport`].
//! 4. **Channels**: one session channel per command, with a pseudo-terminal.
//!
//! ## Retry Strategy
//!
//! Only step 2 is retried, with exponential backoff and jitter via `backon`:
//!
//! - **Initial delay**: `EngineConfig::retry_delay` (default: 1000ms)
//! - **Maximum delay**: capped at `EngineConfig::max_retry_delay` (10 seconds)
//! - **Maximum attempts**: `EngineConfig::max_retries` (default: 3)
//!
//! Host-key rejections and other non-transient failures are never retried.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::{ChannelMsg, Disconnect, MethodKind, keys};
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use super::error::{Result, SshError};
use super::host_keys::HostKeyVerifier;
use super::session::SshClientHandler;
use super::transport::{
    AuthMethodKind, AuthTransport, ChannelEvent, Connector, ExecChannel, InteractivePrompt,
    InteractiveStep, KeyAttempt, NoneAuthOutcome, RemoteConnection,
};
use super::types::HostSpec;

/// Pseudo-terminal width; wide enough that tools do not wrap their output.
const PTY_COLUMNS: u32 = 512;
const PTY_ROWS: u32 = 24;

/// Build russh client configuration.
///
/// Keepalive every 30 seconds, max 3 missed keepalives. Compression prefers
/// zlib when `compress` is set.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Opens russh transports with connect retries.
pub struct RusshConnector {
    connect_timeout: Duration,
    compression: bool,
    max_retries: u32,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl RusshConnector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            compression: config.compression,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay(),
        }
    }

    async fn connect_once(
        &self,
        host: &HostSpec,
        verifier: &HostKeyVerifier,
    ) -> Result<client::Handle<SshClientHandler>> {
        let config = build_client_config(self.compression);
        let handler = SshClientHandler::new(host.address.clone(), host.port, verifier.clone());
        let connect_future = client::connect(config, (host.address.as_str(), host.port), handler);

        let unreachable = |reason: String| SshError::HostUnreachable {
            host: host.name.clone(),
            reason,
        };

        tokio::time::timeout(self.connect_timeout, connect_future)
            .await
            .map_err(|_| {
                unreachable(format!(
                    "Connection timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| match e {
                SshError::Transport(reason) | SshError::Io(reason) => {
                    unreachable(format!("Failed to connect: {reason}"))
                }
                other => other,
            })
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        host: &HostSpec,
        verifier: &HostKeyVerifier,
    ) -> Result<Box<dyn AuthTransport>> {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(self.max_retry_delay)
            .with_max_times(self.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!(
                    "SSH connection retry attempt {} to {}",
                    current_attempt,
                    host.endpoint()
                );
            }
            self.connect_once(host, verifier).await
        })
        .retry(backoff)
        .when(|e: &SshError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!(
                    "SSH connection to {} failed with non-retryable error: {}",
                    host.endpoint(),
                    e
                );
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok(handle) => {
                if total_attempts > 1 {
                    info!(
                        "SSH connection to {} succeeded after {} retry attempt(s)",
                        host.endpoint(),
                        total_attempts - 1
                    );
                }
                Ok(Box::new(RusshTransport { handle }))
            }
            Err(e) => {
                error!(
                    "SSH connection to {} failed after {} attempt(s). Last error: {}",
                    host.endpoint(),
                    total_attempts,
                    e
                );
                Err(e)
            }
        }
    }
}

fn offered_methods(remaining: &russh::MethodSet) -> Vec<AuthMethodKind> {
    let mut offered = Vec::new();
    if remaining.contains(&MethodKind::PublicKey) {
        offered.push(AuthMethodKind::PublicKey);
    }
    if remaining.contains(&MethodKind::KeyboardInteractive) {
        offered.push(AuthMethodKind::KeyboardInteractive);
    }
    if remaining.contains(&MethodKind::Password) {
        offered.push(AuthMethodKind::Password);
    }
    offered
}

fn interactive_step(response: KeyboardInteractiveAuthResponse) -> InteractiveStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => InteractiveStep::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => InteractiveStep::Failure,
        KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => InteractiveStep::Prompts(
            prompts
                .into_iter()
                .map(|p| InteractivePrompt {
                    text: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        ),
    }
}

/// A connected russh handle that has not finished authenticating.
pub struct RusshTransport {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl AuthTransport for RusshTransport {
    async fn try_none(&mut self, username: &str) -> Result<NoneAuthOutcome> {
        match self.handle.authenticate_none(username).await? {
            AuthResult::Success => Ok(NoneAuthOutcome::Accepted),
            AuthResult::Failure {
                remaining_methods, ..
            } => Ok(NoneAuthOutcome::Offered(offered_methods(&remaining_methods))),
        }
    }

    async fn try_public_key(
        &mut self,
        username: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<KeyAttempt> {
        if !key_path.exists() {
            return Ok(KeyAttempt::Unavailable(format!(
                "{} does not exist",
                key_path.display()
            )));
        }

        let key_pair = match keys::load_secret_key(key_path, passphrase) {
            Ok(key) => key,
            Err(e) => {
                let message = e.to_string();
                if passphrase.is_some() || message.to_lowercase().contains("encrypt") {
                    debug!("Key {:?} needs a passphrase: {}", key_path, message);
                    return Ok(KeyAttempt::NeedsPassphrase);
                }
                return Ok(KeyAttempt::Unavailable(message));
            }
        };

        let hash_alg = self
            .handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = self
            .handle
            .authenticate_publickey(username, key_with_hash)
            .await?;

        Ok(if result.success() {
            KeyAttempt::Accepted
        } else {
            KeyAttempt::Rejected
        })
    }

    async fn start_interactive(&mut self, username: &str) -> Result<InteractiveStep> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(username, None)
            .await?;
        Ok(interactive_step(response))
    }

    async fn respond_interactive(&mut self, responses: Vec<String>) -> Result<InteractiveStep> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(interactive_step(response))
    }

    async fn try_password(&mut self, username: &str, password: &str) -> Result<bool> {
        let result = self.handle.authenticate_password(username, password).await?;
        Ok(result.success())
    }

    async fn close(&mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }

    fn into_connection(self: Box<Self>) -> Arc<dyn RemoteConnection> {
        Arc::new(RusshConnection {
            handle: self.handle,
        })
    }
}

/// An authenticated russh handle.
pub struct RusshConnection {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Box::new(RusshChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

pub struct RusshChannel {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl ExecChannel for RusshChannel {
    async fn exec(&mut self, command: &str, pty: bool) -> Result<()> {
        if pty {
            // Terminal echo off: answered passwords must never come back as output.
            self.channel
                .request_pty(
                    true,
                    "xterm",
                    PTY_COLUMNS,
                    PTY_ROWS,
                    0,
                    0,
                    &[(russh::Pty::ECHO, 0)],
                )
                .await?;
        }
        self.channel.exec(true, command).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ChannelEvent::Data(data.to_vec())),
                ChannelMsg::ExtendedData { data, .. } => {
                    return Some(ChannelEvent::Data(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ChannelEvent::ExitStatus(exit_status));
                }
                ChannelMsg::Eof => return Some(ChannelEvent::Eof),
                ChannelMsg::Close => return None,
                _ => continue,
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}
