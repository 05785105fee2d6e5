//! Seams between the engine and the SSH library.
//!
//! The connection manager, authenticator and executor only see these traits.
//! `client` implements them on top of russh; tests script them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::Result;
use super::host_keys::HostKeyVerifier;
use super::types::HostSpec;

/// Authentication methods the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethodKind {
    PublicKey,
    KeyboardInteractive,
    Password,
}

impl fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::KeyboardInteractive => "keyboard-interactive",
            AuthMethodKind::Password => "password",
        })
    }
}

/// Answer to a `none` authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoneAuthOutcome {
    /// The server let the user in without credentials.
    Accepted,
    /// Methods the server is willing to continue with.
    Offered(Vec<AuthMethodKind>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAttempt {
    Accepted,
    /// The key loaded but the server refused it.
    Rejected,
    /// The key file is encrypted and the passphrase was missing or wrong.
    NeedsPassphrase,
    /// The key file cannot be used at all.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractivePrompt {
    pub text: String,
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveStep {
    Success,
    Failure,
    /// The server wants answers; an empty list is a valid (no-op) round.
    Prompts(Vec<InteractivePrompt>),
}

/// Produces live transports that still need authentication.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the transport and verify the host key.
    async fn connect(&self, host: &HostSpec, verifier: &HostKeyVerifier) -> Result<Box<dyn AuthTransport>>;
}

/// A live but unauthenticated transport.
#[async_trait]
pub trait AuthTransport: Send {
    async fn try_none(&mut self, username: &str) -> Result<NoneAuthOutcome>;

    async fn try_public_key(
        &mut self,
        username: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<KeyAttempt>;

    async fn start_interactive(&mut self, username: &str) -> Result<InteractiveStep>;

    async fn respond_interactive(&mut self, responses: Vec<String>) -> Result<InteractiveStep>;

    /// `true` when the server accepted the password.
    async fn try_password(&mut self, username: &str, password: &str) -> Result<bool>;

    async fn close(&mut self);

    /// Hand the authenticated transport over as a shareable connection.
    fn into_connection(self: Box<Self>) -> Arc<dyn RemoteConnection>;
}

/// An authenticated connection that channels can be opened on.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes from the pseudo-terminal (stdout and stderr interleaved).
    Data(Vec<u8>),
    ExitStatus(u32),
    Eof,
}

/// One execution channel, bound to exactly one command.
#[async_trait]
pub trait ExecChannel: Send {
    /// Request a pseudo-terminal if `pty` is set, then start `command`.
    async fn exec(&mut self, command: &str, pty: bool) -> Result<()>;

    /// Next event, or `None` once the channel is closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    async fn close(&mut self);
}
