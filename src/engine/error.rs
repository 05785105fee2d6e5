//! Error taxonomy for the remote execution engine.
//!
//! Every failure that reaches a caller is an [`SshError`]. Each variant maps to
//! one of the engine's exit codes through [`SshError::exit_code`], so callers
//! that only look at `{output, exit_code}` see the same classification as
//! callers that inspect the error itself.
//!
//! # Retry Classification
//!
//! The engine retries exactly one thing on its own: establishing the TCP/SSH
//! transport. Whether a transport failure is worth retrying is decided from the
//! error message:
//!
//! 1. **Authentication failures (NOT retryable)**: wrong credentials, denied
//!    access. Retrying only risks account lockouts.
//! 2. **Connection errors (retryable)**: refused, reset, timed out, unreachable.
//! 3. **Unknown errors**: retried unless they look like an SSH protocol error
//!    without a timeout/connect hint.
//!
//! Authentication keywords take precedence over connection keywords.

use std::time::Duration;

use thiserror::Error;

use super::types::{EXIT_CANCELED, EXIT_NO_HOST, EXIT_START_FAILED, EXIT_TIMEOUT, EXIT_TRANSPORT_ERROR};

/// Errors surfaced by the engine.
#[derive(Debug, Clone, Error)]
pub enum SshError {
    /// The transport could not be established.
    #[error("host {host} is unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    /// Every authentication method the server offered was tried and failed.
    #[error("authentication to {host} failed: all methods exhausted (tried: {tried})")]
    AuthenticationExhausted { host: String, tried: String },

    /// Authentication was aborted: a prompt was cancelled or a host key was rejected.
    #[error("authentication to {host} abandoned: {reason}")]
    AuthenticationAbandoned { host: String, reason: String },

    /// No output and no end-of-stream arrived within the wait timeout.
    #[error("command on {host} timed out after {timeout:?}: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    /// The command was cancelled by its caller.
    #[error("command on {host} was cancelled: {command}")]
    Cancelled { host: String, command: String },

    /// An execution channel could not be opened on a live connection.
    #[error("could not open channel on {host}: {reason}")]
    ChannelOpen { host: String, reason: String },

    /// The remote command finished with a non-zero status.
    #[error("command on {host} exited with {code}: {command}")]
    RemoteExitNonZero {
        host: String,
        command: String,
        code: i32,
    },

    /// No authenticated connection became available within the reconnect bound.
    #[error("not connected to {host}")]
    NotConnected { host: String },

    /// No host with this name is registered with the engine.
    #[error("no host named '{0}'")]
    UnknownHost(String),

    /// The transport failed underneath a live connection or channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// The host-key store could not be read or written.
    #[error("host key error: {0}")]
    HostKey(String),

    /// Invalid configuration or host description.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local IO failure.
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias using SshError
pub type Result<T> = std::result::Result<T, SshError>;

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(err.to_string())
    }
}

impl SshError {
    /// Exit code reported for a command that failed with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SshError::Cancelled { .. } => EXIT_CANCELED,
            SshError::Timeout { .. } => EXIT_TIMEOUT,
            SshError::UnknownHost(_) => EXIT_NO_HOST,
            SshError::RemoteExitNonZero { code, .. } => *code,
            SshError::Transport(_) | SshError::Io(_) => EXIT_TRANSPORT_ERROR,
            SshError::HostUnreachable { .. }
            | SshError::AuthenticationExhausted { .. }
            | SshError::AuthenticationAbandoned { .. }
            | SshError::ChannelOpen { .. }
            | SshError::NotConnected { .. }
            | SshError::HostKey(_)
            | SshError::Config(_) => EXIT_START_FAILED,
        }
    }

    /// Whether establishing the transport should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SshError::HostUnreachable { reason, .. } => is_retryable_message(reason),
            SshError::Transport(reason) => is_retryable_message(reason),
            _ => false,
        }
    }

    /// Host name carried by the error, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            SshError::HostUnreachable { host, .. }
            | SshError::AuthenticationExhausted { host, .. }
            | SshError::AuthenticationAbandoned { host, .. }
            | SshError::Timeout { host, .. }
            | SshError::Cancelled { host, .. }
            | SshError::ChannelOpen { host, .. }
            | SshError::RemoteExitNonZero { host, .. }
            | SshError::NotConnected { host } => Some(host),
            SshError::UnknownHost(name) => Some(name),
            _ => None,
        }
    }
}

const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "host key",
];

const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Classify a transport error message as transient (`true`) or permanent.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    !lower.contains("ssh") || lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod exit_codes {
        use super::*;

        #[test]
        fn test_cancel_and_timeout_codes() {
            let cancelled = SshError::Cancelled {
                host: "node1".into(),
                command: "sleep 10".into(),
            };
            let timeout = SshError::Timeout {
                host: "node1".into(),
                command: "sleep 10".into(),
                timeout: Duration::from_secs(1),
            };
            assert_eq!(cancelled.exit_code(), 130);
            assert_eq!(timeout.exit_code(), 100);
        }

        #[test]
        fn test_start_failures_map_to_102() {
            let errors = [
                SshError::NotConnected { host: "n".into() },
                SshError::ChannelOpen {
                    host: "n".into(),
                    reason: "watchdog".into(),
                },
                SshError::AuthenticationExhausted {
                    host: "n".into(),
                    tried: "password".into(),
                },
            ];
            for err in errors {
                assert_eq!(err.exit_code(), 102, "{err}");
            }
        }

        #[test]
        fn test_unknown_host_and_transport() {
            assert_eq!(SshError::UnknownHost("x".into()).exit_code(), 101);
            assert_eq!(SshError::Transport("eof".into()).exit_code(), 255);
        }

        #[test]
        fn test_remote_exit_code_is_passed_through() {
            let err = SshError::RemoteExitNonZero {
                host: "n".into(),
                command: "false".into(),
                code: 3,
            };
            assert_eq!(err.exit_code(), 3);
            assert_eq!(err.host(), Some("n"));
        }
    }

    mod retry_classification {
        use super::*;

        #[test]
        fn test_auth_failures_are_not_retryable() {
            assert!(!is_retryable_message("Permission denied (publickey)"));
            assert!(!is_retryable_message("Authentication failed"));
            assert!(!is_retryable_message("host key rejected"));
        }

        #[test]
        fn test_connection_errors_are_retryable() {
            assert!(is_retryable_message("Connection refused (os error 111)"));
            assert!(is_retryable_message("connection reset by peer"));
            assert!(is_retryable_message("No route to host"));
            assert!(is_retryable_message("connect timed out after 30s"));
        }

        #[test]
        fn test_auth_keyword_takes_precedence() {
            assert!(!is_retryable_message(
                "connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_are_not_retryable() {
            assert!(!is_retryable_message("SSH protocol error"));
            assert!(is_retryable_message("SSH failed to connect"));
            assert!(is_retryable_message("something odd happened"));
        }

        #[test]
        fn test_only_transport_variants_retry() {
            let unreachable = SshError::HostUnreachable {
                host: "n".into(),
                reason: "Connection refused".into(),
            };
            assert!(unreachable.is_retryable());

            let exhausted = SshError::AuthenticationExhausted {
                host: "n".into(),
                tried: "password".into(),
            };
            assert!(!exhausted.is_retryable());
        }
    }
}
