use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::{Result, SshError};

/// Command completed successfully.
pub const EXIT_SUCCESS: i32 = 0;
/// Command was cancelled by its caller.
pub const EXIT_CANCELED: i32 = 130;
/// Generic timeout before completion. Also the placeholder a command carries
/// until the remote side reports a real exit status.
pub const EXIT_TIMEOUT: i32 = 100;
/// No host is bound to the request.
pub const EXIT_NO_HOST: i32 = 101;
/// Execution could not be started.
pub const EXIT_START_FAILED: i32 = 102;
/// Transport or IO failure while the command was running.
pub const EXIT_TRANSPORT_ERROR: i32 = 255;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// The two conventional private key files tried when a host names none.
pub(crate) const DEFAULT_KEY_FILES: &[&str] = &["id_ed25519", "id_rsa"];

/// Home directory of the current user, if known.
pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// `~/.ssh/<name>` for each conventional key file.
pub(crate) fn default_key_paths() -> Vec<PathBuf> {
    match home_dir() {
        Some(home) => DEFAULT_KEY_FILES
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .collect(),
        None => Vec::new(),
    }
}

/// Identity of a managed host. Owned by the caller; the engine never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSpec {
    /// Name the host is registered under.
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Candidate private keys, tried in order.
    pub key_paths: Vec<PathBuf>,
    /// Commands on this host run through `sudo`.
    pub sudo: bool,
}

impl HostSpec {
    pub fn new(address: impl Into<String>, username: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            key_paths: default_key_paths(),
            sudo: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_paths(mut self, key_paths: Vec<PathBuf>) -> Self {
        self.key_paths = key_paths;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// `address:port` as used for the TCP connect.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Parse `user@host[:port]`, `user@[v6addr]:port` or `host` (current user).
pub fn parse_host_spec(input: &str) -> Result<HostSpec> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SshError::Config("empty host specification".to_string()));
    }

    let (username, rest) = match input.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        Some(_) => {
            return Err(SshError::Config(format!(
                "missing user name in '{input}'"
            )));
        }
        None => (
            std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            input,
        ),
    };

    let (address, port) = split_host_port(rest)?;
    if address.is_empty() {
        return Err(SshError::Config(format!("missing host in '{input}'")));
    }

    Ok(HostSpec::new(address, username).with_port(port))
}

fn split_host_port(rest: &str) -> Result<(String, u16)> {
    if let Some(stripped) = rest.strip_prefix('[') {
        let Some((addr, tail)) = stripped.split_once(']') else {
            return Err(SshError::Config(format!("unterminated '[' in '{rest}'")));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => return Err(SshError::Config(format!("unexpected '{tail}' after address"))),
        };
        return Ok((addr.to_string(), port));
    }

    // A bare IPv6 address has more than one colon and no port.
    if rest.matches(':').count() > 1 {
        return Ok((rest.to_string(), DEFAULT_SSH_PORT));
    }

    match rest.split_once(':') {
        Some((addr, port)) => Ok((addr.to_string(), parse_port(port)?)),
        None => Ok((rest.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| SshError::Config(format!("invalid port '{port}'")))
}

/// Per-chunk output callback.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One command to run on one host.
#[derive(Clone)]
pub struct CommandRequest {
    pub command: String,
    /// Command text appears in the transcript.
    pub show_command: bool,
    /// Output appears in the transcript.
    pub show_output: bool,
    /// Wait timeout; `None` uses the engine default.
    pub timeout: Option<Duration>,
    pub on_chunk: Option<OutputCallback>,
    /// Record the command without running it.
    pub dry_run: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            show_command: true,
            show_output: true,
            timeout: None,
            on_chunk: None,
            dry_run: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_visibility(mut self, show_command: bool, show_output: bool) -> Self {
        self.show_command = show_command;
        self.show_output = show_output;
        self
    }

    pub fn on_chunk(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(callback));
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Same options, different command text.
    pub(crate) fn for_command(&self, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("command", &self.command)
            .field("show_command", &self.show_command)
            .field("show_output", &self.show_output)
            .field("timeout", &self.timeout)
            .field("on_chunk", &self.on_chunk.is_some())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

/// Outcome of one command: everything streamed so far plus the exit code.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
    /// Set when the command did not complete normally.
    pub error: Option<SshError>,
}

impl CommandResult {
    pub fn completed(output: String, exit_code: i32) -> Self {
        Self {
            output,
            exit_code,
            error: None,
        }
    }

    pub fn failed(output: String, error: SshError) -> Self {
        Self {
            output,
            exit_code: error.exit_code(),
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS && self.error.is_none()
    }

    /// Output on success; the carried error, or `RemoteExitNonZero`, otherwise.
    pub fn into_result(self, host: &str, command: &str) -> Result<String> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.exit_code != EXIT_SUCCESS {
            return Err(SshError::RemoteExitNonZero {
                host: host.to_string(),
                command: command.to_string(),
                code: self.exit_code,
            });
        }
        Ok(self.output)
    }
}

/// Snapshot of one host's connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub endpoint: String,
    pub username: String,
    pub state: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub auth_method: Option<String>,
    pub running_commands: usize,
}
