//! Engine configuration.
//!
//! Every setting is resolved with a three-tier priority:
//!
//! 1. **Override** - value supplied by the caller (highest priority)
//! 2. **Environment Variable** - value from the process environment
//! 3. **Default** - built-in default (lowest priority)
//!
//! Unparseable environment values fall through to the default. A timeout of
//! zero seconds is treated the same way, from an override or the environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CLUSTER_SSH_CONNECT_TIMEOUT` | 30s | Transport connect timeout in seconds |
//! | `CLUSTER_SSH_COMMAND_TIMEOUT` | 180s | Command wait timeout in seconds |
//! | `CLUSTER_SSH_RECONNECT_WAIT` | 20s | Bound on joining an in-flight connection attempt |
//! | `CLUSTER_SSH_CHANNEL_TIMEOUT` | 10s | Channel-open watchdog in seconds |
//! | `CLUSTER_SSH_MAX_RETRIES` | 3 | Connect retries for transient errors |
//! | `CLUSTER_SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `CLUSTER_SSH_COMPRESSION` | true | Enable zlib compression |
//! | `CLUSTER_SSH_KNOWN_HOSTS` | `~/.ssh/known_hosts` | Host-key store |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::types::home_dir;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;
pub(crate) const DEFAULT_RECONNECT_WAIT_SECS: u64 = 20;
pub(crate) const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_EXIT_STATUS_GRACE_MS: u64 = 2000;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap in seconds
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 10;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "CLUSTER_SSH_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "CLUSTER_SSH_COMMAND_TIMEOUT";
pub(crate) const RECONNECT_WAIT_ENV_VAR: &str = "CLUSTER_SSH_RECONNECT_WAIT";
pub(crate) const CHANNEL_TIMEOUT_ENV_VAR: &str = "CLUSTER_SSH_CHANNEL_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "CLUSTER_SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "CLUSTER_SSH_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "CLUSTER_SSH_COMPRESSION";
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "CLUSTER_SSH_KNOWN_HOSTS";

/// Resolve a parsed setting with priority: override -> env var -> default
pub(crate) fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// Like [`resolve_parsed`] for a timeout in seconds, skipping zero values.
pub(crate) fn resolve_timeout_secs(param: Option<u64>, env_var: &str, default: u64) -> u64 {
    let param = param.filter(|secs| *secs > 0);
    match resolve_parsed(param, env_var, default) {
        0 => default,
        secs => secs,
    }
}

/// Resolve the compression setting with priority: override -> env var -> default (true)
pub(crate) fn resolve_compression(param: Option<bool>) -> bool {
    if let Some(compress) = param {
        return compress;
    }

    if let Ok(raw) = env::var(COMPRESSION_ENV_VAR) {
        return raw.eq_ignore_ascii_case("true") || raw == "1";
    }

    true
}

/// Resolve the known-hosts path with priority: override -> env var -> `~/.ssh/known_hosts`
pub(crate) fn resolve_known_hosts(param: Option<PathBuf>) -> PathBuf {
    if let Some(path) = param {
        return path;
    }

    if let Ok(raw) = env::var(KNOWN_HOSTS_ENV_VAR)
        && !raw.trim().is_empty()
    {
        return PathBuf::from(raw.trim());
    }

    default_known_hosts()
}

fn default_known_hosts() -> PathBuf {
    home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".ssh")
        .join("known_hosts")
}

/// Caller-supplied overrides; `None` fields fall back to env or default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub connect_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub reconnect_wait_secs: Option<u64>,
    pub channel_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub compression: Option<bool>,
    pub known_hosts: Option<PathBuf>,
}

/// Timeouts and policies shared by every connection of one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connect_timeout: Duration,
    /// Wait timeout for output or end-of-stream while a command runs.
    pub command_timeout: Duration,
    /// Bound on joining an in-flight connection attempt.
    pub reconnect_wait: Duration,
    pub channel_open_timeout: Duration,
    /// How long to wait for an exit status once the stream ended.
    pub exit_status_grace: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compression: bool,
    pub known_hosts: PathBuf,
}

impl Default for EngineConfig {
    /// Built-in defaults only; the environment is not consulted.
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            reconnect_wait: Duration::from_secs(DEFAULT_RECONNECT_WAIT_SECS),
            channel_open_timeout: Duration::from_secs(DEFAULT_CHANNEL_TIMEOUT_SECS),
            exit_status_grace: Duration::from_millis(DEFAULT_EXIT_STATUS_GRACE_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compression: true,
            known_hosts: default_known_hosts(),
        }
    }
}

impl EngineConfig {
    /// Resolve every setting from overrides, then the environment, then defaults.
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_timeout_secs(
                overrides.connect_timeout_secs,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            command_timeout: Duration::from_secs(resolve_timeout_secs(
                overrides.command_timeout_secs,
                COMMAND_TIMEOUT_ENV_VAR,
                DEFAULT_COMMAND_TIMEOUT_SECS,
            )),
            reconnect_wait: Duration::from_secs(resolve_parsed(
                overrides.reconnect_wait_secs,
                RECONNECT_WAIT_ENV_VAR,
                DEFAULT_RECONNECT_WAIT_SECS,
            )),
            channel_open_timeout: Duration::from_secs(resolve_timeout_secs(
                overrides.channel_timeout_secs,
                CHANNEL_TIMEOUT_ENV_VAR,
                DEFAULT_CHANNEL_TIMEOUT_SECS,
            )),
            exit_status_grace: Duration::from_millis(DEFAULT_EXIT_STATUS_GRACE_MS),
            max_retries: resolve_parsed(
                overrides.max_retries,
                MAX_RETRIES_ENV_VAR,
                DEFAULT_MAX_RETRIES,
            ),
            retry_delay: Duration::from_millis(resolve_parsed(
                overrides.retry_delay_ms,
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            compression: resolve_compression(overrides.compression),
            known_hosts: resolve_known_hosts(overrides.known_hosts),
        }
    }

    /// Upper bound for the backoff between connect retries.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(MAX_RETRY_DELAY_SECS)
    }
}
