//! Remote command execution engine.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: host identity, command requests and results, exit codes
//! - `config`: configuration resolution with environment variable support
//! - `error`: error taxonomy and retry classification
//! - `prompt`: caller-implemented secret and host-key prompts
//! - `host_keys`: known_hosts verification and persistence
//! - `auth`: authentication state machine and credential cache
//! - `transport`: seams between the engine and the SSH library
//! - `client` / `session`: russh implementation of those seams
//! - `connection`: per-host connection manager
//! - `executor` / `scanner` / `sudo`: single-command execution
//! - `pipeline`: ordered multi-step commands
//! - `registry` / `service`: the `SshEngine` facade
//! - `transcript`: sink for visible commands and output

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod host_keys;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod scanner;
pub mod service;
pub(crate) mod session;
pub mod sudo;
#[cfg(test)]
pub(crate) mod testing;
pub mod transcript;
pub mod transport;
pub mod types;

pub use config::{ConfigOverrides, EngineConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Result, SshError};
pub use executor::{CommandExecutor, ExecutionHandle};
pub use host_keys::{HostKeyStatus, HostKeyStore, KnownHostsFile};
pub use pipeline::{CommandPipeline, PipelineHandle, PipelineResult, STEP_DELIMITER, split_steps};
pub use prompt::{HostKeyPrompt, PromptContext, Prompter, SecretKind, StaticPrompter};
pub use service::SshEngine;
pub use transcript::{MemoryTranscript, TracingTranscript, Transcript, TranscriptEntry};
pub use types::{CommandRequest, CommandResult, ConnectionInfo, HostSpec, parse_host_spec};
