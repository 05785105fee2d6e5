//! Engine facade: the host registry plus execute/run entry points.
//!
//! Callers address hosts by name. Every host added to one engine shares the
//! engine's configuration, connector, host-key store, prompter, credential
//! cache and transcript.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::auth::CredentialCache;
use super::client::RusshConnector;
use super::config::EngineConfig;
use super::connection::{ConnectionManager, EngineContext};
use super::error::{Result, SshError};
use super::executor::{CommandExecutor, ExecutionHandle};
use super::host_keys::{HostKeyStore, HostKeyVerifier, KnownHostsFile};
use super::pipeline::{CommandPipeline, PipelineHandle, PipelineResult, split_steps};
use super::prompt::Prompter;
use super::registry::HostRegistry;
use super::transcript::{TracingTranscript, Transcript};
use super::transport::Connector;
use super::types::{CommandRequest, CommandResult, ConnectionInfo, HostSpec};

pub struct SshEngine {
    ctx: Arc<EngineContext>,
    hosts: HostRegistry,
}

impl SshEngine {
    /// An engine on russh, trusting host keys from `config.known_hosts`.
    pub fn new(config: EngineConfig, prompter: Arc<dyn Prompter>) -> Self {
        let connector = Arc::new(RusshConnector::new(&config));
        let store = Arc::new(KnownHostsFile::new(config.known_hosts.clone()));
        Self::from_parts(config, connector, store, prompter, Arc::new(TracingTranscript))
    }

    pub fn from_parts(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        host_keys: Arc<dyn HostKeyStore>,
        prompter: Arc<dyn Prompter>,
        transcript: Arc<dyn Transcript>,
    ) -> Self {
        let verifier = HostKeyVerifier::new(host_keys, Arc::clone(&prompter));
        Self {
            ctx: Arc::new(EngineContext {
                config,
                connector,
                verifier,
                prompter,
                credentials: CredentialCache::new(),
                transcript,
                shutdown: CancellationToken::new(),
            }),
            hosts: HostRegistry::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.ctx.credentials
    }

    /// Register `host`. A host with the same name keeps its existing manager.
    pub fn add_host(&self, host: HostSpec) -> Arc<ConnectionManager> {
        self.hosts
            .insert(ConnectionManager::new(host, Arc::clone(&self.ctx)))
    }

    pub fn host(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.hosts.get(name)
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.names()
    }

    /// Disconnect and forget a host.
    pub async fn remove_host(&self, name: &str) -> bool {
        match self.hosts.remove(name) {
            Some(manager) => {
                manager.disconnect().await;
                true
            }
            None => false,
        }
    }

    fn manager(&self, name: &str) -> Result<Arc<ConnectionManager>> {
        self.hosts
            .get(name)
            .ok_or_else(|| SshError::UnknownHost(name.to_string()))
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        self.manager(name)?.connect().await
    }

    pub async fn reconnect(&self, name: &str) -> Result<()> {
        self.manager(name)?.reconnect().await
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.manager(name)?.disconnect().await;
        Ok(())
    }

    /// Run one command and wait. An unknown host yields exit code 101.
    pub async fn execute(&self, name: &str, request: CommandRequest) -> CommandResult {
        match self.manager(name) {
            Ok(manager) => CommandExecutor::new(manager).execute(request).await,
            Err(e) => CommandResult::failed(String::new(), e),
        }
    }

    pub fn execute_detached(
        &self,
        name: &str,
        request: CommandRequest,
        on_complete: impl FnOnce(&CommandResult) + Send + 'static,
    ) -> Result<ExecutionHandle> {
        let manager = self.manager(name)?;
        Ok(CommandExecutor::new(manager).execute_detached(request, on_complete))
    }

    /// Run `steps` in order on one host, stopping at the first failure.
    pub async fn run(&self, name: &str, steps: &[String], template: &CommandRequest) -> PipelineResult {
        match self.manager(name) {
            Ok(manager) => {
                CommandPipeline::new(CommandExecutor::new(manager))
                    .run(steps, template)
                    .await
            }
            Err(e) => PipelineResult {
                output: String::new(),
                exit_code: e.exit_code(),
                steps_run: 0,
                error: Some(e),
            },
        }
    }

    /// [`run`](Self::run) on a `;;;`-delimited script.
    pub async fn run_script(&self, name: &str, script: &str, template: &CommandRequest) -> PipelineResult {
        self.run(name, &split_steps(script), template).await
    }

    pub fn spawn_pipeline(
        &self,
        name: &str,
        steps: Vec<String>,
        template: CommandRequest,
    ) -> Result<PipelineHandle> {
        let manager = self.manager(name)?;
        Ok(CommandPipeline::new(CommandExecutor::new(manager)).spawn(steps, template))
    }

    /// Snapshot of every host, sorted by name.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.hosts.all().iter().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.host.cmp(&b.host));
        infos
    }

    /// Stop every pipeline and disconnect every host. Pipelines started
    /// afterwards are cancelled before their first step.
    pub async fn shutdown(&self) {
        let managers = self.hosts.all();
        info!(hosts = managers.len(), "Shutting down");
        self.ctx.shutdown.cancel();
        join_all(managers.iter().map(|m| m.disconnect())).await;
    }
}
