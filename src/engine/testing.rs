//! Scripted stand-ins for the SSH transport, the prompter and the host-key
//! store.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::auth::CredentialCache;
use super::config::EngineConfig;
use super::connection::EngineContext;
use super::error::{Result, SshError};
use super::host_keys::{HostKeyStatus, HostKeyStore, HostKeyVerifier};
use super::prompt::{HostKeyPrompt, PromptContext, Prompter, SecretKind};
use super::scanner::{SUDO_FAILED_SENTINEL, SUDO_PROMPT_SENTINEL};
use super::transcript::MemoryTranscript;
use super::transport::{
    AuthMethodKind, AuthTransport, ChannelEvent, Connector, ExecChannel, InteractivePrompt,
    InteractiveStep, KeyAttempt, NoneAuthOutcome, RemoteConnection,
};
use super::types::HostSpec;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A private key file as the mock server sees it.
#[derive(Debug, Clone)]
pub(crate) struct KeyFile {
    passphrase: Option<String>,
    authorized: bool,
}

impl KeyFile {
    pub(crate) fn authorized(passphrase: Option<&str>) -> Self {
        Self {
            passphrase: passphrase.map(str::to_string),
            authorized: true,
        }
    }

    pub(crate) fn unauthorized(passphrase: Option<&str>) -> Self {
        Self {
            passphrase: passphrase.map(str::to_string),
            authorized: false,
        }
    }
}

/// One scripted action of the mock shell.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Output(Vec<u8>),
    Delay(Duration),
    Exit(u32),
    Eof,
    /// Never produce anything again.
    Hang,
    /// The whole connection dies.
    Drop,
    /// Print the sudo prompt and check what gets written back.
    Sudo { password: String, attempts_left: u32 },
    AwaitSudoAnswer { password: String, attempts_left: u32 },
}

impl Step {
    pub(crate) fn output(text: &str) -> Self {
        Step::Output(text.as_bytes().to_vec())
    }
}

type Shell = Arc<dyn Fn(&str) -> Vec<Step> + Send + Sync>;

/// Inner command of a `sudo ... bash -c '<escaped>'` wrapper.
fn unwrap_sudo(command: &str) -> Option<String> {
    if !command.starts_with("sudo ") {
        return None;
    }
    let start = command.find("bash -c '")? + "bash -c '".len();
    let inner = command[start..].strip_suffix('\'')?;
    Some(inner.replace("'\"'\"'", "'"))
}

/// A shell that understands a handful of commands.
///
/// - `echo X`: prints `X`, exits 0
/// - `false`: exits 1; `exit N`: exits N
/// - `sleep ...` / `hang`: never finishes
/// - `partial X`: prints `X`, then never finishes
/// - `noexit X`: prints `X`, ends the stream without an exit status
/// - `drop`: kills the connection mid-command
/// - anything else: exits 127
pub(crate) fn cooperative_shell(command: &str) -> Vec<Step> {
    let command = command.trim();
    let (head, rest) = command.split_once(' ').unwrap_or((command, ""));
    match head {
        "echo" => vec![
            Step::output(&format!("{rest}\r\n")),
            Step::Exit(0),
            Step::Eof,
        ],
        "true" => vec![Step::Exit(0), Step::Eof],
        "false" => vec![Step::Exit(1), Step::Eof],
        "exit" => vec![Step::Exit(rest.parse().unwrap_or(1)), Step::Eof],
        "sleep" | "hang" => vec![Step::Hang],
        "partial" => vec![Step::output(&format!("{rest}\r\n")), Step::Hang],
        "noexit" => vec![Step::output(&format!("{rest}\r\n")), Step::Eof],
        "drop" => vec![Step::output("bye\r\n"), Step::Drop],
        _ => vec![
            Step::output(&format!("bash: {head}: command not found\r\n")),
            Step::Exit(127),
            Step::Eof,
        ],
    }
}

struct ServerState {
    accept_none: bool,
    offered: Vec<AuthMethodKind>,
    keys: HashMap<PathBuf, KeyFile>,
    password: Option<String>,
    sudo_password: Option<String>,
    silent_interactive: bool,
    connect_error: Option<SshError>,
    connect_delay: Duration,
    open_delay: Duration,
    shell: Shell,

    auth_log: Vec<String>,
    connects: usize,
    closed_transports: usize,
    disconnects: usize,
    executed: Vec<String>,
    inputs: Vec<String>,
    closed_channels: usize,
}

/// The remote side: accepted credentials, shell behaviour and counters.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                accept_none: false,
                offered: Vec::new(),
                keys: HashMap::new(),
                password: None,
                sudo_password: None,
                silent_interactive: false,
                connect_error: None,
                connect_delay: Duration::ZERO,
                open_delay: Duration::ZERO,
                shell: Arc::new(cooperative_shell),
                auth_log: Vec::new(),
                connects: 0,
                closed_transports: 0,
                disconnects: 0,
                executed: Vec::new(),
                inputs: Vec::new(),
                closed_channels: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.state)
    }

    pub(crate) fn accept_none(self) -> Self {
        self.state().accept_none = true;
        self
    }

    pub(crate) fn offer(self, methods: &[AuthMethodKind]) -> Self {
        self.state().offered = methods.to_vec();
        self
    }

    pub(crate) fn with_key(self, path: &str, key: KeyFile) -> Self {
        self.state().keys.insert(PathBuf::from(path), key);
        self
    }

    pub(crate) fn with_password(self, password: &str) -> Self {
        self.state().password = Some(password.to_string());
        self
    }

    /// Commands run through sudo ask for this password.
    pub(crate) fn with_sudo_password(self, password: &str) -> Self {
        self.state().sudo_password = Some(password.to_string());
        self
    }

    /// Offer keyboard-interactive but fail it without sending a prompt.
    pub(crate) fn silent_interactive(self) -> Self {
        self.state().silent_interactive = true;
        self
    }

    pub(crate) fn fail_connect(self, error: SshError) -> Self {
        self.state().connect_error = Some(error);
        self
    }

    pub(crate) fn connect_delay(self, delay: Duration) -> Self {
        self.state().connect_delay = delay;
        self
    }

    pub(crate) fn open_delay(self, delay: Duration) -> Self {
        self.set_open_delay(delay);
        self
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    pub(crate) fn shell(self, shell: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static) -> Self {
        self.state().shell = Arc::new(shell);
        self
    }

    pub(crate) fn transport(&self) -> Box<dyn AuthTransport> {
        Box::new(MockTransport {
            server: self.clone(),
        })
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: self.clone(),
        })
    }

    fn log(&self, entry: String) {
        self.state().auth_log.push(entry);
    }

    fn steps_for(&self, command: &str) -> VecDeque<Step> {
        let (shell, sudo_password) = {
            let state = self.state();
            (state.shell.clone(), state.sudo_password.clone())
        };
        match unwrap_sudo(command) {
            Some(inner) => {
                let mut steps = VecDeque::new();
                if let Some(password) = sudo_password {
                    steps.push_back(Step::Sudo {
                        password,
                        attempts_left: 3,
                    });
                }
                steps.extend(shell(&inner));
                steps
            }
            None => shell(command).into(),
        }
    }

    pub(crate) fn auth_log(&self) -> Vec<String> {
        self.state().auth_log.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state().connects
    }

    pub(crate) fn closed_transports(&self) -> usize {
        self.state().closed_transports
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Command text of every exec, in order.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Everything written to command input, in order.
    pub(crate) fn inputs(&self) -> Vec<String> {
        self.state().inputs.clone()
    }

    pub(crate) fn closed_channels(&self) -> usize {
        self.state().closed_channels
    }
}

struct MockTransport {
    server: MockServer,
}

#[async_trait]
impl AuthTransport for MockTransport {
    async fn try_none(&mut self, _username: &str) -> Result<NoneAuthOutcome> {
        self.server.log("none".into());
        let state = self.server.state();
        Ok(if state.accept_none {
            NoneAuthOutcome::Accepted
        } else {
            NoneAuthOutcome::Offered(state.offered.clone())
        })
    }

    async fn try_public_key(
        &mut self,
        _username: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<KeyAttempt> {
        self.server.log(format!(
            "publickey:{}:{}",
            key_path.display(),
            passphrase.unwrap_or("-")
        ));
        let state = self.server.state();
        let Some(key) = state.keys.get(key_path) else {
            return Ok(KeyAttempt::Unavailable("no such file".into()));
        };
        if key.passphrase.is_some() && key.passphrase.as_deref() != passphrase {
            return Ok(KeyAttempt::NeedsPassphrase);
        }
        Ok(if key.authorized && state.offered.contains(&AuthMethodKind::PublicKey) {
            KeyAttempt::Accepted
        } else {
            KeyAttempt::Rejected
        })
    }

    async fn start_interactive(&mut self, _username: &str) -> Result<InteractiveStep> {
        self.server.log("interactive:start".into());
        if self.server.state().silent_interactive {
            return Ok(InteractiveStep::Failure);
        }
        Ok(InteractiveStep::Prompts(vec![InteractivePrompt {
            text: "Password: ".into(),
            echo: false,
        }]))
    }

    async fn respond_interactive(&mut self, responses: Vec<String>) -> Result<InteractiveStep> {
        self.server.log(format!("respond:{}", responses.join(",")));
        let state = self.server.state();
        Ok(match (responses.first(), state.password.as_ref()) {
            (Some(answer), Some(password)) if answer == password => InteractiveStep::Success,
            _ => InteractiveStep::Failure,
        })
    }

    async fn try_password(&mut self, _username: &str, password: &str) -> Result<bool> {
        self.server.log(format!("password:{password}"));
        Ok(self.server.state().password.as_deref() == Some(password))
    }

    async fn close(&mut self) {
        self.server.state().closed_transports += 1;
    }

    fn into_connection(self: Box<Self>) -> Arc<dyn RemoteConnection> {
        Arc::new(MockConnection {
            server: self.server,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct MockConnection {
    server: MockServer,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>> {
        let delay = self.server.state().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(SshError::Transport("connection closed".into()));
        }
        Ok(Box::new(MockChannel {
            server: self.server.clone(),
            connection_closed: self.closed.clone(),
            steps: VecDeque::new(),
            pending_input: VecDeque::new(),
            closed: false,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.state().disconnects += 1;
        }
    }
}

struct MockChannel {
    server: MockServer,
    connection_closed: Arc<AtomicBool>,
    steps: VecDeque<Step>,
    pending_input: VecDeque<String>,
    closed: bool,
}

#[async_trait]
impl ExecChannel for MockChannel {
    async fn exec(&mut self, command: &str, _pty: bool) -> Result<()> {
        self.server.state().executed.push(command.to_string());
        self.steps = self.server.steps_for(command);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if self.closed {
                return None;
            }
            match self.steps.pop_front()? {
                Step::Output(bytes) => return Some(ChannelEvent::Data(bytes)),
                Step::Delay(delay) => tokio::time::sleep(delay).await,
                Step::Exit(code) => return Some(ChannelEvent::ExitStatus(code)),
                Step::Eof => return Some(ChannelEvent::Eof),
                Step::Hang => std::future::pending::<()>().await,
                Step::Drop => {
                    self.connection_closed.store(true, Ordering::SeqCst);
                    return None;
                }
                Step::Sudo {
                    password,
                    attempts_left,
                } => {
                    self.steps.push_front(Step::AwaitSudoAnswer {
                        password,
                        attempts_left,
                    });
                    return Some(ChannelEvent::Data(SUDO_PROMPT_SENTINEL.as_bytes().to_vec()));
                }
                Step::AwaitSudoAnswer {
                    password,
                    attempts_left,
                } => {
                    let Some(answer) = self.pending_input.pop_front() else {
                        // the answer arrives through `write` before the next call
                        self.steps.push_front(Step::AwaitSudoAnswer {
                            password,
                            attempts_left,
                        });
                        std::future::pending::<()>().await;
                        continue;
                    };
                    if answer.trim_end_matches('\n') == password {
                        return Some(ChannelEvent::Data(b"\r\n".to_vec()));
                    }
                    if attempts_left > 1 {
                        self.steps.push_front(Step::Sudo {
                            password,
                            attempts_left: attempts_left - 1,
                        });
                    } else {
                        self.steps = VecDeque::from(vec![
                            Step::output("sudo: 3 incorrect password attempts\r\n"),
                            Step::Exit(1),
                            Step::Eof,
                        ]);
                    }
                    return Some(ChannelEvent::Data(
                        format!("\r\n{SUDO_FAILED_SENTINEL}\r\n").into_bytes(),
                    ));
                }
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.server.state().inputs.push(text.clone());
        self.pending_input.push_back(text);
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.state().closed_channels += 1;
        }
    }
}

struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &HostSpec,
        verifier: &HostKeyVerifier,
    ) -> Result<Box<dyn AuthTransport>> {
        let (delay, error) = {
            let mut state = self.server.state();
            state.connects += 1;
            (state.connect_delay, state.connect_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        verifier
            .check(&host.address, host.port, "ssh-ed25519", b"mock-host-key", "SHA256:mock")
            .await?;
        Ok(self.server.transport())
    }
}

/// In-memory host-key store.
#[derive(Default)]
pub(crate) struct MemoryHostKeyStore {
    keys: Mutex<HashMap<(String, u16, String), Vec<u8>>>,
}

impl HostKeyStore for MemoryHostKeyStore {
    fn verify(&self, host: &str, port: u16, algorithm: &str, key: &[u8]) -> Result<HostKeyStatus> {
        let keys = lock(&self.keys);
        Ok(
            match keys.get(&(host.to_string(), port, algorithm.to_string())) {
                Some(stored) if stored == key => HostKeyStatus::Trusted,
                Some(_) => HostKeyStatus::Changed,
                None => HostKeyStatus::NewKey,
            },
        )
    }

    fn accept(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key: &[u8],
        _status: HostKeyStatus,
    ) -> Result<()> {
        lock(&self.keys).insert((host.to_string(), port, algorithm.to_string()), key.to_vec());
        Ok(())
    }
}

/// Answers secret requests from per-kind queues. An empty queue cancels.
pub(crate) struct ScriptedPrompter {
    answers: Mutex<HashMap<&'static str, VecDeque<String>>>,
    accept_host_keys: bool,
    requests: Mutex<Vec<SecretKind>>,
    host_key_prompts: AtomicUsize,
}

impl ScriptedPrompter {
    /// Accepts host keys; every queue empty.
    pub(crate) fn new() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            accept_host_keys: true,
            requests: Mutex::new(Vec::new()),
            host_key_prompts: AtomicUsize::new(0),
        }
    }

    fn queue<'a>(self, label: &'static str, answers: impl IntoIterator<Item = &'a str>) -> Self {
        lock(&self.answers)
            .entry(label)
            .or_default()
            .extend(answers.into_iter().map(str::to_string));
        self
    }

    pub(crate) fn passphrases<'a>(self, answers: impl IntoIterator<Item = &'a str>) -> Self {
        self.queue("key passphrase", answers)
    }

    pub(crate) fn passwords<'a>(self, answers: impl IntoIterator<Item = &'a str>) -> Self {
        self.queue("password", answers)
    }

    pub(crate) fn interactive<'a>(self, answers: impl IntoIterator<Item = &'a str>) -> Self {
        self.queue("interactive response", answers)
    }

    pub(crate) fn sudo_passwords<'a>(self, answers: impl IntoIterator<Item = &'a str>) -> Self {
        self.queue("sudo password", answers)
    }

    pub(crate) fn accept_host_keys(mut self, accept: bool) -> Self {
        self.accept_host_keys = accept;
        self
    }

    pub(crate) fn requests(&self) -> Vec<SecretKind> {
        lock(&self.requests).clone()
    }

    /// Requests made for one kind of secret, by label.
    pub(crate) fn count(&self, label: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|kind| kind.label() == label)
            .count()
    }

    pub(crate) fn host_key_prompts(&self) -> usize {
        self.host_key_prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn request_secret(&self, kind: &SecretKind, _context: &PromptContext) -> Option<String> {
        lock(&self.requests).push(kind.clone());
        lock(&self.answers)
            .get_mut(kind.label())
            .and_then(|queue| queue.pop_front())
    }

    async fn confirm_host_key(&self, _prompt: &HostKeyPrompt) -> bool {
        self.host_key_prompts.fetch_add(1, Ordering::SeqCst);
        self.accept_host_keys
    }
}

/// Timeouts short enough for tests.
pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        connect_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(5),
        reconnect_wait: Duration::from_secs(2),
        channel_open_timeout: Duration::from_millis(200),
        exit_status_grace: Duration::from_millis(100),
        max_retries: 0,
        retry_delay: Duration::from_millis(10),
        compression: false,
        known_hosts: std::env::temp_dir()
            .join(format!("cluster-ssh-{}", uuid::Uuid::new_v4()))
            .join("known_hosts"),
    }
}

pub(crate) fn test_context_with(
    server: &MockServer,
    prompter: Arc<ScriptedPrompter>,
    transcript: Arc<MemoryTranscript>,
) -> Arc<EngineContext> {
    Arc::new(EngineContext {
        config: test_config(),
        connector: server.connector(),
        verifier: HostKeyVerifier::new(Arc::new(MemoryHostKeyStore::default()), prompter.clone()),
        prompter,
        credentials: CredentialCache::new(),
        transcript,
        shutdown: CancellationToken::new(),
    })
}

pub(crate) fn test_context(server: &MockServer, prompter: ScriptedPrompter) -> Arc<EngineContext> {
    test_context_with(server, Arc::new(prompter), Arc::new(MemoryTranscript::new()))
}
