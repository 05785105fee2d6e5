#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cluster_ssh::engine::{
    CommandRequest, ConfigOverrides, EngineConfig, HostKeyPrompt, HostKeyStatus, HostSpec,
    PipelineResult, PromptContext, Prompter, SecretKind, SshEngine, StaticPrompter,
    parse_host_spec, split_steps,
};

/// Run commands on cluster nodes over SSH
#[derive(Parser, Debug)]
#[command(name = "cluster-ssh", version)]
struct Args {
    /// Target as user@host[:port]; repeat for several hosts
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    /// Private key file to try; repeat for several (default: ~/.ssh/id_ed25519, ~/.ssh/id_rsa)
    #[arg(long = "key")]
    keys: Vec<PathBuf>,

    /// Run every step through sudo
    #[arg(long)]
    sudo: bool,

    /// Command wait timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Record the steps without running them
    #[arg(long)]
    dry_run: bool,

    /// Trust unknown host keys without asking (changed keys are still refused)
    #[arg(long)]
    accept_new_host_keys: bool,

    #[arg(long, env = "CLUSTER_SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "CLUSTER_SSH_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[arg(long, env = "CLUSTER_SSH_SUDO_PASSWORD", hide_env_values = true)]
    sudo_password: Option<String>,

    /// Steps separated by `;;;`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

/// Preconfigured secrets first, then the terminal.
struct TerminalPrompter {
    preset: StaticPrompter,
    // one question on the terminal at a time, whatever the host
    terminal: Mutex<()>,
}

async fn read_line(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        write!(stderr, "{question}").ok()?;
        stderr.flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

async fn read_secret(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || rpassword::prompt_password(question).ok())
        .await
        .ok()
        .flatten()
}

/// Question shown for a secret, and whether the answer is typed blind.
fn secret_question(kind: &SecretKind, context: &PromptContext) -> (String, bool) {
    match kind {
        SecretKind::KeyPassphrase { path } => (
            format!("Enter passphrase for key '{}': ", path.display()),
            true,
        ),
        SecretKind::Password => (
            format!("{}@{}'s password: ", context.username, context.host),
            true,
        ),
        SecretKind::Interactive { prompt, echo } => {
            (format!("[{}] {}", context.host, prompt), !echo)
        }
        SecretKind::SudoPassword => (
            format!("[sudo] password for {}@{}: ", context.username, context.host),
            true,
        ),
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn request_secret(&self, kind: &SecretKind, context: &PromptContext) -> Option<String> {
        // a preset that was already rejected is not offered twice
        if context.attempt <= 1
            && let Some(secret) = self.preset.request_secret(kind, context).await
        {
            return Some(secret);
        }

        let (question, masked) = secret_question(kind, context);
        let _terminal = self.terminal.lock().await;
        if masked {
            read_secret(question).await
        } else {
            read_line(question).await
        }
    }

    async fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool {
        if self.preset.confirm_host_key(prompt).await {
            return true;
        }

        let _terminal = self.terminal.lock().await;
        let warning = match prompt.status {
            HostKeyStatus::Changed => "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!\n",
            _ => "",
        };
        let question = format!(
            "{warning}The authenticity of host '{}' (port {}) can't be established.\n\
             {} key fingerprint is {}.\n\
             Are you sure you want to continue connecting (yes/no)? ",
            prompt.host, prompt.port, prompt.algorithm, prompt.fingerprint
        );
        matches!(read_line(question).await.as_deref(), Some("yes"))
    }
}

#[derive(Serialize)]
struct HostReport {
    host: String,
    exit_code: i32,
    steps_run: usize,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dry_run: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let hosts = args
        .hosts
        .iter()
        .map(|h| {
            parse_host_spec(h).map(|spec| {
                let spec = spec.with_sudo(args.sudo);
                if args.keys.is_empty() {
                    spec
                } else {
                    spec.with_key_paths(args.keys.clone())
                }
            })
        })
        .collect::<Result<Vec<HostSpec>, _>>()?;

    let config = EngineConfig::resolve(ConfigOverrides {
        command_timeout_secs: args.timeout,
        ..Default::default()
    });
    let prompter = Arc::new(TerminalPrompter {
        preset: StaticPrompter {
            password: args.password.clone(),
            passphrase: args.passphrase.clone(),
            sudo_password: args.sudo_password.clone(),
            accept_new_keys: args.accept_new_host_keys,
        },
        terminal: Mutex::new(()),
    });
    let engine = SshEngine::new(config, prompter);
    for host in &hosts {
        engine.add_host(host.clone());
    }

    let steps = split_steps(&args.command.join(" "));
    let template = CommandRequest::new("")
        .with_visibility(true, false)
        .dry_run(args.dry_run);
    info!(hosts = hosts.len(), steps = steps.len(), "Running");

    let mut runs = std::pin::pin!(join_all(
        hosts
            .iter()
            .map(|h| engine.run(&h.name, &steps, &template))
    ));
    let results: Vec<PipelineResult> = tokio::select! {
        results = &mut runs => results,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; cancelling running commands");
            engine.shutdown().await;
            runs.await
        }
    };

    let reports: Vec<HostReport> = hosts
        .iter()
        .zip(results)
        .map(|(host, result)| HostReport {
            host: host.name.clone(),
            exit_code: result.exit_code,
            steps_run: result.steps_run,
            output: result.output,
            error: result.error.map(|e| e.to_string()),
            dry_run: engine.host(&host.name).and_then(|m| m.last_dry_run()),
        })
        .collect();
    engine.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("== {} (exit {}) ==", report.host, report.exit_code);
            if let Some(command) = &report.dry_run {
                println!("dry run, last step: {command}");
            }
            print!("{}", report.output);
            if let Some(error) = &report.error {
                eprintln!("{}: {}", report.host, error);
            }
        }
    }

    let worst = reports.iter().map(|r| r.exit_code).max().unwrap_or(0);
    Ok(ExitCode::from(u8::try_from(worst.clamp(0, 255)).unwrap_or(u8::MAX)))
}
