//! Authentication state machine for one connection attempt.
//!
//! Methods are tried in a fixed precedence, restricted to what the server
//! offers in answer to a `none` request:
//!
//! 1. **Public key**: cached key first, then up to [`MAX_KEY_FILES`] key
//!    files. Encrypted keys get up to [`MAX_PASSPHRASE_ATTEMPTS`] passphrases.
//! 2. **Keyboard-interactive**: prompts answered from the cached password or
//!    the prompter. A server that offers the method but never sends a prompt
//!    has it disabled for the rest of the attempt.
//! 3. **Password**: cached password, then up to [`MAX_PASSWORD_ATTEMPTS`]
//!    prompted ones, then one more pass over the keys with a single
//!    passphrase attempt each.
//!
//! A failed method falls through to the next one. Only running out of methods
//! surfaces [`SshError::AuthenticationExhausted`]. A cancelled prompt aborts
//! the whole attempt.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialCache};
use crate::engine::error::{Result, SshError};
use crate::engine::prompt::{PromptContext, Prompter, SecretKind};
use crate::engine::transport::{
    AuthMethodKind, AuthTransport, InteractiveStep, KeyAttempt, NoneAuthOutcome,
};
use crate::engine::types::HostSpec;

/// Key files tried per public-key pass (the two conventional key types).
pub const MAX_KEY_FILES: usize = 2;
pub const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;
pub const MAX_PASSWORD_ATTEMPTS: u32 = 3;
/// Prompt rounds answered before keyboard-interactive is given up.
pub const MAX_INTERACTIVE_ROUNDS: u32 = 3;

enum InteractiveOutcome {
    Authenticated,
    Failed,
    /// Offered but no prompt was ever issued.
    Disabled,
}

pub struct Authenticator<'a> {
    host: &'a HostSpec,
    cache: &'a CredentialCache,
    prompter: &'a dyn Prompter,
}

impl<'a> Authenticator<'a> {
    pub fn new(host: &'a HostSpec, cache: &'a CredentialCache, prompter: &'a dyn Prompter) -> Self {
        Self {
            host,
            cache,
            prompter,
        }
    }

    /// Authenticate `transport`, returning the name of the method that worked.
    ///
    /// The transport is closed on any error.
    pub async fn authenticate(&self, transport: &mut dyn AuthTransport) -> Result<&'static str> {
        match self.run(transport).await {
            Ok(method) => {
                info!(host = %self.host.name, method, "Authenticated");
                Ok(method)
            }
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn run(&self, transport: &mut dyn AuthTransport) -> Result<&'static str> {
        let offered = match transport.try_none(&self.host.username).await? {
            NoneAuthOutcome::Accepted => return Ok("none"),
            NoneAuthOutcome::Offered(methods) => methods,
        };
        debug!(host = %self.host.name, ?offered, "Server offered authentication methods");

        let mut tried: Vec<AuthMethodKind> = Vec::new();

        if offered.contains(&AuthMethodKind::PublicKey) {
            tried.push(AuthMethodKind::PublicKey);
            if self.try_keys(transport, MAX_PASSPHRASE_ATTEMPTS).await? {
                return Ok("publickey");
            }
        }

        if offered.contains(&AuthMethodKind::KeyboardInteractive) {
            tried.push(AuthMethodKind::KeyboardInteractive);
            match self.try_interactive(transport).await? {
                InteractiveOutcome::Authenticated => return Ok("keyboard-interactive"),
                InteractiveOutcome::Disabled => {
                    warn!(
                        host = %self.host.name,
                        "keyboard-interactive offered but no prompt issued; disabled for this attempt"
                    );
                }
                InteractiveOutcome::Failed => {}
            }
        }

        if offered.contains(&AuthMethodKind::Password) {
            tried.push(AuthMethodKind::Password);
            if self.try_password(transport).await? {
                return Ok("password");
            }

            if offered.contains(&AuthMethodKind::PublicKey) {
                debug!(host = %self.host.name, "Retrying public key after password exhaustion");
                if self.try_keys(transport, 1).await? {
                    return Ok("publickey");
                }
            }
        }

        let tried = if tried.is_empty() {
            "none".to_string()
        } else {
            tried
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        Err(SshError::AuthenticationExhausted {
            host: self.host.name.clone(),
            tried,
        })
    }

    async fn ask(&self, kind: SecretKind, attempt: u32) -> Result<String> {
        debug!(host = %self.host.name, kind = kind.label(), attempt, "Requesting secret");
        let context = PromptContext {
            host: self.host.name.clone(),
            username: self.host.username.clone(),
            attempt,
        };
        self.prompter
            .request_secret(&kind, &context)
            .await
            .ok_or_else(|| SshError::AuthenticationAbandoned {
                host: self.host.name.clone(),
                reason: format!("{} prompt cancelled", kind.label()),
            })
    }

    /// Key files for one pass: the host's candidates, at most [`MAX_KEY_FILES`].
    fn key_candidates(&self, skip: Option<&Path>) -> Vec<PathBuf> {
        self.host
            .key_paths
            .iter()
            .filter(|p| Some(p.as_path()) != skip)
            .take(MAX_KEY_FILES)
            .cloned()
            .collect()
    }

    async fn try_keys(&self, transport: &mut dyn AuthTransport, passphrase_attempts: u32) -> Result<bool> {
        let user = &self.host.username;
        let cached = self.cache.key();

        if let Some(key) = &cached {
            let attempt = transport
                .try_public_key(user, &key.path, key.passphrase.as_deref())
                .await?;
            if attempt == KeyAttempt::Accepted {
                return Ok(true);
            }
            debug!(host = %self.host.name, path = ?key.path, "Cached key not accepted; dropping it");
            self.cache.forget_key();
        }

        let skip = cached.as_ref().map(|k| k.path.as_path());
        for path in self.key_candidates(skip) {
            if self.try_key_file(transport, &path, passphrase_attempts).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn try_key_file(
        &self,
        transport: &mut dyn AuthTransport,
        path: &Path,
        passphrase_attempts: u32,
    ) -> Result<bool> {
        let user = &self.host.username;
        match transport.try_public_key(user, path, None).await? {
            KeyAttempt::Accepted => {
                self.cache.record_success(Credential::PublicKey {
                    path: path.to_path_buf(),
                    passphrase: None,
                });
                return Ok(true);
            }
            KeyAttempt::Rejected => {
                debug!(host = %self.host.name, ?path, "Key rejected");
                return Ok(false);
            }
            KeyAttempt::Unavailable(reason) => {
                debug!(host = %self.host.name, ?path, reason, "Key unavailable");
                return Ok(false);
            }
            KeyAttempt::NeedsPassphrase => {}
        }

        for attempt in 1..=passphrase_attempts {
            let passphrase = self
                .ask(
                    SecretKind::KeyPassphrase {
                        path: path.to_path_buf(),
                    },
                    attempt,
                )
                .await?;
            match transport.try_public_key(user, path, Some(&passphrase)).await? {
                KeyAttempt::Accepted => {
                    self.cache.record_success(Credential::PublicKey {
                        path: path.to_path_buf(),
                        passphrase: Some(passphrase),
                    });
                    return Ok(true);
                }
                KeyAttempt::NeedsPassphrase => {
                    debug!(host = %self.host.name, ?path, attempt, "Wrong passphrase");
                }
                KeyAttempt::Rejected | KeyAttempt::Unavailable(_) => return Ok(false),
            }
        }
        Ok(false)
    }

    async fn try_interactive(&self, transport: &mut dyn AuthTransport) -> Result<InteractiveOutcome> {
        let mut cached = self.cache.password();
        let mut used_cached = false;
        let mut prompts_issued: u32 = 0;
        let mut rounds: u32 = 0;
        let mut secrets: Vec<String> = Vec::new();

        let mut step = transport.start_interactive(&self.host.username).await?;
        loop {
            match step {
                InteractiveStep::Success => {
                    if prompts_issued == 1
                        && let Some(secret) = secrets.pop()
                    {
                        self.cache.record_success(Credential::Password(secret));
                    }
                    return Ok(InteractiveOutcome::Authenticated);
                }
                InteractiveStep::Failure => {
                    if prompts_issued == 0 {
                        return Ok(InteractiveOutcome::Disabled);
                    }
                    if used_cached {
                        self.cache.forget_password();
                    }
                    return Ok(InteractiveOutcome::Failed);
                }
                InteractiveStep::Prompts(prompts) => {
                    rounds += 1;
                    if rounds > MAX_INTERACTIVE_ROUNDS {
                        return Ok(if prompts_issued == 0 {
                            InteractiveOutcome::Disabled
                        } else {
                            InteractiveOutcome::Failed
                        });
                    }

                    let mut responses = Vec::with_capacity(prompts.len());
                    for prompt in prompts {
                        prompts_issued += 1;
                        let answer = match (prompt.echo, cached.take()) {
                            (false, Some(secret)) => {
                                used_cached = true;
                                secret
                            }
                            (_, unused) => {
                                cached = unused;
                                self.ask(
                                    SecretKind::Interactive {
                                        prompt: prompt.text,
                                        echo: prompt.echo,
                                    },
                                    rounds,
                                )
                                .await?
                            }
                        };
                        if !prompt.echo {
                            secrets.push(answer.clone());
                        }
                        responses.push(answer);
                    }
                    step = transport.respond_interactive(responses).await?;
                }
            }
        }
    }

    async fn try_password(&self, transport: &mut dyn AuthTransport) -> Result<bool> {
        let user = &self.host.username;

        if let Some(cached) = self.cache.password() {
            if transport.try_password(user, &cached).await? {
                return Ok(true);
            }
            debug!(host = %self.host.name, "Cached password rejected; dropping it");
            self.cache.forget_password();
        }

        for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
            let password = self.ask(SecretKind::Password, attempt).await?;
            if transport.try_password(user, &password).await? {
                self.cache.record_success(Credential::Password(password));
                return Ok(true);
            }
            debug!(host = %self.host.name, attempt, "Password rejected");
        }
        Ok(false)
    }
}
