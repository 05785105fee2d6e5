//! Caller-implemented secret and host-key prompts.
//!
//! The engine never talks to a terminal or a UI itself. Whenever it needs a
//! secret, it asks the [`Prompter`] it was built with. Returning `None`
//! cancels whatever the engine was doing: an authentication attempt is
//! abandoned and the transport closed, and a command waiting on a sudo
//! password is cancelled.

use std::path::PathBuf;

use async_trait::async_trait;

use super::host_keys::HostKeyStatus;

/// What the engine is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretKind {
    /// Passphrase protecting a private key file.
    KeyPassphrase { path: PathBuf },
    /// Login password.
    Password,
    /// One prompt of a keyboard-interactive challenge.
    Interactive { prompt: String, echo: bool },
    /// Password requested by `sudo` on the remote side.
    SudoPassword,
}

impl SecretKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            SecretKind::KeyPassphrase { .. } => "key passphrase",
            SecretKind::Password => "password",
            SecretKind::Interactive { .. } => "interactive response",
            SecretKind::SudoPassword => "sudo password",
        }
    }
}

/// Where the request comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub host: String,
    pub username: String,
    /// 1-based attempt number for this kind of secret.
    pub attempt: u32,
}

/// A host key that needs an explicit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    /// SHA-256 fingerprint in OpenSSH notation.
    pub fingerprint: String,
    pub status: HostKeyStatus,
}

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Supply a secret, or `None` to cancel.
    async fn request_secret(&self, kind: &SecretKind, context: &PromptContext) -> Option<String>;

    /// Accept (`true`) or reject a new or changed host key.
    async fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool;
}

/// Answers from preconfigured secrets and never asks anyone.
///
/// Missing secrets cancel the request. New host keys are accepted only when
/// `accept_new_keys` is set; changed keys are always rejected.
#[derive(Debug, Clone, Default)]
pub struct StaticPrompter {
    pub password: Option<String>,
    pub passphrase: Option<String>,
    pub sudo_password: Option<String>,
    pub accept_new_keys: bool,
}

#[async_trait]
impl Prompter for StaticPrompter {
    async fn request_secret(&self, kind: &SecretKind, _context: &PromptContext) -> Option<String> {
        match kind {
            SecretKind::KeyPassphrase { .. } => self.passphrase.clone(),
            SecretKind::Password => self.password.clone(),
            SecretKind::Interactive { echo: false, .. } => self.password.clone(),
            SecretKind::Interactive { echo: true, .. } => None,
            SecretKind::SudoPassword => self.sudo_password.clone().or_else(|| self.password.clone()),
        }
    }

    async fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool {
        self.accept_new_keys && prompt.status == HostKeyStatus::NewKey
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PromptContext {
        PromptContext {
            host: "node1".into(),
            username: "root".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_static_prompter_answers_configured_secrets() {
        let prompter = StaticPrompter {
            password: Some("pw".into()),
            ..Default::default()
        };
        assert_eq!(
            prompter.request_secret(&SecretKind::Password, &context()).await,
            Some("pw".into())
        );
        // sudo falls back to the login password
        assert_eq!(
            prompter.request_secret(&SecretKind::SudoPassword, &context()).await,
            Some("pw".into())
        );
        let passphrase = SecretKind::KeyPassphrase {
            path: PathBuf::from("/k"),
        };
        assert_eq!(prompter.request_secret(&passphrase, &context()).await, None);
    }

    #[tokio::test]
    async fn test_static_prompter_never_accepts_changed_keys() {
        let prompter = StaticPrompter {
            accept_new_keys: true,
            ..Default::default()
        };
        let mut prompt = HostKeyPrompt {
            host: "node1".into(),
            port: 22,
            algorithm: "ssh-ed25519".into(),
            fingerprint: "SHA256:abc".into(),
            status: HostKeyStatus::NewKey,
        };
        assert!(prompter.confirm_host_key(&prompt).await);
        prompt.status = HostKeyStatus::Changed;
        assert!(!prompter.confirm_host_key(&prompt).await);
    }

    #[test]
    fn test_labels() {
        assert_eq!(SecretKind::SudoPassword.label(), "sudo password");
        assert_eq!(
            SecretKind::Interactive {
                prompt: "Password:".into(),
                echo: false
            }
            .label(),
            "interactive response"
        );
    }
}
