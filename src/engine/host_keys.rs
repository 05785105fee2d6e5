//! Host-key verification and persistence.
//!
//! [`KnownHostsFile`] reads and writes the OpenSSH `known_hosts` layout:
//!
//! ```text
//! |1|<base64 salt>|<base64 HMAC-SHA1(salt, host)> ssh-ed25519 AAAAC3Nza...
//! node2,10.0.0.2 ssh-rsa AAAAB3Nza...
//! [node3]:2222 ecdsa-sha2-nistp256 AAAAE2Vj...
//! ```
//!
//! Lookups go through `russh::keys`, which understands hashed and plain host
//! lists alike. Entries written by the engine always use the hashed host form.
//! Marker lines (`@cert-authority`, `@revoked`) and comments are never matched
//! and survive a rewrite.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use russh::keys;
use serde::Serialize;
use sha1::Sha1;
use tracing::{debug, info, warn};

use super::error::{Result, SshError};
use super::prompt::{HostKeyPrompt, Prompter};
use super::types::DEFAULT_SSH_PORT;

type HmacSha1 = Hmac<Sha1>;

const HASH_MAGIC: &str = "|1|";
const SALT_LEN: usize = 20;

/// Outcome of looking a presented key up in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostKeyStatus {
    /// A stored entry for this host and algorithm matches the key.
    Trusted,
    /// Nothing is stored for this host and algorithm.
    NewKey,
    /// A stored entry for this host and algorithm holds a different key.
    Changed,
}

pub trait HostKeyStore: Send + Sync {
    fn verify(&self, host: &str, port: u16, algorithm: &str, key: &[u8]) -> Result<HostKeyStatus>;

    /// Persist a key the caller decided to trust. `status` is what `verify`
    /// returned; a `Changed` key replaces the old entries.
    fn accept(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key: &[u8],
        status: HostKeyStatus,
    ) -> Result<()>;
}

/// Host identifier as written to known_hosts: `host` or `[host]:port`.
pub(crate) fn host_identifier(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn hmac_host(salt: &[u8], identifier: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha1::new_from_slice(salt)
        .map_err(|e| SshError::HostKey(format!("invalid salt: {e}")))?;
    mac.update(identifier.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn hash_identifier(identifier: &str) -> Result<String> {
    let salt: [u8; SALT_LEN] = rand::random();
    let digest = hmac_host(&salt, identifier)?;
    Ok(format!(
        "{HASH_MAGIC}{}|{}",
        STANDARD.encode(salt),
        STANDARD.encode(digest)
    ))
}

/// Whether the host field of a known_hosts line names `identifier`.
/// Only used to pick the lines a replaced key drops.
fn hosts_field_matches(field: &str, identifier: &str) -> bool {
    if let Some(hashed) = field.strip_prefix(HASH_MAGIC) {
        let Some((salt, digest)) = hashed.split_once('|') else {
            return false;
        };
        let (Ok(salt), Ok(digest)) = (STANDARD.decode(salt), STANDARD.decode(digest)) else {
            return false;
        };
        return hmac_host(&salt, identifier).is_ok_and(|d| d == digest);
    }

    field
        .split(',')
        .filter(|h| !h.starts_with('!'))
        .any(|h| h.eq_ignore_ascii_case(identifier))
}

/// Host field and algorithm of an entry line; `None` for comments and markers.
fn entry_fields(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

/// A known_hosts file on disk.
#[derive(Debug)]
pub struct KnownHostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl KnownHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SshError::HostKey(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                SshError::HostKey(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        Ok(())
    }

    fn append_line(&self, line: &str) -> Result<()> {
        self.ensure_parent()?;
        let needs_newline = self
            .read()
            .map(|c| !c.is_empty() && !c.ends_with('\n'))
            .unwrap_or(false);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SshError::HostKey(format!("cannot open {}: {e}", self.path.display())))?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn rewrite_without(&self, identifier: &str, algorithm: &str) -> Result<()> {
        let content = self.read()?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| match entry_fields(line) {
                Some((hosts, alg)) => !(alg == algorithm && hosts_field_matches(hosts, identifier)),
                None => true,
            })
            .collect();
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(&self.path, rewritten)
            .map_err(|e| SshError::HostKey(format!("cannot write {}: {e}", self.path.display())))
    }
}

impl HostKeyStore for KnownHostsFile {
    fn verify(&self, host: &str, port: u16, _algorithm: &str, key: &[u8]) -> Result<HostKeyStatus> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let key = keys::PublicKey::from_bytes(key)
            .map_err(|e| SshError::HostKey(format!("cannot decode host key: {e}")))?;

        // a missing file is an empty one
        match keys::check_known_hosts_path(host, port, &key, &self.path) {
            Ok(true) => Ok(HostKeyStatus::Trusted),
            Ok(false) => Ok(HostKeyStatus::NewKey),
            Err(keys::Error::KeyChanged { line }) => {
                debug!(host = %host, port, line, path = %self.path.display(), "Stored host key differs");
                Ok(HostKeyStatus::Changed)
            }
            Err(e) => Err(SshError::HostKey(format!(
                "cannot check {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn accept(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key: &[u8],
        status: HostKeyStatus,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let identifier = host_identifier(host, port);

        match status {
            HostKeyStatus::Trusted => return Ok(()),
            HostKeyStatus::Changed => self.rewrite_without(&identifier, algorithm)?,
            HostKeyStatus::NewKey => {}
        }

        let line = format!(
            "{} {algorithm} {}",
            hash_identifier(&identifier)?,
            STANDARD.encode(key)
        );
        self.append_line(&line)
    }
}

/// Stores may touch the filesystem; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SshError::HostKey(format!("host key store task failed: {e}")))?
}

/// Joins a [`HostKeyStore`] with the caller's decision for unknown keys.
#[derive(Clone)]
pub struct HostKeyVerifier {
    store: Arc<dyn HostKeyStore>,
    prompter: Arc<dyn Prompter>,
}

impl HostKeyVerifier {
    pub fn new(store: Arc<dyn HostKeyStore>, prompter: Arc<dyn Prompter>) -> Self {
        Self { store, prompter }
    }

    fn owned(
        &self,
        host: &str,
        algorithm: &str,
        key: &[u8],
    ) -> (Arc<dyn HostKeyStore>, String, String, Vec<u8>) {
        (
            Arc::clone(&self.store),
            host.to_string(),
            algorithm.to_string(),
            key.to_vec(),
        )
    }

    /// Proceed silently for trusted keys; otherwise ask, then persist or abort.
    pub async fn check(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key: &[u8],
        fingerprint: &str,
    ) -> Result<()> {
        let status = {
            let (store, host, algorithm, key) = self.owned(host, algorithm, key);
            blocking(move || store.verify(&host, port, &algorithm, &key)).await?
        };
        if status == HostKeyStatus::Trusted {
            return Ok(());
        }

        if status == HostKeyStatus::Changed {
            warn!(host = %host, port, algorithm, "Host key has CHANGED");
        }

        let prompt = HostKeyPrompt {
            host: host.to_string(),
            port,
            algorithm: algorithm.to_string(),
            fingerprint: fingerprint.to_string(),
            status,
        };
        if !self.prompter.confirm_host_key(&prompt).await {
            return Err(SshError::AuthenticationAbandoned {
                host: host.to_string(),
                reason: format!("host key {fingerprint} rejected ({status:?})"),
            });
        }

        {
            let (store, host, algorithm, key) = self.owned(host, algorithm, key);
            blocking(move || store.accept(&host, port, &algorithm, &key, status)).await?;
        }
        info!(host = %host, port, algorithm, fingerprint, "Host key accepted");
        Ok(())
    }
}
