//! Credential cache shared by every host of one engine.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

/// A login credential that worked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    PublicKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKey {
    pub path: PathBuf,
    pub passphrase: Option<String>,
}

#[derive(Debug, Default)]
struct Slots {
    key: Option<CachedKey>,
    password: Option<String>,
    sudo: Option<String>,
}

/// Last successful secrets, one slot per credential type.
///
/// A slot is written at most once until it is cleared: later successes with a
/// different value do not overwrite it. A cached secret the server rejects is
/// dropped, which frees its slot.
#[derive(Debug, Default)]
pub struct CredentialCache {
    slots: Mutex<Slots>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache the credential that authenticated a connection and clear the
    /// other login slot.
    pub fn record_success(&self, credential: Credential) {
        let mut slots = self.lock();
        match credential {
            Credential::PublicKey { path, passphrase } => {
                if slots.key.is_none() {
                    debug!("Caching public key {:?}", path);
                    slots.key = Some(CachedKey { path, passphrase });
                }
                slots.password = None;
            }
            Credential::Password(password) => {
                if slots.password.is_none() {
                    debug!("Caching login password");
                    slots.password = Some(password);
                }
                slots.key = None;
            }
        }
    }

    pub fn key(&self) -> Option<CachedKey> {
        self.lock().key.clone()
    }

    pub fn password(&self) -> Option<String> {
        self.lock().password.clone()
    }

    pub fn forget_key(&self) {
        self.lock().key = None;
    }

    pub fn forget_password(&self) {
        self.lock().password = None;
    }

    pub fn sudo_password(&self) -> Option<String> {
        self.lock().sudo.clone()
    }

    /// Write-once: an already cached sudo password is kept.
    pub fn set_sudo_password(&self, password: String) {
        let mut slots = self.lock();
        if slots.sudo.is_none() {
            slots.sudo = Some(password);
        }
    }

    pub fn clear_sudo_password(&self) {
        self.lock().sudo = None;
    }

    /// Every cached secret, for redaction.
    pub fn secrets(&self) -> Vec<String> {
        let slots = self.lock();
        slots
            .key
            .as_ref()
            .and_then(|k| k.passphrase.clone())
            .into_iter()
            .chain(slots.password.clone())
            .chain(slots.sudo.clone())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn clear(&self) {
        *self.lock() = Slots::default();
    }
}
