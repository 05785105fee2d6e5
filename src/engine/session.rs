//! russh client handler.
//!
//! Every server key is checked against the engine's [`HostKeyVerifier`]. A key
//! that is neither trusted nor explicitly accepted fails the handshake with
//! the verifier's error, which `client::connect` hands back unchanged.

use russh::{client, keys};

use super::error::SshError;
use super::host_keys::HostKeyVerifier;

pub struct SshClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
}

impl SshClientHandler {
    pub fn new(host: impl Into<String>, port: u16, verifier: HostKeyVerifier) -> Self {
        Self {
            host: host.into(),
            port,
            verifier,
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let key_bytes = server_public_key
            .to_bytes()
            .map_err(|e| SshError::HostKey(format!("cannot encode server key: {e}")))?;
        let fingerprint = server_public_key
            .fingerprint(keys::HashAlg::Sha256)
            .to_string();

        self.verifier
            .check(
                &self.host,
                self.port,
                server_public_key.algorithm().as_str(),
                &key_bytes,
                &fingerprint,
            )
            .await?;
        Ok(true)
    }
}
