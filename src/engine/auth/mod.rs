//! Authentication for new connections.
//!
//! - [`Authenticator`]: drives one attempt over an [`AuthTransport`](crate::engine::transport::AuthTransport)
//! - [`CredentialCache`]: last successful secrets, shared across hosts

mod authenticator;
mod credentials;

pub use authenticator::{
    Authenticator, MAX_INTERACTIVE_ROUNDS, MAX_KEY_FILES, MAX_PASSPHRASE_ATTEMPTS,
    MAX_PASSWORD_ATTEMPTS,
};
pub use credentials::{CachedKey, Credential, CredentialCache};
