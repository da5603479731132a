//! Bearer credential wrapper.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// An opaque bearer secret identifying one account session.
///
/// Used as the map key by every cache in this crate. `Debug` and `Display`
/// only print a short SHA-256 fingerprint so the secret never ends up in
/// logs or panic messages.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref().trim()))
    }

    /// The raw secret. Only for building outbound requests.
    #[inline]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First 8 hex chars of SHA-256 over the secret.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }

    /// `name=value` cookie pair for the `Cookie` header.
    pub fn cookie_pair(&self, cookie_name: &str) -> String {
        format!("{}={}", cookie_name, self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(cred:{})", self.fingerprint())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cred:{}", self.fingerprint())
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
