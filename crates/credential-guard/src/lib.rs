//! credential-guard library crate.
//!
//! Credential and session security for accounts on a remote platform:
//! at-rest encryption of secrets, per-credential proof-of-possession keys,
//! signed auth artifacts, anti-forgery token handling and a cached
//! moderation gate. [`SessionGuard`] wires them together.

pub mod cache;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod csrf;
pub mod eligibility;
pub mod error;
pub mod guard;
pub mod intent;
pub mod logging;
pub mod store;
pub mod transport;

pub use cache::TtlCache;
pub use config::GuardConfig;
pub use credential::Credential;
pub use crypto::{
    CredentialEncryptor, EncryptedBlob, ProofOfPossessionKeyManager, ProofOfPossessionKeyPair,
};
pub use csrf::{AntiForgeryTokenStore, CsrfClient};
pub use eligibility::{CredentialEligibilityGate, EligibilityStatus};
pub use error::{CredentialError, Result};
pub use guard::SessionGuard;
pub use intent::{AuthIntentBuilder, SecureAuthIntent};
pub use store::{AccountKeyStore, InMemoryAccountKeyStore, StoredKeyMaterial};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
