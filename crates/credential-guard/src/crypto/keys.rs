//! Proof-of-possession key pairs.
//!
//! Each credential owns one P-256 key pair, created lazily and reused for
//! the life of the account. Lookup order is memory cache, then the account
//! store (private key decrypted with the local key), then generation. A
//! freshly generated pair is persisted in the background; a failed write
//! only costs the pair its cross-session lifetime.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::credential::Credential;
use crate::crypto::encryptor::CredentialEncryptor;
use crate::error::{CredentialError, Result};
use crate::store::{AccountKeyStore, StoredKeyMaterial};

/// DER SubjectPublicKeyInfo header for an uncompressed P-256 point,
/// including the trailing `0x04` point tag.
pub const SPKI_P256_PREFIX: [u8; 27] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00, 0x04,
];
/// X || Y.
pub const PUBLIC_POINT_LEN: usize = 64;
pub const PRIVATE_KEY_LEN: usize = 32;

/// A P-256 key pair bound to one credential.
#[derive(Clone)]
pub struct ProofOfPossessionKeyPair {
    public_key: String,
    signing_key: SigningKey,
}

impl ProofOfPossessionKeyPair {
    /// Generate a new pair from the OS CSPRNG.
    pub fn generate() -> Result<Self> {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Rebuild a pair from a raw 32-byte private scalar.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_LEN {
            return Err(CredentialError::ParseError(format!(
                "private key must be {PRIVATE_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|_| CredentialError::ParseError("private key is not a valid scalar".into()))?;
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self> {
        let public_key = encode_public_key(signing_key.verifying_key())?;
        Ok(Self {
            public_key,
            signing_key,
        })
    }

    /// Base64 of `SPKI_P256_PREFIX || X || Y`, the form the platform expects.
    #[inline]
    pub fn public_key_encoded(&self) -> &str {
        &self.public_key
    }

    pub fn public_point(&self) -> [u8; PUBLIC_POINT_LEN] {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_POINT_LEN];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    pub fn private_key_bytes(&self) -> Zeroizing<[u8; PRIVATE_KEY_LEN]> {
        let mut out = Zeroizing::new([0u8; PRIVATE_KEY_LEN]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// ECDSA over an already computed SHA-256 digest.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Signature> {
        self.signing_key
            .sign_prehash(digest)
            .map_err(|e| CredentialError::Unknown(format!("signing failed: {e}")))
    }
}

impl PartialEq for ProofOfPossessionKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && *self.private_key_bytes() == *other.private_key_bytes()
    }
}

impl Eq for ProofOfPossessionKeyPair {}

impl fmt::Debug for ProofOfPossessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofOfPossessionKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn encode_public_key(verifying_key: &VerifyingKey) -> Result<String> {
    let point = verifying_key.to_encoded_point(false);
    let bytes = point.as_bytes();
    if bytes.len() != PUBLIC_POINT_LEN + 1 {
        return Err(CredentialError::Unknown(format!(
            "unexpected public point length {}",
            bytes.len()
        )));
    }

    let mut der = Vec::with_capacity(SPKI_P256_PREFIX.len() + PUBLIC_POINT_LEN);
    der.extend_from_slice(&SPKI_P256_PREFIX);
    der.extend_from_slice(&bytes[1..]);
    Ok(STANDARD.encode(der))
}

/// Owns the per-credential key pairs.
pub struct ProofOfPossessionKeyManager {
    encryptor: Arc<CredentialEncryptor>,
    store: Arc<dyn AccountKeyStore>,
    cache: DashMap<Credential, Arc<ProofOfPossessionKeyPair>>,
    /// Per-credential locks so unrelated credentials never wait on each other.
    key_locks: DashMap<Credential, Arc<Mutex<()>>>,
}

impl ProofOfPossessionKeyManager {
    pub fn new(encryptor: Arc<CredentialEncryptor>, store: Arc<dyn AccountKeyStore>) -> Self {
        Self {
            encryptor,
            store,
            cache: DashMap::new(),
            key_locks: DashMap::new(),
        }
    }

    /// Return the credential's key pair, loading or generating it on first use.
    #[instrument(skip(self), fields(credential = %credential))]
    pub async fn get_or_create_key_pair(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ProofOfPossessionKeyPair>> {
        if let Some(pair) = self.cached(credential) {
            return Ok(pair);
        }

        let lock = self.key_lock(credential);
        let _guard = lock.lock().await;

        // Double-check after acquiring lock (another task may have loaded it)
        if let Some(pair) = self.cached(credential) {
            return Ok(pair);
        }

        if let Some(material) = self.store.find_by_credential(credential).await? {
            match self.restore(&material) {
                Ok(pair) => {
                    debug!("Restored key pair from account store");
                    let pair = Arc::new(pair);
                    self.cache.insert(credential.clone(), Arc::clone(&pair));
                    return Ok(pair);
                }
                Err(e) => {
                    warn!(error = %e, "Persisted key material is unusable; generating a new key pair");
                }
            }
        }

        let pair = Arc::new(ProofOfPossessionKeyPair::generate()?);
        info!("Generated new proof-of-possession key pair");
        self.cache.insert(credential.clone(), Arc::clone(&pair));
        self.persist_in_background(credential, &pair);

        Ok(pair)
    }

    /// Cached pair, without touching the store.
    pub fn cached(&self, credential: &Credential) -> Option<Arc<ProofOfPossessionKeyPair>> {
        self.cache.get(credential).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the in-memory pair (the owning account record was deleted).
    pub fn forget(&self, credential: &Credential) {
        self.cache.remove(credential);
        // A lock still held elsewhere stays, so a concurrent load keeps
        // serializing on it.
        self.key_locks
            .remove_if(credential, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn key_lock(&self, credential: &Credential) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(credential.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn restore(&self, material: &StoredKeyMaterial) -> Result<ProofOfPossessionKeyPair> {
        let encoded = Zeroizing::new(self.encryptor.decrypt(&material.encrypted_private_key));
        if encoded.is_empty() {
            return Err(CredentialError::DecryptionFailed(
                "private key missing or undecryptable".into(),
            ));
        }

        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| CredentialError::ParseError(format!("private key base64: {e}")))?,
        );
        let pair = ProofOfPossessionKeyPair::from_private_bytes(&raw)?;

        if !material.public_key.is_empty() && material.public_key != pair.public_key {
            return Err(CredentialError::ParseError(
                "stored public key does not match private key".into(),
            ));
        }
        Ok(pair)
    }

    fn persist_in_background(&self, credential: &Credential, pair: &ProofOfPossessionKeyPair) {
        let private_b64 = Zeroizing::new(STANDARD.encode(pair.private_key_bytes().as_slice()));
        let encrypted = match self.encryptor.encrypt(&private_b64) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to encrypt private key; key pair kept in memory only");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let credential = credential.clone();
        let public_key = pair.public_key_encoded().to_string();

        tokio::spawn(async move {
            if let Err(e) = store
                .update_key_material(&credential, &public_key, &encrypted)
                .await
            {
                warn!(credential = %credential, error = %e, "Failed to persist key material (non-fatal)");
            } else {
                debug!(credential = %credential, "Persisted key material");
            }
        });
    }
}
