//! At-rest encryption of secrets with a locally held symmetric key.
//!
//! Blob layout: `base64(nonce[24] || ciphertext || tag[16])`, XChaCha20-Poly1305.
//! The key is a raw 32-byte file created on first use with owner-only
//! permissions, then kept in memory for the lifetime of the encryptor.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{CredentialError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

type LocalKey = Zeroizing<[u8; KEY_LEN]>;

/// Base64 text produced by [`CredentialEncryptor::encrypt`].
///
/// The empty blob is the encryption of the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for EncryptedBlob {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EncryptedBlob {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for EncryptedBlob {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encrypts and decrypts secrets for storage.
pub struct CredentialEncryptor {
    key_path: Option<PathBuf>,
    key: OnceLock<LocalKey>,
    /// Guards the file check-and-create sequence.
    init_lock: Mutex<()>,
}

impl CredentialEncryptor {
    /// Encryptor backed by the key file at `key_path`. Nothing is read until
    /// the first encrypt/decrypt.
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            key: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Encryptor around an in-memory key; never touches disk.
    pub fn with_key(key: [u8; KEY_LEN]) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Zeroizing::new(key));
        Self {
            key_path: None,
            key: cell,
            init_lock: Mutex::new(()),
        }
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Load the local key, creating and persisting it on first use.
    ///
    /// At most one key is ever produced per encryptor: concurrent callers
    /// serialize on `init_lock` and re-check the cell after acquiring it.
    fn local_key(&self) -> Result<&LocalKey> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }

        let _guard = self.init_lock.lock();
        if let Some(key) = self.key.get() {
            return Ok(key);
        }

        let path = self
            .key_path
            .as_deref()
            .ok_or_else(|| CredentialError::KeyUnavailable("no key path configured".into()))?;
        let key = get_or_create_local_key(path)?;
        let _ = self.key.set(key);

        self.key
            .get()
            .ok_or_else(|| CredentialError::KeyUnavailable("key cell not initialized".into()))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        let key = self.local_key()?;
        XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|_| CredentialError::KeyUnavailable("invalid key length".into()))
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob> {
        if plaintext.is_empty() {
            return Ok(EncryptedBlob::default());
        }

        let cipher = self.cipher()?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::EncryptionFailed("XChaCha20-Poly1305 seal failed".into()))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(EncryptedBlob(STANDARD.encode(raw)))
    }

    /// Decrypt, distinguishing "no secret" from "corrupted secret".
    ///
    /// * `Ok(None)` - the blob is empty
    /// * `Ok(Some(_))` - decrypted plaintext
    /// * `Err(DecryptionFailed)` - malformed, truncated, or wrong key
    /// * `Err(KeyUnavailable)` - the local key could not be loaded
    pub fn decrypt_checked(&self, blob: &EncryptedBlob) -> Result<Option<String>> {
        let encoded = blob.as_str().trim();
        if encoded.is_empty() {
            return Ok(None);
        }

        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::DecryptionFailed(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::DecryptionFailed(format!(
                "blob too short: {} bytes",
                raw.len()
            )));
        }

        let cipher = self.cipher()?;
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                CredentialError::DecryptionFailed(
                    "authentication failed - wrong key or corrupted data".into(),
                )
            })?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| CredentialError::DecryptionFailed("plaintext is not UTF-8".into()))
    }

    /// Decrypt, returning an empty string on any failure.
    ///
    /// Callers treat an empty secret as absent and recover by re-deriving it.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> String {
        match self.decrypt_checked(blob) {
            Ok(plaintext) => plaintext.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Discarding undecryptable secret");
                String::new()
            }
        }
    }
}

/// Read-or-create cycles before giving up on a key file that keeps changing.
const KEY_INIT_ATTEMPTS: usize = 3;

/// Read the key file if it holds exactly 32 bytes; otherwise generate a new
/// key and move it into place with owner-only permissions.
///
/// Creation never overwrites: when another encryptor or process gets there
/// first, its key is read back and used.
fn get_or_create_local_key(path: &Path) -> Result<LocalKey> {
    for _ in 0..KEY_INIT_ATTEMPTS {
        if let Some(key) = read_key_file(path)? {
            debug!(path = %path.display(), "Loaded local key");
            return Ok(key);
        }

        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(generated.as_slice());

        match write_key_file(path, &key) {
            Ok(()) => {
                info!(path = %path.display(), "Created new local key");
                return Ok(key);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Local key created concurrently, reloading");
            }
            Err(e) => {
                return Err(CredentialError::KeyUnavailable(format!(
                    "failed to write {}: {e}",
                    path.display()
                )));
            }
        }
    }

    Err(CredentialError::KeyUnavailable(format!(
        "{} changed during initialization",
        path.display()
    )))
}

/// `Ok(None)` when there is no usable key file. A file of the wrong length
/// is removed so a fresh key can take its place.
fn read_key_file(path: &Path) -> Result<Option<LocalKey>> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == KEY_LEN => {
            let bytes = Zeroizing::new(bytes);
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&bytes);
            Ok(Some(key))
        }
        Ok(bytes) => {
            warn!(
                path = %path.display(),
                len = bytes.len(),
                "Local key file has the wrong length; generating a new key"
            );
            match std::fs::remove_file(path) {
                Ok(()) => Ok(None),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(CredentialError::KeyUnavailable(format!(
                    "failed to remove {}: {e}",
                    path.display()
                ))),
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CredentialError::KeyUnavailable(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Write `key` to a temp file beside `path`, then link it into place only
/// if `path` does not exist yet (`AlreadyExists` otherwise).
fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::Builder::new()
        .prefix(".local-key-")
        .tempfile_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(key)?;
    file.as_file().sync_all()?;

    file.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}
