//! Cryptographic primitives: at-rest encryption and proof-of-possession keys.

pub mod encryptor;
pub mod keys;

pub use encryptor::{CredentialEncryptor, EncryptedBlob};
pub use keys::{ProofOfPossessionKeyManager, ProofOfPossessionKeyPair, SPKI_P256_PREFIX};
