//! Account store abstraction.
//!
//! Key material is persisted alongside the account record by an external
//! store. This crate only ever hands it encrypted private keys.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::credential::Credential;
use crate::crypto::EncryptedBlob;
use crate::error::Result;

/// Persisted proof-of-possession key material for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKeyMaterial {
    /// Base64 SPKI public key, stored in clear.
    pub public_key: String,
    /// Base64 private scalar, encrypted with the local key.
    pub encrypted_private_key: EncryptedBlob,
}

#[async_trait]
pub trait AccountKeyStore: Send + Sync {
    /// Key material recorded for the account owning `credential`, if any.
    async fn find_by_credential(&self, credential: &Credential)
    -> Result<Option<StoredKeyMaterial>>;

    /// Persist freshly generated key material for the account.
    async fn update_key_material(
        &self,
        credential: &Credential,
        public_key: &str,
        encrypted_private_key: &EncryptedBlob,
    ) -> Result<()>;
}

/// Process-local [`AccountKeyStore`], for tools and tests that have no
/// account database.
#[derive(Default)]
pub struct InMemoryAccountKeyStore {
    records: RwLock<HashMap<Credential, StoredKeyMaterial>>,
}

impl InMemoryAccountKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential, material: StoredKeyMaterial) {
        self.records.write().insert(credential, material);
    }

    pub fn get(&self, credential: &Credential) -> Option<StoredKeyMaterial> {
        self.records.read().get(credential).cloned()
    }

    /// Drop the record, as when the owning account is deleted.
    pub fn remove(&self, credential: &Credential) -> Option<StoredKeyMaterial> {
        self.records.write().remove(credential)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AccountKeyStore for InMemoryAccountKeyStore {
    async fn find_by_credential(
        &self,
        credential: &Credential,
    ) -> Result<Option<StoredKeyMaterial>> {
        Ok(self.get(credential))
    }

    async fn update_key_material(
        &self,
        credential: &Credential,
        public_key: &str,
        encrypted_private_key: &EncryptedBlob,
    ) -> Result<()> {
        self.insert(
            credential.clone(),
            StoredKeyMaterial {
                public_key: public_key.to_string(),
                encrypted_private_key: encrypted_private_key.clone(),
            },
        );
        Ok(())
    }
}
