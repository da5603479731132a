use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use credential_guard::{
    Credential, CredentialEncryptor, EncryptedBlob, GuardConfig, InMemoryAccountKeyStore,
    ProofOfPossessionKeyPair, SessionGuard,
};
use serde::Serialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Key material as an account store would persist it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyMaterialOutput {
    public_key: String,
    encrypted_private_key: EncryptedBlob,
}

pub struct CommandExecutor {
    config: GuardConfig,
}

impl CommandExecutor {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    fn encryptor(&self) -> CredentialEncryptor {
        CredentialEncryptor::new(self.config.key_path.clone())
    }

    fn session_guard(&self) -> Result<SessionGuard> {
        let store = Arc::new(InMemoryAccountKeyStore::new());
        SessionGuard::from_config(self.config.clone(), store)
            .context("Failed to build session guard")
    }

    pub fn encrypt(&self, text: Option<String>) -> Result<()> {
        let text = Zeroizing::new(input_or_stdin(text)?);
        let blob = self.encryptor().encrypt(&text)?;
        println!("{}", blob.as_str());
        Ok(())
    }

    pub fn decrypt(&self, blob: Option<String>) -> Result<()> {
        let blob = EncryptedBlob::from(input_or_stdin(blob)?.trim());
        match self.encryptor().decrypt_checked(&blob)? {
            Some(plaintext) => println!("{plaintext}"),
            None => bail!("Blob is empty"),
        }
        Ok(())
    }

    pub fn keygen(&self) -> Result<()> {
        let pair = ProofOfPossessionKeyPair::generate()?;
        let private_b64 = Zeroizing::new(STANDARD.encode(pair.private_key_bytes().as_slice()));
        let output = KeyMaterialOutput {
            public_key: pair.public_key_encoded().to_string(),
            encrypted_private_key: self.encryptor().encrypt(&private_b64)?,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    pub async fn check(&self, cookie: &str, json: bool) -> Result<()> {
        let credential = credential(cookie)?;
        let guard = self.session_guard()?;
        let status = guard.classify(&credential).await;
        info!(credential = %credential, %status, "Moderation check finished");

        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!("{credential}: {status}");
        }
        if let Some(remaining) = guard.gate().backoff_remaining() {
            eprintln!("Rate limited, retry in {}s", remaining.as_secs());
        }
        Ok(())
    }

    pub async fn intent(&self, cookie: &str) -> Result<()> {
        let credential = credential(cookie)?;
        let guard = self.session_guard()?;
        let intent = guard.secure_auth_intent(&credential).await?;
        println!("{intent}");
        Ok(())
    }

    pub async fn bound_token(&self, cookie: &str, url: &str, body: Option<String>) -> Result<()> {
        let credential = credential(cookie)?;
        let body = input_or_stdin(body)?;
        let guard = self.session_guard()?;
        let token = guard
            .intents()
            .build_bound_auth_token(&credential, url, &body)
            .await?;
        debug!(credential = %credential, url, "Bound auth token built");
        println!("{token}");
        Ok(())
    }
}

fn credential(cookie: &str) -> Result<Credential> {
    let credential = Credential::new(cookie);
    if credential.is_empty() {
        bail!("Cookie must not be empty");
    }
    Ok(credential)
}

fn input_or_stdin(value: Option<String>) -> Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read stdin")?;
    Ok(buffer.trim_end_matches(['\r', '\n']).to_string())
}
