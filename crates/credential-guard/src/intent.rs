//! Signed authentication artifacts.
//!
//! Both artifacts embed the current Unix timestamp and are rejected by the
//! platform once stale, so they are rebuilt for every call.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::credential::Credential;
use crate::crypto::{ProofOfPossessionKeyManager, ProofOfPossessionKeyPair};
use crate::error::{CredentialError, Result};
use crate::transport::{HttpRequest, HttpTransport};

/// Version tag leading every bound auth token.
pub const BOUND_AUTH_TOKEN_VERSION: &str = "v1";

/// Header carrying a bound auth token on outbound requests.
pub const BOUND_AUTH_TOKEN_HEADER: &str = "x-bound-auth-token";

/// JSON body proving possession of the credential's key at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureAuthIntent {
    pub client_public_key: String,
    pub client_epoch_timestamp: i64,
    pub server_nonce: String,
    pub sai_signature: String,
}

pub struct AuthIntentBuilder {
    keys: Arc<ProofOfPossessionKeyManager>,
    transport: Arc<dyn HttpTransport>,
    nonce_url: String,
    cookie_name: String,
}

impl AuthIntentBuilder {
    pub fn new(
        keys: Arc<ProofOfPossessionKeyManager>,
        transport: Arc<dyn HttpTransport>,
        nonce_url: impl Into<String>,
        cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            transport,
            nonce_url: nonce_url.into(),
            cookie_name: cookie_name.into(),
        }
    }

    /// Build the serialized secure auth intent for `credential`.
    ///
    /// Fetches a one-time server nonce, so this may fail with a network error.
    #[instrument(skip(self), fields(credential = %credential))]
    pub async fn build_secure_auth_intent(&self, credential: &Credential) -> Result<String> {
        let pair = self.keys.get_or_create_key_pair(credential).await?;
        let server_nonce = self.fetch_server_nonce(credential).await?;
        let intent = secure_auth_intent_at(&pair, server_nonce, Utc::now().timestamp())?;
        Ok(serde_json::to_string(&intent)?)
    }

    /// Build a `v1|bodyHash|timestamp|sig1|sig2` token binding `body` to the
    /// credential's key at the current time.
    #[instrument(skip(self, body), fields(credential = %credential))]
    pub async fn build_bound_auth_token(
        &self,
        credential: &Credential,
        url: &str,
        body: &str,
    ) -> Result<String> {
        let pair = self.keys.get_or_create_key_pair(credential).await?;
        let token = bound_auth_token_at(&pair, body, Utc::now().timestamp())?;
        debug!(url, body_len = body.len(), "Built bound auth token");
        Ok(token)
    }

    async fn fetch_server_nonce(&self, credential: &Credential) -> Result<String> {
        let mut request = HttpRequest::get(&self.nonce_url);
        request.set_header(
            reqwest::header::COOKIE,
            &credential.cookie_pair(&self.cookie_name),
        )?;

        let response = self.transport.send(request).await?;
        match response.status {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CredentialError::CredentialInvalid);
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(CredentialError::RateLimited),
            status if status.is_server_error() => {
                return Err(CredentialError::Network(format!(
                    "server nonce endpoint returned {status}"
                )));
            }
            status => {
                return Err(CredentialError::InvalidResponse(format!(
                    "server nonce endpoint returned {status}"
                )));
            }
        }

        parse_server_nonce(&response.body)
    }
}

/// The endpoint answers with a JSON string; bare text is accepted too.
fn parse_server_nonce(body: &str) -> Result<String> {
    let body = body.trim();
    let nonce = match serde_json::from_str::<String>(body) {
        Ok(nonce) => nonce,
        Err(_) => body.to_string(),
    };
    let nonce = nonce.trim();
    if nonce.is_empty() {
        return Err(CredentialError::InvalidResponse("empty server nonce".into()));
    }
    Ok(nonce.to_string())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn sign_b64(pair: &ProofOfPossessionKeyPair, digest: &[u8]) -> Result<String> {
    let signature = pair.sign_digest(digest)?;
    Ok(STANDARD.encode(signature.to_bytes()))
}

pub(crate) fn secure_auth_intent_at(
    pair: &ProofOfPossessionKeyPair,
    server_nonce: String,
    timestamp: i64,
) -> Result<SecureAuthIntent> {
    let digest = sha256(timestamp.to_string().as_bytes());
    Ok(SecureAuthIntent {
        client_public_key: pair.public_key_encoded().to_string(),
        client_epoch_timestamp: timestamp,
        server_nonce,
        sai_signature: sign_b64(pair, &digest)?,
    })
}

pub(crate) fn bound_auth_token_at(
    pair: &ProofOfPossessionKeyPair,
    body: &str,
    timestamp: i64,
) -> Result<String> {
    let body_hash = sha256(body.as_bytes());
    let body_signature = sign_b64(pair, &sha256(&body_hash))?;

    let timestamp = timestamp.to_string();
    let time_signature = sign_b64(pair, &sha256(timestamp.as_bytes()))?;

    Ok(format!(
        "{}|{}|{}|{}|{}",
        BOUND_AUTH_TOKEN_VERSION,
        STANDARD.encode(body_hash),
        timestamp,
        body_signature,
        time_signature
    ))
}
