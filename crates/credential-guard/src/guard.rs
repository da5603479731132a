//! Session guard.
//!
//! Wires the components together in the order every sensitive action
//! follows: eligibility check, then anti-forgery token, then (when the
//! endpoint asks for it) a proof-of-possession artifact.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::HeaderName;
use tracing::{debug, instrument, warn};

use crate::config::GuardConfig;
use crate::credential::Credential;
use crate::crypto::{CredentialEncryptor, ProofOfPossessionKeyManager};
use crate::csrf::{AntiForgeryTokenStore, CsrfClient};
use crate::eligibility::{CredentialEligibilityGate, EligibilityStatus};
use crate::error::Result;
use crate::intent::{AuthIntentBuilder, BOUND_AUTH_TOKEN_HEADER};
use crate::store::AccountKeyStore;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

pub struct SessionGuard {
    config: GuardConfig,
    encryptor: Arc<CredentialEncryptor>,
    keys: Arc<ProofOfPossessionKeyManager>,
    tokens: Arc<AntiForgeryTokenStore>,
    csrf: CsrfClient,
    intents: AuthIntentBuilder,
    gate: CredentialEligibilityGate,
}

impl SessionGuard {
    /// Build a guard talking to the platform over reqwest.
    pub fn from_config(config: GuardConfig, store: Arc<dyn AccountKeyStore>) -> Result<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::from_config(&config)?);
        let encryptor = Arc::new(CredentialEncryptor::new(config.key_path.clone()));
        Ok(Self::new(config, transport, encryptor, store))
    }

    pub fn new(
        config: GuardConfig,
        transport: Arc<dyn HttpTransport>,
        encryptor: Arc<CredentialEncryptor>,
        store: Arc<dyn AccountKeyStore>,
    ) -> Self {
        let keys = Arc::new(ProofOfPossessionKeyManager::new(encryptor.clone(), store));
        let tokens = Arc::new(AntiForgeryTokenStore::new());
        let csrf = CsrfClient::new(transport.clone(), tokens.clone(), config.cookie_name.clone());
        let intents = AuthIntentBuilder::new(
            keys.clone(),
            transport.clone(),
            config.nonce_url.clone(),
            config.cookie_name.clone(),
        );
        let gate = CredentialEligibilityGate::new(transport, &config);

        Self {
            config,
            encryptor,
            keys,
            tokens,
            csrf,
            intents,
            gate,
        }
    }

    /// `Ok(())` only if the credential is currently classified `Eligible`.
    pub async fn ensure_usable(&self, credential: &Credential) -> Result<()> {
        self.gate.classify(credential).await.into_result()
    }

    pub async fn classify(&self, credential: &Credential) -> EligibilityStatus {
        self.gate.classify(credential).await
    }

    /// Send an authenticated request for an eligible credential.
    #[instrument(skip(self, request), fields(credential = %credential))]
    pub async fn send(&self, credential: &Credential, request: HttpRequest) -> Result<HttpResponse> {
        self.ensure_usable(credential).await?;
        self.dispatch(credential, request).await
    }

    /// Like [`send`](Self::send), with an `x-bound-auth-token` over the body.
    #[instrument(skip(self, request), fields(credential = %credential))]
    pub async fn send_bound(
        &self,
        credential: &Credential,
        request: HttpRequest,
    ) -> Result<HttpResponse> {
        self.ensure_usable(credential).await?;

        let mut request = request;
        let token = self
            .intents
            .build_bound_auth_token(credential, &request.url, request.body_str())
            .await?;
        request.set_header(HeaderName::from_static(BOUND_AUTH_TOKEN_HEADER), &token)?;

        self.dispatch(credential, request).await
    }

    /// Serialized secure auth intent for an eligible credential.
    pub async fn secure_auth_intent(&self, credential: &Credential) -> Result<String> {
        self.ensure_usable(credential).await?;
        self.intents.build_secure_auth_intent(credential).await
    }

    /// Forget everything cached for a credential (account removed or logged out).
    pub fn forget(&self, credential: &Credential) {
        self.gate.invalidate(credential);
        self.tokens.invalidate(credential);
        self.keys.forget(credential);
        debug!(credential = %credential, "Dropped cached session state");
    }

    async fn dispatch(&self, credential: &Credential, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.csrf.send(credential, request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            warn!("Credential rejected, dropping cached eligibility and token");
            self.gate.invalidate(credential);
            self.tokens.invalidate(credential);
        }
        Ok(response)
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn encryptor(&self) -> &Arc<CredentialEncryptor> {
        &self.encryptor
    }

    pub fn key_manager(&self) -> &Arc<ProofOfPossessionKeyManager> {
        &self.keys
    }

    pub fn tokens(&self) -> &Arc<AntiForgeryTokenStore> {
        &self.tokens
    }

    pub fn gate(&self) -> &CredentialEligibilityGate {
        &self.gate
    }

    pub fn intents(&self) -> &AuthIntentBuilder {
        &self.intents
    }
}
