//! Anti-forgery (CSRF) tokens.
//!
//! The platform rejects state-changing requests without a current
//! `x-csrf-token` with a 403 that carries a fresh token. [`CsrfClient`]
//! caches that token per credential and retries the rejected request once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderName};
use tracing::{debug, instrument, warn};

use crate::credential::Credential;
use crate::error::{CredentialError, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Request and response header carrying the token.
pub const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

/// Latest anti-forgery token per credential.
#[derive(Default)]
pub struct AntiForgeryTokenStore {
    tokens: RwLock<HashMap<Credential, String>>,
}

impl AntiForgeryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached token, or an empty string when none is known.
    pub fn get_token(&self, credential: &Credential) -> String {
        self.tokens
            .read()
            .get(credential)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_token(&self, credential: &Credential, token: impl Into<String>) {
        self.tokens.write().insert(credential.clone(), token.into());
    }

    pub fn invalidate(&self, credential: &Credential) {
        self.tokens.write().remove(credential);
    }

    pub fn clear(&self) {
        self.tokens.write().clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

/// Sends requests on behalf of a credential with the token protocol applied.
pub struct CsrfClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<AntiForgeryTokenStore>,
    cookie_name: String,
}

impl CsrfClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<AntiForgeryTokenStore>,
        cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            cookie_name: cookie_name.into(),
        }
    }

    pub fn tokens(&self) -> &Arc<AntiForgeryTokenStore> {
        &self.tokens
    }

    /// Send `request` with the credential cookie and cached token attached.
    ///
    /// A 403 on a state-changing request that hands out a new token is
    /// retried once with that token. A second 403 is
    /// [`CredentialError::AntiForgeryRejected`]. Any other response is
    /// returned as is, after its token (if new) has been stored.
    #[instrument(skip(self, request), fields(credential = %credential, method = %request.method, url = %request.url))]
    pub async fn send(&self, credential: &Credential, request: HttpRequest) -> Result<HttpResponse> {
        let mut request = request;
        request.set_header(COOKIE, &credential.cookie_pair(&self.cookie_name))?;

        let sent_token = self.tokens.get_token(credential);
        if !sent_token.is_empty() {
            request.set_header(HeaderName::from_static(CSRF_TOKEN_HEADER), &sent_token)?;
        }

        let retryable = request.is_state_changing();
        let response = self.transport.send(request.clone()).await?;
        let fresh = self.observe_token(credential, &sent_token, &response);

        if response.status != StatusCode::FORBIDDEN || !retryable {
            return Ok(response);
        }
        let Some(fresh) = fresh else {
            debug!("403 without a fresh token, not retrying");
            return Ok(response);
        };

        debug!("Anti-forgery token rejected, retrying with fresh token");
        request.set_header(HeaderName::from_static(CSRF_TOKEN_HEADER), &fresh)?;
        let response = self.transport.send(request).await?;
        self.observe_token(credential, &fresh, &response);

        if response.status == StatusCode::FORBIDDEN {
            warn!("Anti-forgery token rejected twice");
            return Err(CredentialError::AntiForgeryRejected {
                status: response.status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Store the response's token if it differs from the one sent.
    fn observe_token(
        &self,
        credential: &Credential,
        sent: &str,
        response: &HttpResponse,
    ) -> Option<String> {
        let token = response.header(CSRF_TOKEN_HEADER)?.trim();
        if token.is_empty() || token == sent {
            return None;
        }
        self.tokens.update_token(credential, token);
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, response, response_with_header};

    const COOKIE_NAME: &str = ".ROBLOSECURITY";

    fn client(transport: Arc<ScriptedTransport>) -> CsrfClient {
        CsrfClient::new(transport, Arc::new(AntiForgeryTokenStore::new()), COOKIE_NAME)
    }

    fn sent_token(request: &HttpRequest) -> Option<&str> {
        request
            .headers
            .get(CSRF_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_store_operations() {
        let store = AntiForgeryTokenStore::new();
        let a = Credential::new("a");
        let b = Credential::new("b");

        assert_eq!(store.get_token(&a), "");
        store.update_token(&a, "T1");
        store.update_token(&b, "T2");
        assert_eq!(store.get_token(&a), "T1");

        store.update_token(&a, "T3");
        assert_eq!(store.get_token(&a), "T3");

        store.invalidate(&a);
        assert_eq!(store.get_token(&a), "");
        assert_eq!(store.get_token(&b), "T2");

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_retry_once_with_fresh_token() {
        let transport = ScriptedTransport::new(vec![
            Ok(response_with_header(403, "", CSRF_TOKEN_HEADER, "T1")),
            Ok(response_with_header(200, "{}", CSRF_TOKEN_HEADER, "T2")),
        ]);
        let client = client(transport.clone());
        let credential = Credential::new("abc");

        let response = client
            .send(&credential, HttpRequest::post("https://api.test/v1/thing"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(client.tokens().get_token(&credential), "T2");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(sent_token(&requests[0]), None);
        assert_eq!(sent_token(&requests[1]), Some("T1"));
        for request in &requests {
            assert_eq!(request.headers.get(COOKIE).unwrap(), ".ROBLOSECURITY=abc");
        }
    }

    #[tokio::test]
    async fn test_second_rejection_is_an_error() {
        let transport = ScriptedTransport::new(vec![
            Ok(response_with_header(403, "", CSRF_TOKEN_HEADER, "T1")),
            Ok(response_with_header(403, "", CSRF_TOKEN_HEADER, "T2")),
            Ok(response(200, "")),
        ]);
        let client = client(transport.clone());
        let credential = Credential::new("abc");

        let err = client
            .send(&credential, HttpRequest::post("https://api.test/v1/thing"))
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::AntiForgeryRejected { status: 403 }));
        assert_eq!(transport.request_count(), 2);
        assert_eq!(client.tokens().get_token(&credential), "T2");
    }

    #[tokio::test]
    async fn test_cached_token_is_sent() {
        let transport = ScriptedTransport::new(vec![Ok(response(200, ""))]);
        let client = client(transport.clone());
        let credential = Credential::new("abc");
        client.tokens().update_token(&credential, "cached");

        client
            .send(&credential, HttpRequest::patch("https://api.test/v1/thing"))
            .await
            .unwrap();

        assert_eq!(sent_token(&transport.requests()[0]), Some("cached"));
        assert_eq!(client.tokens().get_token(&credential), "cached");
    }

    #[tokio::test]
    async fn test_403_without_token_is_returned() {
        let transport = ScriptedTransport::new(vec![Ok(response(403, "denied"))]);
        let client = client(transport.clone());
        let credential = Credential::new("abc");

        let response = client
            .send(&credential, HttpRequest::post("https://api.test/v1/thing"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_get_observes_token_without_retry() {
        let transport = ScriptedTransport::new(vec![Ok(response_with_header(
            403,
            "",
            CSRF_TOKEN_HEADER,
            "T1",
        ))]);
        let client = client(transport.clone());
        let credential = Credential::new("abc");

        let response = client
            .send(&credential, HttpRequest::get("https://api.test/v1/thing"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(client.tokens().get_token(&credential), "T1");
    }

    #[tokio::test]
    async fn test_success_response_refreshes_token() {
        let transport = ScriptedTransport::new(vec![Ok(response_with_header(
            200,
            "",
            CSRF_TOKEN_HEADER,
            "T9",
        ))]);
        let client = client(transport);
        let credential = Credential::new("abc");
        client.tokens().update_token(&credential, "T1");

        client
            .send(&credential, HttpRequest::post("https://api.test/v1/thing"))
            .await
            .unwrap();

        assert_eq!(client.tokens().get_token(&credential), "T9");
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let transport = ScriptedTransport::new(vec![Err(CredentialError::Network(
            "connection reset".into(),
        ))]);
        let client = client(transport);

        let err = client
            .send(&Credential::new("abc"), HttpRequest::post("https://api.test/v1/thing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Network(_)));
    }
}
