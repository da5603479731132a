//! HTTP transport seam.
//!
//! Every outbound call in this crate goes through [`HttpTransport::send`].
//! Production code uses [`ReqwestTransport`]; tests substitute a scripted
//! fake. Headers are `http::HeaderMap`, so lookups are case-insensitive.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::error::{CredentialError, Result};

/// An outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a header from a runtime string, rejecting values that are not
    /// valid in an HTTP header.
    pub fn set_header(&mut self, name: HeaderName, value: &str) -> Result<()> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| CredentialError::ParseError(format!("Invalid value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the body and set `Content-Type: application/json`.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Some(serde_json::to_string(value)?);
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    /// Body text, empty when absent.
    pub fn body_str(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    /// Methods that must carry an anti-forgery token.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PATCH | Method::PUT | Method::DELETE
        )
    }
}

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Header value as text; `None` if absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| CredentialError::ParseError(format!("{e} (status {})", self.status)))
    }

    /// `Retry-After` in whole seconds, if present.
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.header("Retry-After")?.trim();
        if value.is_empty() {
            return None;
        }
        value.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// The HTTP collaborator: `send(method, url, headers, body) -> (status, headers, body)`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// [`HttpTransport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client with the configured timeout, user agent and proxy.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        install_rustls_provider();

        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if config.request_timeout > Duration::ZERO {
            builder = builder.timeout(config.request_timeout);
        }

        builder = match config.proxy_url.as_deref() {
            Some(url) => match reqwest::Proxy::all(url) {
                Ok(proxy) => builder.proxy(proxy),
                Err(error) => {
                    warn!(proxy_url = %url, error = %error, "Invalid proxy URL; disabling proxy");
                    builder.no_proxy()
                }
            },
            None => builder,
        };

        let client = builder
            .build()
            .map_err(|e| CredentialError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport fake shared by unit tests.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

    enum Script {
        Queue(Mutex<VecDeque<Result<HttpResponse>>>),
        Handler(Box<Handler>),
    }

    /// Replays canned responses and records every request it receives.
    pub(crate) struct ScriptedTransport {
        script: Script,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(responses: Vec<Result<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Script::Queue(Mutex::new(responses.into())),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn with_handler<F>(handler: F) -> Arc<Self>
        where
            F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
        {
            Arc::new(Self {
                script: Script::Handler(Box::new(handler)),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().clone()
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().push(request.clone());
            match &self.script {
                Script::Queue(queue) => queue.lock().pop_front().unwrap_or_else(|| {
                    Err(CredentialError::Network("no scripted response left".into()))
                }),
                Script::Handler(handler) => handler(&request),
            }
        }
    }

    /// Response with a single extra header.
    pub(crate) fn response_with_header(
        status: u16,
        body: &str,
        name: &'static str,
        value: &str,
    ) -> HttpResponse {
        let mut response = HttpResponse::new(StatusCode::from_u16(status).unwrap(), body);
        response
            .headers
            .insert(name, HeaderValue::from_str(value).unwrap());
        response
    }

    pub(crate) fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(StatusCode::from_u16(status).unwrap(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = testing::response_with_header(403, "", "x-csrf-token", "abc");
        assert_eq!(response.header("X-CSRF-TOKEN"), Some("abc"));
        assert_eq!(response.header("x-csrf-token"), Some("abc"));
    }

    #[test]
    fn test_retry_after() {
        let response = testing::response_with_header(429, "", "retry-after", " 12 ");
        assert_eq!(response.retry_after(), Some(Duration::from_secs(12)));

        let response = testing::response_with_header(429, "", "retry-after", "tomorrow");
        assert_eq!(response.retry_after(), None);
        assert_eq!(testing::response(429, "").retry_after(), None);
    }

    #[test]
    fn test_request_builders() {
        let request = HttpRequest::post("https://example.com/v1/thing")
            .json(&serde_json::json!({ "a": 1 }))
            .unwrap();
        assert!(request.is_state_changing());
        assert_eq!(request.body_str(), r#"{"a":1}"#);
        assert_eq!(
            request.headers.get("content-type").unwrap(),
            "application/json"
        );

        let request = HttpRequest::get("https://example.com");
        assert!(!request.is_state_changing());
        assert_eq!(request.body_str(), "");
    }

    #[test]
    fn test_set_header_rejects_control_chars() {
        let mut request = HttpRequest::get("https://example.com");
        let err = request
            .set_header(reqwest::header::COOKIE, "a=b\r\nInjected: 1")
            .unwrap_err();
        assert!(matches!(err, CredentialError::ParseError(_)));
    }
}
