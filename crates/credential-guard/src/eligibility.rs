//! Moderation-based eligibility gate.
//!
//! Every sensitive action asks the gate first. Classifications are cached
//! per credential; anything short of a definite `Eligible` counts as not
//! usable.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::COOKIE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::TtlCache;
use crate::config::GuardConfig;
use crate::credential::Credential;
use crate::error::{CredentialError, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Upper bound on a rate-limit backoff, whatever `Retry-After` asks for.
pub const MAX_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Risk classification of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EligibilityStatus {
    /// Status unknown: transport failure, 5xx, rate limit or unreadable reply.
    NetworkError,
    /// Platform rejected the credential.
    InvalidCredential,
    Eligible,
    /// Temporarily banned.
    Banned { until: DateTime<Utc> },
    /// Has a moderation warning to acknowledge.
    Warned,
    /// Account deleted by moderation.
    Terminated,
}

impl EligibilityStatus {
    /// Only `Eligible` is usable.
    #[inline]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Eligible)
    }

    /// Permanent until an explicit refresh; the user has to log in again.
    #[inline]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::InvalidCredential | Self::Terminated)
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError)
    }

    /// `Ok(())` for `Eligible`, otherwise the matching error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Eligible => Ok(()),
            Self::NetworkError => Err(CredentialError::Network(
                "credential eligibility unknown".into(),
            )),
            Self::InvalidCredential => Err(CredentialError::CredentialInvalid),
            Self::Banned { until } => Err(CredentialError::CredentialBanned { until }),
            Self::Warned => Err(CredentialError::CredentialWarned),
            Self::Terminated => Err(CredentialError::CredentialTerminated),
        }
    }
}

impl fmt::Display for EligibilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkError => write!(f, "network error"),
            Self::InvalidCredential => write!(f, "invalid credential"),
            Self::Eligible => write!(f, "eligible"),
            Self::Banned { until } => write!(f, "banned until {}", until.to_rfc3339()),
            Self::Warned => write!(f, "warned"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Body of the moderation endpoint. `{}` when the account is in good standing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModerationResponse {
    #[serde(default)]
    punishment_type_description: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

pub struct CredentialEligibilityGate {
    transport: Arc<dyn HttpTransport>,
    moderation_url: String,
    cookie_name: String,
    cache: TtlCache<Credential, EligibilityStatus>,
    /// Set by a 429; while in the future no request is sent.
    backoff_until: RwLock<Option<Instant>>,
    default_backoff: Duration,
}

impl CredentialEligibilityGate {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &GuardConfig) -> Self {
        Self {
            transport,
            moderation_url: config.moderation_url.clone(),
            cookie_name: config.cookie_name.clone(),
            cache: TtlCache::new(config.eligibility_ttl),
            backoff_until: RwLock::new(None),
            default_backoff: config.rate_limit_backoff,
        }
    }

    /// Cached classification, querying the moderation endpoint on a miss.
    ///
    /// `NetworkError` is never cached. `InvalidCredential` and `Terminated`
    /// do not expire.
    #[instrument(skip(self), fields(credential = %credential))]
    pub async fn classify(&self, credential: &Credential) -> EligibilityStatus {
        if let Some(status) = self.cache.get(credential) {
            return status;
        }

        if let Some(remaining) = self.backoff_remaining() {
            debug!(
                remaining_secs = remaining.as_secs(),
                "Rate limit backoff active, skipping moderation check"
            );
            return EligibilityStatus::NetworkError;
        }

        let status = self.query(credential).await;
        if status.requires_reauthentication() {
            // Kept until refresh, invalidate or clear_all.
            self.cache.set(credential.clone(), status, Some(Duration::MAX));
        } else if !status.is_transient() {
            self.cache.set(credential.clone(), status, None);
        }
        status
    }

    pub async fn is_usable(&self, credential: &Credential) -> bool {
        self.classify(credential).await.is_usable()
    }

    /// Drop the cached entry and query again.
    pub async fn refresh(&self, credential: &Credential) -> EligibilityStatus {
        self.cache.invalidate(credential);
        self.classify(credential).await
    }

    pub fn invalidate(&self, credential: &Credential) {
        self.cache.invalidate(credential);
    }

    pub fn clear_all(&self) {
        self.cache.clear();
    }

    /// Classification currently cached for `credential`, without querying.
    pub fn cached_status(&self, credential: &Credential) -> Option<EligibilityStatus> {
        self.cache.get(credential)
    }

    /// Time left on the rate-limit backoff, if one is active.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let until = (*self.backoff_until.read())?;
        until
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    /// Drop expired classifications. Returns how many were removed.
    pub fn prune(&self) -> usize {
        self.cache.prune()
    }

    async fn query(&self, credential: &Credential) -> EligibilityStatus {
        let mut request = HttpRequest::get(&self.moderation_url);
        if let Err(e) = request.set_header(COOKIE, &credential.cookie_pair(&self.cookie_name)) {
            warn!(error = %e, "Credential cannot be sent as a cookie");
            return EligibilityStatus::InvalidCredential;
        }

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Moderation check failed");
                return EligibilityStatus::NetworkError;
            }
        };

        let status = self.interpret(&response);
        match status {
            EligibilityStatus::Eligible | EligibilityStatus::NetworkError => {
                debug!(%status, "Moderation check complete")
            }
            _ => info!(%status, "Credential is not eligible"),
        }
        status
    }

    fn interpret(&self, response: &HttpResponse) -> EligibilityStatus {
        match response.status {
            status if status.is_success() => classify_moderation_body(&response.body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                EligibilityStatus::InvalidCredential
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let backoff = response
                    .retry_after()
                    .unwrap_or(self.default_backoff)
                    .min(MAX_RATE_LIMIT_BACKOFF);
                warn!(
                    backoff_secs = backoff.as_secs(),
                    "Moderation endpoint rate limited, backing off"
                );
                *self.backoff_until.write() = Instant::now().checked_add(backoff);
                EligibilityStatus::NetworkError
            }
            status => {
                warn!(%status, "Unexpected moderation response status");
                EligibilityStatus::NetworkError
            }
        }
    }
}

fn classify_moderation_body(body: &str) -> EligibilityStatus {
    let moderation: ModerationResponse = match serde_json::from_str(body) {
        Ok(moderation) => moderation,
        Err(e) => {
            warn!(error = %e, "Unreadable moderation response");
            return EligibilityStatus::NetworkError;
        }
    };

    if let Some(end_date) = moderation
        .end_date
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return match parse_end_date(end_date) {
            Some(until) => EligibilityStatus::Banned { until },
            None => {
                warn!(end_date, "Unparseable punishment end date");
                EligibilityStatus::NetworkError
            }
        };
    }

    let punishment = moderation
        .punishment_type_description
        .unwrap_or_default()
        .to_ascii_lowercase();
    if punishment.contains("delete") {
        EligibilityStatus::Terminated
    } else if punishment.contains("warn") {
        EligibilityStatus::Warned
    } else {
        EligibilityStatus::Eligible
    }
}

/// RFC 3339, or an ISO timestamp without offset taken as UTC.
fn parse_end_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, response, response_with_header};
    use chrono::TimeZone;

    fn gate(transport: Arc<ScriptedTransport>) -> CredentialEligibilityGate {
        let config = GuardConfig {
            moderation_url: "https://moderation.test/v1/not-approved".into(),
            ..GuardConfig::default()
        };
        CredentialEligibilityGate::new(transport, &config)
    }

    #[test]
    fn test_is_usable_only_for_eligible() {
        let until = Utc::now();
        let statuses = [
            EligibilityStatus::NetworkError,
            EligibilityStatus::InvalidCredential,
            EligibilityStatus::Banned { until },
            EligibilityStatus::Warned,
            EligibilityStatus::Terminated,
        ];
        for status in statuses {
            assert!(!status.is_usable(), "{status} must not be usable");
            assert!(status.into_result().is_err());
        }
        assert!(EligibilityStatus::Eligible.is_usable());
        assert!(EligibilityStatus::Eligible.into_result().is_ok());
    }

    #[test]
    fn test_status_helpers() {
        assert!(EligibilityStatus::InvalidCredential.requires_reauthentication());
        assert!(EligibilityStatus::Terminated.requires_reauthentication());
        assert!(!EligibilityStatus::Warned.requires_reauthentication());
        assert!(EligibilityStatus::NetworkError.is_transient());
        assert!(!EligibilityStatus::InvalidCredential.is_transient());
    }

    #[test]
    fn test_moderation_body_mapping() {
        assert_eq!(classify_moderation_body("{}"), EligibilityStatus::Eligible);
        assert_eq!(
            classify_moderation_body(r#"{"punishmentTypeDescription":"Delete"}"#),
            EligibilityStatus::Terminated
        );
        assert_eq!(
            classify_moderation_body(r#"{"punishmentTypeDescription":"Warn"}"#),
            EligibilityStatus::Warned
        );
        assert_eq!(
            classify_moderation_body(r#"{"punishmentTypeDescription":"Ban 1 Day","endDate":"2030-01-02T03:04:05.000Z"}"#),
            EligibilityStatus::Banned {
                until: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()
            }
        );
        assert_eq!(
            classify_moderation_body(r#"{"endDate":"2030-01-02T03:04:05"}"#),
            EligibilityStatus::Banned {
                until: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()
            }
        );
        assert_eq!(
            classify_moderation_body(r#"{"endDate":null,"punishmentTypeDescription":null}"#),
            EligibilityStatus::Eligible
        );
        assert_eq!(
            classify_moderation_body(r#"{"endDate":"soon"}"#),
            EligibilityStatus::NetworkError
        );
        assert_eq!(
            classify_moderation_body("<html>"),
            EligibilityStatus::NetworkError
        );
    }

    #[tokio::test]
    async fn test_banned_with_expiry() {
        let transport = ScriptedTransport::new(vec![Ok(response(
            200,
            r#"{"punishmentTypeDescription":"Ban 7 Days","endDate":"2031-05-06T07:08:09Z"}"#,
        ))]);
        let gate = gate(transport.clone());
        let credential = Credential::new("abc");

        let status = gate.classify(&credential).await;
        assert_eq!(
            status,
            EligibilityStatus::Banned {
                until: Utc.with_ymd_and_hms(2031, 5, 6, 7, 8, 9).unwrap()
            }
        );
        assert!(!gate.is_usable(&credential).await);

        let request = &transport.requests()[0];
        assert_eq!(request.url, "https://moderation.test/v1/not-approved");
        assert_eq!(request.headers.get(COOKIE).unwrap(), ".ROBLOSECURITY=abc");
    }

    #[tokio::test]
    async fn test_terminated_and_invalid() {
        let transport = ScriptedTransport::new(vec![
            Ok(response(200, r#"{"punishmentTypeDescription":"Delete"}"#)),
            Ok(response(401, "")),
            Ok(response(403, "")),
        ]);
        let gate = gate(transport);

        assert_eq!(
            gate.classify(&Credential::new("a")).await,
            EligibilityStatus::Terminated
        );
        assert_eq!(
            gate.classify(&Credential::new("b")).await,
            EligibilityStatus::InvalidCredential
        );
        assert_eq!(
            gate.classify(&Credential::new("c")).await,
            EligibilityStatus::InvalidCredential
        );
    }

    #[tokio::test]
    async fn test_classification_is_cached() {
        let transport = ScriptedTransport::new(vec![
            Ok(response(200, "{}")),
            Ok(response(200, r#"{"punishmentTypeDescription":"Warn"}"#)),
        ]);
        let gate = gate(transport.clone());
        let credential = Credential::new("abc");

        assert!(gate.is_usable(&credential).await);
        assert!(gate.is_usable(&credential).await);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(gate.cached_status(&credential), Some(EligibilityStatus::Eligible));

        assert_eq!(gate.refresh(&credential).await, EligibilityStatus::Warned);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_network_errors_are_not_cached() {
        let transport = ScriptedTransport::new(vec![
            Err(CredentialError::Network("connection refused".into())),
            Ok(response(502, "")),
            Ok(response(200, "{}")),
        ]);
        let gate = gate(transport.clone());
        let credential = Credential::new("abc");

        assert_eq!(gate.classify(&credential).await, EligibilityStatus::NetworkError);
        assert_eq!(gate.classify(&credential).await, EligibilityStatus::NetworkError);
        assert_eq!(gate.cached_status(&credential), None);
        assert_eq!(gate.classify(&credential).await, EligibilityStatus::Eligible);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_sets_backoff() {
        let transport = ScriptedTransport::new(vec![
            Ok(response_with_header(429, "", "retry-after", "120")),
            Ok(response(200, "{}")),
        ]);
        let gate = gate(transport.clone());

        assert_eq!(
            gate.classify(&Credential::new("a")).await,
            EligibilityStatus::NetworkError
        );
        let remaining = gate.backoff_remaining().unwrap();
        assert!(remaining > Duration::from_secs(100));
        assert!(remaining <= Duration::from_secs(120));

        // Other credentials are held back too.
        assert_eq!(
            gate.classify(&Credential::new("b")).await,
            EligibilityStatus::NetworkError
        );
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_retry_after_is_capped() {
        let transport = ScriptedTransport::new(vec![Ok(response_with_header(
            429,
            "",
            "retry-after",
            "18446744073709551615",
        ))]);
        let gate = gate(transport);

        assert_eq!(
            gate.classify(&Credential::new("a")).await,
            EligibilityStatus::NetworkError
        );
        let remaining = gate.backoff_remaining().unwrap();
        assert!(remaining <= MAX_RATE_LIMIT_BACKOFF);
        assert!(remaining > MAX_RATE_LIMIT_BACKOFF - Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_permanent_statuses_outlive_ttl() {
        let transport = ScriptedTransport::new(vec![
            Ok(response(401, "")),
            Ok(response(200, r#"{"punishmentTypeDescription":"Delete"}"#)),
            Ok(response(200, "{}")),
            Ok(response(200, "{}")),
        ]);
        let config = GuardConfig {
            eligibility_ttl: Duration::from_millis(20),
            ..GuardConfig::default()
        };
        let gate = CredentialEligibilityGate::new(transport.clone(), &config);
        let invalid = Credential::new("invalid");
        let terminated = Credential::new("terminated");

        assert_eq!(gate.classify(&invalid).await, EligibilityStatus::InvalidCredential);
        assert_eq!(gate.classify(&terminated).await, EligibilityStatus::Terminated);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(gate.classify(&invalid).await, EligibilityStatus::InvalidCredential);
        assert_eq!(gate.classify(&terminated).await, EligibilityStatus::Terminated);
        assert_eq!(gate.prune(), 0);
        assert_eq!(transport.request_count(), 2);

        assert_eq!(gate.refresh(&invalid).await, EligibilityStatus::Eligible);
        gate.invalidate(&terminated);
        assert_eq!(gate.classify(&terminated).await, EligibilityStatus::Eligible);
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn test_rate_limit_without_retry_after_uses_default() {
        let transport = ScriptedTransport::new(vec![Ok(response(429, ""))]);
        let config = GuardConfig {
            rate_limit_backoff: Duration::from_secs(30),
            ..GuardConfig::default()
        };
        let gate = CredentialEligibilityGate::new(transport, &config);

        gate.classify(&Credential::new("a")).await;
        let remaining = gate.backoff_remaining().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_all() {
        let transport = ScriptedTransport::with_handler(|_| Ok(response(200, "{}")));
        let gate = gate(transport.clone());
        let a = Credential::new("a");
        let b = Credential::new("b");

        gate.classify(&a).await;
        gate.classify(&b).await;
        gate.invalidate(&a);
        assert_eq!(gate.cached_status(&a), None);
        assert!(gate.cached_status(&b).is_some());

        gate.clear_all();
        assert_eq!(gate.cached_status(&b), None);

        gate.classify(&a).await;
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_short_ttl_expires() {
        let transport = ScriptedTransport::with_handler(|_| Ok(response(200, "{}")));
        let config = GuardConfig {
            eligibility_ttl: Duration::from_millis(20),
            ..GuardConfig::default()
        };
        let gate = CredentialEligibilityGate::new(transport.clone(), &config);
        let credential = Credential::new("abc");

        gate.classify(&credential).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gate.cached_status(&credential), None);
        gate.classify(&credential).await;
        assert_eq!(transport.request_count(), 2);
    }
}
