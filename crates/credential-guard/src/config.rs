//! Environment-driven configuration.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{CredentialError, Result};

pub const DEFAULT_COOKIE_NAME: &str = ".ROBLOSECURITY";
pub const DEFAULT_MODERATION_URL: &str = "https://usermoderation.roblox.com/v1/not-approved";
pub const DEFAULT_NONCE_URL: &str = "https://apis.roblox.com/hba-service/v1/getServerNonce";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Eligibility results are trusted for 30 minutes.
pub const DEFAULT_ELIGIBILITY_TTL: Duration = Duration::from_secs(30 * 60);
/// Fallback backoff when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const KEY_FILE_NAME: &str = "local.key";
const APP_DIR_NAME: &str = "credential-guard";

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Location of the raw 32-byte local symmetric key.
    pub key_path: PathBuf,
    /// Cookie the credential is sent as.
    pub cookie_name: String,
    pub moderation_url: String,
    pub nonce_url: String,
    pub eligibility_ttl: Duration,
    pub rate_limit_backoff: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Explicit proxy for all platform calls; `None` uses system/env defaults.
    pub proxy_url: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            moderation_url: DEFAULT_MODERATION_URL.to_string(),
            nonce_url: DEFAULT_NONCE_URL.to_string(),
            eligibility_ttl: DEFAULT_ELIGIBILITY_TTL,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy_url: None,
        }
    }
}

impl GuardConfig {
    /// Build the configuration from `CREDENTIAL_GUARD_*` environment variables.
    ///
    /// Unset or blank variables fall back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(path) = var("CREDENTIAL_GUARD_KEY_PATH") {
            config.key_path = PathBuf::from(path);
        }
        if let Some(name) = var("CREDENTIAL_GUARD_COOKIE_NAME") {
            config.cookie_name = name;
        }
        if let Some(url) = var("CREDENTIAL_GUARD_MODERATION_URL") {
            config.moderation_url = validate_url("CREDENTIAL_GUARD_MODERATION_URL", url)?;
        }
        if let Some(url) = var("CREDENTIAL_GUARD_NONCE_URL") {
            config.nonce_url = validate_url("CREDENTIAL_GUARD_NONCE_URL", url)?;
        }
        if let Some(secs) = var("CREDENTIAL_GUARD_ELIGIBILITY_TTL_SECS") {
            config.eligibility_ttl = parse_secs("CREDENTIAL_GUARD_ELIGIBILITY_TTL_SECS", &secs)?;
        }
        if let Some(secs) = var("CREDENTIAL_GUARD_BACKOFF_SECS") {
            config.rate_limit_backoff = parse_secs("CREDENTIAL_GUARD_BACKOFF_SECS", &secs)?;
        }
        if let Some(secs) = var("CREDENTIAL_GUARD_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("CREDENTIAL_GUARD_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(ua) = var("CREDENTIAL_GUARD_USER_AGENT") {
            config.user_agent = ua;
        }
        if let Some(url) = var("CREDENTIAL_GUARD_PROXY_URL") {
            config.proxy_url = Some(validate_url("CREDENTIAL_GUARD_PROXY_URL", url)?);
        }

        Ok(config)
    }

    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }
}

/// `<config_dir>/credential-guard/local.key`, or the working directory when
/// the platform has no config dir.
pub fn default_key_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(KEY_FILE_NAME)
}

fn validate_url(name: &str, value: String) -> Result<String> {
    Url::parse(&value).map_err(|e| CredentialError::config(format!("Invalid {name}: {e}")))?;
    Ok(value)
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| CredentialError::config(format!("{name} must be a whole number of seconds")))
}
