//! Credential error types.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Errors that can occur during credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Transport failure or 5xx from the platform. Safe to retry later.
    #[error("Network error: {0}")]
    Network(String),

    /// Platform asked us to back off.
    #[error("Rate limited - try again later")]
    RateLimited,

    /// Credential rejected by the platform - re-login required.
    #[error("Invalid credential - re-login required")]
    CredentialInvalid,

    /// Account is banned until the given time.
    #[error("Credential banned until {until}")]
    CredentialBanned { until: chrono::DateTime<chrono::Utc> },

    /// Account has an unacknowledged moderation warning.
    #[error("Credential has an active moderation warning")]
    CredentialWarned,

    /// Account was terminated.
    #[error("Credential terminated")]
    CredentialTerminated,

    /// State-changing request was still rejected after a token refresh.
    #[error("Anti-forgery token rejected after retry (status {status})")]
    AntiForgeryRejected { status: u16 },

    /// Cipher primitive failed while encrypting.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Blob could not be decoded or authenticated.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Local symmetric key could not be loaded or created.
    #[error("Local key unavailable: {0}")]
    KeyUnavailable(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Platform returned a response of unexpected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key generation or signing primitive failure.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CredentialError {
    /// Check if this error requires manual re-login.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::CredentialInvalid | Self::CredentialTerminated)
    }

    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CredentialError::CredentialInvalid.requires_reauthentication());
        assert!(CredentialError::CredentialTerminated.requires_reauthentication());
        assert!(!CredentialError::CredentialWarned.requires_reauthentication());

        assert!(CredentialError::Network("reset".into()).is_transient());
        assert!(CredentialError::RateLimited.is_transient());
        assert!(!CredentialError::CredentialInvalid.is_transient());
        assert!(!CredentialError::ParseError("x".into()).is_transient());
    }
}
