//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once at startup. Credentials must never appear in log fields in clear:
//! pass a [`Credential`](crate::Credential), whose formatting is redacted.

use chrono::Local;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{CredentialError, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "credential_guard=info,reqwest=warn";

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Build the filter: `RUST_LOG` when set, otherwise `directive`, otherwise
/// [`DEFAULT_LOG_FILTER`].
pub fn build_filter(directive: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = directive.unwrap_or(DEFAULT_LOG_FILTER);
    EnvFilter::try_new(directive)
        .map_err(|e| CredentialError::config(format!("Invalid log filter '{directive}': {e}")))
}

/// Install the global subscriber.
pub fn init_logging(directive: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = build_filter(directive)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_timer(LocalTimer))
            .try_init(),
    };

    result.map_err(|e| {
        CredentialError::config(format!("Failed to set global default subscriber: {e}"))
    })
}
