//! Error taxonomy shared by the retry classifier (C4) and the loop
//! controller's terminal `RunError` event (spec.md §4.4, §7).

use std::collections::HashMap;
use std::time::Duration;

/// A structured provider error, as the transport layer (excluded from this
/// crate per spec.md §1) would surface a failed model call.
///
/// Callers of the core construct this from whatever their HTTP client gives
/// them; the core never issues requests itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("request cancelled")]
    Cancelled,

    #[error("context window exceeded")]
    ContextOverflow,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request aborted: {0}")]
    Aborted(String),

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("provider server error: {0}")]
    ServerError(String),

    #[error("http {status}: {body}")]
    Http {
        status: u16,
        body: String,
        headers: HashMap<String, String>,
    },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// The `code` carried on a terminal `RunError` event, where applicable.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProviderError::Cancelled => None,
            ProviderError::ContextOverflow => None,
            ProviderError::Auth(_) => Some("AUTH_ERROR"),
            ProviderError::InvalidRequest(_) => Some("INVALID_REQUEST"),
            ProviderError::Aborted(_) => Some("ABORTED"),
            ProviderError::Overloaded(_) => Some("OVERLOADED"),
            ProviderError::RateLimit(_) => Some("RATE_LIMIT"),
            ProviderError::ServerError(_) => Some("SERVER_ERROR"),
            ProviderError::Http { status, .. } => {
                if *status == 429 {
                    Some("RATE_LIMIT")
                } else if *status >= 500 {
                    Some("SERVER_ERROR")
                } else {
                    None
                }
            }
            ProviderError::Other(_) => None,
        }
    }

    /// `retry-after-ms` / `retry-after` headers, if present on an HTTP error.
    pub fn retry_after(&self) -> Option<Duration> {
        let headers = match self {
            ProviderError::Http { headers, .. } => headers,
            _ => return None,
        };

        if let Some(ms) = headers.get("retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
            if ms >= 0.0 {
                return Some(Duration::from_millis(ms as u64));
            }
        }

        if let Some(raw) = headers.get("retry-after") {
            if let Ok(secs) = raw.parse::<f64>() {
                if secs >= 0.0 {
                    return Some(Duration::from_secs_f64(secs));
                }
            }
            if let Ok(when) = httpdate_to_duration(raw) {
                return Some(when);
            }
        }

        None
    }
}

/// Parse an HTTP-date `retry-after` header into a duration from now.
/// Returns `Err` for anything not resembling an RFC 1123 date; callers
/// fall back to no header override.
fn httpdate_to_duration(raw: &str) -> Result<Duration, ()> {
    let when = chrono::DateTime::parse_from_rfc2822(raw).map_err(|_| ())?;
    let now = chrono::Utc::now();
    let delta = when.with_timezone(&chrono::Utc) - now;
    let millis = delta.num_milliseconds();
    if millis <= 0 {
        Ok(Duration::from_millis(0))
    } else {
        Ok(Duration::from_millis(millis as u64))
    }
}
