//! C4 — Retry/backoff.
//!
//! Classifies a `ProviderError` as retryable or not, computes the delay
//! before the next attempt, and provides a cancellable sleep primitive
//! (spec.md §4.4).

use std::time::Duration;

use tokio::sync::watch;

use crate::error::ProviderError;

const INITIAL_DELAY_MS: u64 = 2000;
const BACKOFF_FACTOR: u64 = 2;
const CAP_NO_HEADER_MS: u64 = 30_000;
/// Cap applied when a header override exists but still needs bounding
/// against pathological values (platform maximum).
const CAP_WITH_HEADER_MS: u64 = 300_000;

/// `Err` means the wait was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Classify an error as retryable (`Some(reason)`) or not (`None`).
pub fn classify(error: &ProviderError) -> Option<String> {
    match error {
        ProviderError::Cancelled | ProviderError::ContextOverflow => None,
        ProviderError::Auth(_) | ProviderError::InvalidRequest(_) | ProviderError::Aborted(_) => None,
        ProviderError::Overloaded(msg) => Some(format!("overloaded: {msg}")),
        ProviderError::RateLimit(msg) => Some(format!("rate limited: {msg}")),
        ProviderError::ServerError(msg) => Some(format!("server error: {msg}")),
        ProviderError::Http { status, .. } => {
            if matches!(*status, 429 | 529) || *status >= 500 {
                Some(format!("http {status}"))
            } else {
                None
            }
        }
        ProviderError::Other(msg) => classify_message(msg),
    }
}

const RETRYABLE_PATTERNS: &[&str] = &["overloaded", "rate limit", "429", "exhausted", "unavailable"];

fn classify_message(msg: &str) -> Option<String> {
    let lower = msg.to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .find(|p| lower.contains(*p))
        .map(|p| format!("matched pattern \"{p}\""))
}

/// Compute the delay before the next attempt, honoring header overrides in
/// priority order, else exponential backoff from `attempt` (1-indexed).
pub fn delay_for(error: &ProviderError, attempt: u32) -> Duration {
    if let Some(d) = error.retry_after() {
        let cap = Duration::from_millis(CAP_WITH_HEADER_MS);
        return d.min(cap);
    }

    let exp = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1));
    let ms = INITIAL_DELAY_MS.saturating_mul(exp).min(CAP_NO_HEADER_MS);
    Duration::from_millis(ms)
}

/// Sleep for `delay`, waking early with `Cancelled` if `cancel` flips to
/// `true` first.
pub async fn cancellable_sleep(delay: Duration, cancel: &mut watch::Receiver<bool>) -> Result<(), Cancelled> {
    if *cancel.borrow() {
        return Err(Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        result = cancel.changed() => {
            match result {
                Ok(()) if *cancel.borrow() => Err(Cancelled),
                Ok(()) => Ok(()),
                Err(_) => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn cancellation_is_non_retryable() {
        assert_eq!(classify(&ProviderError::Cancelled), None);
    }

    #[test]
    fn context_overflow_is_non_retryable() {
        assert_eq!(classify(&ProviderError::ContextOverflow), None);
    }

    #[test]
    fn auth_error_is_non_retryable() {
        assert_eq!(classify(&ProviderError::Auth("bad key".into())), None);
    }

    #[test]
    fn rate_limit_is_retryable() {
        assert!(classify(&ProviderError::RateLimit("slow down".into())).is_some());
    }

    #[test]
    fn http_429_is_retryable() {
        let e = ProviderError::Http { status: 429, body: String::new(), headers: HashMap::new() };
        assert!(classify(&e).is_some());
    }

    #[test]
    fn http_529_is_retryable() {
        let e = ProviderError::Http { status: 529, body: String::new(), headers: HashMap::new() };
        assert!(classify(&e).is_some());
    }

    #[test]
    fn http_404_is_not_retryable() {
        let e = ProviderError::Http { status: 404, body: String::new(), headers: HashMap::new() };
        assert_eq!(classify(&e), None);
    }

    #[test]
    fn message_pattern_matching() {
        assert!(classify(&ProviderError::Other("service is overloaded right now".into())).is_some());
        assert!(classify(&ProviderError::Other("totally fine".into())).is_none());
    }

    #[test]
    fn exponential_backoff_without_header() {
        let e = ProviderError::Other("overloaded".into());
        let d1 = delay_for(&e, 1);
        let d2 = delay_for(&e, 2);
        let d3 = delay_for(&e, 3);
        assert_eq!(d1, Duration::from_millis(2000));
        assert_eq!(d2, Duration::from_millis(4000));
        assert_eq!(d3, Duration::from_millis(8000));
        assert!(d2 >= d1 && d3 >= d2);
    }

    #[test]
    fn backoff_is_capped_without_header() {
        let e = ProviderError::Other("overloaded".into());
        let d = delay_for(&e, 20);
        assert!(d <= Duration::from_millis(CAP_NO_HEADER_MS));
    }

    #[test]
    fn header_delay_takes_priority_over_backoff() {
        let mut headers = HashMap::new();
        headers.insert("retry-after-ms".to_string(), "1234".to_string());
        let e = ProviderError::Http { status: 429, body: String::new(), headers };
        assert_eq!(delay_for(&e, 5), Duration::from_millis(1234));
    }

    #[tokio::test]
    async fn cancellable_sleep_resolves_normally() {
        let (_tx, mut rx) = watch::channel(false);
        let result = cancellable_sleep(Duration::from_millis(1), &mut rx).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn cancellable_sleep_wakes_early_on_cancel() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = cancellable_sleep(Duration::from_secs(30), &mut rx).await;
        assert_eq!(result, Err(Cancelled));
    }
}
