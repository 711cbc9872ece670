use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Minimum spacing between consecutive outbound requests.
pub const REQUEST_INTERVAL_MS: u64 = 150;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_BACKOFF_BASE_MS: u64 = 500;
pub const MAX_RETRY_BACKOFF_MS: u64 = 4_000;

// Type alias for the rate limiter to simplify signatures
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Failure of one outbound exchange call, classified for retry.
#[derive(Debug)]
pub enum FetchError {
    /// Non-2xx HTTP response with its body text.
    Status { code: u16, body: String },
    /// Transport-level failure (DNS, connect, timeout, body read).
    Network(String),
}

impl FetchError {
    /// 429 and 5xx responses plus all network errors are transient; other
    /// 4xx responses surface to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { code, .. } => *code == 429 || *code >= 500,
            FetchError::Network(_) => true,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Status { code, body } => write!(f, "HTTP {}: {}", code, body),
            FetchError::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// Process-wide gate for outbound exchange calls.
///
/// Serializes requests to a minimum spacing and retries transient failures
/// with exponential backoff. Cloneable; all clones share the same limiter.
#[derive(Clone)]
pub struct RateLimitedFetcher {
    limiter: Arc<DirectLimiter>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl RateLimitedFetcher {
    pub fn new() -> Self {
        Self::with_settings(
            Duration::from_millis(REQUEST_INTERVAL_MS),
            MAX_RETRY_ATTEMPTS,
            Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            Duration::from_millis(MAX_RETRY_BACKOFF_MS),
        )
    }

    /// Build with explicit spacing and retry settings (tests use short ones).
    pub fn with_settings(
        interval: Duration,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        let quota = Quota::with_period(interval).expect("request interval must be non-zero");
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            max_attempts,
            backoff_base,
            backoff_cap,
        }
    }

    /// Run one exchange call through the shared spacing gate.
    ///
    /// `op` builds, sends, and decodes the request; it is re-invoked on each
    /// retry. Transient failures back off doubling from the base, capped;
    /// the last error surfaces once attempts are exhausted.
    pub async fn fetch<T, F, Fut>(&self, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = self.backoff_base;

        for attempt in 1..=self.max_attempts {
            self.limiter.until_ready().await;

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        "Transient exchange error: {}, retrying in {:?} (attempt {}/{})",
                        err,
                        backoff,
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_cap);
                }
                Err(err) => return Err(err),
            }
        }

        Err(FetchError::Network("no fetch attempts were made".to_string()))
    }
}

impl Default for RateLimitedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn quick_fetcher(interval_ms: u64, base_ms: u64) -> RateLimitedFetcher {
        RateLimitedFetcher::with_settings(
            Duration::from_millis(interval_ms),
            MAX_RETRY_ATTEMPTS,
            Duration::from_millis(base_ms),
            Duration::from_millis(base_ms * 8),
        )
    }

    #[tokio::test]
    async fn test_success_is_single_attempt() {
        let fetcher = quick_fetcher(1, 10);
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result = fetcher
            .fetch(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let fetcher = quick_fetcher(1, 20);
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let started = Instant::now();
        let result = fetcher
            .fetch(move || {
                let counted = counted.clone();
                async move {
                    let attempt = counted.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt <= 2 {
                        Err(FetchError::Status {
                            code: 500,
                            body: "boom".to_string(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Backoff doubles from the base: 20ms + 40ms between the attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let fetcher = quick_fetcher(1, 10);
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<u32, _> = fetcher
            .fetch(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Status {
                        code: 404,
                        body: "missing".to_string(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_and_surface_last_error() {
        let fetcher = RateLimitedFetcher::with_settings(
            Duration::from_millis(1),
            3,
            Duration::from_millis(1),
            Duration::from_millis(4),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<u32, _> = fetcher
            .fetch(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Network("unreachable".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[tokio::test]
    async fn test_request_spacing_enforced() {
        let fetcher = quick_fetcher(50, 10);
        let mut starts = Vec::new();

        for _ in 0..3 {
            let started = Arc::new(std::sync::Mutex::new(None));
            let slot = started.clone();
            fetcher
                .fetch(move || {
                    let slot = slot.clone();
                    async move {
                        *slot.lock().unwrap() = Some(Instant::now());
                        Ok::<_, FetchError>(())
                    }
                })
                .await
                .unwrap();
            starts.push(started.lock().unwrap().unwrap());
        }

        for pair in starts.windows(2) {
            // 5ms slack for timer granularity; the target spacing is 50ms.
            assert!(pair[1] - pair[0] >= Duration::from_millis(45));
        }
    }

    #[test]
    fn test_error_classification() {
        let rate_limited = FetchError::Status {
            code: 429,
            body: String::new(),
        };
        let server = FetchError::Status {
            code: 503,
            body: String::new(),
        };
        let bad_request = FetchError::Status {
            code: 400,
            body: String::new(),
        };
        let network = FetchError::Network("reset".to_string());

        assert!(rate_limited.is_retryable());
        assert!(server.is_retryable());
        assert!(network.is_retryable());
        assert!(!bad_request.is_retryable());
    }
}
