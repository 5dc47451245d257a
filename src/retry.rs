//! Bounded retry and timeout helpers for transport calls.
//!
//! Only snapshot/screenshot fetches go through `with_retry`; input injection
//! is never retried mid-sequence.

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// `retries` extra attempts on top of the first one.
    pub fn with_retries(retries: usize) -> Self {
        Self {
            max_attempts: retries + 1,
            ..Self::default()
        }
    }
}

pub fn calculate_delay(config: &RetryConfig, attempt: usize) -> Duration {
    let delay = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let clamped = delay.min(config.max_delay_ms as f64) as u64;
    Duration::from_millis(clamped)
}

/// Run `fut` under `limit`, mapping elapsed time into `BridgeError::Timeout`.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, fut: Fut) -> BridgeResult<T>
where
    Fut: Future<Output = BridgeResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout(format!(
            "{} exceeded {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts.max(1) {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "transport call failed"
                );
                if !e.is_retryable() || attempt + 1 >= config.max_attempts {
                    return Err(e);
                }
                sleep(calculate_delay(config, attempt)).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BridgeError::Timeout(format!("{} never ran", operation_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();
        assert_eq!(calculate_delay(&config, 0), Duration::from_millis(200));
        assert_eq!(calculate_delay(&config, 1), Duration::from_millis(400));
        assert_eq!(calculate_delay(&config, 5), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transport_faults_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let out = with_retry(&RetryConfig::with_retries(2), "dump", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BridgeError::Timeout("dump".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicUsize::new(0);
        let err = with_retry(&RetryConfig::with_retries(4), "dump", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BridgeError::Ocr("bad tsv".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "ocr");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed() {
        let err = with_timeout(Duration::from_millis(50), "screencap", async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, BridgeError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(msg) if msg.contains("screencap")));
    }
}
