// =============================================================================
// Generic retry-with-backoff wrapper for exchange calls
// =============================================================================
//
// Retries up to `max_retries` times with exponential backoff (factor 1.5,
// starting at `base_delay_ms`). Does not distinguish error classes: any
// `Err` from the wrapped future is considered retryable, matching the
// reference client's blanket `except Exception` retry loop.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
const BACKOFF_FACTOR: f64 = 1.5;

/// Run `f` up to `max_retries + 1` times, backing off `base_delay_ms *
/// 1.5^attempt` milliseconds between attempts. Returns the last error if
/// every attempt fails.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay_ms: u64,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                let delay = (base_delay_ms as f64 * BACKOFF_FACTOR.powi(attempt as i32)) as u64;
                warn!(label, attempt, delay_ms = delay, error = %e, "retrying after error");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_try_without_delay() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, 1, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, 1, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                anyhow::bail!("transient");
            }
            Ok::<_, anyhow::Error>("ok")
        })
        .await
        .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("test", 2, 1, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
