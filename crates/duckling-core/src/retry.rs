//! Retry helper (C3): bounded exponential-backoff wrapper with jitter, used
//! around every external/transient operation (LLM calls, VCS operations,
//! hosted-VCS calls, assistant invocations).

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::warn;

/// Exponential backoff with 10% jitter, matching spec default `maxRetries=3`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Delay before the `attempt`-th retry (1-indexed): `base * 2^(attempt-1)`,
/// capped at `max_delay`, with up to `jitter` fraction added on top.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.base_delay.as_millis().saturating_mul(1u128 << attempt.min(20).saturating_sub(1));
    let capped = exp.min(config.max_delay.as_millis());
    let jitter_span = (capped as f64 * config.jitter).max(0.0);
    let jitter_ms = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(0.0..jitter_span)
    } else {
        0.0
    };
    Duration::from_millis(capped as u64 + jitter_ms as u64)
}

/// Run `op` up to `config.max_attempts` times, sleeping with backoff between
/// attempts. Returns the last error if every attempt fails.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, operation_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= config.max_attempts => {
                return Err(e.context(format!("{operation_name} failed after {attempt} attempt(s)")));
            }
            Err(e) => {
                let delay = calculate_delay(config, attempt);
                warn!(operation_name, attempt, ?delay, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_monotonically_until_capped() {
        let config = RetryConfig { jitter: 0.0, ..RetryConfig::new(5) };
        let mut prev = Duration::ZERO;
        for attempt in 1..=5 {
            let d = calculate_delay(&config, attempt);
            assert!(d >= prev);
            assert!(d <= config.max_delay);
            prev = d;
        }
    }

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..RetryConfig::new(3) };
        let result = retry_async(&config, "test_op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow::anyhow!("transient"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_exhausts_and_returns_last_error() {
        let config = RetryConfig { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..RetryConfig::new(2) };
        let result: Result<()> = retry_async(&config, "test_op", || async { Err(anyhow::anyhow!("always fails")) }).await;
        assert!(result.is_err());
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_max_delay_plus_jitter(attempt in 1u32..30, base_ms in 1u64..5000, max_ms in 1u64..60_000) {
            let config = RetryConfig {
                max_attempts: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter: 0.1,
            };
            let d = calculate_delay(&config, attempt);
            let ceiling = config.max_delay.as_millis() as u64 + (config.max_delay.as_millis() as f64 * config.jitter) as u64 + 1;
            prop_assert!(d.as_millis() as u64 <= ceiling);
        }
    }
}
