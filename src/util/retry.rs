//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff schedule: `base * 2^attempt`, capped, plus up to 20% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        exp.mul_f64(1.0 + jitter)
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// attempt budget is spent. The last error is returned.
pub async fn retry<T, E, F, Fut, R>(
    backoff: Backoff,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= backoff.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
        }
    }
}
