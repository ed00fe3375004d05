use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with optional jitter, shared by command writes,
/// snapshot fetches and change-feed reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0-based), capped, without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay(&self, retry: u32) -> Duration {
        let jitter = match self.jitter_max {
            Some(max) if !max.is_zero() => {
                let max_ms = max.as_millis() as u64;
                Duration::from_millis(rand::rng().random_range(0..=max_ms))
            }
            _ => Duration::ZERO,
        };
        self.backoff(retry) + jitter
    }
}

/// Retries every error until `max_attempts` is used up.
pub async fn retry_async_with_config<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_async_when(config, |_| true, f).await
}

/// Retries only the errors `should_retry` accepts; any other error is
/// returned after the first attempt.
pub async fn retry_async_when<F, Fut, T, E, P>(
    config: RetryConfig,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut retry = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) if retry as usize + 1 >= max_attempts => return Err(e),
            Err(_) => {
                let delay = config.delay(retry);
                tracing::debug!(
                    "Attempt {}/{} failed, retrying in {:?}",
                    retry + 1,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}
