//! Per-adapter token buckets and the retry policy for remote calls.
//!
//! Every outbound adapter call acquires a token first; an empty bucket
//! suspends the caller until the next refill or until its cancellation token
//! fires. Transient failures retry with exponential backoff and jitter;
//! authentication and permission failures never retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use crate::models::Platform;

/// Budget applied to adapters that never declared one.
const DEFAULT_BUDGET_PER_MINUTE: u32 = 60;

#[derive(Debug)]
struct BucketState {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl BucketState {
    fn new(budget_per_minute: u32) -> Self {
        let capacity = budget_per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Option<Duration> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }
}

/// Token buckets plus retry/backoff for all registered adapters
pub struct AdapterRateLimiter {
    retry: RetryConfig,
    buckets: DashMap<Platform, Arc<Mutex<BucketState>>>,
}

impl AdapterRateLimiter {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            buckets: DashMap::new(),
        }
    }

    /// Size the bucket for one platform from its declared budget.
    pub fn register(&self, platform: Platform, budget_per_minute: u32) {
        self.buckets.insert(
            platform,
            Arc::new(Mutex::new(BucketState::new(budget_per_minute))),
        );
    }

    fn bucket(&self, platform: Platform) -> Arc<Mutex<BucketState>> {
        self.buckets
            .entry(platform)
            .or_insert_with(|| Arc::new(Mutex::new(BucketState::new(DEFAULT_BUDGET_PER_MINUTE))))
            .clone()
    }

    /// Acquire one token for an outbound call, suspending until the bucket
    /// refills. Cancellation wins over the wait.
    pub async fn acquire(&self, platform: Platform, cancel: &CancellationToken) -> Result<()> {
        let bucket = self.bucket(platform);
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let wait = { bucket.lock().await.try_take() };
            match wait {
                None => return Ok(()),
                Some(delay) => {
                    tracing::debug!(
                        platform = %platform,
                        wait_ms = delay.as_millis() as u64,
                        "rate limit bucket empty, waiting"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    }
                }
            }
        }
    }

    /// Run one remote call with token acquisition and retry. Retryable
    /// failures back off exponentially with jitter up to the configured
    /// attempt budget; everything else propagates immediately.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        platform: Platform,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.acquire(platform, cancel).await?;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            platform = %platform,
                            attempt,
                            "remote call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.backoff_delay(attempt, &err);
                    tracing::warn!(
                        platform = %platform,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote call failed, retrying"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32, err: &SyncError) -> Duration {
        let base = self.retry.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
        let jitter =
            1.0 + self.retry.jitter_ratio * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        let mut delay = Duration::from_millis((base * jitter).max(0.0) as u64);
        // A server-provided retry-after hint extends, never shortens, the wait.
        if let SyncError::RateLimited {
            retry_after: Some(hint),
            ..
        } = err
        {
            delay = delay.max(*hint);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn bucket_suspends_until_refill() {
        let limiter = AdapterRateLimiter::new(RetryConfig::default());
        limiter.register(Platform::Spotify, 2);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(Platform::Spotify, &cancel).await.unwrap();
        limiter.acquire(Platform::Spotify, &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third token needs a refill: 2 per minute means one every 30s.
        limiter.acquire(Platform::Spotify, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_bucket_wait() {
        let limiter = AdapterRateLimiter::new(RetryConfig::default());
        limiter.register(Platform::Youtube, 1);
        let cancel = CancellationToken::new();

        limiter.acquire(Platform::Youtube, &cancel).await.unwrap();

        let waiting = limiter.acquire(Platform::Youtube, &cancel);
        tokio::pin!(waiting);
        tokio::select! {
            biased;
            _ = &mut waiting => panic!("acquire should be blocked"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        cancel.cancel();
        assert!(matches!(waiting.await, Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_up_to_budget() {
        let limiter = AdapterRateLimiter::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            jitter_ratio: 0.0,
        });
        limiter.register(Platform::Spotify, 10_000);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = limiter
            .execute_with_retry(Platform::Spotify, &cancel, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SyncError::RateLimited {
                        platform: Platform::Spotify,
                        retry_after: None,
                    })
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exhausted_after_max_attempts() {
        let limiter = AdapterRateLimiter::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            jitter_ratio: 0.0,
        });
        limiter.register(Platform::Discogs, 10_000);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = limiter
            .execute_with_retry(Platform::Discogs, &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::transient("remote 503"))
            })
            .await;

        assert!(matches!(result, Err(SyncError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failures_never_retry() {
        let limiter = AdapterRateLimiter::new(RetryConfig::default());
        limiter.register(Platform::Rekordbox, 10_000);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = limiter
            .execute_with_retry(Platform::Rekordbox, &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::AuthFailed {
                    platform: Platform::Rekordbox,
                    message: "token revoked".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(SyncError::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
