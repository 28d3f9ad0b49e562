//! Token accounting and retry for runtime calls.
//!
//! Keeps a 60s sliding window of token usage reported by the runtime, and
//! retries rate-limited requests with exponential backoff plus jitter.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::runtime::RuntimeError;

/// Generous defaults. The API answers 429 when we actually hit the limit,
/// and that path is handled by `execute_with_retry`.
const DEFAULT_INPUT_TPM: u32 = 200_000;
const DEFAULT_OUTPUT_TPM: u32 = 40_000;

/// Only throttle when very close to the limit
const SAFETY_MARGIN: f32 = 0.95;

const MAX_RETRIES: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 60_000;
const WINDOW: Duration = Duration::from_secs(60);

/// Token usage as reported on `response.completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
struct WindowEntry {
    timestamp: Instant,
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    Safe,
    /// Approaching limit, should throttle
    Throttle,
    /// At limit, must wait
    Limited,
}

pub struct RateLimiter {
    window: Mutex<VecDeque<WindowEntry>>,
    status: Mutex<RateLimitStatus>,
    limits: (u32, u32),
    totals: Mutex<(u64, u64)>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_INPUT_TPM, DEFAULT_OUTPUT_TPM)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn with_limits(input_tpm: u32, output_tpm: u32) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            status: Mutex::new(RateLimitStatus::Safe),
            limits: (
                (input_tpm as f32 * SAFETY_MARGIN) as u32,
                (output_tpm as f32 * SAFETY_MARGIN) as u32,
            ),
            totals: Mutex::new((0, 0)),
        }
    }

    pub async fn record_usage(&self, usage: Usage) {
        {
            let mut window = self.window.lock().await;
            window.push_back(WindowEntry {
                timestamp: Instant::now(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
            prune(&mut window);
        }
        {
            let mut totals = self.totals.lock().await;
            totals.0 += u64::from(usage.input_tokens);
            totals.1 += u64::from(usage.output_tokens);
        }
        self.update_status().await;
    }

    /// Token usage inside the sliding window.
    pub async fn current_usage(&self) -> (u64, u64) {
        let window = self.window.lock().await;
        let cutoff = Instant::now().checked_sub(WINDOW);
        window
            .iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .fold((0, 0), |(i, o), e| {
                (i + u64::from(e.input_tokens), o + u64::from(e.output_tokens))
            })
    }

    pub async fn totals(&self) -> (u64, u64) {
        *self.totals.lock().await
    }

    #[allow(clippy::cast_precision_loss)]
    async fn update_status(&self) {
        prune(&mut *self.window.lock().await);
        let (input, output) = self.current_usage().await;
        let (limit_input, limit_output) = self.limits;

        let input_ratio = input as f64 / f64::from(limit_input.max(1));
        let output_ratio = output as f64 / f64::from(limit_output.max(1));

        let next = if input_ratio >= 1.0 || output_ratio >= 1.0 {
            RateLimitStatus::Limited
        } else if input_ratio >= f64::from(SAFETY_MARGIN) || output_ratio >= f64::from(SAFETY_MARGIN) {
            RateLimitStatus::Throttle
        } else {
            RateLimitStatus::Safe
        };

        let mut status = self.status.lock().await;
        if *status != next {
            tracing::info!(
                "[rate_limiter] status: {:?} (input: {}/{}, output: {}/{})",
                next, input, limit_input, output, limit_output
            );
            *status = next;
        }
    }

    pub async fn status(&self) -> RateLimitStatus {
        *self.status.lock().await
    }

    /// Time until the oldest entry leaves the window.
    async fn wait_time(&self) -> Duration {
        let window = self.window.lock().await;
        let now = Instant::now();
        window
            .front()
            .map(|oldest| (oldest.timestamp + WINDOW).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Sleep if recent usage is near or over the limit. The status is
    /// recomputed first so an expired window no longer counts.
    pub async fn throttle_if_needed(&self) {
        self.update_status().await;
        match self.status().await {
            RateLimitStatus::Safe => {}
            RateLimitStatus::Throttle => {
                let wait = self.wait_time().await;
                if wait > Duration::ZERO {
                    tracing::info!("[rate_limiter] throttling for {:?}", wait);
                    sleep(wait).await;
                }
            }
            RateLimitStatus::Limited => {
                let wait = self.wait_time().await.max(Duration::from_secs(5));
                tracing::warn!("[rate_limiter] rate limited, waiting for {:?}", wait);
                sleep(wait).await;
            }
        }
    }

    /// Exponential backoff with ±25% jitter.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn calculate_backoff(attempt: u32) -> Duration {
        let delay = (BASE_RETRY_DELAY_MS * 2_u64.pow(attempt.min(5))).min(MAX_RETRY_DELAY_MS);
        let jitter = (delay as f32 * 0.25) as u64;
        let delay = delay - jitter + rand::random::<u64>() % (jitter * 2 + 1);
        Duration::from_millis(delay)
    }

    /// Run `operation`, retrying only while it fails with a rate-limit error.
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, RuntimeError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let mut attempt = 1;
        loop {
            self.throttle_if_needed().await;

            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_rate_limited() && attempt < MAX_RETRIES => {
                    let delay = Self::calculate_backoff(attempt);
                    tracing::warn!(
                        "[rate_limiter] rate limit hit (attempt {}/{}), retrying in {:?}",
                        attempt, MAX_RETRIES, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(window: &mut VecDeque<WindowEntry>) {
    let Some(cutoff) = Instant::now().checked_sub(WINDOW) else {
        return;
    };
    while window.front().is_some_and(|e| e.timestamp < cutoff) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        for attempt in 0..10 {
            let d = RateLimiter::calculate_backoff(attempt).as_millis();
            let base = u128::from((BASE_RETRY_DELAY_MS * 2_u64.pow(attempt.min(5))).min(MAX_RETRY_DELAY_MS));
            assert!(d >= base * 3 / 4 && d <= base * 5 / 4, "attempt {attempt}: {d}ms");
        }
    }

    #[tokio::test]
    async fn test_usage_moves_status() {
        let limiter = RateLimiter::with_limits(1000, 1000);
        limiter.record_usage(Usage { input_tokens: 100, output_tokens: 10 }).await;
        assert_eq!(limiter.status().await, RateLimitStatus::Safe);
        limiter.record_usage(Usage { input_tokens: 900, output_tokens: 10 }).await;
        assert_eq!(limiter.status().await, RateLimitStatus::Limited);
        assert_eq!(limiter.current_usage().await, (1000, 20));
        assert_eq!(limiter.totals().await, (1000, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_status_clears_when_window_expires() {
        let limiter = RateLimiter::with_limits(1000, 1000);
        limiter.record_usage(Usage { input_tokens: 1000, output_tokens: 0 }).await;
        assert_eq!(limiter.status().await, RateLimitStatus::Limited);

        tokio::time::advance(WINDOW + Duration::from_secs(1)).await;
        let started = Instant::now();
        limiter.throttle_if_needed().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(limiter.status().await, RateLimitStatus::Safe);
        assert_eq!(limiter.current_usage().await, (0, 0));
    }

    #[tokio::test]
    async fn test_large_usage_does_not_overflow() {
        let limiter = RateLimiter::new();
        let huge = Usage { input_tokens: u32::MAX, output_tokens: u32::MAX };
        limiter.record_usage(huge).await;
        limiter.record_usage(huge).await;
        assert_eq!(limiter.current_usage().await, (2 * u64::from(u32::MAX), 2 * u64::from(u32::MAX)));
        assert_eq!(limiter.status().await, RateLimitStatus::Limited);
    }

    #[tokio::test]
    async fn test_non_rate_limit_errors_are_not_retried() {
        let limiter = RateLimiter::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = limiter
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RuntimeError::Api { status: 400, message: "bad".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried() {
        let limiter = RateLimiter::new();
        let calls = AtomicU32::new(0);
        let result = limiter
            .execute_with_retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(RuntimeError::Api { status: 429, message: "slow down".into() })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
