use crate::sleep::Sleeper;
use rand::{Rng, rng};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Exponential-backoff policy for one pipeline step.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay before the given retry (1-based attempt that just failed),
    /// doubled per attempt and capped at `max_delay`.
    fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exp);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted, with
/// exponential backoff plus a small jitter between attempts. All waits go
/// through the injected [`Sleeper`].
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    reason: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total_t0 = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let attempt_t0 = Instant::now();
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        reason,
                        attempt,
                        max = policy.max_attempts,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "exhausted retries"
                    );
                    return Err(e);
                }

                let jitter_ms: u64 = rng().random_range(0..=250);
                let delay = policy.delay_for(attempt) + Duration::from_millis(jitter_ms);
                warn!(
                    reason,
                    attempt,
                    max = policy.max_attempts,
                    elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
                    ?delay,
                    error = %e,
                    "attempt failed; backing off"
                );
                sleeper.sleep(reason, delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleep::testing::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try_without_sleeping() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let result: Result<u32, String> =
            with_backoff(&policy, &sleeper, "noop", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = with_backoff(&policy, &sleeper, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("boom".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        let sleeps = sleeper.sleeps();
        assert_eq!(sleeps.len(), 2);
        // 500ms then 1s, plus up to 250ms jitter each.
        assert!(sleeps[0].1 >= Duration::from_millis(500));
        assert!(sleeps[0].1 <= Duration::from_millis(750));
        assert!(sleeps[1].1 >= Duration::from_millis(1000));
        assert!(sleeps[1].1 <= Duration::from_millis(1250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = with_backoff(&policy, &sleeper, "doomed", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always".to_string()) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "always");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }
}
