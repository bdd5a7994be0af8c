use crate::sleep::Sleeper;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Knobs for one batch run.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_concurrent: usize,
    pub global_cooldown: Duration,
    pub domain_cooldown: Duration,
}

/// One unit of work: an id plus the URL whose host is rate-limited.
#[derive(Debug, Clone)]
pub struct RateItem {
    pub id: i64,
    pub url: String,
}

/// Per-host politeness scheduler.
///
/// Not shareable across unrelated batches: the host map is mutated only by
/// the task running `process_batch`.
#[derive(Debug)]
pub struct DomainRateLimiter {
    config: RateLimitConfig,
    last_access: HashMap<String, Instant>,
}

/// Floor for the starvation sleep when no item is ready.
const MIN_IDLE_SLEEP: Duration = Duration::from_millis(500);

impl DomainRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_access: HashMap::new(),
        }
    }

    /// Run `work(item, host)` over the batch, at most `max_concurrent` at a
    /// time and never touching the same host within `domain_cooldown`.
    ///
    /// Items with unparseable URLs are dropped silently. Rejected work is
    /// discarded; fulfilled results are returned in completion order. Every
    /// wait goes through `sleeper`.
    pub async fn process_batch<T, E, W, Fut>(
        &mut self,
        items: Vec<RateItem>,
        sleeper: &dyn Sleeper,
        work: W,
    ) -> Vec<T>
    where
        W: Fn(RateItem, String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut pending: Vec<(RateItem, String)> = items
            .into_iter()
            .filter_map(|item| match Url::parse(&item.url).ok().and_then(|u| {
                u.host_str().map(|h| h.to_string())
            }) {
                Some(host) => Some((item, host)),
                None => {
                    debug!(id = item.id, url = %item.url, "dropping item with invalid URL");
                    None
                }
            })
            .collect();

        let mut results = Vec::new();

        while !pending.is_empty() {
            let now = Instant::now();
            let mut selected: Vec<(RateItem, String)> = Vec::new();
            let mut rest: Vec<(RateItem, String)> = Vec::new();

            for (item, host) in pending.drain(..) {
                let ready = self
                    .last_access
                    .get(&host)
                    .is_none_or(|last| now.duration_since(*last) >= self.config.domain_cooldown);
                if selected.len() < self.config.max_concurrent && ready {
                    self.last_access.insert(host.clone(), now);
                    selected.push((item, host));
                } else {
                    rest.push((item, host));
                }
            }
            pending = rest;

            if selected.is_empty() {
                let wait = self.min_remaining_cooldown(&pending, now);
                sleeper.sleep("domain cooldown", wait.max(MIN_IDLE_SLEEP)).await;
                continue;
            }

            let mut in_flight: FuturesUnordered<_> = selected
                .into_iter()
                .map(|(item, host)| work(item, host))
                .collect();
            while let Some(outcome) = in_flight.next().await {
                if let Ok(value) = outcome {
                    results.push(value);
                }
            }

            if !pending.is_empty() {
                sleeper
                    .sleep("global cooldown", self.config.global_cooldown)
                    .await;
            }
        }

        results
    }

    /// Smallest positive remaining cooldown across the hosts still queued.
    fn min_remaining_cooldown(&self, pending: &[(RateItem, String)], now: Instant) -> Duration {
        pending
            .iter()
            .filter_map(|(_, host)| {
                let last = self.last_access.get(host)?;
                self.config
                    .domain_cooldown
                    .checked_sub(now.duration_since(*last))
            })
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(MIN_IDLE_SLEEP)
    }
}
