use futures::future::BoxFuture;
use std::time::Duration;

/// Capability for suspending the current task.
///
/// Every long wait in the pipeline (rate-limit cooldowns, retry backoff,
/// strategy-fallback jitter, scheduler alarms) goes through this trait so a
/// durable orchestrator can checkpoint sleeps; under a plain runtime it is
/// just `tokio::time::sleep`.
pub trait Sleeper: Send + Sync {
    fn sleep<'a>(&'a self, reason: &'a str, duration: Duration) -> BoxFuture<'a, ()>;
}

/// Runtime implementation backed by the tokio clock. Honors cancellation:
/// dropping the future cancels the sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep<'a>(&'a self, reason: &'a str, duration: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::trace!(reason, ?duration, "sleeping");
            tokio::time::sleep(duration).await;
        })
    }
}
