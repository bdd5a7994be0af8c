use crate::bus::{ArticleQueue, Delivery};
use crate::sleep::Sleeper;
use crate::worker::EnrichmentWorker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

/// How many bus messages one enrichment job may combine.
const PULL_BATCH_SIZE: usize = 16;
/// Redelivery delay after a job could not be started.
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Bridges bus messages to enrichment jobs.
///
/// A batch is acked as a whole once the job owns it; a batch whose job
/// could not start is nacked as a whole and retried after a delay. The bus
/// dead-letters messages that keep failing.
pub struct JobDispatcher {
    bus: ArticleQueue,
    worker: Arc<EnrichmentWorker>,
    sleeper: Arc<dyn Sleeper>,
}

impl JobDispatcher {
    pub fn new(bus: ArticleQueue, worker: Arc<EnrichmentWorker>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            bus,
            worker,
            sleeper,
        }
    }

    /// Consume the queue forever.
    pub async fn run(&self) {
        loop {
            let batch = self.bus.pull_batch(PULL_BATCH_SIZE).await;
            self.handle_batch(batch).await;
        }
    }

    /// Handle one pulled batch of deliveries.
    #[instrument(level = "info", skip_all, fields(deliveries = batch.len()))]
    pub async fn handle_batch(&self, batch: Vec<Delivery>) {
        if batch.is_empty() {
            return;
        }
        let delivery_ids: Vec<u64> = batch.iter().map(|d| d.delivery_id).collect();

        // Combine every message's ids into one job, dropping duplicates
        // that at-least-once delivery can produce.
        let mut seen = std::collections::HashSet::new();
        let ids: Vec<i64> = batch
            .iter()
            .flat_map(|d| d.message.articles_id.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect();

        if ids.is_empty() {
            self.bus.ack(&delivery_ids);
            return;
        }

        match self.worker.process(ids).await {
            Ok(summary) => {
                info!(
                    selected = summary.selected,
                    processed = summary.processed,
                    "enrichment job finished; acking batch"
                );
                self.bus.ack(&delivery_ids);
            }
            Err(e) => {
                error!(error = %e, "enrichment job could not run; nacking batch");
                self.bus.nack(&delivery_ids);
                self.sleeper.sleep("dispatcher retry", RETRY_DELAY).await;
            }
        }
    }
}
