use crate::models::QueueMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, warn};

/// Largest number of article ids one message may carry.
pub const MAX_BATCH_IDS: usize = 100;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message exceeds batch cap: {0} ids (max {MAX_BATCH_IDS})")]
    BatchTooLarge(usize),
}

/// One delivery of a message. The same message can be delivered more than
/// once; consumers must be idempotent.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: u64,
    pub attempts: u32,
    pub message: QueueMessage,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<u64, Delivery>,
    dead: Vec<Delivery>,
    next_id: u64,
}

/// In-process at-least-once queue between the source scrapers and the
/// enrichment dispatcher. Nacked messages are redelivered until the
/// delivery-attempt cap moves them to the dead-letter sink.
#[derive(Clone)]
pub struct ArticleQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    max_attempts: u32,
}

impl ArticleQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            max_attempts,
        }
    }

    /// Publish one message. The publisher is responsible for sub-batching;
    /// oversized messages are rejected.
    pub fn publish(&self, articles_id: Vec<i64>) -> Result<(), BusError> {
        if articles_id.len() > MAX_BATCH_IDS {
            return Err(BusError::BatchTooLarge(articles_id.len()));
        }
        {
            let mut inner = self.inner.lock().expect("bus mutex poisoned");
            inner.next_id += 1;
            let delivery = Delivery {
                delivery_id: inner.next_id,
                attempts: 1,
                message: QueueMessage { articles_id },
            };
            inner.ready.push_back(delivery);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for at least one message, then take up to `max`. Taken messages
    /// stay in flight until acked or nacked.
    pub async fn pull_batch(&self, max: usize) -> Vec<Delivery> {
        loop {
            let batch = self.try_pull_batch(max);
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pull_batch(&self, max: usize) -> Vec<Delivery> {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(delivery) = inner.ready.pop_front() else {
                break;
            };
            inner.in_flight.insert(delivery.delivery_id, delivery.clone());
            batch.push(delivery);
        }
        batch
    }

    /// Acknowledge deliveries; the queue forgets them.
    pub fn ack(&self, delivery_ids: &[u64]) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        for id in delivery_ids {
            inner.in_flight.remove(id);
        }
    }

    /// Negative-acknowledge deliveries: requeue with an incremented attempt
    /// count, or move to the dead-letter sink at the cap.
    pub fn nack(&self, delivery_ids: &[u64]) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        for id in delivery_ids {
            let Some(mut delivery) = inner.in_flight.remove(id) else {
                continue;
            };
            delivery.attempts += 1;
            if delivery.attempts > self.max_attempts {
                error!(
                    delivery_id = delivery.delivery_id,
                    attempts = delivery.attempts,
                    ids = delivery.message.articles_id.len(),
                    "delivery exhausted attempts; dead-lettering"
                );
                inner.dead.push(delivery);
            } else {
                warn!(
                    delivery_id = delivery.delivery_id,
                    attempts = delivery.attempts,
                    "requeueing nacked delivery"
                );
                inner.ready.push_back(delivery);
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("bus mutex poisoned").ready.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.lock().expect("bus mutex poisoned").dead.len()
    }

    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.inner
            .lock()
            .expect("bus mutex poisoned")
            .dead
            .iter()
            .map(|d| d.message.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_pull_ack() {
        let queue = ArticleQueue::new(3);
        queue.publish(vec![1, 2, 3]).unwrap();

        let batch = queue.pull_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.articles_id, vec![1, 2, 3]);
        assert_eq!(batch[0].attempts, 1);

        queue.ack(&[batch[0].delivery_id]);
        assert_eq!(queue.depth(), 0);
        assert!(queue.try_pull_batch(10).is_empty());
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_attempt_count() {
        let queue = ArticleQueue::new(3);
        queue.publish(vec![7]).unwrap();

        let first = queue.pull_batch(10).await;
        queue.nack(&[first[0].delivery_id]);

        let second = queue.pull_batch(10).await;
        assert_eq!(second[0].message.articles_id, vec![7]);
        assert_eq!(second[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_attempt_cap() {
        let queue = ArticleQueue::new(2);
        queue.publish(vec![9]).unwrap();

        for _ in 0..2 {
            let batch = queue.try_pull_batch(10);
            assert_eq!(batch.len(), 1);
            queue.nack(&[batch[0].delivery_id]);
        }

        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.dead_letter_count(), 1);
        assert_eq!(queue.dead_letters()[0].articles_id, vec![9]);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let queue = ArticleQueue::new(3);
        let ids: Vec<i64> = (0..=MAX_BATCH_IDS as i64).collect();
        assert!(matches!(
            queue.publish(ids),
            Err(BusError::BatchTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_batch_waits_for_publish() {
        let queue = ArticleQueue::new(3);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull_batch(10).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.publish(vec![4]).unwrap();

        let batch = consumer.await.unwrap();
        assert_eq!(batch[0].message.articles_id, vec![4]);
    }
}
