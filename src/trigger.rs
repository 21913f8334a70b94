// Review-created trigger: Ingest → Maintainer notification channel
//
// Fire-and-forget. There is no acknowledgement back to the submitter and an
// event may be delivered more than once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::aggregate::AggregateMaintainer;
use crate::db::{self, Review, Store};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCreated {
    pub review_id: String,
    pub location_id: Option<String>,
    pub rating: u8,
    pub created_at: DateTime<Utc>,
}

impl ReviewCreated {
    /// Target location, `None` when absent or empty
    pub fn location_id(&self) -> Option<&str> {
        self.location_id.as_deref().filter(|id| !id.is_empty())
    }
}

impl From<&Review> for ReviewCreated {
    fn from(review: &Review) -> Self {
        Self {
            review_id: review.id.clone(),
            location_id: Some(review.entity_id.clone()),
            rating: review.rating,
            created_at: review.created_at,
        }
    }
}

/// Publishing side, cheap to clone
#[derive(Clone)]
pub struct TriggerQueue {
    sender: mpsc::UnboundedSender<ReviewCreated>,
}

pub struct TriggerReceiver {
    receiver: mpsc::UnboundedReceiver<ReviewCreated>,
}

pub fn channel() -> (TriggerQueue, TriggerReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (TriggerQueue { sender }, TriggerReceiver { receiver })
}

impl TriggerQueue {
    /// Hand the event to the consumer. Never blocks and never fails the caller;
    /// a closed channel is only logged.
    pub fn publish(&self, event: ReviewCreated) {
        let review_id = event.review_id.clone();
        if self.sender.send(event).is_err() {
            warn!(%review_id, "trigger consumer is gone, review-created event dropped");
        }
    }
}

impl TriggerReceiver {
    pub async fn recv(&mut self) -> Option<ReviewCreated> {
        self.receiver.recv().await
    }
}

/// Republish ReviewCreated for every stored review that never reached an
/// aggregate, e.g. after a crash between persisting and consuming.
///
/// Runs at startup before the queue is shared. Already-counted reviews are
/// skipped by the maintainer, so over-publishing is harmless.
pub fn replay_unprocessed(store: &Store, queue: &TriggerQueue) -> Result<usize, StoreError> {
    let pending = store.with_conn(|conn| db::unprocessed_reviews(conn))?;

    for review in &pending {
        queue.publish(ReviewCreated::from(review));
    }

    if !pending.is_empty() {
        info!(count = pending.len(), "replaying review-created events for uncounted reviews");
    }

    Ok(pending.len())
}

/// Consume events until every `TriggerQueue` is dropped.
///
/// Each event runs in its own task, so updates for different locations (and
/// for the same one) proceed concurrently. Returns after in-flight updates finish.
pub async fn run_consumer(mut receiver: TriggerReceiver, maintainer: Arc<AggregateMaintainer>) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            maybe_event = receiver.recv() => match maybe_event {
                Some(event) => {
                    debug!(review_id = %event.review_id, "review-created event received");
                    let maintainer = maintainer.clone();
                    tasks.spawn(async move { maintainer.on_review_created(&event).await });
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "aggregate task panicked");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "aggregate task panicked");
        }
    }

    debug!("trigger consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::read_aggregate;
    use crate::review::{ReviewIngest, ReviewSubmission};

    fn event(review_id: &str, location_id: &str, rating: u8) -> ReviewCreated {
        ReviewCreated {
            review_id: review_id.to_string(),
            location_id: Some(location_id.to_string()),
            rating,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_consumer_applies_published_events() {
        let store = Store::open_in_memory().unwrap();
        let maintainer = Arc::new(AggregateMaintainer::new(store.clone()));
        let (queue, receiver) = channel();

        let consumer = tokio::spawn(run_consumer(receiver, maintainer));

        queue.publish(event("r1", "loc1", 5));
        queue.publish(event("r2", "loc1", 4));
        queue.publish(event("r3", "loc2", 1));
        // Redelivery of r1
        queue.publish(event("r1", "loc1", 5));
        drop(queue);

        consumer.await.unwrap();

        let loc1 = store.with_conn(|conn| read_aggregate(conn, "loc1")).unwrap();
        assert_eq!(loc1.aggregate.ratings_count, 2);
        assert!((loc1.aggregate.average_rating - 4.5).abs() < 1e-9);

        let loc2 = store.with_conn(|conn| read_aggregate(conn, "loc2")).unwrap();
        assert_eq!(loc2.aggregate.ratings_count, 1);
    }

    #[tokio::test]
    async fn test_restart_replays_reviews_never_counted() {
        let dir = std::env::temp_dir().join(format!("spot-reviews-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reviews.db");

        // First run: the review is persisted but the consumer is already gone
        {
            let store = Store::open(&path).unwrap();
            let (queue, receiver) = channel();
            drop(receiver);

            let ingest = ReviewIngest::new(store, queue);
            let submission = ReviewSubmission {
                location_id: Some("loc1".to_string()),
                rating: Some(serde_json::json!(4)),
                ..Default::default()
            };
            ingest.submit(submission).unwrap();
        }

        // Second run: startup replay feeds the new consumer
        let store = Store::open(&path).unwrap();
        let maintainer = Arc::new(AggregateMaintainer::new(store.clone()));
        let (queue, receiver) = channel();
        let consumer = tokio::spawn(run_consumer(receiver, maintainer));

        assert_eq!(replay_unprocessed(&store, &queue).unwrap(), 1);
        drop(queue);
        consumer.await.unwrap();

        let loc1 = store.with_conn(|conn| read_aggregate(conn, "loc1")).unwrap();
        assert_eq!(loc1.aggregate.ratings_count, 1);
        assert_eq!(loc1.aggregate.average_rating, 4.0);

        // Nothing left for the next restart
        let (queue, _receiver) = channel();
        assert_eq!(replay_unprocessed(&store, &queue).unwrap(), 0);

        drop(store);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_publish_after_consumer_dropped_does_not_fail() {
        let (queue, receiver) = channel();
        drop(receiver);

        // Logged and dropped
        queue.publish(event("r1", "loc1", 3));
    }

    #[test]
    fn test_empty_location_id_is_absent() {
        let mut created = event("r1", "", 3);
        assert_eq!(created.location_id(), None);

        created.location_id = None;
        assert_eq!(created.location_id(), None);

        created.location_id = Some("loc1".to_string());
        assert_eq!(created.location_id(), Some("loc1"));
    }
}
