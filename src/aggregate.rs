// ⭐ Aggregate Maintainer - running count + mean rating per location
//
// Invoked once per review-created event (possibly more than once, delivery is
// at-least-once). Each invocation is a read / compute / compare-and-swap
// cycle against the location row, retried on conflict.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::{self, AggregateSnapshot, CommitOutcome, ReconcileEntry, Store};
use crate::error::StoreError;
use crate::trigger::ReviewCreated;

/// Default number of read/commit attempts before an update is dropped
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the pause between attempts
const MAX_BACKOFF: Duration = Duration::from_millis(50);

// ============================================================================
// ENTITY AGGREGATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAggregate {
    pub ratings_count: u64,
    pub average_rating: f64,
}

impl EntityAggregate {
    /// Fold one more rating into the running mean
    pub fn with_rating(&self, rating: u8) -> EntityAggregate {
        let ratings_count = self.ratings_count + 1;
        let total = self.average_rating * self.ratings_count as f64 + f64::from(rating);

        EntityAggregate {
            ratings_count,
            average_rating: total / ratings_count as f64,
        }
    }

    pub fn approx_eq(&self, other: &EntityAggregate) -> bool {
        self.ratings_count == other.ratings_count
            && (self.average_rating - other.average_rating).abs() < 1e-9
    }
}

// ============================================================================
// MAINTAINER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Aggregate updated to this value
    Applied(EntityAggregate),

    /// Event was redelivered for a review already counted
    Duplicate,

    /// Event had no target location
    SkippedMissingEntity,

    /// Every attempt lost to a concurrent writer; update dropped
    Exhausted { attempts: u32 },
}

pub struct AggregateMaintainer {
    store: Store,
    max_attempts: u32,
    backoff: Duration,
}

impl AggregateMaintainer {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(2),
        }
    }

    /// At least one attempt is always made
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Base pause between attempts, grows linearly per attempt up to 50ms
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Trigger entry point. Nothing is returned to anyone: outcomes and
    /// failures are logged and otherwise dropped.
    pub async fn on_review_created(&self, event: &ReviewCreated) {
        match self.apply(event).await {
            Ok(ApplyOutcome::Applied(aggregate)) => {
                info!(
                    review_id = %event.review_id,
                    location_id = event.location_id().unwrap_or_default(),
                    ratings_count = aggregate.ratings_count,
                    average_rating = aggregate.average_rating,
                    "aggregate updated"
                );
            }
            Ok(ApplyOutcome::Duplicate) => {
                info!(review_id = %event.review_id, "review already counted, ignoring redelivery");
            }
            Ok(ApplyOutcome::SkippedMissingEntity) => {}
            Ok(ApplyOutcome::Exhausted { attempts }) => {
                error!(
                    review_id = %event.review_id,
                    attempts,
                    "aggregate update dropped after repeated transaction conflicts"
                );
            }
            Err(e) => {
                error!(review_id = %event.review_id, error = %e, "aggregate update failed");
            }
        }
    }

    /// Fold the event's rating into its location aggregate
    pub async fn apply(&self, event: &ReviewCreated) -> Result<ApplyOutcome, StoreError> {
        self.apply_with_reader(event, |conn: &mut Connection, location_id: &str| {
            db::read_aggregate(conn, location_id)
        })
        .await
    }

    /// Retry loop with the snapshot read pulled out, so the read/commit window
    /// can be interleaved with other writers.
    async fn apply_with_reader<F>(
        &self,
        event: &ReviewCreated,
        read: F,
    ) -> Result<ApplyOutcome, StoreError>
    where
        F: Fn(&mut Connection, &str) -> Result<AggregateSnapshot, StoreError>,
    {
        let Some(location_id) = event.location_id() else {
            warn!(review_id = %event.review_id, "Review without locationId");
            return Ok(ApplyOutcome::SkippedMissingEntity);
        };

        for attempt in 1..=self.max_attempts {
            let snapshot = self.store.with_conn(|conn| read(conn, location_id))?;
            let next = snapshot.aggregate.with_rating(event.rating);

            let outcome = self.store.with_conn(|conn| {
                db::commit_aggregate(conn, &event.review_id, location_id, snapshot.version, &next)
            })?;

            match outcome {
                CommitOutcome::Committed => return Ok(ApplyOutcome::Applied(next)),
                CommitOutcome::Duplicate => return Ok(ApplyOutcome::Duplicate),
                CommitOutcome::Conflict => {
                    debug!(
                        review_id = %event.review_id,
                        location_id,
                        attempt,
                        "aggregate version moved, retrying"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep((self.backoff * attempt).min(MAX_BACKOFF)).await;
                    }
                }
            }
        }

        Ok(ApplyOutcome::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

/// Recompute every aggregate from the stored reviews.
///
/// Repairs under-counts left by dropped updates or events without a target.
pub fn reconcile(store: &Store) -> Result<Vec<ReconcileEntry>, StoreError> {
    let drifted = store.with_conn(db::recompute_aggregates)?;

    for entry in &drifted {
        warn!(
            location_id = %entry.location_id,
            stored_count = entry.before.ratings_count,
            actual_count = entry.after.ratings_count,
            "aggregate drift corrected"
        );
    }

    Ok(drifted)
}
