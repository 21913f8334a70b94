// ✍️ Review Ingest - validate a submission, persist it, fire the trigger
//
// Ingest never touches the aggregate. Persisting the review and publishing
// ReviewCreated is all it does.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::db::{self, Review, Store};
use crate::error::{IngestError, StoreError};
use crate::trigger::{ReviewCreated, TriggerQueue};

/// Longest accepted review text, in characters
pub const MAX_TEXT_LENGTH: usize = 500;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// SUBMISSION
// ============================================================================

/// Raw submission body: `{locationId, rating, text?, userId?, userName?}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSubmission {
    #[serde(default)]
    pub location_id: Option<String>,

    /// Number or numeric string
    #[serde(default)]
    pub rating: Option<Value>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub user_name: Option<String>,
}

/// Submission that passed validation, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewReview {
    pub location_id: String,
    pub rating: u8,
    pub text: Option<String>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
}

impl ReviewSubmission {
    pub fn validate(self) -> Result<NewReview, IngestError> {
        let location_id = self
            .location_id
            .filter(|id| !id.is_empty())
            .ok_or(IngestError::MissingFields)?;

        let rating = match self.rating {
            None | Some(Value::Null) | Some(Value::Bool(false)) => {
                return Err(IngestError::MissingFields)
            }
            Some(Value::String(ref s)) if s.is_empty() => return Err(IngestError::MissingFields),
            Some(value) => coerce_rating(&value)?,
        };

        let text = non_empty(self.text);
        if let Some(text) = &text {
            if text.chars().count() > MAX_TEXT_LENGTH {
                return Err(IngestError::TextTooLong {
                    max: MAX_TEXT_LENGTH,
                });
            }
        }

        Ok(NewReview {
            location_id,
            rating,
            text,
            author_id: non_empty(self.user_id),
            author_name: non_empty(self.user_name),
        })
    }
}

impl NewReview {
    /// Assign the server-side id and creation timestamp
    pub fn into_review(self) -> Review {
        Review {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: self.location_id,
            rating: self.rating,
            text: self.text,
            author_id: self.author_id,
            author_name: self.author_name,
            created_at: Utc::now(),
        }
    }
}

/// Accepts JSON numbers and numeric strings. Zero, fractions and anything
/// outside 1..=5 are rejected.
fn coerce_rating(value: &Value) -> Result<u8, IngestError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or(IngestError::InvalidRating)?;

    if number.fract() != 0.0 || !(1.0..=5.0).contains(&number) {
        return Err(IngestError::InvalidRating);
    }

    Ok(number as u8)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// ============================================================================
// INGEST
// ============================================================================

pub struct ReviewIngest {
    store: Store,
    trigger: TriggerQueue,
}

impl ReviewIngest {
    pub fn new(store: Store, trigger: TriggerQueue) -> Self {
        Self { store, trigger }
    }

    /// Validate and durably append a review, then publish ReviewCreated.
    ///
    /// Nothing is persisted or published when validation fails. Storage
    /// failures are returned as-is, without retry.
    pub fn submit(&self, submission: ReviewSubmission) -> Result<Review, IngestError> {
        let review = submission.validate()?.into_review();

        self.store
            .with_conn(|conn| db::insert_review(conn, &review))?;

        info!(
            review_id = %review.id,
            location_id = %review.entity_id,
            rating = review.rating,
            "review created"
        );

        self.trigger.publish(ReviewCreated::from(&review));

        Ok(review)
    }
}

// ============================================================================
// LISTING
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ReviewPage {
    pub reviews: Vec<Review>,
    pub total: i64,
}

/// Newest-first page of reviews. `page` is 0-based; `page_size` is clamped
/// to 1..=100.
pub fn list_reviews(
    store: &Store,
    location_id: &str,
    page: u32,
    page_size: u32,
) -> Result<ReviewPage, StoreError> {
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

    store.with_conn(|conn| {
        Ok(ReviewPage {
            reviews: db::list_reviews(conn, location_id, page, page_size)?,
            total: db::count_reviews(conn, location_id)?,
        })
    })
}
