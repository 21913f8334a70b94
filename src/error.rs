// Error taxonomy for the review pipeline
//
// Client input errors surface as 4xx, storage errors as 5xx.
// Trigger-side errors never reach a caller; the maintainer logs them.

use thiserror::Error;

/// Failures from the SQLite-backed store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Rejections and failures from Review Ingest
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Missing required fields")]
    MissingFields,

    #[error("Rating must be an integer between 1 and 5")]
    InvalidRating,

    #[error("Comment must be at most {max} characters")]
    TextTooLong { max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// True for errors caused by the submitted payload (4xx class)
    pub fn is_client_error(&self) -> bool {
        !matches!(self, IngestError::Store(_))
    }
}

/// Failures from the places lookup collaborator
#[derive(Error, Debug)]
pub enum PlacesError {
    #[error("places API key is not configured")]
    MissingApiKey,

    #[error("Places API HTTP error {0}")]
    Status(u16),

    #[error("places request failed: {0}")]
    Http(#[from] reqwest::Error),
}
