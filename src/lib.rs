// Spot Reviews - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod aggregate;      // Aggregate Maintainer - running count/mean per location
pub mod config;
pub mod db;
pub mod error;
pub mod places;         // Places lookup + haversine distance
pub mod review;         // Review Ingest
pub mod trigger;        // Review-created event channel

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use aggregate::{reconcile, AggregateMaintainer, ApplyOutcome, EntityAggregate};
pub use config::Config;
pub use db::{
    AggregateSnapshot, CommitOutcome, LocationRecord, ReconcileEntry, Review, Store, StoreStats,
};
pub use error::{IngestError, PlacesError, StoreError};
pub use places::{
    distance_between_meters, merge_unique, normalize_place_result, NearbyQuery, PlaceLocation,
    PlacesClient,
};
pub use review::{list_reviews, NewReview, ReviewIngest, ReviewPage, ReviewSubmission};
pub use trigger::{replay_unprocessed, run_consumer, ReviewCreated, TriggerQueue, TriggerReceiver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
