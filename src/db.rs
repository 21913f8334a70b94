// 🗄️ Storage - reviews, locations and the per-location rating aggregate
//
// Reviews are append-only. The aggregate columns on `locations` are only
// written through `commit_aggregate`, a compare-and-swap on `version`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::aggregate::EntityAggregate;
use crate::error::StoreError;
use crate::places::PlaceLocation;

// ============================================================================
// STORE HANDLE
// ============================================================================

/// Shared handle to the database, constructed once by the process entry point
/// and cloned into every component that needs storage.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) a database file in WAL mode and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Fresh in-memory database with the schema applied
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Keep closures short: the lock is held for the whole call.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Immutable review record. Serialized with the wire names the web client uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,

    /// Target entity (location) id
    #[serde(rename = "locationId")]
    pub entity_id: String,

    /// Star rating, 1..=5
    pub rating: u8,

    pub text: Option<String>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Stored location: cached place fields plus the rating aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub id: String,
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub types: Vec<String>,

    /// Rating reported by the places provider (not ours)
    pub rating: Option<f64>,
    pub user_ratings_total: Option<u64>,

    pub ratings_count: u64,
    pub average_rating: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LocationRecord {
    pub fn aggregate(&self) -> EntityAggregate {
        EntityAggregate {
            ratings_count: self.ratings_count,
            average_rating: self.average_rating,
        }
    }
}

/// Aggregate as read at a given optimistic-concurrency version.
/// A location with no row yet reads as version 0 with an empty aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSnapshot {
    pub aggregate: EntityAggregate,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Aggregate written and review marked processed
    Committed,

    /// Another writer committed since the snapshot was read; nothing written
    Conflict,

    /// Review was already folded into the aggregate; nothing written
    Duplicate,
}

/// Aggregate that reconciliation had to correct
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileEntry {
    pub location_id: String,
    pub before: EntityAggregate,
    pub after: EntityAggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub reviews: i64,
    pub locations: i64,
    pub processed_reviews: i64,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Reviews (append-only, never updated)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS reviews (
            id TEXT PRIMARY KEY,
            location_id TEXT NOT NULL,
            rating INTEGER NOT NULL,
            text TEXT,
            author_id TEXT,
            author_name TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Locations: place fields are merged by upsert_location, aggregate
    // columns only change through commit_aggregate / recompute_aggregates
    conn.execute(
        "CREATE TABLE IF NOT EXISTS locations (
            id TEXT PRIMARY KEY,
            place_id TEXT,
            name TEXT,
            address TEXT,
            lat REAL,
            lng REAL,
            types TEXT,
            rating REAL,
            user_ratings_total INTEGER,
            ratings_count INTEGER NOT NULL DEFAULT 0,
            average_rating REAL NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;

    // Idempotency guard for redelivered review-created events
    conn.execute(
        "CREATE TABLE IF NOT EXISTS processed_reviews (
            review_id TEXT PRIMARY KEY,
            location_id TEXT NOT NULL,
            processed_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reviews_location ON reviews(location_id, created_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// REVIEWS
// ============================================================================

pub fn insert_review(conn: &Connection, review: &Review) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO reviews (id, location_id, rating, text, author_id, author_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            review.id,
            review.entity_id,
            review.rating,
            review.text,
            review.author_id,
            review.author_name,
            format_timestamp(&review.created_at),
        ],
    )?;

    Ok(())
}

pub fn get_review(conn: &Connection, id: &str) -> Result<Option<Review>, StoreError> {
    let review = conn
        .query_row(
            "SELECT id, location_id, rating, text, author_id, author_name, created_at
             FROM reviews WHERE id = ?1",
            [id],
            review_from_row,
        )
        .optional()?;

    Ok(review)
}

/// One page of reviews for a location, newest first. `page` is 0-based.
pub fn list_reviews(
    conn: &Connection,
    location_id: &str,
    page: u32,
    page_size: u32,
) -> Result<Vec<Review>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, location_id, rating, text, author_id, author_name, created_at
         FROM reviews
         WHERE location_id = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2 OFFSET ?3",
    )?;

    let offset = i64::from(page) * i64::from(page_size);
    let reviews = stmt
        .query_map(params![location_id, page_size, offset], review_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(reviews)
}

pub fn count_reviews(conn: &Connection, location_id: &str) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM reviews WHERE location_id = ?1",
        [location_id],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// Reviews whose rating has not reached an aggregate yet, oldest first
pub fn unprocessed_reviews(conn: &Connection) -> Result<Vec<Review>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.location_id, r.rating, r.text, r.author_id, r.author_name, r.created_at
         FROM reviews r
         LEFT JOIN processed_reviews p ON p.review_id = r.id
         WHERE p.review_id IS NULL
         ORDER BY r.created_at ASC, r.rowid ASC",
    )?;

    let reviews = stmt
        .query_map([], review_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(reviews)
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        rating: row.get(2)?,
        text: row.get(3)?,
        author_id: row.get(4)?,
        author_name: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

// ============================================================================
// LOCATIONS
// ============================================================================

/// Merge a place into `locations`. Aggregate columns are left untouched.
pub fn upsert_location(conn: &Connection, place: &PlaceLocation) -> Result<(), StoreError> {
    let types_json = serde_json::to_string(&place.types)?;

    conn.execute(
        "INSERT INTO locations (
            id, place_id, name, address, lat, lng, types, rating, user_ratings_total, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            place_id = excluded.place_id,
            name = excluded.name,
            address = excluded.address,
            lat = excluded.lat,
            lng = excluded.lng,
            types = excluded.types,
            rating = excluded.rating,
            user_ratings_total = excluded.user_ratings_total,
            updated_at = excluded.updated_at",
        params![
            place.id,
            place.place_id,
            place.name,
            place.address,
            place.lat,
            place.lng,
            types_json,
            place.rating,
            place.user_ratings_total.map(|total| total as i64),
            format_timestamp(&Utc::now()),
        ],
    )?;

    Ok(())
}

pub fn get_location(conn: &Connection, id: &str) -> Result<Option<LocationRecord>, StoreError> {
    let location = conn
        .query_row(
            "SELECT id, place_id, name, address, lat, lng, types, rating, user_ratings_total,
                    ratings_count, average_rating, updated_at
             FROM locations WHERE id = ?1",
            [id],
            |row| {
                let types_json: Option<String> = row.get(6)?;
                let types = match types_json {
                    Some(json) => serde_json::from_str(&json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e))
                    })?,
                    None => Vec::new(),
                };
                let user_ratings_total: Option<i64> = row.get(8)?;
                let updated_at: Option<String> = row.get(11)?;

                Ok(LocationRecord {
                    id: row.get(0)?,
                    place_id: row.get(1)?,
                    name: row.get(2)?,
                    address: row.get(3)?,
                    lat: row.get(4)?,
                    lng: row.get(5)?,
                    types,
                    rating: row.get(7)?,
                    user_ratings_total: user_ratings_total.map(|total| total.max(0) as u64),
                    ratings_count: count_column(row, 9)?,
                    average_rating: row.get(10)?,
                    updated_at: updated_at
                        .map(|s| parse_timestamp(&s, 11))
                        .transpose()?,
                })
            },
        )
        .optional()?;

    Ok(location)
}

/// Load location seeds from a CSV file with headers
/// `id,place_id,name,address,lat,lng,types` (types separated by `;`).
pub fn load_locations_csv(csv_path: &Path) -> Result<Vec<PlaceLocation>, StoreError> {
    #[derive(Deserialize)]
    struct LocationRow {
        id: String,
        #[serde(default)]
        place_id: Option<String>,
        name: String,
        #[serde(default)]
        address: Option<String>,
        lat: f64,
        lng: f64,
        #[serde(default)]
        types: Option<String>,
    }

    let mut rdr = csv::Reader::from_path(csv_path)?;
    let mut places = Vec::new();

    for result in rdr.deserialize() {
        let row: LocationRow = result?;
        let types = row
            .types
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();

        places.push(PlaceLocation {
            place_id: Some(row.place_id.filter(|p| !p.is_empty()).unwrap_or_else(|| row.id.clone())),
            id: row.id,
            name: row.name,
            address: row.address.filter(|a| !a.is_empty()),
            lat: row.lat,
            lng: row.lng,
            types,
            rating: None,
            user_ratings_total: None,
            vicinity: None,
            distance_meters: None,
        });
    }

    Ok(places)
}

// ============================================================================
// AGGREGATE (optimistic concurrency)
// ============================================================================

pub fn read_aggregate(conn: &Connection, location_id: &str) -> Result<AggregateSnapshot, StoreError> {
    let snapshot = conn
        .query_row(
            "SELECT ratings_count, average_rating, version FROM locations WHERE id = ?1",
            [location_id],
            |row| {
                Ok(AggregateSnapshot {
                    aggregate: EntityAggregate {
                        ratings_count: count_column(row, 0)?,
                        average_rating: row.get(1)?,
                    },
                    version: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(snapshot.unwrap_or(AggregateSnapshot {
        aggregate: EntityAggregate::default(),
        version: 0,
    }))
}

/// Write `next` for `location_id` if the row is still at `expected_version`,
/// and record `review_id` as processed in the same transaction.
///
/// Only the aggregate columns are written; place fields are preserved.
pub fn commit_aggregate(
    conn: &mut Connection,
    review_id: &str,
    location_id: &str,
    expected_version: i64,
    next: &EntityAggregate,
) -> Result<CommitOutcome, StoreError> {
    let tx = conn.transaction()?;

    let already_processed: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM processed_reviews WHERE review_id = ?1)",
        [review_id],
        |row| row.get(0),
    )?;
    if already_processed {
        return Ok(CommitOutcome::Duplicate);
    }

    let now = format_timestamp(&Utc::now());
    let changed = tx.execute(
        "INSERT INTO locations (id, ratings_count, average_rating, version, updated_at)
         VALUES (?1, ?2, ?3, ?4 + 1, ?5)
         ON CONFLICT(id) DO UPDATE SET
            ratings_count = excluded.ratings_count,
            average_rating = excluded.average_rating,
            version = locations.version + 1,
            updated_at = excluded.updated_at
         WHERE locations.version = ?4",
        params![
            location_id,
            next.ratings_count as i64,
            next.average_rating,
            expected_version,
            now,
        ],
    )?;
    if changed == 0 {
        return Ok(CommitOutcome::Conflict);
    }

    tx.execute(
        "INSERT INTO processed_reviews (review_id, location_id, processed_at) VALUES (?1, ?2, ?3)",
        params![review_id, location_id, now],
    )?;

    tx.commit()?;
    Ok(CommitOutcome::Committed)
}

/// Rebuild every aggregate from the review log and mark all reviews processed.
/// Returns the locations whose stored aggregate had drifted.
pub fn recompute_aggregates(conn: &mut Connection) -> Result<Vec<ReconcileEntry>, StoreError> {
    let tx = conn.transaction()?;

    let rows = {
        let mut stmt = tx.prepare(
            "SELECT r.location_id, COUNT(*), AVG(r.rating),
                    COALESCE(l.ratings_count, 0), COALESCE(l.average_rating, 0)
             FROM reviews r
             LEFT JOIN locations l ON l.id = r.location_id
             GROUP BY r.location_id
             ORDER BY r.location_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ReconcileEntry {
                    location_id: row.get(0)?,
                    after: EntityAggregate {
                        ratings_count: count_column(row, 1)?,
                        average_rating: row.get(2)?,
                    },
                    before: EntityAggregate {
                        ratings_count: count_column(row, 3)?,
                        average_rating: row.get(4)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let now = format_timestamp(&Utc::now());
    let mut drifted = Vec::new();

    for entry in rows {
        if entry.before.approx_eq(&entry.after) {
            continue;
        }

        tx.execute(
            "INSERT INTO locations (id, ratings_count, average_rating, version, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(id) DO UPDATE SET
                ratings_count = excluded.ratings_count,
                average_rating = excluded.average_rating,
                version = locations.version + 1,
                updated_at = excluded.updated_at",
            params![
                entry.location_id,
                entry.after.ratings_count as i64,
                entry.after.average_rating,
                now,
            ],
        )?;
        drifted.push(entry);
    }

    tx.execute(
        "INSERT OR IGNORE INTO processed_reviews (review_id, location_id, processed_at)
         SELECT id, location_id, ?1 FROM reviews",
        params![now],
    )?;

    tx.commit()?;
    Ok(drifted)
}

pub fn store_stats(conn: &Connection) -> Result<StoreStats, StoreError> {
    let count = |table: &str| -> Result<i64, StoreError> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    };

    Ok(StoreStats {
        reviews: count("reviews")?,
        locations: count("locations")?,
        processed_reviews: count("processed_reviews")?,
    })
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value, idx)
}

fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    Ok(value.max(0) as u64)
}
