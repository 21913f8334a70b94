// 🌐 HTTP API (axum)
//
// Review submission and listing, stored locations, nearby places.
// Handlers are thin: validation lives in `review`, storage in `db`.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::db::{self, LocationRecord, Review, Store};
use crate::error::{IngestError, PlacesError, StoreError};
use crate::places::{PlaceLocation, PlacesClient, DEFAULT_RADIUS_METERS};
use crate::review::{self, ReviewIngest, ReviewPage, ReviewSubmission, DEFAULT_PAGE_SIZE};
use crate::trigger::TriggerQueue;

/// Shared application state, built once by the server entry point
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub ingest: Arc<ReviewIngest>,
    pub places: Option<Arc<PlacesClient>>,
    pub places_radius: u32,
}

impl AppState {
    pub fn new(store: Store, trigger: TriggerQueue, places: Option<PlacesClient>) -> Self {
        Self {
            ingest: Arc::new(ReviewIngest::new(store.clone(), trigger)),
            store,
            places: places.map(Arc::new),
            places_radius: DEFAULT_RADIUS_METERS,
        }
    }

    pub fn with_places_radius(mut self, radius: u32) -> Self {
        self.places_radius = radius;
        self
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Every error is answered with a plain-text body
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Places lookup is not configured")]
    PlacesUnavailable,

    #[error("Places lookup failed")]
    Upstream(#[source] PlacesError),

    #[error("Internal Server Error")]
    Internal,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PlacesUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "storage error");
        AppError::Internal
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Store(e) => {
                error!(error = %e, "createReview error");
                AppError::Internal
            }
            client => AppError::BadRequest(client.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(format!("Malformed payload: {}", rejection.body_text()))
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/reviews",
            get(list_reviews)
                .post(create_review)
                .fallback(method_not_allowed),
        )
        .route("/createReview", any(create_review_endpoint))
        .route("/api/locations/:id", get(get_location))
        .route("/api/places/nearby", get(nearby_places))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /api/health
async fn health_check() -> &'static str {
    "OK"
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

/// POST /api/reviews - create a review, 201 with the stored record
async fn create_review(
    State(state): State<AppState>,
    payload: Result<Json<ReviewSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<Review>), AppError> {
    let Json(submission) = payload?;
    let review = state.ingest.submit(submission)?;

    Ok((StatusCode::CREATED, Json(review)))
}

/// ANY /createReview - same as POST /api/reviews, other methods get 405
async fn create_review_endpoint(
    method: Method,
    state: State<AppState>,
    payload: Result<Json<ReviewSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<Review>), AppError> {
    if method != Method::POST {
        return Err(AppError::MethodNotAllowed);
    }

    create_review(state, payload).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    location_id: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

/// GET /api/reviews?locationId=..&page=..&pageSize=..
async fn list_reviews(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ReviewPage>, AppError> {
    let location_id = params
        .location_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing locationId".to_string()))?;

    let page = review::list_reviews(
        &state.store,
        &location_id,
        params.page.unwrap_or(0),
        params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    )?;

    Ok(Json(page))
}

/// GET /api/locations/:id - stored location with its aggregate
async fn get_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LocationRecord>, AppError> {
    state
        .store
        .with_conn(|conn| db::get_location(conn, &id))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Location {id}")))
}

#[derive(Debug, Deserialize)]
struct NearbyParams {
    lat: f64,
    lng: f64,
    radius: Option<u32>,
}

/// Place search result annotated with our own aggregate
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyLocation {
    #[serde(flatten)]
    pub place: PlaceLocation,
    pub ratings_count: u64,
    pub average_rating: f64,
}

/// GET /api/places/nearby?lat=..&lng=..&radius=..
async fn nearby_places(
    State(state): State<AppState>,
    Query(params): Query<NearbyParams>,
) -> Result<Json<Vec<NearbyLocation>>, AppError> {
    let places = state.places.as_ref().ok_or(AppError::PlacesUnavailable)?;
    let radius = params.radius.unwrap_or(state.places_radius);

    let found = places
        .search_restrooms_and_pharmacies(params.lat, params.lng, radius)
        .await
        .map_err(|e| {
            warn!(error = %e, "nearby search failed");
            AppError::Upstream(e)
        })?;

    let annotated = state.store.with_conn(|conn| {
        let conn: &rusqlite::Connection = conn;
        found
            .into_iter()
            .map(|place| {
                db::upsert_location(conn, &place)?;
                let snapshot = db::read_aggregate(conn, &place.id)?;
                Ok(NearbyLocation {
                    place,
                    ratings_count: snapshot.aggregate.ratings_count,
                    average_rating: snapshot.aggregate.average_rating,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()
    })?;

    Ok(Json(annotated))
}
