// 📍 Places lookup - nearby restrooms and pharmacies
//
// Thin client over the Google Places Nearby Search endpoint. Raw results are
// normalized into PlaceLocation records with a great-circle distance from
// the search point.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::PlacesError;

pub const NEARBY_SEARCH_URL: &str = "https://maps.googleapis.com/maps/api/place/nearbysearch/json";

pub const DEFAULT_RADIUS_METERS: u32 = 1500;

/// Mean Earth radius used by the haversine formula
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

// ============================================================================
// NORMALIZED LOCATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceLocation {
    pub id: String,
    pub place_id: Option<String>,
    pub name: String,
    pub address: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub types: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ratings_total: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vicinity: Option<String>,

    /// Distance from the search point, whole meters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<u64>,
}

/// Haversine distance in meters, rounded to the nearest meter
pub fn distance_between_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> u64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    (EARTH_RADIUS_METERS * c).round() as u64
}

/// Normalize one raw Nearby Search result.
///
/// Missing ids fall back to a fresh UUID, a missing name to "Unknown" and
/// missing coordinates to 0. Distance is filled in when `reference` is given.
pub fn normalize_place_result(raw: &Value, reference: Option<(f64, f64)>) -> PlaceLocation {
    let place_id = non_empty_str(raw, "place_id")
        .or_else(|| non_empty_str(raw, "id"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let geometry = &raw["geometry"];
    let coordinate = |axis: &str| {
        geometry["location"][axis]
            .as_f64()
            .or_else(|| geometry[axis].as_f64())
            .unwrap_or(0.0)
    };
    let lat = coordinate("lat");
    let lng = coordinate("lng");

    let types = raw["types"]
        .as_array()
        .map(|types| {
            types
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let vicinity = non_empty_str(raw, "vicinity");

    PlaceLocation {
        id: place_id.clone(),
        place_id: Some(place_id),
        name: non_empty_str(raw, "name").unwrap_or_else(|| "Unknown".to_string()),
        address: vicinity
            .clone()
            .or_else(|| non_empty_str(raw, "formatted_address")),
        lat,
        lng,
        types,
        rating: raw["rating"].as_f64(),
        user_ratings_total: raw["user_ratings_total"].as_u64(),
        vicinity,
        distance_meters: reference
            .map(|(ref_lat, ref_lng)| distance_between_meters(ref_lat, ref_lng, lat, lng)),
    }
}

/// Deduplicate by place id (later entries win) and sort nearest first.
/// Entries without a distance sort as distance 0.
pub fn merge_unique(locations: impl IntoIterator<Item = PlaceLocation>) -> Vec<PlaceLocation> {
    let mut merged: Vec<PlaceLocation> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for location in locations {
        let key = location.place_id.clone().unwrap_or_else(|| location.id.clone());
        match positions.get(&key) {
            Some(&idx) => merged[idx] = location,
            None => {
                positions.insert(key, merged.len());
                merged.push(location);
            }
        }
    }

    merged.sort_by_key(|location| location.distance_meters.unwrap_or(0));
    merged
}

fn non_empty_str(raw: &Value, key: &str) -> Option<String> {
    raw[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: u32,
    pub keyword: Option<String>,
    pub place_type: Option<String>,
}

impl NearbyQuery {
    pub fn new(lat: f64, lng: f64, radius_meters: u32) -> Self {
        Self {
            lat,
            lng,
            radius_meters,
            keyword: None,
            place_type: None,
        }
    }

    pub fn keyword(mut self, keyword: &str) -> Self {
        self.keyword = Some(keyword.to_string());
        self
    }

    pub fn place_type(mut self, place_type: &str) -> Self {
        self.place_type = Some(place_type.to_string());
        self
    }
}

pub struct PlacesClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PlacesClient {
    pub fn new(api_key: &str) -> Result<Self, PlacesError> {
        Self::with_base_url(api_key, NEARBY_SEARCH_URL)
    }

    /// Client pointed at another Nearby Search compatible endpoint
    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, PlacesError> {
        if api_key.is_empty() {
            return Err(PlacesError::MissingApiKey);
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Raw Nearby Search JSON
    pub async fn search_nearby_raw(&self, query: &NearbyQuery) -> Result<Value, PlacesError> {
        let mut params = vec![
            ("location", format!("{},{}", query.lat, query.lng)),
            ("radius", query.radius_meters.to_string()),
        ];
        if let Some(keyword) = &query.keyword {
            params.push(("keyword", keyword.clone()));
        }
        if let Some(place_type) = &query.place_type {
            params.push(("type", place_type.clone()));
        }
        params.push(("key", self.api_key.clone()));

        let response = self.client.get(&self.base_url).query(&params).send().await?;

        if !response.status().is_success() {
            return Err(PlacesError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }

    /// Normalized results, with distances from the query point
    pub async fn search_nearby(&self, query: &NearbyQuery) -> Result<Vec<PlaceLocation>, PlacesError> {
        let json = self.search_nearby_raw(query).await?;
        let results = json["results"].as_array().cloned().unwrap_or_default();

        debug!(
            keyword = query.keyword.as_deref().unwrap_or_default(),
            count = results.len(),
            "nearby search returned"
        );

        Ok(results
            .iter()
            .map(|raw| normalize_place_result(raw, Some((query.lat, query.lng))))
            .collect())
    }

    /// Restrooms and pharmacies around a point, deduplicated, nearest first
    pub async fn search_restrooms_and_pharmacies(
        &self,
        lat: f64,
        lng: f64,
        radius_meters: u32,
    ) -> Result<Vec<PlaceLocation>, PlacesError> {
        let restrooms_query = NearbyQuery::new(lat, lng, radius_meters).keyword("restroom");
        let pharmacies_query = NearbyQuery::new(lat, lng, radius_meters)
            .keyword("pharmacy")
            .place_type("pharmacy");

        let (restrooms, pharmacies) = tokio::try_join!(
            self.search_nearby(&restrooms_query),
            self.search_nearby(&pharmacies_query)
        )?;

        Ok(merge_unique(restrooms.into_iter().chain(pharmacies)))
    }
}
