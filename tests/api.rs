//! Router tests for review submission, listing and location lookup.

#![cfg(feature = "server")]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use spot_reviews::api::{router, AppState};
use spot_reviews::{db, trigger, AggregateMaintainer, Store, TriggerReceiver};

fn test_app() -> (Router, Store, TriggerReceiver) {
    let store = Store::open_in_memory().unwrap();
    let (queue, receiver) = trigger::channel();
    let app = router(AppState::new(store.clone(), queue, None));
    (app, store, receiver)
}

/// Sends a request; JSON bodies are parsed, anything else comes back as a string
async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value), String> {
    let builder = Request::builder().method(method).uri(uri);

    let req = match body {
        Some(payload) => {
            let bytes =
                serde_json::to_vec(&payload).map_err(|err| format!("serialize body: {err}"))?;
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(bytes))
        }
        None => builder.body(Body::empty()),
    }
    .map_err(|err| format!("build request: {err}"))?;

    let response = app
        .clone()
        .oneshot(req)
        .await
        .map_err(|err| format!("route request: {err}"))?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .map_err(|err| format!("read body: {err}"))?;

    let parsed = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    Ok((status, parsed))
}

fn review_count(store: &Store) -> i64 {
    store.with_conn(|conn| db::store_stats(conn)).unwrap().reviews
}

#[tokio::test]
async fn create_review_echoes_fields_with_generated_id() -> Result<(), String> {
    let (app, store, _receiver) = test_app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/reviews",
        Some(json!({
            "locationId": "loc1",
            "rating": 4,
            "text": "Helpful place",
            "userId": "u1",
            "userName": "Tester"
        })),
    )
    .await?;

    assert_eq!(status, StatusCode::CREATED);
    assert!(!body["id"].as_str().unwrap_or_default().is_empty());
    assert_eq!(body["locationId"], "loc1");
    assert_eq!(body["rating"], 4);
    assert_eq!(body["text"], "Helpful place");
    assert_eq!(body["authorId"], "u1");
    assert_eq!(body["authorName"], "Tester");
    assert!(body["createdAt"].is_string());
    assert_eq!(review_count(&store), 1);
    Ok(())
}

#[tokio::test]
async fn optional_fields_default_to_null() -> Result<(), String> {
    let (app, _store, _receiver) = test_app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/reviews",
        Some(json!({ "locationId": "loc1", "rating": "5" })),
    )
    .await?;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["rating"], 5);
    assert!(body["text"].is_null());
    assert!(body["authorId"].is_null());
    assert!(body["authorName"].is_null());
    Ok(())
}

#[tokio::test]
async fn missing_fields_are_rejected_without_persisting() -> Result<(), String> {
    let (app, store, _receiver) = test_app();

    for payload in [
        json!({ "rating": 3 }),
        json!({ "locationId": "loc1" }),
        json!({ "locationId": "", "rating": 3 }),
    ] {
        let (status, body) = send(&app, Method::POST, "/api/reviews", Some(payload)).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing required fields");
    }

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/reviews",
        Some(json!({ "locationId": "loc1", "rating": 0 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Rating must be an integer between 1 and 5");

    assert_eq!(review_count(&store), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() -> Result<(), String> {
    let (app, store, _receiver) = test_app();

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/reviews")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .map_err(|err| format!("build request: {err}"))?;
    let response = app
        .clone()
        .oneshot(req)
        .await
        .map_err(|err| format!("route request: {err}"))?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(review_count(&store), 0);
    Ok(())
}

#[tokio::test]
async fn non_post_submission_is_method_not_allowed() -> Result<(), String> {
    let (app, store, _receiver) = test_app();
    let payload = json!({ "locationId": "loc1", "rating": 4 });

    for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
        let (status, body) =
            send(&app, method.clone(), "/createReview", Some(payload.clone())).await?;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{method} /createReview");
        assert_eq!(body, "Method Not Allowed");
    }

    for method in [Method::PUT, Method::DELETE] {
        let (status, _) = send(&app, method.clone(), "/api/reviews", Some(payload.clone())).await?;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{method} /api/reviews");
    }

    assert_eq!(review_count(&store), 0);

    let (status, _) = send(&app, Method::POST, "/createReview", Some(payload)).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(review_count(&store), 1);
    Ok(())
}

#[tokio::test]
async fn storage_failure_is_internal_server_error() -> Result<(), String> {
    let (app, store, _receiver) = test_app();
    store
        .with_conn(|conn| {
            conn.execute("DROP TABLE reviews", [])?;
            Ok(())
        })
        .map_err(|err| format!("drop table: {err}"))?;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/reviews",
        Some(json!({ "locationId": "loc1", "rating": 4 })),
    )
    .await?;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Internal Server Error");
    Ok(())
}

#[tokio::test]
async fn list_reviews_pages_newest_first() -> Result<(), String> {
    let (app, _store, _receiver) = test_app();

    for rating in 1..=3 {
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/reviews",
            Some(json!({ "locationId": "loc1", "rating": rating })),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/reviews?locationId=loc1&page=0&pageSize=2",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    let reviews = body["reviews"].as_array().cloned().unwrap_or_default();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0]["rating"], 3);

    let (_, body) = send(
        &app,
        Method::GET,
        "/api/reviews?locationId=loc1&page=1&pageSize=2",
        None,
    )
    .await?;
    assert_eq!(body["reviews"].as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app, Method::GET, "/api/reviews", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn submitted_reviews_reach_the_location_aggregate() -> Result<(), String> {
    let (app, store, receiver) = test_app();
    let maintainer = Arc::new(AggregateMaintainer::new(store.clone()));
    let consumer = tokio::spawn(trigger::run_consumer(receiver, maintainer));

    for rating in [5, 4, 3, 4] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/reviews",
            Some(json!({ "locationId": "place_1", "rating": rating })),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
    }

    // Dropping the router closes the trigger queue; the consumer drains and exits
    let reader = router(AppState::new(store.clone(), trigger::channel().0, None));
    drop(app);
    consumer.await.map_err(|err| format!("consumer: {err}"))?;

    let (status, body) = send(&reader, Method::GET, "/api/locations/place_1", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ratingsCount"], 4);
    assert_eq!(body["averageRating"], 4.0);

    let (status, _) = send(&reader, Method::GET, "/api/locations/unknown", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn nearby_search_without_api_key_is_unavailable() -> Result<(), String> {
    let (app, _store, _receiver) = test_app();

    let (status, _) = send(
        &app,
        Method::GET,
        "/api/places/nearby?lat=37.77&lng=-122.41",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
