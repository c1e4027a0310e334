use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{
        Method, Request, StatusCode,
        header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH},
    },
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use trefa::application::backend::InventoryBackend;
use trefa::application::inventory::InventoryService;
use trefa::cache::{CacheConfig, CacheStore};
use trefa::config::{AdminSettings, DeployEnvironment};
use trefa::domain::error::FetchError;
use trefa::domain::vehicles::{ScalarQuery, VehicleFilters, VehiclePage};
use trefa::infra::http::{AdminGuard, RouterState, X_REQUEST_ID, build_router};

const SECRET: &str = "webhook-secret";

#[derive(Default)]
struct FakeInventory {
    row_calls: AtomicUsize,
    scalar_calls: AtomicUsize,
    fail_rows: bool,
}

#[async_trait]
impl InventoryBackend for FakeInventory {
    async fn fetch_rows(
        &self,
        filters: &VehicleFilters,
        page: u32,
    ) -> Result<VehiclePage, FetchError> {
        self.row_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_rows {
            return Err(FetchError::unavailable("connection refused"));
        }
        let vehicles = filters
            .marca
            .iter()
            .map(|marca| json!({ "marca": marca, "page": page }))
            .collect();
        Ok(VehiclePage {
            vehicles,
            total_count: 42,
        })
    }

    async fn fetch_scalar(&self, query: &ScalarQuery) -> Result<Value, FetchError> {
        self.scalar_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match query {
            ScalarQuery::FilterOptions => json!({ "marcas": ["Kia", "Toyota"] }),
            ScalarQuery::VehicleBySlug(slug) if slug == "vendido" => Value::Null,
            ScalarQuery::VehicleBySlug(slug) => json!({ "slug": slug, "precio": 250000 }),
            ScalarQuery::AllSlugs => json!([{ "slug": "kia-rio-2020" }, { "slug": "jetta-2019" }]),
        })
    }
}

fn app_with(backend: Arc<FakeInventory>, admin: AdminSettings) -> Router {
    let config = CacheConfig::default();
    let store = Arc::new(CacheStore::new(
        NonZeroUsize::new(100).expect("non-zero capacity"),
    ));
    let inventory = Arc::new(InventoryService::new(backend, store, config));
    build_router(RouterState::new(inventory, AdminGuard::from_settings(&admin)))
}

fn production_admin() -> AdminSettings {
    AdminSettings {
        environment: DeployEnvironment::Production,
        revalidate_key: Some(SECRET.to_string()),
        allow_dev_bypass: false,
    }
}

fn app(backend: Arc<FakeInventory>) -> Router {
    app_with(backend, production_admin())
}

async fn get(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn revalidate(app: &Router, key: Option<&str>, body: Value) -> Response {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/cache/revalidate")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    let request = builder
        .body(Body::from(body.to_string()))
        .expect("request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn json_body(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body should be json")
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn listing_is_served_from_cache_until_revalidated() {
    let backend = Arc::new(FakeInventory::default());
    let app = app(Arc::clone(&backend));
    let uri = "/api/vehicles?marca=Toyota&marca=Kia&page=2";

    let first = get(&app, uri).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache-status"), Some("MISS"));
    assert_eq!(
        header(&first, CACHE_CONTROL.as_str()),
        Some("public, max-age=900, s-maxage=900, stale-while-revalidate=3600")
    );
    let first_etag = header(&first, ETAG.as_str()).map(str::to_string);
    let body = json_body(first).await;
    assert_eq!(body["totalCount"], 42);
    assert_eq!(body["vehicles"].as_array().map(Vec::len), Some(2));

    // Same filters in another order hit the same entry.
    let second = get(&app, "/api/vehicles?page=2&marca=Kia&marca=Toyota").await;
    assert_eq!(header(&second, "x-cache-status"), Some("HIT"));
    assert_eq!(header(&second, ETAG.as_str()).map(str::to_string), first_etag);
    assert_eq!(backend.row_calls.load(Ordering::SeqCst), 1);

    let response = revalidate(&app, Some(SECRET), json!({ "tags": ["vehicle-list"] })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["success"], true);
    assert_eq!(summary["results"]["removedEntries"], 1);

    let third = get(&app, uri).await;
    assert_eq!(header(&third, "x-cache-status"), Some("MISS"));
    assert_eq!(backend.row_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn matching_validator_short_circuits_to_not_modified() {
    let backend = Arc::new(FakeInventory::default());
    let app = app(Arc::clone(&backend));

    let first = get(&app, "/api/vehicles/filters").await;
    let etag = header(&first, ETAG.as_str())
        .expect("etag header")
        .to_string();

    let request = Request::builder()
        .uri("/api/vehicles/filters")
        .header(IF_NONE_MATCH, etag.as_str())
        .body(Body::empty())
        .expect("request should build");
    let revalidated = app.clone().oneshot(request).await.expect("response");
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&revalidated, ETAG.as_str()), Some(etag.as_str()));
    let body = revalidated
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    assert!(body.is_empty());

    let request = Request::builder()
        .uri("/api/vehicles/filters")
        .header(IF_NONE_MATCH, "\"0000000000000000\"")
        .body(Body::empty())
        .expect("request should build");
    let stale = app.clone().oneshot(request).await.expect("response");
    assert_eq!(stale.status(), StatusCode::OK);
    assert_eq!(
        json_body(stale).await,
        json!({ "marcas": ["Kia", "Toyota"] })
    );
    assert_eq!(backend.scalar_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_vehicle_is_a_non_cacheable_404() {
    let backend = Arc::new(FakeInventory::default());
    let app = app(Arc::clone(&backend));

    let response = get(&app, "/api/vehicles/vendido").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        header(&response, CACHE_CONTROL.as_str()),
        Some("no-store, no-cache, must-revalidate")
    );
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "not_found");

    get(&app, "/api/vehicles/vendido").await;
    assert_eq!(backend.scalar_calls.load(Ordering::SeqCst), 2);

    let found = get(&app, "/api/vehicles/kia-rio-2020").await;
    assert_eq!(found.status(), StatusCode::OK);
    assert_eq!(
        header(&found, CACHE_CONTROL.as_str()),
        Some("public, max-age=86400, s-maxage=86400, stale-while-revalidate=604800")
    );
}

#[tokio::test]
async fn slugs_report_their_count() {
    let app = app(Arc::new(FakeInventory::default()));
    let response = get(&app, "/api/vehicles/slugs").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-slug-count"), Some("2"));
}

#[tokio::test]
async fn backend_outage_surfaces_as_503_and_is_not_cached() {
    let backend = Arc::new(FakeInventory {
        fail_rows: true,
        ..Default::default()
    });
    let app = app(Arc::clone(&backend));

    let response = get(&app, "/api/vehicles").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(header(&response, X_REQUEST_ID.as_str()).is_some());
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "backend_unavailable");

    get(&app, "/api/vehicles").await;
    assert_eq!(backend.row_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn revalidation_requires_the_shared_secret() {
    let backend = Arc::new(FakeInventory::default());
    let app = app(Arc::clone(&backend));
    get(&app, "/api/vehicles?marca=Toyota").await;

    let missing = revalidate(&app, None, json!({ "clearMemory": true })).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let wrong = revalidate(&app, Some("guess"), json!({ "clearMemory": true })).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    // Nothing was touched by the rejected calls.
    let cached = get(&app, "/api/vehicles?marca=Toyota").await;
    assert_eq!(header(&cached, "x-cache-status"), Some("HIT"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/cache/revalidate")
        .header("authorization", format!("Bearer {SECRET}"))
        .body(Body::from(r#"{"clearMemory":true,"tags":["bogus"]}"#))
        .expect("request should build");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["results"]["memoryCacheCleared"], true);
    assert_eq!(summary["results"]["removedEntries"], 1);
}

#[tokio::test]
async fn development_bypass_needs_the_explicit_flag() {
    let dev_locked = app_with(
        Arc::new(FakeInventory::default()),
        AdminSettings {
            environment: DeployEnvironment::Development,
            revalidate_key: None,
            allow_dev_bypass: false,
        },
    );
    let response = revalidate(&dev_locked, None, json!({ "tags": ["vehicles"] })).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let dev_open = app_with(
        Arc::new(FakeInventory::default()),
        AdminSettings {
            environment: DeployEnvironment::Development,
            revalidate_key: None,
            allow_dev_bypass: true,
        },
    );
    let response = revalidate(&dev_open, None, json!({ "tags": ["vehicles"] })).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_revalidation_body_is_rejected() {
    let app = app(Arc::new(FakeInventory::default()));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/cache/revalidate")
        .header("x-api-key", SECRET)
        .body(Body::from("{not json"))
        .expect("request should build");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn null_fields_and_non_string_tags_still_revalidate() {
    let app = app(Arc::new(FakeInventory::default()));
    get(&app, "/api/vehicles?marca=Toyota").await;

    let response = revalidate(
        &app,
        Some(SECRET),
        json!({ "tags": null, "clearMemory": true }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["results"]["memoryCacheCleared"], true);
    let refetched = get(&app, "/api/vehicles?marca=Toyota").await;
    assert_eq!(header(&refetched, "x-cache-status"), Some("MISS"));

    let response = revalidate(&app, Some(SECRET), json!({ "tags": ["vehicle-list", 5] })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["results"]["removedEntries"], 1);
    assert_eq!(summary["results"]["ignoredTags"], json!(["5"]));
    let refetched = get(&app, "/api/vehicles?marca=Toyota").await;
    assert_eq!(header(&refetched, "x-cache-status"), Some("MISS"));
}

#[tokio::test]
async fn status_endpoint_reports_store_and_tags() {
    let app = app(Arc::new(FakeInventory::default()));
    get(&app, "/api/vehicles?marca=Toyota").await;
    get(&app, "/api/vehicles?marca=Toyota").await;

    let response = get(&app, "/api/cache/revalidate").await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await;
    assert_eq!(status["status"], "ok");
    assert_eq!(status["memoryCache"]["size"], 1);
    assert_eq!(status["memoryCache"]["hits"], 1);
    assert_eq!(status["memoryCache"]["misses"], 1);
    assert_eq!(status["inFlight"], 0);
    assert!(
        status["availableTags"]
            .as_array()
            .expect("tags")
            .contains(&json!("vehicle-list"))
    );
}

#[tokio::test]
async fn health_is_no_content() {
    let app = app(Arc::new(FakeInventory::default()));
    assert_eq!(get(&app, "/_health").await.status(), StatusCode::NO_CONTENT);
}
