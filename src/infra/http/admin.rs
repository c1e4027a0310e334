//! Cache administration endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::application::inventory::{CacheStatusReport, InventoryService};
use crate::cache::{RevalidateRequest, RevalidateSummary};
use crate::config::{AdminSettings, DeployEnvironment};

use super::RouterState;
use super::error::ApiError;

const API_KEY_HEADER: &str = "x-api-key";

/// Who may call the revalidation endpoint.
#[derive(Clone)]
pub enum AdminGuard {
    SharedSecret(Arc<str>),
    /// Development only: every caller is accepted.
    DevelopmentBypass,
    /// No secret configured; every caller is refused.
    Locked,
}

impl AdminGuard {
    pub fn from_settings(settings: &AdminSettings) -> Self {
        if let Some(key) = settings.revalidate_key.as_deref() {
            return AdminGuard::SharedSecret(Arc::from(key));
        }
        if settings.environment == DeployEnvironment::Development && settings.allow_dev_bypass {
            return AdminGuard::DevelopmentBypass;
        }
        AdminGuard::Locked
    }

    pub fn permits(&self, presented: Option<&str>) -> bool {
        match self {
            AdminGuard::SharedSecret(secret) => presented
                .map(|token| bool::from(token.as_bytes().ct_eq(secret.as_bytes())))
                .unwrap_or(false),
            AdminGuard::DevelopmentBypass => true,
            AdminGuard::Locked => false,
        }
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub inventory: Arc<InventoryService>,
    pub guard: AdminGuard,
}

pub fn build_admin_router(state: RouterState) -> Router<RouterState> {
    // The key check wraps only the POST; GET is added after the layer.
    let revalidate = post(revalidate_cache)
        .route_layer(middleware::from_fn_with_state(state, require_revalidate_key))
        .get(cache_status);

    Router::new().route("/api/cache/revalidate", revalidate)
}

async fn require_revalidate_key(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = presented_key(request.headers());
    if !state.guard.permits(token.as_deref()) {
        warn!(
            target = "trefa::http::admin",
            has_key = token.is_some(),
            "revalidation rejected"
        );
        return ApiError::unauthorized().into_response();
    }
    next.run(request).await
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
struct RevalidateResponse {
    success: bool,
    message: &'static str,
    results: RevalidateSummary,
    timestamp: String,
}

/// An empty body is accepted and behaves like `{}`.
async fn revalidate_cache(
    State(state): State<AdminState>,
    body: Bytes,
) -> Result<Json<RevalidateResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RevalidateRequest::default()
    } else {
        serde_json::from_slice::<RevalidateRequest>(&body).map_err(|err| {
            ApiError::bad_request("Malformed revalidation request", Some(err.to_string()))
        })?
    };

    let summary = state.inventory.revalidate(&request);
    info!(
        target = "trefa::http::admin",
        removed = summary.removed_entries,
        cleared_all = summary.memory_cache_cleared,
        "cache revalidated"
    );

    Ok(Json(RevalidateResponse {
        success: true,
        message: "Cache invalidated",
        timestamp: summary.timestamp.clone(),
        results: summary,
    }))
}

async fn cache_status(State(state): State<AdminState>) -> Json<CacheStatusReport> {
    Json(state.inventory.status())
}
