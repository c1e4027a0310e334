use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_TYPE, IF_NONE_MATCH},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::Query;
use serde::Deserialize;
use serde_json::Value;

use crate::application::inventory::InventoryService;
use crate::cache::{
    CachedRead, FreshnessTier, X_CACHE_STATUS, build_cache_headers, is_client_cache_valid,
};
use crate::domain::vehicles::VehicleFilters;

use super::RouterState;
use super::error::ApiError;

const X_SLUG_COUNT: HeaderName = HeaderName::from_static("x-slug-count");

#[derive(Clone)]
pub struct PublicState {
    pub inventory: Arc<InventoryService>,
}

pub fn build_public_router() -> Router<RouterState> {
    Router::new()
        .route("/api/vehicles", get(list_vehicles))
        .route("/api/vehicles/filters", get(filter_options))
        .route("/api/vehicles/slugs", get(vehicle_slugs))
        .route("/api/vehicles/{slug}", get(vehicle_detail))
        .route("/_health", get(health))
}

/// Raw listing query. Values are kept as text and parsed leniently:
/// anything that does not parse is treated as absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ListQuery {
    marca: Vec<String>,
    autoano: Vec<String>,
    transmision: Vec<String>,
    combustible: Vec<String>,
    garantia: Vec<String>,
    carroceria: Vec<String>,
    ubicacion: Vec<String>,
    promociones: Vec<String>,
    min_price: Option<String>,
    max_price: Option<String>,
    enganchemin: Option<String>,
    max_enganche: Option<String>,
    hide_separado: Option<String>,
    search: Option<String>,
    orderby: Option<String>,
    page: Option<String>,
}

impl ListQuery {
    fn into_request(self) -> (VehicleFilters, u32) {
        let page = parse_number::<u32>(self.page.as_deref()).unwrap_or(1).max(1);
        let filters = VehicleFilters {
            marca: non_empty(self.marca),
            autoano: self
                .autoano
                .iter()
                .filter_map(|year| year.trim().parse().ok())
                .collect(),
            transmision: non_empty(self.transmision),
            combustible: non_empty(self.combustible),
            garantia: non_empty(self.garantia),
            carroceria: non_empty(self.carroceria),
            ubicacion: non_empty(self.ubicacion),
            promociones: non_empty(self.promociones),
            min_price: parse_number(self.min_price.as_deref()),
            max_price: parse_number(self.max_price.as_deref()),
            enganchemin: parse_number(self.enganchemin.as_deref()),
            max_enganche: parse_number(self.max_enganche.as_deref()),
            hide_separado: self.hide_separado.as_deref() == Some("true"),
            search: self.search.filter(|term| !term.trim().is_empty()),
            orderby: self
                .orderby
                .map(|order| order.trim().to_string())
                .filter(|order| !order.is_empty()),
        };
        (filters, page)
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .collect()
}

fn parse_number<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    raw.and_then(|value| value.trim().parse().ok())
}

async fn list_vehicles(
    State(state): State<PublicState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let (filters, page) = query.into_request();
    let read = state.inventory.list(filters, page).await?;
    Ok(conditional_json(&headers, &read, FreshnessTier::Medium, Vec::new()))
}

async fn vehicle_detail(
    State(state): State<PublicState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let slug = slug.trim();
    if slug.is_empty() {
        return Err(ApiError::bad_request("Vehicle slug is required", None));
    }
    match state.inventory.detail(slug).await? {
        Some(read) => Ok(conditional_json(
            &headers,
            &read,
            FreshnessTier::Long,
            Vec::new(),
        )),
        None => Err(ApiError::not_found("Vehicle not found")),
    }
}

async fn filter_options(
    State(state): State<PublicState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let read = state.inventory.filter_options().await?;
    Ok(conditional_json(&headers, &read, FreshnessTier::Long, Vec::new()))
}

async fn vehicle_slugs(
    State(state): State<PublicState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let read = state.inventory.slugs().await?;
    let count = match &read.payload.value {
        Value::Array(slugs) => slugs.len(),
        _ => 0,
    };
    let extra = vec![(X_SLUG_COUNT, HeaderValue::from(count))];
    Ok(conditional_json(&headers, &read, FreshnessTier::Long, extra))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `304 Not Modified` when the client already holds the current entity,
/// otherwise the cached JSON body with its validators.
fn conditional_json<T>(
    request_headers: &HeaderMap,
    read: &CachedRead<T>,
    tier: FreshnessTier,
    mut extra: Vec<(HeaderName, HeaderValue)>,
) -> Response {
    let etag = &read.payload.etag;
    extra.push((X_CACHE_STATUS, read.status.header_value()));
    let mut headers = build_cache_headers(tier, Some(etag), extra);

    if is_client_cache_valid(request_headers.get(IF_NONE_MATCH), etag) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (StatusCode::OK, headers, read.payload.body.clone()).into_response()
}
