//! Inventory backend over a PostgREST (Supabase REST) endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::application::backend::InventoryBackend;
use crate::domain::error::FetchError;
use crate::domain::vehicles::{
    ScalarQuery, SortOrder, VehicleFilters, VehiclePage, page_range,
};
use crate::infra::error::InfraError;

const INVENTORY_TABLE: &str = "inventario_cache";
const SEARCH_RPC: &str = "rpc/search_vehicles";
const FILTER_OPTIONS_RPC: &str = "rpc/get_filter_options";
const ERROR_BODY_LIMIT: usize = 512;

/// Connection settings for [`PostgrestInventory`].
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// REST root, e.g. `https://<project>.supabase.co/rest/v1/`.
    pub url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

pub struct PostgrestInventory {
    client: Client,
    root: Url,
}

impl PostgrestInventory {
    pub fn new(config: &PostgrestConfig) -> Result<Self, InfraError> {
        let mut root = config.url.clone();
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref() {
            let apikey = HeaderValue::from_str(key)
                .map_err(|err| InfraError::configuration(format!("invalid backend api key: {err}")))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|err| InfraError::configuration(format!("invalid backend api key: {err}")))?;
            headers.insert("apikey", apikey);
            headers.insert(reqwest::header::AUTHORIZATION, bearer);
        }

        let client = Client::builder()
            .user_agent(concat!("trefa/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        Ok(Self { client, root })
    }

    fn url(&self, path: &str) -> Result<Url, FetchError> {
        self.root
            .join(path)
            .map_err(|err| FetchError::rejected(0, format!("invalid backend path `{path}`: {err}")))
    }

    fn table(&self, params: &[(String, String)]) -> Result<RequestBuilder, FetchError> {
        let mut url = self.url(INVENTORY_TABLE)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(self.client.get(url))
    }

    async fn rpc(&self, name: &str, body: Value) -> Result<Value, FetchError> {
        let response = send(self.client.post(self.url(name)?).json(&body)).await?;
        let response = ensure_success(response).await?;
        decode(response).await
    }

    /// Vehicle ids matching a free-text term, ranked by the database.
    async fn search_ids(&self, term: &str) -> Result<Vec<Value>, FetchError> {
        let hits = self.rpc(SEARCH_RPC, json!({ "search_term": term })).await?;
        let hits = match hits {
            Value::Array(hits) => hits,
            Value::Null => Vec::new(),
            other => {
                return Err(FetchError::decode(format!(
                    "search returned {} instead of an array",
                    json_kind(&other)
                )));
            }
        };
        Ok(hits
            .into_iter()
            .filter_map(|mut hit| hit.get_mut("id").map(Value::take))
            .collect())
    }
}

#[async_trait]
impl InventoryBackend for PostgrestInventory {
    #[instrument(skip(self, filters))]
    async fn fetch_rows(
        &self,
        filters: &VehicleFilters,
        page: u32,
    ) -> Result<VehiclePage, FetchError> {
        let mut params = list_params(filters);

        if let Some(term) = filters.search_term() {
            let ids = self.search_ids(term).await?;
            if ids.is_empty() {
                return Ok(VehiclePage::empty());
            }
            params.push(("id".to_string(), in_list(ids.iter().map(id_literal))));
        }

        let (from, to) = page_range(page);
        let request = self
            .table(&params)?
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", format!("{from}-{to}"));
        let response = send(request).await?;

        // Past the last page PostgREST answers 416 but still reports the total.
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            let total = total_count(response.headers()).unwrap_or(0);
            return Ok(VehiclePage {
                vehicles: Vec::new(),
                total_count: total,
            });
        }

        let response = ensure_success(response).await?;
        let total = total_count(response.headers());
        let vehicles = match decode(response).await? {
            Value::Array(rows) => rows,
            other => {
                return Err(FetchError::decode(format!(
                    "listing returned {} instead of an array",
                    json_kind(&other)
                )));
            }
        };
        let total_count = total.unwrap_or(vehicles.len() as u64);
        debug!(rows = vehicles.len(), total_count, "fetched inventory page");
        Ok(VehiclePage {
            vehicles,
            total_count,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_scalar(&self, query: &ScalarQuery) -> Result<Value, FetchError> {
        match query {
            ScalarQuery::FilterOptions => self.rpc(FILTER_OPTIONS_RPC, json!({})).await,
            ScalarQuery::VehicleBySlug(slug) => {
                let params = [
                    ("select".to_string(), "*".to_string()),
                    ("slug".to_string(), format!("eq.{slug}")),
                    ("limit".to_string(), "1".to_string()),
                ];
                let response = ensure_success(send(self.table(&params)?).await?).await?;
                match decode(response).await? {
                    Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
                    Value::Array(_) | Value::Null => Ok(Value::Null),
                    other => Err(FetchError::decode(format!(
                        "vehicle lookup returned {}",
                        json_kind(&other)
                    ))),
                }
            }
            ScalarQuery::AllSlugs => {
                let params = [
                    ("select".to_string(), "slug".to_string()),
                    ("exhibicion_inventario".to_string(), "eq.true".to_string()),
                    ("order".to_string(), "updated_at.desc".to_string()),
                ];
                let response = ensure_success(send(self.table(&params)?).await?).await?;
                decode(response).await
            }
        }
    }
}

/// PostgREST query parameters for a listing, excluding search and paging.
fn list_params(filters: &VehicleFilters) -> Vec<(String, String)> {
    let mut params = vec![
        ("select".to_string(), "*".to_string()),
        ("exhibicion_inventario".to_string(), "eq.true".to_string()),
    ];
    let mut push = |column: &str, value: String| params.push((column.to_string(), value));

    if filters.hide_separado {
        push("or", "(separado.eq.false,separado.is.null)".to_string());
    }
    for (column, values) in [
        ("marca", &filters.marca),
        ("transmision", &filters.transmision),
        ("combustible", &filters.combustible),
        ("garantia", &filters.garantia),
    ] {
        if !values.is_empty() {
            push(column, in_list(values.iter().map(|v| quote(v))));
        }
    }
    if !filters.autoano.is_empty() {
        push("autoano", in_list(filters.autoano.iter().map(i32::to_string)));
    }
    if let Some(min) = filters.min_price.filter(|v| *v > 0) {
        push("precio", format!("gte.{min}"));
    }
    if let Some(max) = filters.max_price.filter(|v| *v > 0) {
        push("precio", format!("lte.{max}"));
    }
    if let Some(min) = filters.enganchemin.filter(|v| *v > 0) {
        push("enganchemin", format!("gte.{min}"));
    }
    if let Some(max) = filters.max_enganche.filter(|v| *v > 0) {
        push("enganchemin", format!("lte.{max}"));
    }
    if !filters.carroceria.is_empty() {
        let conditions: Vec<String> = filters
            .carroceria
            .iter()
            .map(|body| like_pattern(body))
            .filter(|pattern| pattern != "**")
            .map(|pattern| format!("carroceria.ilike.{pattern},clasificacionid.ilike.{pattern}"))
            .collect();
        if !conditions.is_empty() {
            push("or", format!("({})", conditions.join(",")));
        }
    }
    if !filters.ubicacion.is_empty() {
        push(
            "ubicacion",
            in_list(filters.branch_codes().iter().map(|v| quote(v))),
        );
    }
    if !filters.promociones.is_empty() {
        let items: Vec<String> = filters.promociones.iter().map(|v| quote(v)).collect();
        push("promociones", format!("ov.{{{}}}", items.join(",")));
    }
    match filters.sort() {
        SortOrder::Relevance => push("order", "view_count.desc.nullslast".to_string()),
        SortOrder::Column { column, ascending } => push(
            "order",
            format!("{column}.{}", if ascending { "asc" } else { "desc" }),
        ),
        SortOrder::Unordered => {}
    }
    params
}

fn in_list(items: impl Iterator<Item = String>) -> String {
    format!("in.({})", items.collect::<Vec<_>>().join(","))
}

/// Double-quote a value for PostgREST list syntax.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Case-insensitive substring pattern; characters with meaning in the
/// logic-tree syntax are dropped.
fn like_pattern(value: &str) -> String {
    let cleaned: String = value
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '"' | '\\'))
        .collect();
    format!("*{}*", cleaned.trim())
}

fn id_literal(id: &Value) -> String {
    match id {
        Value::String(text) => quote(text),
        other => other.to_string(),
    }
}

/// Total from a `Content-Range: 0-20/47` header; `None` when unknown (`*`).
fn total_count(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

async fn send(request: RequestBuilder) -> Result<Response, FetchError> {
    request.send().await.map_err(|err| {
        if err.is_timeout() {
            FetchError::unavailable(format!("request timed out: {err}"))
        } else {
            FetchError::unavailable(err.to_string())
        }
    })
}

async fn ensure_success(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let cut = (0..=ERROR_BODY_LIMIT)
            .rev()
            .find(|idx| body.is_char_boundary(*idx))
            .unwrap_or(0);
        body.truncate(cut);
    }
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Err(FetchError::unavailable(format!("status {status}: {body}")))
        }
        _ => Err(FetchError::rejected(status.as_u16(), body)),
    }
}

async fn decode(response: Response) -> Result<Value, FetchError> {
    response
        .json::<Value>()
        .await
        .map_err(|err| FetchError::decode(err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
