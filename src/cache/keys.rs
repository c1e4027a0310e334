//! Cache key definitions.
//!
//! Defines the cache namespaces (`CacheKind`), the fixed set of invalidation
//! tags (`CacheTag`) and the request `Fingerprint` used as the store key.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::CacheError;

/// Number of hex characters kept from the SHA-256 digest in a fingerprint.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Logical namespace of a cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    /// Filtered, paginated vehicle listing.
    List,
    /// A single vehicle by slug.
    Detail,
    /// Free-text search results.
    Search,
    /// Enumerated values for the listing filters.
    FilterOptions,
    /// Every published vehicle slug.
    Slugs,
}

impl CacheKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            CacheKind::List => "list",
            CacheKind::Detail => "detail",
            CacheKind::Search => "search",
            CacheKind::FilterOptions => "filter-options",
            CacheKind::Slugs => "slugs",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalidation group attached to cache entries.
///
/// The set is closed: revalidation requests naming anything else are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTag {
    Vehicles,
    VehicleList,
    VehicleDetail,
    Filters,
    FilterOptions,
    Search,
    Slugs,
    Popular,
}

/// Returned when a tag name is not part of [`CacheTag::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTag(pub String);

impl fmt::Display for UnknownTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown cache tag `{}`", self.0)
    }
}

impl std::error::Error for UnknownTag {}

impl CacheTag {
    pub const ALL: [CacheTag; 8] = [
        CacheTag::Vehicles,
        CacheTag::VehicleList,
        CacheTag::VehicleDetail,
        CacheTag::Filters,
        CacheTag::FilterOptions,
        CacheTag::Search,
        CacheTag::Slugs,
        CacheTag::Popular,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            CacheTag::Vehicles => "vehicles",
            CacheTag::VehicleList => "vehicle-list",
            CacheTag::VehicleDetail => "vehicle-detail",
            CacheTag::Filters => "filters",
            CacheTag::FilterOptions => "filter-options",
            CacheTag::Search => "search",
            CacheTag::Slugs => "slugs",
            CacheTag::Popular => "popular",
        }
    }

    /// Names of every valid tag, in declaration order.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|tag| tag.as_str()).collect()
    }
}

impl FromStr for CacheTag {
    type Err = UnknownTag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str() == value)
            .ok_or_else(|| UnknownTag(value.to_string()))
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CacheTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Deterministic store key for a read request.
///
/// The key is `"<kind>:<hex>"`, a truncated SHA-256 over the canonical form of
/// the request parameters. The canonical form itself travels with the key so
/// the store can tell a genuine hit from a truncated-hash collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    kind: CacheKind,
    key: String,
    canonical: Arc<str>,
}

impl Fingerprint {
    fn from_canonical(kind: CacheKind, canonical: String) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            kind,
            key: format!("{}:{}", kind.as_str(), &digest[..FINGERPRINT_HEX_LEN]),
            canonical: Arc::from(canonical),
        }
    }

    /// Fingerprint of an already-materialized JSON parameter object.
    pub fn from_value(kind: CacheKind, params: &Value) -> Self {
        let canonical = normalize(params)
            .map(|value| render(&value))
            .unwrap_or_else(|| "{}".to_string());
        Self::from_canonical(kind, canonical)
    }

    /// Fingerprint for a namespace without parameters (filter options, slugs).
    pub fn singleton(kind: CacheKind) -> Self {
        Self::from_canonical(kind, "{}".to_string())
    }

    /// Fingerprint for a vehicle detail lookup.
    pub fn detail(slug: &str) -> Self {
        Self::from_value(CacheKind::Detail, &serde_json::json!({ "slug": slug }))
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Canonical parameter text the key was derived from.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub(crate) fn canonical_arc(&self) -> Arc<str> {
        Arc::clone(&self.canonical)
    }

    #[cfg(test)]
    pub(crate) fn with_key(kind: CacheKind, key: &str, canonical: &str) -> Self {
        Self {
            kind,
            key: key.to_string(),
            canonical: Arc::from(canonical),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Derive the store key for `params` within namespace `kind`.
///
/// Arrays are order-insensitive, empty or absent fields are dropped, and
/// numbers are rendered as canonical decimal text.
pub fn fingerprint<P>(kind: CacheKind, params: &P) -> Result<Fingerprint, CacheError>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params).map_err(|source| CacheError::Canonicalize {
        kind: kind.as_str(),
        source,
    })?;
    Ok(Fingerprint::from_value(kind, &value))
}

/// Drop semantically empty values; `None` means "omit this field".
fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::Bool(true) | Value::Number(_) => Some(value.clone()),
        Value::String(text) if text.is_empty() => None,
        Value::String(_) => Some(value.clone()),
        Value::Array(items) => {
            let items: Vec<Value> = items.iter().filter_map(normalize).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Object(fields) => {
            let fields: serde_json::Map<String, Value> = fields
                .iter()
                .filter_map(|(name, field)| normalize(field).map(|field| (name.clone(), field)))
                .collect();
            (!fields.is_empty()).then_some(Value::Object(fields))
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => render_number(number),
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(render).collect();
            parts.sort_unstable();
            parts.dedup();
            format!("[{}]", parts.join(","))
        }
        Value::Object(fields) => {
            let mut parts: Vec<(&String, String)> = fields
                .iter()
                .map(|(name, field)| (name, render(field)))
                .collect();
            parts.sort_unstable_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = parts
                .into_iter()
                .map(|(name, field)| format!("{}:{field}", Value::String(name.clone())))
                .collect();
            format!("{{{}}}", body.join(","))
        }
    }
}

// 2^53: beyond this an f64 no longer represents every integer exactly.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

fn render_number(number: &serde_json::Number) -> String {
    if let Some(int) = number.as_i64() {
        return int.to_string();
    }
    if let Some(uint) = number.as_u64() {
        return uint.to_string();
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < MAX_EXACT_F64 => {
            (float as i64).to_string()
        }
        Some(float) => float.to_string(),
        None => number.to_string(),
    }
}
