//! HTTP conditional caching: entity tags, `If-None-Match` evaluation and the
//! `Cache-Control` freshness tiers shared by the read endpoints.

use std::fmt;

use axum::http::header::{CACHE_CONTROL, ETAG};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::error::CacheError;

const ETAG_HEX_LEN: usize = 16;

/// Header carrying the in-process cache outcome of a read.
pub const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");

/// Strong entity tag over a serialized response body, stored quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(String);

impl ETag {
    pub fn from_body(body: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(body));
        Self(format!("\"{}\"", &digest[..ETAG_HEX_LEN]))
    }

    /// The quoted tag, as sent in the `ETag` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }

    fn opaque(&self) -> &str {
        self.0.trim_matches('"')
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entity tag of `value` as it would be serialized in a JSON response.
pub fn compute_etag<T>(value: &T) -> Result<ETag, CacheError>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value).map_err(CacheError::Encode)?;
    Ok(ETag::from_body(&body))
}

/// Evaluate an `If-None-Match` validator against the current tag.
///
/// Accepts `*`, comma-separated lists, and weak tags (`W/"…"`), which match
/// their strong counterpart. A missing or non-ASCII header never matches.
pub fn is_client_cache_valid(validator: Option<&HeaderValue>, etag: &ETag) -> bool {
    let Some(raw) = validator.and_then(|value| value.to_str().ok()) else {
        return false;
    };
    raw.split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| {
            candidate == "*" || {
                let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
                candidate.trim_matches('"') == etag.opaque()
            }
        })
}

/// Shared-cache freshness policy of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessTier {
    /// Fingerprinted assets; never revalidated.
    Immutable,
    /// Slowly changing reference data: filter options, slugs, vehicle details.
    Long,
    /// Listings and search results.
    Medium,
    /// Near-real-time data.
    Short,
    /// Must not be stored anywhere; also used for every error response.
    NoCache,
    /// Per-user data; browser cache only.
    Private,
}

impl FreshnessTier {
    pub const fn cache_control(self) -> &'static str {
        match self {
            FreshnessTier::Immutable => "public, max-age=31536000, immutable",
            FreshnessTier::Long => {
                "public, max-age=86400, s-maxage=86400, stale-while-revalidate=604800"
            }
            FreshnessTier::Medium => {
                "public, max-age=900, s-maxage=900, stale-while-revalidate=3600"
            }
            FreshnessTier::Short => "public, max-age=60, s-maxage=60, stale-while-revalidate=300",
            FreshnessTier::NoCache => "no-store, no-cache, must-revalidate",
            FreshnessTier::Private => "private, max-age=300",
        }
    }
}

/// Whether a read was answered from the in-process store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Build the caching headers for a response of the given tier.
///
/// `extra` headers are applied last and override the computed ones.
pub fn build_cache_headers(
    tier: FreshnessTier,
    etag: Option<&ETag>,
    extra: impl IntoIterator<Item = (HeaderName, HeaderValue)>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(tier.cache_control()));
    if let Some(etag) = etag {
        match etag.header_value() {
            Some(value) => {
                headers.insert(ETAG, value);
            }
            None => warn!(
                target = "trefa::cache::conditional",
                etag = %etag,
                "entity tag is not a valid header value; omitting it"
            ),
        }
    }
    for (name, value) in extra {
        headers.insert(name, value);
    }
    headers
}
