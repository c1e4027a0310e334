//! Trefa read-through cache.
//!
//! Fronts the inventory backend with:
//!
//! - **Store**: bounded in-process LRU of typed values with per-entry TTL and tags
//! - **Deduplication**: one backing fetch per fingerprint, shared by all callers
//! - **Conditional responses**: entity tags, `If-None-Match`, `Cache-Control` tiers
//! - **Invalidation**: by tag, key, public path, or everything
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` table of `trefa.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 1000
//! sweep_interval_seconds = 60
//! list_ttl_seconds = 900
//! # detail, search, filter_options and slugs TTLs follow the same pattern
//! ```

mod conditional;
mod config;
mod dedup;
mod error;
mod invalidation;
mod keys;
mod lock;
mod read_through;
mod store;

pub use conditional::{
    CacheStatus, ETag, FreshnessTier, X_CACHE_STATUS, build_cache_headers, compute_etag,
    is_client_cache_valid,
};
pub use config::CacheConfig;
pub use dedup::RequestDeduplicator;
pub use error::CacheError;
pub use invalidation::{
    KeyCleared, PathCleared, PathRevalidator, PathScope, RevalidateRequest, RevalidateSummary,
    TagCleared, revalidate,
};
pub use keys::{CacheKind, CacheTag, Fingerprint, UnknownTag, fingerprint};
pub use read_through::{CachedPayload, CachedRead, ReadPolicy, ReadThrough};
pub use store::{CacheStats, CacheStore};

pub(crate) use invalidation::now_rfc3339;
