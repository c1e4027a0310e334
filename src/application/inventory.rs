//! Cached vehicle inventory reads.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::application::backend::InventoryBackend;
use crate::cache::{
    CacheConfig, CacheKind, CacheStats, CacheStore, CacheTag, CachedRead, Fingerprint,
    ReadPolicy, ReadThrough, RevalidateRequest, RevalidateSummary, fingerprint, now_rfc3339,
    revalidate,
};
use crate::domain::error::FetchError;
use crate::domain::vehicles::{ScalarQuery, VehicleFilters, VehiclePage};

const LIST_TAGS: &[CacheTag] = &[CacheTag::Vehicles, CacheTag::VehicleList];
const SEARCH_TAGS: &[CacheTag] = &[CacheTag::Vehicles, CacheTag::VehicleList, CacheTag::Search];
const DETAIL_TAGS: &[CacheTag] = &[CacheTag::Vehicles, CacheTag::VehicleDetail];
const FILTER_OPTION_TAGS: &[CacheTag] = &[CacheTag::Filters, CacheTag::FilterOptions];
const SLUG_TAGS: &[CacheTag] = &[CacheTag::Vehicles, CacheTag::Slugs];

#[derive(Serialize)]
struct ListParams<'a> {
    #[serde(flatten)]
    filters: &'a VehicleFilters,
    page: u32,
}

/// Snapshot served by the cache status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusReport {
    pub status: &'static str,
    pub enabled: bool,
    pub memory_cache: CacheStats,
    pub in_flight: usize,
    pub available_tags: Vec<&'static str>,
    pub timestamp: String,
}

/// Vehicle read operations, answered through the in-process cache.
pub struct InventoryService {
    backend: Arc<dyn InventoryBackend>,
    store: Arc<CacheStore>,
    config: CacheConfig,
    pages: ReadThrough<VehiclePage>,
    documents: ReadThrough<Value>,
}

impl InventoryService {
    pub fn new(
        backend: Arc<dyn InventoryBackend>,
        store: Arc<CacheStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            pages: ReadThrough::new(Arc::clone(&store), config.enabled),
            documents: ReadThrough::new(Arc::clone(&store), config.enabled),
            backend,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// One page of the filtered listing. Search terms are matched
    /// case-insensitively, so they are lowercased before keying and fetching.
    /// Sort orders are trimmed the same way.
    #[instrument(skip(self, filters))]
    pub async fn list(
        &self,
        mut filters: VehicleFilters,
        page: u32,
    ) -> Result<CachedRead<VehiclePage>, FetchError> {
        let page = page.max(1);
        filters.search = filters.search_term().map(str::to_lowercase);
        filters.orderby = filters.order_term().map(str::to_string);
        let kind = if filters.search.is_some() {
            CacheKind::Search
        } else {
            CacheKind::List
        };
        let policy = ReadPolicy {
            ttl: self.config.ttl_for(kind),
            tags: if kind == CacheKind::Search {
                SEARCH_TAGS
            } else {
                LIST_TAGS
            },
        };

        let key = match fingerprint(
            kind,
            &ListParams {
                filters: &filters,
                page,
            },
        ) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "listing parameters could not be keyed; bypassing cache");
                None
            }
        };

        let backend = Arc::clone(&self.backend);
        let read = self
            .pages
            .read(key.as_ref(), policy, move || async move {
                backend.fetch_rows(&filters, page).await.map(Some)
            })
            .await?;
        read.ok_or(FetchError::Aborted)
    }

    /// A vehicle by slug, or `None` when no published vehicle has it.
    /// Missing vehicles are not cached.
    #[instrument(skip(self))]
    pub async fn detail(&self, slug: &str) -> Result<Option<CachedRead<Value>>, FetchError> {
        let policy = ReadPolicy {
            ttl: self.config.ttl_for(CacheKind::Detail),
            tags: DETAIL_TAGS,
        };
        let query = ScalarQuery::VehicleBySlug(slug.to_string());
        self.scalar(Fingerprint::detail(slug), policy, query, None)
            .await
    }

    /// Distinct values available for each listing filter.
    #[instrument(skip(self))]
    pub async fn filter_options(&self) -> Result<CachedRead<Value>, FetchError> {
        let policy = ReadPolicy {
            ttl: self.config.ttl_for(CacheKind::FilterOptions),
            tags: FILTER_OPTION_TAGS,
        };
        let empty = Value::Object(serde_json::Map::new());
        let read = self
            .scalar(
                Fingerprint::singleton(CacheKind::FilterOptions),
                policy,
                ScalarQuery::FilterOptions,
                Some(empty),
            )
            .await?;
        read.ok_or(FetchError::Aborted)
    }

    /// Slugs of every published vehicle, most recently updated first.
    #[instrument(skip(self))]
    pub async fn slugs(&self) -> Result<CachedRead<Value>, FetchError> {
        let policy = ReadPolicy {
            ttl: self.config.ttl_for(CacheKind::Slugs),
            tags: SLUG_TAGS,
        };
        let read = self
            .scalar(
                Fingerprint::singleton(CacheKind::Slugs),
                policy,
                ScalarQuery::AllSlugs,
                Some(Value::Array(Vec::new())),
            )
            .await?;
        read.ok_or(FetchError::Aborted)
    }

    /// `fallback` replaces a null result; without one, null means "not found".
    async fn scalar(
        &self,
        key: Fingerprint,
        policy: ReadPolicy,
        query: ScalarQuery,
        fallback: Option<Value>,
    ) -> Result<Option<CachedRead<Value>>, FetchError> {
        let backend = Arc::clone(&self.backend);
        self.documents
            .read(Some(&key), policy, move || async move {
                let value = backend.fetch_scalar(&query).await?;
                Ok::<_, FetchError>(match value {
                    Value::Null => fallback,
                    value => Some(value),
                })
            })
            .await
    }

    pub fn revalidate(&self, request: &RevalidateRequest) -> RevalidateSummary {
        revalidate(&self.store, request)
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    pub fn status(&self) -> CacheStatusReport {
        CacheStatusReport {
            status: "ok",
            enabled: self.config.enabled,
            memory_cache: self.store.stats(),
            in_flight: self.pages.in_flight() + self.documents.in_flight(),
            available_tags: CacheTag::names(),
            timestamp: now_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::CacheStatus;

    #[derive(Default)]
    struct CountingBackend {
        row_calls: AtomicUsize,
        scalar_calls: AtomicUsize,
    }

    #[async_trait]
    impl InventoryBackend for CountingBackend {
        async fn fetch_rows(
            &self,
            filters: &VehicleFilters,
            page: u32,
        ) -> Result<VehiclePage, FetchError> {
            self.row_calls.fetch_add(1, Ordering::SeqCst);
            Ok(VehiclePage {
                vehicles: vec![json!({ "marca": filters.marca.first(), "page": page })],
                total_count: 47,
            })
        }

        async fn fetch_scalar(&self, query: &ScalarQuery) -> Result<Value, FetchError> {
            self.scalar_calls.fetch_add(1, Ordering::SeqCst);
            Ok(match query {
                ScalarQuery::VehicleBySlug(slug) if slug == "missing" => Value::Null,
                ScalarQuery::VehicleBySlug(slug) => json!({ "slug": slug }),
                ScalarQuery::FilterOptions => Value::Null,
                ScalarQuery::AllSlugs => json!([{ "slug": "a" }, { "slug": "b" }]),
            })
        }
    }

    fn service(backend: Arc<CountingBackend>) -> InventoryService {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(NonZeroUsize::new(64).expect("non-zero")));
        InventoryService::new(backend, store, config)
    }

    fn toyota() -> VehicleFilters {
        VehicleFilters {
            marca: vec!["Toyota".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_is_cached_per_filter_and_page() {
        let backend = Arc::new(CountingBackend::default());
        let service = service(Arc::clone(&backend));

        let first = service.list(toyota(), 1).await.expect("list");
        let again = service.list(toyota(), 1).await.expect("list");
        let other_page = service.list(toyota(), 2).await.expect("list");

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(other_page.status, CacheStatus::Miss);
        assert_eq!(backend.row_calls.load(Ordering::SeqCst), 2);
        assert_eq!(again.payload.value.total_count, 47);
    }

    #[tokio::test]
    async fn search_terms_share_a_key_regardless_of_case() {
        let backend = Arc::new(CountingBackend::default());
        let service = service(Arc::clone(&backend));
        let search = |term: &str| VehicleFilters {
            search: Some(term.to_string()),
            ..Default::default()
        };

        service.list(search("  Jetta"), 1).await.expect("list");
        let hit = service.list(search("jetta "), 1).await.expect("list");

        assert_eq!(hit.status, CacheStatus::Hit);
        assert_eq!(backend.row_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.store().stats().tags.get("search"), Some(&1));
    }

    #[tokio::test]
    async fn padded_sort_orders_share_a_key() {
        let backend = Arc::new(CountingBackend::default());
        let service = service(Arc::clone(&backend));
        let ordered = |order: &str| VehicleFilters {
            orderby: Some(order.to_string()),
            ..toyota()
        };

        service.list(ordered("price-asc"), 1).await.expect("list");
        let hit = service.list(ordered("price-asc "), 1).await.expect("list");
        let blank = service.list(ordered("   "), 1).await.expect("list");
        let unordered = service.list(toyota(), 1).await.expect("list");

        assert_eq!(hit.status, CacheStatus::Hit);
        assert_eq!(blank.status, CacheStatus::Miss);
        assert_eq!(unordered.status, CacheStatus::Hit);
        assert_eq!(backend.row_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_detail_is_not_cached() {
        let backend = Arc::new(CountingBackend::default());
        let service = service(Arc::clone(&backend));

        assert!(service.detail("missing").await.expect("detail").is_none());
        assert!(service.detail("missing").await.expect("detail").is_none());
        assert_eq!(backend.scalar_calls.load(Ordering::SeqCst), 2);

        let found = service.detail("kia-rio").await.expect("detail");
        assert_eq!(
            found.map(|read| read.payload.value.clone()),
            Some(json!({ "slug": "kia-rio" }))
        );
    }

    #[tokio::test]
    async fn null_filter_options_become_an_empty_object() {
        let service = service(Arc::new(CountingBackend::default()));
        let options = service.filter_options().await.expect("options");
        assert_eq!(options.payload.value, json!({}));
        assert_eq!(options.payload.body.as_ref(), b"{}");
    }

    #[tokio::test]
    async fn revalidating_list_tag_leaves_other_scopes() {
        let backend = Arc::new(CountingBackend::default());
        let service = service(Arc::clone(&backend));

        service.list(toyota(), 1).await.expect("list");
        service.slugs().await.expect("slugs");

        let summary = service.revalidate(&RevalidateRequest {
            tags: vec!["vehicle-list".into()],
            ..Default::default()
        });
        assert_eq!(summary.removed_entries, 1);

        assert_eq!(
            service.slugs().await.expect("slugs").status,
            CacheStatus::Hit
        );
        assert_eq!(
            service.list(toyota(), 1).await.expect("list").status,
            CacheStatus::Miss
        );

        let status = service.status();
        assert_eq!(status.memory_cache.size, 2);
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.available_tags.len(), CacheTag::ALL.len());
    }
}
