use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{Value, json};
use serial_test::serial;
use trefa::application::backend::InventoryBackend;
use trefa::application::inventory::InventoryService;
use trefa::cache::{CacheConfig, CacheStore, RevalidateRequest};
use trefa::domain::error::FetchError;
use trefa::domain::vehicles::{ScalarQuery, VehicleFilters, VehiclePage};

struct SlowInventory;

#[async_trait]
impl InventoryBackend for SlowInventory {
    async fn fetch_rows(
        &self,
        filters: &VehicleFilters,
        _page: u32,
    ) -> Result<VehiclePage, FetchError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(VehiclePage {
            vehicles: vec![json!({ "marca": filters.marca })],
            total_count: 1,
        })
    }

    async fn fetch_scalar(&self, _query: &ScalarQuery) -> Result<Value, FetchError> {
        Ok(json!([]))
    }
}

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

/// Counter totals and gauge presence keyed by metric name, summed over labels.
fn observed() -> HashMap<String, f64> {
    let mut totals = HashMap::new();
    for (key, _, _, value) in snapshotter().snapshot().into_vec() {
        let amount = match value {
            DebugValue::Counter(count) => count as f64,
            DebugValue::Gauge(level) => level.into_inner(),
            DebugValue::Histogram(samples) => samples.len() as f64,
        };
        *totals.entry(key.key().name().to_string()).or_insert(0.0) += amount;
    }
    totals
}

fn service(capacity: usize) -> InventoryService {
    let store = Arc::new(CacheStore::new(
        NonZeroUsize::new(capacity).expect("non-zero capacity"),
    ));
    InventoryService::new(Arc::new(SlowInventory), store, CacheConfig::default())
}

fn brand(marca: &str) -> VehicleFilters {
    VehicleFilters {
        marca: vec![marca.to_string()],
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn read_path_emits_hit_miss_dedup_and_expiry_metrics() {
    snapshotter();
    let service = service(16);

    let concurrent = join_all((0..8).map(|_| service.list(brand("Mazda"), 1))).await;
    assert!(concurrent.iter().all(Result::is_ok));
    service.list(brand("Mazda"), 1).await.expect("cached read");

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    service.list(brand("Mazda"), 1).await.expect("refetched read");

    let metrics = observed();
    for name in [
        "trefa_cache_hit_total",
        "trefa_cache_miss_total",
        "trefa_cache_dedup_joined_total",
        "trefa_cache_expired_total",
        "trefa_backend_fetch_ms",
    ] {
        assert!(
            metrics.get(name).copied().unwrap_or_default() > 0.0,
            "missing metric: {name}"
        );
    }
    assert!(metrics.contains_key("trefa_cache_entries"));
    assert!(metrics.contains_key("trefa_cache_inflight"));
}

#[tokio::test]
#[serial]
async fn eviction_and_invalidation_are_counted() {
    snapshotter();
    let service = service(1);

    service.list(brand("Kia"), 1).await.expect("first read");
    service.list(brand("Honda"), 1).await.expect("evicting read");
    assert_eq!(service.store().len(), 1);

    let summary = service.revalidate(&RevalidateRequest {
        tags: vec!["vehicles".to_string()],
        ..Default::default()
    });
    assert_eq!(summary.removed_entries, 1);

    let metrics = observed();
    for name in ["trefa_cache_evict_total", "trefa_cache_invalidated_total"] {
        assert!(
            metrics.get(name).copied().unwrap_or_default() > 0.0,
            "missing metric: {name}"
        );
    }
}
