//! Contract the inventory service needs from a backing store.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::error::FetchError;
use crate::domain::vehicles::{ScalarQuery, VehicleFilters, VehiclePage};

/// Narrow read interface over the vehicle inventory.
///
/// Any store that can answer these two calls can sit behind the cache.
#[async_trait]
pub trait InventoryBackend: Send + Sync {
    /// One page of vehicles matching `filters`, with the total match count.
    async fn fetch_rows(&self, filters: &VehicleFilters, page: u32)
    -> Result<VehiclePage, FetchError>;

    /// A single JSON result. `Value::Null` means "nothing there".
    async fn fetch_scalar(&self, query: &ScalarQuery) -> Result<Value, FetchError>;
}
