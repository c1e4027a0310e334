//! Read-through orchestration: probe the store, coalesce misses, fetch,
//! serialize once, and populate the store under the request's tags.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::histogram;
use serde::Serialize;
use tracing::{debug, warn};

use super::conditional::{CacheStatus, ETag};
use super::dedup::RequestDeduplicator;
use super::error::CacheError;
use super::keys::{CacheTag, Fingerprint};
use super::store::CacheStore;
use crate::domain::error::FetchError;

const METRIC_FETCH_MS: &str = "trefa_backend_fetch_ms";

/// A value together with its serialized JSON body and entity tag.
///
/// Serialization happens once per fetch; hits reuse the body bytes as-is.
#[derive(Debug)]
pub struct CachedPayload<T> {
    pub value: T,
    pub body: Bytes,
    pub etag: ETag,
}

impl<T: Serialize> CachedPayload<T> {
    pub fn encode(value: T) -> Result<Self, CacheError> {
        let body = Bytes::from(serde_json::to_vec(&value).map_err(CacheError::Encode)?);
        let etag = ETag::from_body(&body);
        Ok(Self { value, body, etag })
    }
}

/// Outcome of a read that found something.
#[derive(Debug)]
pub struct CachedRead<T> {
    pub payload: Arc<CachedPayload<T>>,
    pub status: CacheStatus,
}

impl<T> Clone for CachedRead<T> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            status: self.status,
        }
    }
}

/// Expiry and invalidation scope applied to values written by a read.
#[derive(Debug, Clone, Copy)]
pub struct ReadPolicy {
    pub ttl: Duration,
    pub tags: &'static [CacheTag],
}

type Slot<T> = Option<Arc<CachedPayload<T>>>;

/// Read-through front for one payload type over the shared store.
pub struct ReadThrough<T> {
    store: Arc<CacheStore>,
    inflight: RequestDeduplicator<Fingerprint, Slot<T>>,
    enabled: bool,
}

impl<T> ReadThrough<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore>, enabled: bool) -> Self {
        Self {
            store,
            inflight: RequestDeduplicator::new(),
            enabled,
        }
    }

    /// Answer from the store when fresh, otherwise run `fetch` once for all
    /// concurrent callers and cache a `Some` result.
    ///
    /// `fingerprint` is `None` when the request could not be keyed; such
    /// requests, like every request while caching is disabled, go straight
    /// to the backend.
    pub async fn read<F, Fut>(
        &self,
        fingerprint: Option<&Fingerprint>,
        policy: ReadPolicy,
        fetch: F,
    ) -> Result<Option<CachedRead<T>>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, FetchError>> + Send + 'static,
    {
        let Some(fingerprint) = fingerprint.filter(|_| self.enabled) else {
            let payload = fetch_and_encode(fetch(), "bypass").await?;
            return Ok(payload.map(|payload| CachedRead {
                payload,
                status: CacheStatus::Miss,
            }));
        };

        if let Some(payload) = self.store.get::<CachedPayload<T>>(fingerprint) {
            debug!(target = "trefa::cache::read_through", key = %fingerprint, "cache hit");
            return Ok(Some(CachedRead {
                payload,
                status: CacheStatus::Hit,
            }));
        }

        let store = Arc::clone(&self.store);
        let owned = fingerprint.clone();
        let payload = self
            .inflight
            .dedupe(fingerprint.clone(), move || {
                let pending = fetch();
                async move {
                    let payload = fetch_and_encode(pending, owned.kind().as_str()).await?;
                    if let Some(payload) = &payload {
                        store.set(&owned, Arc::clone(payload), policy.ttl, policy.tags);
                    }
                    Ok::<_, FetchError>(payload)
                }
            })
            .await?;

        Ok(payload.map(|payload| CachedRead {
            payload,
            status: CacheStatus::Miss,
        }))
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.in_flight()
    }
}

async fn fetch_and_encode<T, Fut>(pending: Fut, kind: &'static str) -> Result<Slot<T>, FetchError>
where
    T: Serialize,
    Fut: Future<Output = Result<Option<T>, FetchError>>,
{
    let started = Instant::now();
    let fetched = pending.await;
    histogram!(METRIC_FETCH_MS, "kind" => kind).record(started.elapsed().as_secs_f64() * 1000.0);

    let Some(value) = fetched? else {
        return Ok(None);
    };
    match CachedPayload::encode(value) {
        Ok(payload) => Ok(Some(Arc::new(payload))),
        Err(err) => {
            warn!(target = "trefa::cache::read_through", error = %err, kind, "failed to encode fetched value");
            Err(FetchError::decode(err.to_string()))
        }
    }
}
