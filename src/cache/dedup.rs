//! Single-flight request coalescing.
//!
//! At most one backing fetch runs per key. Callers arriving while a fetch is
//! in flight await the same shared future and receive a clone of its result,
//! success or failure. The slot is cleared as soon as the fetch settles, so a
//! failure is never replayed to later callers.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::error::FetchError;

const METRIC_INFLIGHT: &str = "trefa_cache_inflight";
const METRIC_JOINED: &str = "trefa_cache_dedup_joined_total";

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct InFlight<V> {
    id: u64,
    fetch: SharedFetch<V>,
}

/// Registry of fetches currently in flight, keyed by fingerprint.
pub struct RequestDeduplicator<K, V> {
    inflight: Arc<DashMap<K, InFlight<V>>>,
    next_id: Arc<AtomicU64>,
}

impl<K, V> Clone for RequestDeduplicator<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, V> Default for RequestDeduplicator<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RequestDeduplicator<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `producer` for `key` unless a fetch for `key` is already running,
    /// in which case wait for that one instead.
    ///
    /// The producer's future is spawned onto the runtime. Dropping the
    /// returned future stops waiting but leaves the fetch running for the
    /// other callers.
    pub async fn dedupe<F, Fut>(&self, key: K, producer: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let fetch = match self.inflight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                counter!(METRIC_JOINED).increment(1);
                debug!(target = "trefa::cache::dedup", %key, "joining in-flight fetch");
                slot.get().fetch.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let fetch: SharedFetch<V> = async move {
                    // A dropped sender means the producer task panicked.
                    rx.await.unwrap_or(Err(FetchError::Aborted))
                }
                .boxed()
                .shared();
                slot.insert(InFlight {
                    id,
                    fetch: fetch.clone(),
                });
                gauge!(METRIC_INFLIGHT).set(self.inflight.len() as f64);

                let guard = InFlightGuard {
                    key,
                    id,
                    inflight: Arc::clone(&self.inflight),
                };
                let work = producer();
                tokio::spawn(async move {
                    let result = work.await;
                    drop(guard);
                    let _ = tx.send(result);
                });
                fetch
            }
        };

        fetch.await
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Clears the in-flight slot when the producer task finishes or unwinds.
struct InFlightGuard<K: Eq + Hash, V> {
    key: K,
    id: u64,
    inflight: Arc<DashMap<K, InFlight<V>>>,
}

impl<K: Eq + Hash, V> Drop for InFlightGuard<K, V> {
    fn drop(&mut self) {
        // Only remove our own registration; a newer fetch may own the key now.
        self.inflight.remove_if(&self.key, |_, slot| slot.id == self.id);
        gauge!(METRIC_INFLIGHT).set(self.inflight.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    async fn slow_value(calls: Arc<AtomicUsize>, value: u32) -> Result<u32, FetchError> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(value)
    }

    async fn slow_failure(calls: Arc<AtomicUsize>) -> Result<u32, FetchError> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(FetchError::unavailable("connection refused"))
    }

    async fn exploding() -> Result<u32, FetchError> {
        panic!("producer panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let dedup = RequestDeduplicator::<&'static str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..16).map(|_| {
            let calls = Arc::clone(&calls);
            let dedup = dedup.clone();
            async move { dedup.dedupe("list:abc", || slow_value(calls, 42)).await }
        });
        let results = join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| result == &Ok(42)));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fetch_independently() {
        let dedup = RequestDeduplicator::<&'static str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            dedup.dedupe("list:a", || slow_value(Arc::clone(&calls), 1)),
            dedup.dedupe("list:b", || slow_value(Arc::clone(&calls), 2)),
        );

        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_shared_then_forgotten() {
        let dedup = RequestDeduplicator::<&'static str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..4).map(|_| {
            let calls = Arc::clone(&calls);
            let dedup = dedup.clone();
            async move { dedup.dedupe("detail:x", || slow_failure(calls)).await }
        });
        let results = join_all(waiters).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(
            results
                .iter()
                .all(|result| matches!(result, Err(FetchError::Unavailable { .. })))
        );
        assert_eq!(dedup.in_flight(), 0);

        let retry = dedup
            .dedupe("detail:x", || slow_value(Arc::clone(&calls), 7))
            .await;
        assert_eq!(retry, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_cancel_fetch() {
        let dedup = RequestDeduplicator::<&'static str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let dedup = dedup.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move { dedup.dedupe("slugs:all", || slow_value(calls, 3)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(dedup.in_flight(), 1);

        waiter.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_producer_releases_the_slot() {
        let dedup = RequestDeduplicator::<&'static str, u32>::new();

        let result = dedup.dedupe("list:boom", exploding).await;
        assert_eq!(result, Err(FetchError::Aborted));
        assert_eq!(dedup.in_flight(), 0);
    }
}
