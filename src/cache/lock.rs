//! Poison-tolerant lock access for cache state.
//!
//! A panic while a cache lock is held must not turn every later request into a
//! panic as well. The guards below recover the inner state, record the event
//! and let the caller continue with whatever the map held at that point.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::counter;
use tracing::warn;

const METRIC_LOCK_POISONED: &str = "trefa_cache_lock_poisoned_total";

fn recover<G>(poisoned: PoisonError<G>, op: &'static str, mode: &'static str) -> G {
    warn!(
        target = "trefa::cache::lock",
        op,
        lock_mode = mode,
        result = "poisoned_recovered",
        "cache lock was poisoned by a panicking holder; continuing with recovered state"
    );
    counter!(METRIC_LOCK_POISONED, "mode" => mode).increment(1);
    poisoned.into_inner()
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|err| recover(err, op, "read"))
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|err| recover(err, op, "write"))
}
