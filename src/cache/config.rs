//! Cache configuration.
//!
//! Runtime view of the `[cache]` settings: store capacity, expiry sweep
//! cadence and the TTL of each cache namespace.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::CacheKind;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LIST_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_DETAIL_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_FILTER_OPTIONS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SLUGS_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serve reads through the in-process store. When off every read goes to the backend.
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction kicks in.
    pub max_entries: usize,
    /// Cadence of the background sweep that drops expired entries. Zero disables it.
    pub sweep_interval: Duration,
    pub list_ttl: Duration,
    pub detail_ttl: Duration,
    pub search_ttl: Duration,
    pub filter_options_ttl: Duration,
    pub slugs_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            list_ttl: DEFAULT_LIST_TTL,
            detail_ttl: DEFAULT_DETAIL_TTL,
            search_ttl: DEFAULT_SEARCH_TTL,
            filter_options_ttl: DEFAULT_FILTER_OPTIONS_TTL,
            slugs_ttl: DEFAULT_SLUGS_TTL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries.get(),
            sweep_interval: settings.sweep_interval,
            list_ttl: settings.list_ttl,
            detail_ttl: settings.detail_ttl,
            search_ttl: settings.search_ttl,
            filter_options_ttl: settings.filter_options_ttl,
            slugs_ttl: settings.slugs_ttl,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Time-to-live applied to entries of the given namespace.
    pub fn ttl_for(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::List => self.list_ttl,
            CacheKind::Detail => self.detail_ttl,
            CacheKind::Search => self.search_ttl,
            CacheKind::FilterOptions => self.filter_options_ttl,
            CacheKind::Slugs => self.slugs_ttl,
        }
    }

    /// Sweep cadence, or `None` when sweeping is disabled with `0`.
    pub fn sweep_period(&self) -> Option<Duration> {
        (!self.sweep_interval.is_zero()).then_some(self.sweep_interval)
    }
}
