//! Explicit invalidation: by tag, by key, by public path, or everything.
//!
//! This is the only way an entry leaves the store before its TTL. Every
//! operation is idempotent; repeating a request just reports zero removals.

use metrics::counter;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use super::keys::{CacheTag, Fingerprint};
use super::store::CacheStore;

const METRIC_INVALIDATED: &str = "trefa_cache_invalidated_total";

/// Body of a revalidation request. Every field is optional and `null`
/// means absent. Non-string list entries are kept as their JSON text, so an
/// odd tag is reported as ignored rather than failing the request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RevalidateRequest {
    #[serde(deserialize_with = "lenient_list")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub paths: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub keys: Vec<String>,
    #[serde(deserialize_with = "lenient_flag")]
    pub clear_memory: bool,
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    };
    Ok(entries
        .into_iter()
        .filter(|entry| !entry.is_null())
        .map(|entry| match entry {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect())
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(
        Option::<Value>::deserialize(deserializer)?,
        Some(Value::Bool(true))
    ))
}

impl RevalidateRequest {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.paths.is_empty() && self.keys.is_empty() && !self.clear_memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCleared {
    pub tag: CacheTag,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCleared {
    pub key: String,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCleared {
    pub path: String,
    /// Cache scope the path resolved to, or `None` when nothing is cached for it.
    pub scope: Option<String>,
    pub removed: usize,
}

/// What a revalidation actually did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalidateSummary {
    pub tags: Vec<TagCleared>,
    pub ignored_tags: Vec<String>,
    pub keys: Vec<KeyCleared>,
    pub paths: Vec<PathCleared>,
    pub memory_cache_cleared: bool,
    pub removed_entries: usize,
    pub timestamp: String,
}

/// The part of the store a public path's cached data lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathScope {
    Tag(CacheTag),
    Key(Fingerprint),
}

impl PathScope {
    fn describe(&self) -> String {
        match self {
            PathScope::Tag(tag) => format!("tag:{tag}"),
            PathScope::Key(key) => format!("key:{key}"),
        }
    }
}

/// Maps public routes onto the cache scope backing them.
pub struct PathRevalidator;

impl PathRevalidator {
    pub fn scope_for(path: &str) -> Option<PathScope> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["api", "vehicles"] | ["autos"] => Some(PathScope::Tag(CacheTag::VehicleList)),
            ["api", "vehicles", "filters"] => Some(PathScope::Tag(CacheTag::FilterOptions)),
            ["api", "vehicles", "slugs"] => Some(PathScope::Tag(CacheTag::Slugs)),
            ["api", "vehicles", slug] | ["autos", slug] => {
                Some(PathScope::Key(Fingerprint::detail(slug)))
            }
            _ => None,
        }
    }
}

/// Apply a revalidation request to `store`.
///
/// A full clear short-circuits the finer-grained operations. Unknown tags are
/// reported back but otherwise ignored.
pub fn revalidate(store: &CacheStore, request: &RevalidateRequest) -> RevalidateSummary {
    let timestamp = now_rfc3339();

    if request.clear_memory {
        let removed = store.clear();
        counter!(METRIC_INVALIDATED, "scope" => "all").increment(removed as u64);
        info!(target = "trefa::cache::invalidation", removed, "cleared in-process cache");
        return RevalidateSummary {
            tags: Vec::new(),
            ignored_tags: Vec::new(),
            keys: Vec::new(),
            paths: request
                .paths
                .iter()
                .map(|path| PathCleared {
                    path: path.clone(),
                    scope: PathRevalidator::scope_for(path).map(|scope| scope.describe()),
                    removed: 0,
                })
                .collect(),
            memory_cache_cleared: true,
            removed_entries: removed,
            timestamp,
        };
    }

    let mut ignored_tags = Vec::new();
    let mut tags = Vec::new();
    for name in &request.tags {
        match name.parse::<CacheTag>() {
            Ok(tag) if !tags.iter().any(|cleared: &TagCleared| cleared.tag == tag) => {
                let removed = store.invalidate_tag(tag);
                counter!(METRIC_INVALIDATED, "scope" => "tag").increment(removed as u64);
                tags.push(TagCleared { tag, removed });
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target = "trefa::cache::invalidation", %err, "ignoring unknown tag");
                ignored_tags.push(name.clone());
            }
        }
    }

    let keys: Vec<KeyCleared> = request
        .keys
        .iter()
        .map(|key| {
            let removed = store.invalidate_key(key);
            if removed {
                counter!(METRIC_INVALIDATED, "scope" => "key").increment(1);
            }
            KeyCleared {
                key: key.clone(),
                removed,
            }
        })
        .collect();

    let paths: Vec<PathCleared> = request
        .paths
        .iter()
        .map(|path| {
            let scope = PathRevalidator::scope_for(path);
            let removed = match &scope {
                Some(PathScope::Tag(tag)) => store.invalidate_tag(*tag),
                Some(PathScope::Key(key)) => usize::from(store.invalidate_key(key.as_str())),
                None => 0,
            };
            counter!(METRIC_INVALIDATED, "scope" => "path").increment(removed as u64);
            PathCleared {
                path: path.clone(),
                scope: scope.map(|scope| scope.describe()),
                removed,
            }
        })
        .collect();

    let removed_entries = tags.iter().map(|t| t.removed).sum::<usize>()
        + keys.iter().filter(|k| k.removed).count()
        + paths.iter().map(|p| p.removed).sum::<usize>();

    info!(
        target = "trefa::cache::invalidation",
        tags = tags.len(),
        ignored_tags = ignored_tags.len(),
        keys = keys.len(),
        paths = paths.len(),
        removed_entries,
        "revalidated cache"
    );

    RevalidateSummary {
        tags,
        ignored_tags,
        keys,
        paths,
        memory_cache_cleared: false,
        removed_entries,
        timestamp,
    }
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
