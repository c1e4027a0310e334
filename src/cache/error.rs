use thiserror::Error;

/// Failures raised inside the cache itself.
///
/// None of these reach an HTTP caller: the cache boundary logs them and
/// degrades to a miss or a no-op.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to canonicalize `{kind}` parameters: {source}")]
    Canonicalize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize cached payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cached payload under `{key}` is a `{found}`, caller expected `{expected}`")]
    TypeMismatch {
        key: String,
        found: &'static str,
        expected: &'static str,
    },
    #[error("fingerprint collision on `{key}`")]
    Collision { key: String },
}
