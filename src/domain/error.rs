use thiserror::Error;

/// Failure of a backing-store fetch.
///
/// `Clone` because one failed fetch is handed to every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("inventory backend is unavailable: {message}")]
    Unavailable { message: String },
    #[error("inventory backend rejected the query with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("inventory backend returned an unreadable payload: {message}")]
    Decode { message: String },
    #[error("inventory fetch ended without producing a result")]
    Aborted,
}

impl FetchError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Whether retrying later could succeed without a change on our side.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Aborted)
    }
}
