use http::{HeaderMap, StatusCode};
use thiserror::Error;

/// Error kinds surfaced at the cache boundary. Everything else travels as
/// `anyhow::Error` and is folded into `Storage` before leaving the driver.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object not found")]
    NotFound,

    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("upstream returned status {status}")]
    UpstreamStatus {
        status: StatusCode,
        headers: HeaderMap,
    },

    #[error("upstream transport: {0}")]
    UpstreamTransport(#[source] anyhow::Error),

    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("block write callback: {0}")]
    WriteCallback(#[source] std::io::Error),
}

impl CacheError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Storage(err.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        CacheError::UpstreamTransport(err.into())
    }

    /// Whether the error maps to a missing key rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
