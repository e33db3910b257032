//! Error types for the page cache and eviction engine
//!
//! Lock contention and no-benefit skips are not errors; they are
//! [`EvictOutcome`](crate::evict::EvictOutcome) variants and get silently
//! requeued. Only conditions the caller can act on surface here.

use crate::types::PageId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Visibility oracle unavailable: {0}")]
    Oracle(String),

    #[error("Page {0} is not resident")]
    PageNotFound(PageId),

    #[error("Engine is shut down")]
    Shutdown,
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}
