//! Error types for building and configuring the runtime
//!
//! Turn processing never fails; these errors surface only while the runtime
//! is assembled or its configuration is read.

use thiserror::Error;

use crate::embeddings::{CacheError, IndexError};
use crate::flow::ConfigError;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Flow definitions failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An index could not be populated or built
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// The embedding cache could not be opened
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Reading or writing configuration files failed
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Convenience result alias for runtime construction
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
