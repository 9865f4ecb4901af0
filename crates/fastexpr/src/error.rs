//! Error types for fastexpr

use fastexpr_config::ConfigError;
use thiserror::Error;

use crate::value::Thrown;

/// The compiler declined a tree. Callers fall back to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotSupported {
    /// A node kind or feature combination has no compiled form
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A parameter is referenced outside every scope that declares it
    #[error("parameter `{name}` is not declared in any enclosing scope")]
    InvalidCapture { name: String },
}

impl NotSupported {
    pub(crate) fn construct(what: impl Into<String>) -> Self {
        NotSupported::UnsupportedConstruct(what.into())
    }
}

/// Main error type for fastexpr operations
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    NotSupported(#[from] NotSupported),

    /// The expression threw and nothing handled it
    #[error(transparent)]
    Thrown(#[from] Thrown),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fastexpr operations
pub type Result<T> = std::result::Result<T, Error>;
