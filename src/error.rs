//! Error taxonomy for the RAVE sampler.
//!
//! Nothing in the crate recovers locally: every error aborts the current run.
//! Partially written inversion caches are left on disk on purpose, they are the
//! resume point of the next attempt.

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, RaveError>;

#[derive(Debug, thiserror::Error)]
pub enum RaveError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid frame order: {0}")]
    Permutation(String),

    #[error("inconsistent cache at {location}: {reason}")]
    CacheInconsistency { location: String, reason: String },

    #[error("{capability} failed")]
    Capability {
        capability: &'static str,
        #[source]
        source: candle_core::Error,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RaveError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn cache(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheInconsistency {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a failure reported by an external model capability.
    pub fn capability(capability: &'static str) -> impl FnOnce(candle_core::Error) -> Self {
        move |source| Self::Capability { capability, source }
    }
}
