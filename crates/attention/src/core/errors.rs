//! Error types emitted by the attention block.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
///
/// Every variant is a programmer error: configurations are validated once at
/// construction and reused across many forward calls, so nothing here is
/// worth retrying.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The configuration violates a structural invariant.
    #[error("invalid attention configuration: {0}")]
    InvalidConfig(String),
    /// A scoring function identifier outside the supported set.
    #[error("unknown scoring function '{0}'")]
    UnknownScoringFunction(String),
    /// Cross-attention needs encoder states when no cached projection exists.
    #[error("cross-attention requires source states when no cached key/value state is given")]
    MissingSource,
    /// The supplied tensors do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// A named parameter was absent or mis-shaped during weight import.
    #[error("parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },
    /// A tensor backend failure propagated to the caller.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AttentionError {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        AttentionError::InvalidConfig(msg.into())
    }

    pub(crate) fn shape<S: Into<String>>(context: S) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
