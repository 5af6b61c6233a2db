//! Error types for heddle.

use thiserror::Error;

/// Errors raised while building a balancer.
///
/// Selection and completion never fail; every error surfaces at build time.
#[derive(Debug, Error)]
pub enum HeddleError {
    /// Failure sustain duration is negative.
    #[error("failure sustain must not be negative, got {0}ms")]
    InvalidFailureSustain(i64),

    /// Failure penalty weight is zero.
    #[error("failure weight must be positive, got {0}")]
    InvalidFailureWeight(u32),

    /// Group size is zero.
    #[error("group size must be positive, got {0}")]
    InvalidGroupSize(usize),

    /// Ring buffer window count is zero.
    #[error("window count must be positive, got {0}")]
    InvalidWindowCount(usize),

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

/// Result type alias for heddle operations.
pub type Result<T> = std::result::Result<T, HeddleError>;
