//! Typed configuration failures.
//!
//! Everything else in the crate reports through `anyhow`; these variants
//! exist so callers can tell a malformed run setup apart from a numerical
//! failure without parsing messages.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("Invalid parameter code: {0}")]
    InvalidParameterCode(String),
    #[error("No seed region: {0}")]
    NoSeedRegion(String),
    #[error("Invalid thread count {0}; at least one worker is required.")]
    InvalidThreadCount(usize),
    #[error("Field shape mismatch: {0}")]
    FieldShapeMismatch(String),
    #[error("Invalid region: {0}")]
    InvalidRegion(String),
}
