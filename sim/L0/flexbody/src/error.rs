//! Error types for rope and cloth simulation.

use std::collections::TryReserveError;

use thiserror::Error;

/// Errors that can occur while building, stepping or reconstructing a
/// flexible body.
///
/// Every error is scoped to a single body. Callers that drive many bodies
/// (see [`FrameDriver`](crate::driver::FrameDriver)) deactivate the failing
/// body and keep the others running.
#[derive(Debug, Error)]
pub enum FlexError {
    /// Particle lattice cannot produce a spring network (e.g. zero particles).
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Configuration values are out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Attachment connector is structurally invalid or unresolvable.
    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    /// Index out of bounds.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Particle or spring storage could not be allocated.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Numerical error (`NaN`, infinity).
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Operation requires an active body.
    #[error("Body is not active: {0}")]
    Inactive(String),
}

impl FlexError {
    /// Create an invalid topology error.
    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid attachment error.
    pub fn invalid_attachment(msg: impl Into<String>) -> Self {
        Self::InvalidAttachment(msg.into())
    }

    /// Create an index out of bounds error.
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Self::IndexOutOfBounds(msg.into())
    }

    /// Create a resource exhaustion error.
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical_error(msg: impl Into<String>) -> Self {
        Self::NumericalError(msg.into())
    }

    /// Create an inactive body error.
    pub fn inactive(msg: impl Into<String>) -> Self {
        Self::Inactive(msg.into())
    }

    /// Whether the body that raised this error should be taken out of
    /// simulation.
    #[must_use]
    pub const fn is_fatal_for_body(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::NumericalError(_))
    }
}

impl From<TryReserveError> for FlexError {
    fn from(err: TryReserveError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}

/// Result type for flexible body operations.
pub type Result<T> = std::result::Result<T, FlexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlexError::invalid_attachment("connector 7 resolves to the scene root");
        assert_eq!(
            err.to_string(),
            "Invalid attachment: connector 7 resolves to the scene root"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(FlexError::resource_exhausted("particles").is_fatal_for_body());
        assert!(FlexError::numerical_error("NaN").is_fatal_for_body());
        assert!(!FlexError::invalid_config("substep").is_fatal_for_body());
    }

    #[test]
    fn test_from_try_reserve() {
        let mut v: Vec<u64> = Vec::new();
        let err = v.try_reserve(usize::MAX).map_err(FlexError::from);
        assert!(matches!(err, Err(FlexError::ResourceExhausted(_))));
    }
}
