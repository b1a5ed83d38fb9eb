//! Graphics error types.

use thiserror::Error;

/// Errors surfaced by fallible device and renderer paths.
///
/// These cover external failures (device or swap-chain creation) that startup
/// code is expected to handle gracefully. Programmer errors — stale handles,
/// exhausted fixed-capacity heaps, malformed pass declarations — are asserts,
/// not variants here: continuing with inconsistent GPU state is worse than
/// stopping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    #[error("failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("failed to create swap chain: {0}")]
    SwapchainCreationFailed(String),
    #[error("failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::InitializationFailed("no adapter found".to_string());
        assert_eq!(err.to_string(), "failed to initialize device: no adapter found");

        let err = GraphicsError::InvalidParameter("zero-sized buffer".to_string());
        assert_eq!(err.to_string(), "invalid parameter: zero-sized buffer");
    }
}
