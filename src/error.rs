//! Unified error handling for TileForge
//!
//! A single crate-level error type consolidates the failure taxonomy:
//! - Usage violations (invalid call sequence or arguments)
//! - Unsupported configurations (operator/shape/backend combinations)
//! - Allocation failures (backing store exhausted)
//! - Bounds violations on buffer access
//! - Internal errors (bugs)
//!
//! Cancellation is deliberately *not* an error; a cancelled run is reported
//! through [`crate::op::RunOutcome::Cancelled`].

use std::fmt;

/// Unified error type for TileForge.
#[derive(Debug, thiserror::Error)]
pub enum TileForgeError {
    /// Invalid call sequence or argument; fatal to the call, never retried.
    #[error("usage violation: {0}")]
    Usage(String),

    /// The requested operator/shape/backend combination cannot be realized.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Backing store exhausted or allocation rejected by the engine.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Out-of-bounds buffer access.
    #[error("bounds violation: range [{offset}, {offset}+{size}) exceeds buffer size {buffer_size}")]
    Bounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Internal error (indicates a bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TileForgeError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TileForgeError::Usage(_) | TileForgeError::Bounds { .. } => ErrorCategory::Usage,
            TileForgeError::Unsupported(_) => ErrorCategory::Unsupported,
            TileForgeError::Allocation(_) => ErrorCategory::Allocation,
            TileForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may retry with different parameters (e.g. a smaller
    /// tile size or another backend).
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Allocation)
    }
}

/// Error category for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid call sequence or argument.
    Usage,
    /// Configuration cannot be realized on this backend.
    Unsupported,
    /// Memory exhausted; retry with reduced requirements is reasonable.
    Allocation,
    /// Bug; report it.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Usage => write!(f, "Usage"),
            ErrorCategory::Unsupported => write!(f, "Unsupported"),
            ErrorCategory::Allocation => write!(f, "Allocation"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TileForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TileForgeError::Internal(format!("lock poisoned: {}", err))
    }
}

/// Result alias used throughout the crate.
pub type TileResult<T> = std::result::Result<T, TileForgeError>;

/// Create a usage-violation error with formatted context.
#[macro_export]
macro_rules! usage_error {
    ($msg:expr) => {
        $crate::error::TileForgeError::Usage($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TileForgeError::Usage(format!($fmt, $($arg)*))
    };
}

/// Create an unsupported-configuration error with formatted context.
#[macro_export]
macro_rules! unsupported_error {
    ($msg:expr) => {
        $crate::error::TileForgeError::Unsupported($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TileForgeError::Unsupported(format!($fmt, $($arg)*))
    };
}
