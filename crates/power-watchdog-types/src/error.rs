//! Error types for data parsing in power-watchdog-types.

use thiserror::Error;

/// Errors that can occur when decoding Power Watchdog protocol data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in power-watchdog-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough bytes to decode the requested structure.
    #[error("Insufficient bytes: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// A DLReport body that is neither one nor two line blocks long.
    #[error("Unexpected DLReport body length {0} (expected 34 or 68)")]
    UnexpectedBodyLength(usize),

    /// Data that cannot be represented on the wire.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using power-watchdog-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
