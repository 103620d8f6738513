//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Integrity tag did not match the received data
    #[error("message integrity check failed")]
    IntegrityCheckFailed,

    /// Zero-length payloads cannot be protected
    #[error("empty payload")]
    EmptyPayload,

    /// Buffer too short to hold a payload and its integrity tag
    #[error("input too short: expected at least {expected}, got {actual}")]
    InputTooShort {
        /// Minimum length for the operation
        expected: usize,
        /// Actual length supplied
        actual: usize,
    },
}
