//! Error types for the message layer.

use crate::buffer::PayloadBuf;
use hearth_crypto::CryptoError;
use hearth_transport::TransportError;
use std::io;
use thiserror::Error;

/// Message layer errors
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument to an API call
    #[error("invalid argument")]
    InvalidArgument,

    /// Object is in the wrong state for the requested operation
    #[error("incorrect state for operation")]
    IncorrectState,

    /// Header declares a message version this implementation does not speak
    #[error("unsupported message version: {0}")]
    UnsupportedMessageVersion(u8),

    /// Header declares an unknown encryption type
    #[error("unsupported encryption type: {0}")]
    UnsupportedEncryptionType(u8),

    /// Message length field or structure is inconsistent
    #[error("invalid message length")]
    InvalidMessageLength,

    /// Buffer ends before the fields its header declares
    #[error("message incomplete: expected at least {expected} bytes, got {actual}")]
    MessageIncomplete {
        /// Minimum length the header implies
        expected: usize,
        /// Actual buffer length
        actual: usize,
    },

    /// Encoded message would exceed the maximum size
    #[error("message too long: {len} exceeds {max}")]
    MessageTooLong {
        /// Encoded length
        len: usize,
        /// Applicable maximum
        max: usize,
    },

    /// Not enough reserved head/tail room to encode in place
    #[error("buffer too small for in-place encode")]
    BufferTooSmall,

    /// Cryptographic failure (integrity check, malformed input)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Destination address could not be resolved
    #[error("invalid address: destination unresolvable")]
    InvalidAddress,

    /// Message is addressed to a different node
    #[error("message addressed to another node")]
    InvalidDestinationNode,

    /// No endpoint is ready for the destination's address family
    #[error("no endpoint ready for destination")]
    NoEndpoint,

    /// A fixed-capacity pool has no free slot
    #[error("pool exhausted")]
    PoolExhausted,

    /// Buffer or object allocation failed
    #[error("out of memory")]
    NoMemory,

    /// No session material exists for the peer/key pair
    #[error("no session for peer and key id")]
    NoSession,

    /// Transport layer failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O failure from a socket operation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this failure should prompt a peer-facing key-error
    /// notification (integrity failure or missing session material).
    #[must_use]
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            Error::Crypto(CryptoError::IntegrityCheckFailed) | Error::NoSession
        )
    }
}

/// A send failure, carrying the payload buffer back to the caller when the
/// retain-buffer flag was set.
#[derive(Debug)]
pub struct SendError {
    /// The underlying failure.
    pub error: Error,
    /// The payload buffer, present iff the caller asked to retain it.
    pub buffer: Option<PayloadBuf>,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
