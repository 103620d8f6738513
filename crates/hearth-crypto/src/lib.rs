//! # Hearth Crypto
//!
//! Message protection primitives for the Hearth message layer.
//!
//! This crate provides:
//! - AES-128-CTR + HMAC-SHA1 protect/unprotect, in place over
//!   `payload ‖ tag`
//! - Deterministic counter-block construction so no nonce travels on the
//!   wire
//! - Constant-time tag verification
//! - Zeroized session key material
//!
//! The scheme is authenticate-then-encrypt: the integrity tag is computed
//! over a pseudo-header plus the plaintext payload, appended, and the whole
//! region is encrypted in one counter-mode pass.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constant_time;
pub mod error;
pub mod keys;
pub mod protect;

pub use error::CryptoError;
pub use keys::{Aes128CtrHmacSha1Keys, SessionKeys};
pub use protect::{counter_block, decrypt_verify, encrypt_authenticate};

/// AES-128 encryption key length in bytes.
pub const AES128_KEY_LEN: usize = 16;

/// HMAC-SHA1 integrity key length in bytes.
pub const INTEGRITY_KEY_LEN: usize = 20;

/// HMAC-SHA1 integrity tag length in bytes.
pub const TAG_LEN: usize = 20;

/// AES counter block length in bytes.
pub const COUNTER_BLOCK_LEN: usize = 16;
