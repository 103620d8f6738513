//! Session key material.
//!
//! Key material is looked up per message from the fabric directory and
//! zeroized when dropped. This crate never stores keys beyond one
//! protect/unprotect call.

use crate::{AES128_KEY_LEN, INTEGRITY_KEY_LEN};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key material for the AES-128-CTR + HMAC-SHA1 scheme.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Aes128CtrHmacSha1Keys {
    /// AES-128 data encryption key.
    pub enc_key: [u8; AES128_KEY_LEN],
    /// HMAC-SHA1 integrity key.
    pub integrity_key: [u8; INTEGRITY_KEY_LEN],
}

impl Aes128CtrHmacSha1Keys {
    /// Create key material from raw bytes.
    #[must_use]
    pub fn new(enc_key: [u8; AES128_KEY_LEN], integrity_key: [u8; INTEGRITY_KEY_LEN]) -> Self {
        Self {
            enc_key,
            integrity_key,
        }
    }
}

impl std::fmt::Debug for Aes128CtrHmacSha1Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs.
        f.write_str("Aes128CtrHmacSha1Keys(..)")
    }
}

/// Session key material by protection scheme.
#[derive(Debug, Clone)]
pub enum SessionKeys {
    /// Unprotected session; no key material.
    None,
    /// AES-128-CTR encryption with HMAC-SHA1 integrity.
    Aes128CtrHmacSha1(Aes128CtrHmacSha1Keys),
}
