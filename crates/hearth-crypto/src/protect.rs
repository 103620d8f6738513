//! In-place AES-128-CTR + HMAC-SHA1 message protection.
//!
//! Protect: tag = HMAC-SHA1(integrity_key, aad ‖ payload) is appended after
//! the payload, then payload ‖ tag is encrypted in one CTR pass. Unprotect
//! reverses the pass, recomputes the expected tag from the decrypted
//! payload, and compares in constant time.
//!
//! The counter block is derived deterministically from the sender's node id
//! and the message id, so receivers reconstruct it from the header and no
//! nonce is carried on the wire. The session layer guarantees message ids
//! are unique per key, which keeps the keystream unique.

use crate::constant_time::verify_tag;
use crate::error::CryptoError;
use crate::keys::Aes128CtrHmacSha1Keys;
use crate::{COUNTER_BLOCK_LEN, TAG_LEN};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::Zeroize;

type Aes128Ctr = Ctr32BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Build the AES counter block for a message.
///
/// Layout: source node id (8 bytes LE) ‖ message id (4 bytes LE) ‖ 32-bit
/// block counter starting at zero (big-endian, incremented per AES block).
#[must_use]
pub fn counter_block(source_node_id: u64, message_id: u32) -> [u8; COUNTER_BLOCK_LEN] {
    let mut block = [0u8; COUNTER_BLOCK_LEN];
    block[..8].copy_from_slice(&source_node_id.to_le_bytes());
    block[8..12].copy_from_slice(&message_id.to_le_bytes());
    // block[12..16] is the running block counter, starts at zero
    block
}

fn compute_tag(integrity_key: &[u8; 20], aad: &[u8], payload: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha1::new_from_slice(integrity_key).expect("HMAC can take key of any size");
    mac.update(aad);
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

/// Protect `data` in place.
///
/// `data` must be `payload ‖ tag-room`: the final [`TAG_LEN`] bytes are
/// overwritten with the integrity tag before the encryption pass covers the
/// whole region.
///
/// # Errors
///
/// [`CryptoError::InputTooShort`] without room for the tag,
/// [`CryptoError::EmptyPayload`] when there is no payload to protect.
pub fn encrypt_authenticate(
    keys: &Aes128CtrHmacSha1Keys,
    counter: &[u8; COUNTER_BLOCK_LEN],
    aad: &[u8],
    data: &mut [u8],
) -> Result<(), CryptoError> {
    if data.len() < TAG_LEN {
        return Err(CryptoError::InputTooShort {
            expected: TAG_LEN + 1,
            actual: data.len(),
        });
    }
    let payload_len = data.len() - TAG_LEN;
    if payload_len == 0 {
        return Err(CryptoError::EmptyPayload);
    }

    let (payload, tag_room) = data.split_at_mut(payload_len);
    let tag = compute_tag(&keys.integrity_key, aad, payload);
    tag_room.copy_from_slice(&tag);

    let mut cipher = Aes128Ctr::new((&keys.enc_key).into(), counter.into());
    cipher.apply_keystream(data);
    Ok(())
}

/// Unprotect `data` (`ciphertext payload ‖ tag`) in place.
///
/// Returns the payload length on success. On tag mismatch the decrypted
/// bytes are wiped before returning, so callers never observe unverified
/// plaintext.
///
/// # Errors
///
/// [`CryptoError::InputTooShort`] when the region cannot contain a payload
/// and tag, [`CryptoError::IntegrityCheckFailed`] on tag mismatch.
pub fn decrypt_verify(
    keys: &Aes128CtrHmacSha1Keys,
    counter: &[u8; COUNTER_BLOCK_LEN],
    aad: &[u8],
    data: &mut [u8],
) -> Result<usize, CryptoError> {
    if data.len() < TAG_LEN + 1 {
        return Err(CryptoError::InputTooShort {
            expected: TAG_LEN + 1,
            actual: data.len(),
        });
    }
    let payload_len = data.len() - TAG_LEN;

    let mut cipher = Aes128Ctr::new((&keys.enc_key).into(), counter.into());
    cipher.apply_keystream(data);

    let (payload, received_tag) = data.split_at_mut(payload_len);
    let expected = compute_tag(&keys.integrity_key, aad, payload);
    let mut received = [0u8; TAG_LEN];
    received.copy_from_slice(received_tag);

    if !verify_tag(&expected, &received) {
        data.zeroize();
        return Err(CryptoError::IntegrityCheckFailed);
    }
    Ok(payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> Aes128CtrHmacSha1Keys {
        Aes128CtrHmacSha1Keys::new(
            *b"0123456789abcdef",
            *b"integrity-key-bytes!",
        )
    }

    fn protect_then_unprotect(payload: &[u8], aad: &[u8]) -> Vec<u8> {
        let keys = test_keys();
        let counter = counter_block(0x1122_3344_5566_7788, 42);

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter, aad, &mut data).unwrap();

        // ciphertext differs from plaintext
        assert_ne!(&data[..payload.len()], payload);

        let n = decrypt_verify(&keys, &counter, aad, &mut data).unwrap();
        assert_eq!(n, payload.len());
        data.truncate(n);
        data
    }

    #[test]
    fn test_roundtrip() {
        let payload = b"thermostat setpoint 21.5";
        let got = protect_then_unprotect(payload, b"aad");
        assert_eq!(got, payload);
    }

    #[test]
    fn test_roundtrip_single_byte() {
        assert_eq!(protect_then_unprotect(&[0x7F], &[]), vec![0x7F]);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let keys = test_keys();
        let counter = counter_block(1, 1);
        let mut data = vec![0u8; TAG_LEN];
        assert_eq!(
            encrypt_authenticate(&keys, &counter, b"", &mut data),
            Err(CryptoError::EmptyPayload)
        );
    }

    #[test]
    fn test_too_short_rejected() {
        let keys = test_keys();
        let counter = counter_block(1, 1);
        let mut data = vec![0u8; TAG_LEN - 3];
        assert!(matches!(
            encrypt_authenticate(&keys, &counter, b"", &mut data),
            Err(CryptoError::InputTooShort { .. })
        ));
        let mut data = vec![0u8; TAG_LEN];
        assert!(matches!(
            decrypt_verify(&keys, &counter, b"", &mut data),
            Err(CryptoError::InputTooShort { .. })
        ));
    }

    #[test]
    fn test_ciphertext_bit_flip_detected() {
        let keys = test_keys();
        let counter = counter_block(7, 99);
        let payload = b"window sensor open";

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter, b"hdr", &mut data).unwrap();

        for bit in [0usize, 37, 8 * payload.len() - 1] {
            let mut corrupted = data.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                decrypt_verify(&keys, &counter, b"hdr", &mut corrupted),
                Err(CryptoError::IntegrityCheckFailed),
                "bit {bit} flip not detected"
            );
        }
    }

    #[test]
    fn test_tag_bit_flip_detected() {
        let keys = test_keys();
        let counter = counter_block(7, 99);
        let payload = b"lock state";

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter, b"", &mut data).unwrap();

        let tag_start = payload.len();
        for i in 0..TAG_LEN {
            let mut corrupted = data.clone();
            corrupted[tag_start + i] ^= 0x80;
            assert_eq!(
                decrypt_verify(&keys, &counter, b"", &mut corrupted),
                Err(CryptoError::IntegrityCheckFailed)
            );
        }
    }

    #[test]
    fn test_failed_verify_wipes_plaintext() {
        let keys = test_keys();
        let counter = counter_block(7, 99);
        let payload = b"secret reading";

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter, b"", &mut data).unwrap();
        data[0] ^= 1;

        let _ = decrypt_verify(&keys, &counter, b"", &mut data).unwrap_err();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aad_mismatch_detected() {
        let keys = test_keys();
        let counter = counter_block(3, 12);
        let payload = b"dimmer level 40";

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter, b"header-v2", &mut data).unwrap();

        assert_eq!(
            decrypt_verify(&keys, &counter, b"header-v1", &mut data),
            Err(CryptoError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn test_wrong_counter_fails_verify() {
        let keys = test_keys();
        let payload = b"scene recall";

        let mut data = payload.to_vec();
        data.resize(payload.len() + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter_block(3, 12), b"", &mut data).unwrap();

        assert_eq!(
            decrypt_verify(&keys, &counter_block(3, 13), b"", &mut data),
            Err(CryptoError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn test_counter_block_layout() {
        let block = counter_block(0x0807_0605_0403_0201, 0x0D0C_0B0A);
        assert_eq!(&block[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&block[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&block[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_keystream_differs_per_message_id() {
        let keys = test_keys();
        let payload = vec![0u8; 64];

        let mut a = payload.clone();
        a.resize(64 + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter_block(1, 1), b"", &mut a).unwrap();

        let mut b = payload;
        b.resize(64 + TAG_LEN, 0);
        encrypt_authenticate(&keys, &counter_block(1, 2), b"", &mut b).unwrap();

        assert_ne!(&a[..64], &b[..64]);
    }

    #[test]
    fn test_multi_block_payload() {
        // Crosses several AES block boundaries to exercise the running counter.
        let payload = vec![0x5Au8; 1000];
        let got = protect_then_unprotect(&payload, b"x");
        assert_eq!(got, payload);
    }
}
