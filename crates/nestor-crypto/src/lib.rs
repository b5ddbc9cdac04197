//! HMAC-SHA256 integrity primitive for index metadata.
//!
//! An index file's header carries a matcher description (the shape or
//! predicate source that decides which documents the index accepts) and,
//! optionally, an HMAC over that description keyed by a process-wide
//! secret. The HMAC exists to reject index files that were tampered with,
//! or mis-associated with the wrong storage, between writer processes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of a computed HMAC-SHA256 tag.
pub const HMAC_LEN: usize = 32;

/// Computes the HMAC-SHA256 of `message` under `secret`.
#[must_use]
pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&tag);
    out
}

/// Verifies `tag` against the HMAC-SHA256 of `message` under `secret` in
/// constant time.
#[must_use]
pub fn verify(secret: &[u8], message: &[u8], tag: &[u8]) -> bool {
    if tag.len() != HMAC_LEN {
        return false;
    }
    let expected = hmac_sha256(secret, message);
    expected.ct_eq(tag).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn matching_secret_verifies() {
        let tag = hmac_sha256(b"secret-a", b"payload");
        assert!(verify(b"secret-a", b"payload", &tag));
    }

    #[test]
    fn mismatched_secret_fails() {
        let tag = hmac_sha256(b"secret-a", b"payload");
        assert!(!verify(b"secret-b", b"payload", &tag));
    }

    #[test]
    fn tampered_message_fails() {
        let tag = hmac_sha256(b"secret-a", b"payload");
        assert!(!verify(b"secret-a", b"payload-tampered", &tag));
    }

    proptest! {
        #[test]
        fn verify_agrees_with_hmac_sha256_for_any_input(secret: Vec<u8>, message: Vec<u8>) {
            let tag = hmac_sha256(&secret, &message);
            prop_assert!(verify(&secret, &message, &tag));
        }

        #[test]
        fn verify_rejects_any_single_bit_flip(secret: Vec<u8>, message: Vec<u8>, flip_index in 0usize..HMAC_LEN, flip_bit in 0u8..8) {
            let mut tag = hmac_sha256(&secret, &message);
            tag[flip_index] ^= 1 << flip_bit;
            prop_assert!(!verify(&secret, &message, &tag));
        }
    }
}
