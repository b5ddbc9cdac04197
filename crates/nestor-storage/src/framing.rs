//! Shared on-disk encoding helpers used by both partitions and indexes:
//! the `"nestor01"` magic, the 8-byte ASCII width descriptor that follows
//! it, and the 10-byte ASCII length prefix that frames each document.

use std::path::Path;

use nestor_types::HEADER_MAGIC;

use crate::error::{Result, StorageError};

/// Width in bytes of the magic field at the start of every partition and
/// index file.
pub const MAGIC_LEN: usize = 8;

/// Width in bytes of the ASCII width descriptor immediately following the
/// magic (partition: length-prefix width; index: entry record width).
pub const WIDTH_FIELD_LEN: usize = 8;

/// Width in bytes of a document's ASCII length prefix.
pub const LENGTH_PREFIX_LEN: usize = 10;

/// Total partition header size: magic + width descriptor.
pub const PARTITION_HEADER_LEN: usize = MAGIC_LEN + WIDTH_FIELD_LEN;

/// The frame terminator. Redundant with the length prefix but deliberate:
/// it lets a boundary scan resynchronize after a torn write.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Encodes `value` as a right-justified, space-padded ASCII decimal field
/// exactly `width` bytes wide.
///
/// # Panics
/// Panics if `value`'s decimal representation does not fit in `width`
/// bytes — callers only ever encode small, bounded values (length
/// prefixes, entry widths) so this indicates a programming error, not
/// user input.
pub fn encode_ascii_field(value: u64, width: usize) -> Vec<u8> {
    let text = value.to_string();
    assert!(text.len() <= width, "value {value} does not fit in {width} ASCII bytes");
    let mut buf = vec![b' '; width];
    buf[width - text.len()..].copy_from_slice(text.as_bytes());
    buf
}

/// Parses a space-padded ASCII decimal field. Returns a `CorruptFile`
/// error (captioned by the caller) if the field is not valid ASCII
/// decimal digits and spaces.
pub fn decode_ascii_field(field: &[u8], path: &Path, what: &str) -> Result<u64> {
    let text = std::str::from_utf8(field).map_err(|_| StorageError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("{what} is not valid UTF-8"),
    })?;
    text.trim().parse::<u64>().map_err(|_| StorageError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("{what} ({text:?}) is not a decimal number"),
    })
}

/// Normalizes a 1-based range bound against `length`: negative values count
/// back from the end (`-K` becomes `length - K + 1`), non-negative values
/// pass through unchanged. The caller is responsible for validating the
/// result falls in `[1, length]`.
#[must_use]
pub fn normalize_range_bound(raw: i64, length: u32) -> i64 {
    if raw < 0 {
        i64::from(length) + raw + 1
    } else {
        raw
    }
}

/// Validates that `header` begins with the Nestor magic, returning a
/// `CorruptFile` error naming `path` otherwise.
pub fn validate_magic(header: &[u8], path: &Path) -> Result<()> {
    if header.len() < MAGIC_LEN || &header[..MAGIC_LEN] != HEADER_MAGIC.as_slice() {
        return Err(StorageError::CorruptFile {
            path: path.to_path_buf(),
            reason: "magic mismatch".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ascii_field_round_trips() {
        let encoded = encode_ascii_field(42, 10);
        assert_eq!(encoded.len(), 10);
        assert_eq!(&encoded, b"        42");
        let decoded = decode_ascii_field(&encoded, Path::new("x"), "length").unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn non_numeric_field_is_corrupt() {
        let err = decode_ascii_field(b"NOTANUM!!!", Path::new("x"), "length");
        assert!(err.is_err());
    }

    proptest! {
        #[test]
        fn any_value_fitting_the_width_round_trips(value in 0u64..=9_999_999_999, width in 10usize..16) {
            let encoded = encode_ascii_field(value, width);
            prop_assert_eq!(encoded.len(), width);
            let decoded = decode_ascii_field(&encoded, Path::new("x"), "length").unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
