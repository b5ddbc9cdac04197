//! Core type definitions for the Nestor storage engine.
//!
//! This crate contains the small, dependency-free vocabulary shared by the
//! partition, index, storage and consumer layers: entity identifiers
//! ([`DocumentNumber`], [`PartitionId`]), the fixed-width [`Entry`] record,
//! and the [`Document`] / [`Serializer`] contract Storage uses to treat a
//! caller's payload as an opaque, serializable value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The 1-based, strictly increasing number assigned to every document
/// written to a storage, regardless of which partition or index it lands
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentNumber(u32);

impl DocumentNumber {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DocumentNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DocumentNumber> for u32 {
    fn from(value: DocumentNumber) -> Self {
        value.0
    }
}

/// The numeric identifier stored inside an [`Entry`] for the partition that
/// holds a document. Distinct from the partitioner's string identifier: the
/// numeric id is assigned the first time a given string identifier is seen
/// and persisted in the primary index's metadata so it survives reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(value: PartitionId) -> Self {
        value.0
    }
}

/// A byte offset within a partition file, relative to the first byte after
/// the partition header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(u32);

impl ByteOffset {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ByteOffset {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ByteOffset> for u32 {
    fn from(value: ByteOffset) -> Self {
        value.0
    }
}

/// Width in bytes of one packed [`Entry`] record on disk.
pub const ENTRY_WIDTH: usize = 16;

/// A fixed-width positional index record: the document's global number, its
/// byte offset inside its partition, the total framed size of the document
/// on disk (including the length prefix and terminator), and the numeric
/// identifier of the containing partition.
///
/// Entries are packed little-endian with no padding, so entry N lives at
/// `header_size + (N - 1) * ENTRY_WIDTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub number: DocumentNumber,
    pub position: ByteOffset,
    pub size: u32,
    pub partition: PartitionId,
}

impl Entry {
    #[must_use]
    pub const fn new(
        number: DocumentNumber,
        position: ByteOffset,
        size: u32,
        partition: PartitionId,
    ) -> Self {
        Self {
            number,
            position,
            size,
            partition,
        }
    }

    /// Packs this entry into its 16-byte little-endian on-disk form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; ENTRY_WIDTH] {
        let mut buf = [0u8; ENTRY_WIDTH];
        buf[0..4].copy_from_slice(&self.number.as_u32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.position.as_u32().to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.partition.as_u32().to_le_bytes());
        buf
    }

    /// Unpacks a 16-byte little-endian record. The caller is responsible for
    /// having validated that `buf` is exactly [`ENTRY_WIDTH`] bytes drawn
    /// from a non-torn record.
    #[must_use]
    pub fn from_bytes(buf: &[u8; ENTRY_WIDTH]) -> Self {
        let number = u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice"));
        let position = u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice"));
        let size = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let partition = u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice"));
        Self {
            number: DocumentNumber::new(number),
            position: ByteOffset::new(position),
            size,
            partition: PartitionId::new(partition),
        }
    }
}

/// The 8-byte magic every Nestor partition and index file begins with.
pub const HEADER_MAGIC: &[u8; 8] = b"nestor01";

/// A document as Storage sees it: an opaque JSON value. Storage only ever
/// needs to (a) hand it to a [`Serializer`] and (b) hand it to a matcher for
/// structural inspection; it never interprets the shape itself.
pub type Document = serde_json::Value;

/// The two-operation contract Storage needs from a serializer plugin.
/// Swappable so callers can use a non-JSON wire format; the default
/// implementation used throughout this crate is [`JsonSerializer`].
pub trait Serializer: Send + Sync {
    /// Renders a document to its wire-format bytes.
    fn serialize(&self, doc: &Document) -> Vec<u8>;

    /// Parses wire-format bytes back into a document.
    ///
    /// # Errors
    /// Returns an error description if `bytes` is not valid for this
    /// serializer's format.
    fn deserialize(&self, bytes: &[u8]) -> Result<Document, String>;
}

/// The default serializer: documents are rendered as UTF-8 JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, doc: &Document) -> Vec<u8> {
        serde_json::to_vec(doc).expect("serde_json::Value always serializes")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Document, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn entry_round_trips_through_bytes_for_any_field_values(number: u32, position: u32, size: u32, partition: u32) {
            let entry = Entry::new(
                DocumentNumber::new(number),
                ByteOffset::new(position),
                size,
                PartitionId::new(partition),
            );
            let bytes = entry.to_bytes();
            prop_assert_eq!(bytes.len(), ENTRY_WIDTH);
            prop_assert_eq!(Entry::from_bytes(&bytes), entry);
        }
    }

    #[test]
    fn document_number_increments() {
        let n = DocumentNumber::new(1);
        assert_eq!(n.next(), DocumentNumber::new(2));
    }

    #[test]
    fn json_serializer_round_trips() {
        let ser = JsonSerializer;
        let doc: Document = serde_json::json!({"foo": "bar"});
        let bytes = ser.serialize(&doc);
        assert_eq!(ser.deserialize(&bytes).unwrap(), doc);
    }

    #[test]
    fn json_serializer_rejects_garbage() {
        let ser = JsonSerializer;
        assert!(ser.deserialize(b"not json").is_err());
    }
}
