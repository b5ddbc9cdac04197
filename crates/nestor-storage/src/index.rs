//! On-disk index files: a self-describing header (magic, entry width,
//! optional HMAC, JSON metadata) followed by fixed-width entry records,
//! addressed directly by document number.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nestor_types::{Entry, ENTRY_WIDTH, HEADER_MAGIC};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::framing::{
    decode_ascii_field, encode_ascii_field, normalize_range_bound, validate_magic, MAGIC_LEN, WIDTH_FIELD_LEN,
};
use crate::matcher::{Matcher, MatcherDescription};

/// Width of the metadata-length ASCII field.
const METADATA_LEN_FIELD: usize = 10;
/// Width of the HMAC presence flag.
const HMAC_FLAG_LEN: usize = 1;
const HMAC_FLAG_PRESENT: u8 = b'1';
const HMAC_FLAG_ABSENT: u8 = b'0';

/// Metadata recorded in an index file's header: the matcher it was
/// created with, and a human-readable name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub matcher: MatcherDescription,
}

/// Construction options for [`Index::open`].
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// When set, the header (magic, widths, metadata) is protected with an
    /// HMAC keyed by this secret and validated on every open.
    pub hmac_secret: Option<Vec<u8>>,
    pub sync_on_write: bool,
}

/// A fixed-width-record index file, addressed directly by the 1-based
/// document number: entry `n` lives at `header_len + (n - 1) * ENTRY_WIDTH`.
pub struct Index {
    path: PathBuf,
    file: File,
    header_len: u64,
    length: u32,
    metadata: IndexMetadata,
    options: IndexOptions,
    open: bool,
}

impl Index {
    /// Creates a new index file with `metadata`, or opens an existing one
    /// and validates it against `matcher` and the configured HMAC secret.
    ///
    /// # Errors
    /// [`StorageError::MatcherMismatch`] if `matcher` disagrees with the
    /// matcher recorded when an existing index was created.
    /// [`StorageError::HmacMismatch`] if the header's HMAC does not verify.
    pub fn open(
        path: impl Into<PathBuf>,
        name: &str,
        matcher: Option<&Matcher>,
        options: IndexOptions,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let (header_len, metadata, length) = if existed {
            Self::read_header(&mut file, &path, &options)?
        } else {
            let metadata = IndexMetadata {
                name: name.to_string(),
                matcher: matcher.map_or(MatcherDescription::None, Matcher::to_description),
            };
            let header_len = Self::write_header(&mut file, &path, &metadata, &options)?;
            (header_len, metadata, 0)
        };

        if let Some(m) = matcher {
            if !m.agrees_with(&metadata.matcher) {
                return Err(StorageError::MatcherMismatch { name: name.to_string() });
            }
        }

        Ok(Self {
            path,
            file,
            header_len,
            length,
            metadata,
            options,
            open: true,
        })
    }

    fn write_header(
        file: &mut File,
        path: &Path,
        metadata: &IndexMetadata,
        options: &IndexOptions,
    ) -> Result<u64> {
        let metadata_bytes =
            serde_json::to_vec(metadata).map_err(|e| StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("failed to serialize index metadata: {e}"),
            })?;

        let mut header = Vec::new();
        header.extend_from_slice(HEADER_MAGIC);
        header.extend_from_slice(&encode_ascii_field(ENTRY_WIDTH as u64, WIDTH_FIELD_LEN));
        header.push(if options.hmac_secret.is_some() {
            HMAC_FLAG_PRESENT
        } else {
            HMAC_FLAG_ABSENT
        });
        header.extend_from_slice(&encode_ascii_field(metadata_bytes.len() as u64, METADATA_LEN_FIELD));
        header.extend_from_slice(&metadata_bytes);

        if let Some(secret) = &options.hmac_secret {
            let tag = nestor_crypto::hmac_sha256(secret, &header);
            header.extend_from_slice(&tag);
        }

        file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(path, e))?;
        file.write_all(&header).map_err(|e| StorageError::io(path, e))?;
        Ok(header.len() as u64)
    }

    fn read_header(file: &mut File, path: &Path, options: &IndexOptions) -> Result<(u64, IndexMetadata, u32)> {
        let mut fixed = vec![0u8; MAGIC_LEN + WIDTH_FIELD_LEN + HMAC_FLAG_LEN + METADATA_LEN_FIELD];
        file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(path, e))?;
        file.read_exact(&mut fixed).map_err(|e| StorageError::io(path, e))?;
        validate_magic(&fixed, path)?;

        let width = decode_ascii_field(
            &fixed[MAGIC_LEN..MAGIC_LEN + WIDTH_FIELD_LEN],
            path,
            "entry width",
        )?;
        if width as usize != ENTRY_WIDTH {
            return Err(StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("unexpected entry width {width}"),
            });
        }

        let hmac_flag = fixed[MAGIC_LEN + WIDTH_FIELD_LEN];
        let metadata_len = decode_ascii_field(
            &fixed[MAGIC_LEN + WIDTH_FIELD_LEN + HMAC_FLAG_LEN..],
            path,
            "metadata length",
        )? as usize;

        let mut metadata_bytes = vec![0u8; metadata_len];
        file.read_exact(&mut metadata_bytes).map_err(|e| StorageError::io(path, e))?;

        let mut header_so_far = fixed;
        header_so_far.extend_from_slice(&metadata_bytes);

        if hmac_flag == HMAC_FLAG_PRESENT {
            let mut tag = [0u8; nestor_crypto::HMAC_LEN];
            file.read_exact(&mut tag).map_err(|e| StorageError::io(path, e))?;
            match &options.hmac_secret {
                Some(secret) if nestor_crypto::verify(secret, &header_so_far, &tag) => {}
                _ => {
                    return Err(StorageError::HmacMismatch { path: path.to_path_buf() });
                }
            }
        } else if options.hmac_secret.is_some() {
            return Err(StorageError::HmacMismatch { path: path.to_path_buf() });
        }

        let metadata: IndexMetadata = serde_json::from_slice(&metadata_bytes).map_err(|e| StorageError::CorruptFile {
            path: path.to_path_buf(),
            reason: format!("failed to parse index metadata: {e}"),
        })?;

        let header_len = MAGIC_LEN as u64
            + WIDTH_FIELD_LEN as u64
            + HMAC_FLAG_LEN as u64
            + METADATA_LEN_FIELD as u64
            + metadata_len as u64
            + if hmac_flag == HMAC_FLAG_PRESENT {
                nestor_crypto::HMAC_LEN as u64
            } else {
                0
            };

        let file_len = file.metadata().map_err(|e| StorageError::io(path, e))?.len();
        let body_len = file_len.saturating_sub(header_len);
        let whole_entries = body_len / ENTRY_WIDTH as u64;
        let remainder = body_len % ENTRY_WIDTH as u64;
        if remainder != 0 {
            tracing::warn!(
                path = %path.display(),
                dangling_bytes = remainder,
                "truncating trailing partial index entry; index is rebuildable from the partition log"
            );
            file.set_len(header_len + whole_entries * ENTRY_WIDTH as u64)
                .map_err(|e| StorageError::io(path, e))?;
        }

        Ok((header_len, metadata, whole_entries as u32))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self, what: &'static str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::NotOpen { what })
        }
    }

    /// Byte offset of the 1-based entry `number` — `number` must be `>= 1`;
    /// the caller is responsible for bounds-checking against `length`.
    fn entry_offset(&self, number: u32) -> u64 {
        self.header_len + u64::from(number - 1) * ENTRY_WIDTH as u64
    }

    /// Appends `entry`, becoming document number `length() + 1` (entries
    /// are addressed by position, so appends must be sequential).
    pub fn add(&mut self, entry: Entry) -> Result<()> {
        self.ensure_open("index add")?;
        let offset = self.entry_offset(self.length + 1);
        let bytes = entry.to_bytes();
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.file.write_all(&bytes).map_err(|e| StorageError::io(&self.path, e))?;
        if self.options.sync_on_write {
            self.file.sync_data().map_err(|e| StorageError::io(&self.path, e))?;
        }
        self.length += 1;
        Ok(())
    }

    /// Reads the entry for the 1-based document `number`, or `None` if it
    /// is below `1` or past `length()`.
    pub fn get(&mut self, number: u32) -> Result<Option<Entry>> {
        self.ensure_open("index get")?;
        if number < 1 || number > self.length {
            return Ok(None);
        }
        let mut bytes = [0u8; ENTRY_WIDTH];
        self.file
            .seek(SeekFrom::Start(self.entry_offset(number)))
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.file.read_exact(&mut bytes).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(Some(Entry::from_bytes(&bytes)))
    }

    /// The last entry recorded, or `None` if the index is empty.
    pub fn last_entry(&mut self) -> Result<Option<Entry>> {
        if self.length == 0 {
            return Ok(None);
        }
        self.get(self.length)
    }

    /// A lazy, finite sequence over the inclusive 1-based range
    /// `[from, until]`. Negative bounds count back from the end
    /// (`-K` maps to `length - K + 1`); if `from > until` after
    /// normalization the sequence runs in reverse. Bounds falling outside
    /// `[1, length]` are not rejected here — the error is raised on the
    /// sequence's first advance.
    #[must_use]
    pub fn range(&mut self, from: i64, until: i64) -> RangeIter<'_> {
        RangeIter {
            index: self,
            state: RangeIterState::Pending { from, until },
        }
    }

    /// A lazy, finite sequence over every entry, in order. Empty (not an
    /// error) when the index is empty.
    #[must_use]
    pub fn all(&mut self) -> RangeIter<'_> {
        let length = self.length;
        self.bounded(1, length)
    }

    /// Internal forward-only sequence over `count` entries starting at
    /// the 1-based `start`, bypassing the public range's negative-bound
    /// normalization and out-of-bounds error. Callers must already know
    /// `start..start+count` is within `[1, length]`, or pass `count == 0`.
    pub(crate) fn bounded(&mut self, start: u32, count: u32) -> RangeIter<'_> {
        RangeIter {
            index: self,
            state: if count == 0 {
                RangeIterState::Done
            } else {
                RangeIterState::Forward { current: start, remaining: count }
            },
        }
    }

    /// Discards entries numbered past `number_to_keep_up_to`.
    pub fn truncate(&mut self, number_to_keep_up_to: u32) -> Result<()> {
        self.ensure_open("index truncate")?;
        if number_to_keep_up_to >= self.length {
            return Ok(());
        }
        let offset = self.entry_offset(number_to_keep_up_to + 1);
        self.file.set_len(offset).map_err(|e| StorageError::io(&self.path, e))?;
        self.length = number_to_keep_up_to;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RangeIterState {
    Pending { from: i64, until: i64 },
    Forward { current: u32, remaining: u32 },
    Reverse { current: u32, remaining: u32 },
    Done,
}

/// Lazy iterator over a contiguous, possibly-reversed entry range,
/// produced by [`Index::range`] and [`Index::all`]. Bounds validity is
/// checked on the first call to `next`, not when the iterator is built.
pub struct RangeIter<'a> {
    index: &'a mut Index,
    state: RangeIterState,
}

impl RangeIter<'_> {
    fn yield_entry(&mut self, number: u32) -> Option<Result<Entry>> {
        match self.index.get(number) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let RangeIterState::Pending { from, until } = self.state {
            let length = self.index.length();
            let normalized_from = normalize_range_bound(from, length);
            let normalized_until = normalize_range_bound(until, length);
            let in_bounds = |v: i64| v >= 1 && v <= i64::from(length);
            if !in_bounds(normalized_from) || !in_bounds(normalized_until) {
                self.state = RangeIterState::Done;
                return Some(Err(StorageError::Range { from, until, length }));
            }
            self.state = if normalized_from <= normalized_until {
                RangeIterState::Forward {
                    current: normalized_from as u32,
                    remaining: (normalized_until - normalized_from + 1) as u32,
                }
            } else {
                RangeIterState::Reverse {
                    current: normalized_from as u32,
                    remaining: (normalized_from - normalized_until + 1) as u32,
                }
            };
        }

        match self.state {
            RangeIterState::Forward { current, remaining } if remaining > 0 => {
                self.state = RangeIterState::Forward {
                    current: current + 1,
                    remaining: remaining - 1,
                };
                self.yield_entry(current)
            }
            RangeIterState::Reverse { current, remaining } if remaining > 0 => {
                self.state = RangeIterState::Reverse {
                    current: current.saturating_sub(1),
                    remaining: remaining - 1,
                };
                self.yield_entry(current)
            }
            _ => {
                self.state = RangeIterState::Done;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestor_types::{ByteOffset, DocumentNumber, PartitionId};
    use tempfile::tempdir;

    fn entry(n: u32) -> Entry {
        Entry {
            number: DocumentNumber::from(n),
            position: ByteOffset::from(n * 16),
            size: 16,
            partition: PartitionId::new(0),
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        idx.add(entry(1)).unwrap();
        idx.add(entry(2)).unwrap();
        assert_eq!(idx.length(), 2);
        assert_eq!(idx.get(2).unwrap(), Some(entry(2)));
    }

    #[test]
    fn get_rejects_number_below_one() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        idx.add(entry(1)).unwrap();
        assert_eq!(idx.get(0).unwrap(), None);
    }

    #[test]
    fn last_entry_and_forward_range() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        for n in 1..=5 {
            idx.add(entry(n)).unwrap();
        }
        assert_eq!(idx.last_entry().unwrap(), Some(entry(5)));
        let collected: Vec<Entry> = idx.range(1, 3).collect::<Result<_>>().unwrap();
        assert_eq!(collected, vec![entry(1), entry(2), entry(3)]);
    }

    #[test]
    fn range_with_negative_bound_counts_from_the_end() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        for n in 1..=10 {
            idx.add(entry(n)).unwrap();
        }
        let collected: Vec<Entry> = idx.range(1, -4).collect::<Result<_>>().unwrap();
        assert_eq!(collected.len(), 7);
        assert_eq!(collected.last().unwrap().number.as_u32(), 7);

        let collected: Vec<Entry> = idx.range(-4, -1).collect::<Result<_>>().unwrap();
        assert_eq!(collected, vec![entry(7), entry(8), entry(9), entry(10)]);
    }

    #[test]
    fn range_iterates_in_reverse_when_from_exceeds_until() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        for n in 1..=10 {
            idx.add(entry(n)).unwrap();
        }
        let collected: Vec<Entry> = idx.range(10, 1).collect::<Result<_>>().unwrap();
        assert_eq!(collected, vec![
            entry(10), entry(9), entry(8), entry(7), entry(6), entry(5), entry(4), entry(3), entry(2), entry(1),
        ]);
    }

    #[test]
    fn range_raises_on_first_advance_not_at_call_site() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        for n in 1..=3 {
            idx.add(entry(n)).unwrap();
        }
        // Constructing the range with an out-of-bounds `until` must not panic
        // or error by itself -- the error only surfaces once polled.
        let mut range = idx.range(1, 10);
        assert!(matches!(range.next(), Some(Err(StorageError::Range { .. }))));
    }

    #[test]
    fn all_is_empty_not_an_error_when_index_is_empty() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        let collected: Vec<Entry> = idx.all().collect::<Result<_>>().unwrap();
        assert!(collected.is_empty());
    }

    #[test]
    fn truncate_shrinks_length() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), "primary", None, IndexOptions::default()).unwrap();
        for n in 1..=5 {
            idx.add(entry(n)).unwrap();
        }
        idx.truncate(2).unwrap();
        assert_eq!(idx.length(), 2);
        assert_eq!(idx.get(3).unwrap(), None);
        assert_eq!(idx.get(2).unwrap(), Some(entry(2)));
    }

    #[test]
    fn reopen_preserves_entries_and_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut idx = Index::open(&path, "by-type", None, IndexOptions::default()).unwrap();
            idx.add(entry(1)).unwrap();
        }
        let mut idx = Index::open(&path, "by-type", None, IndexOptions::default()).unwrap();
        assert_eq!(idx.length(), 1);
        assert_eq!(idx.metadata().name, "by-type");
    }

    #[test]
    fn mismatched_matcher_on_reopen_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let shape_one = Matcher::shape(serde_json::json!({"type": "a"}));
        Index::open(&path, "by-type", Some(&shape_one), IndexOptions::default()).unwrap();

        let shape_two = Matcher::shape(serde_json::json!({"type": "b"}));
        let err = Index::open(&path, "by-type", Some(&shape_two), IndexOptions::default());
        assert!(matches!(err, Err(StorageError::MatcherMismatch { .. })));
    }

    #[test]
    fn hmac_protected_header_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let options = IndexOptions {
            hmac_secret: Some(b"topsecret".to_vec()),
            sync_on_write: false,
        };
        Index::open(&path, "primary", None, options.clone()).unwrap();
        assert!(Index::open(&path, "primary", None, options).is_ok());

        let wrong = IndexOptions {
            hmac_secret: Some(b"wrongsecret".to_vec()),
            sync_on_write: false,
        };
        let err = Index::open(&path, "primary", None, wrong);
        assert!(matches!(err, Err(StorageError::HmacMismatch { .. })));
    }

    #[test]
    fn dangling_partial_entry_is_repaired_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut idx = Index::open(&path, "primary", None, IndexOptions::default()).unwrap();
            idx.add(entry(1)).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len + 5).unwrap();
        drop(file);

        let mut idx = Index::open(&path, "primary", None, IndexOptions::default()).unwrap();
        assert_eq!(idx.length(), 1);
        assert_eq!(idx.get(1).unwrap(), Some(entry(1)));
    }
}
