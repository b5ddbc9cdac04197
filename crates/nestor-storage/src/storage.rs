//! The storage facade: ties partitions, the primary index, and secondary
//! indexes together behind a single write/read/index API, plus a
//! read-only variant for other processes to tail the same data directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use nestor_config::StorageOptions;
use nestor_types::{ByteOffset, Document, DocumentNumber, Entry, PartitionId, Serializer};

use crate::error::{Result, StorageError};
use crate::events::{EventBus, StorageEvent};
use crate::framing::{normalize_range_bound, LENGTH_PREFIX_LEN};
use crate::index::{Index, IndexOptions};
use crate::lock::WriterLock;
use crate::matcher::{matches, Matcher};
use crate::partition::{Partition, PartitionOptions, ReadOnlyPartition};

/// A function deciding which partition a document belongs to, by name.
/// Documents with the same name share a partition file.
pub type Partitioner = Arc<dyn Fn(&Document) -> String + Send + Sync>;

const PARTITIONS_SIDECAR_SUFFIX: &str = ".partitions";
const PRIMARY_INDEX_SUFFIX: &str = ".index";
const PRIMARY_INDEX_NAME: &str = "primary";

fn default_partitioner() -> Partitioner {
    Arc::new(|_document: &Document| "default".to_string())
}

fn partition_options(options: &StorageOptions) -> PartitionOptions {
    PartitionOptions {
        read_buffer_size: options.read_buffer_size,
        write_buffer_size: options.write_buffer_size,
        max_buffered_documents: options.max_write_buffer_documents,
        sync_on_flush: options.sync_on_flush,
        dirty_reads: options.dirty_reads,
    }
}

fn partition_file_path(options: &StorageOptions, id: PartitionId) -> PathBuf {
    options.data_directory.join(format!("{}.{id}", options.storage_file))
}

fn primary_index_path(options: &StorageOptions) -> PathBuf {
    options
        .effective_index_directory()
        .join(format!("{}{PRIMARY_INDEX_SUFFIX}", options.storage_file))
}

fn secondary_index_path(options: &StorageOptions, name: &str) -> PathBuf {
    options
        .effective_index_directory()
        .join(format!("{}.{name}{PRIMARY_INDEX_SUFFIX}", options.storage_file))
}

fn partitions_sidecar_path(options: &StorageOptions) -> PathBuf {
    options
        .data_directory
        .join(format!("{}{PARTITIONS_SIDECAR_SUFFIX}", options.storage_file))
}

fn load_partition_names(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).map_err(|e| StorageError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("invalid partitions sidecar: {e}"),
    })
}

fn save_partition_names(path: &Path, names: &[String]) -> Result<()> {
    let bytes = serde_json::to_vec(names).expect("Vec<String> always serializes");
    std::fs::write(path, bytes).map_err(|e| StorageError::io(path, e))
}

/// Frame length (prefix + payload + terminator) for a payload of `size`
/// bytes — the amount of partition-file space one document occupies.
fn framed_len(size: u32) -> u32 {
    LENGTH_PREFIX_LEN as u32 + size + 1
}

/// The read-write event storage facade: one primary index, any number of
/// secondary indexes, and the partition files they reference.
pub struct Storage {
    options: StorageOptions,
    _writer_lock: WriterLock,
    serializer: Arc<dyn Serializer>,
    partitioner: Partitioner,
    hmac_secret: Option<Vec<u8>>,
    partitions: HashMap<PartitionId, Partition>,
    partition_names: Vec<String>,
    primary_index: Index,
    secondary_indexes: HashMap<String, (Index, Option<Matcher>)>,
    events: EventBus<StorageEvent>,
    open: bool,
}

impl Storage {
    /// Opens (creating if absent) a storage at `options.data_directory`,
    /// acquiring the exclusive writer lock.
    ///
    /// # Errors
    /// [`StorageError::StorageLocked`] if another process already holds
    /// the writer lock for this data directory.
    pub fn open(
        options: StorageOptions,
        serializer: Arc<dyn Serializer>,
        partitioner: Option<Partitioner>,
        hmac_secret: Option<Vec<u8>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.data_directory)
            .map_err(|e| StorageError::io(&options.data_directory, e))?;
        std::fs::create_dir_all(options.effective_index_directory())
            .map_err(|e| StorageError::io(options.effective_index_directory(), e))?;

        let writer_lock = WriterLock::acquire(&options.data_directory)?;
        let partition_names = load_partition_names(&partitions_sidecar_path(&options))?;

        let index_options = IndexOptions {
            hmac_secret: hmac_secret.clone(),
            sync_on_write: options.sync_on_flush,
        };
        let primary_index = Index::open(primary_index_path(&options), PRIMARY_INDEX_NAME, None, index_options)?;

        Ok(Self {
            options,
            _writer_lock: writer_lock,
            serializer,
            partitioner: partitioner.unwrap_or_else(default_partitioner),
            hmac_secret,
            partitions: HashMap::new(),
            partition_names,
            primary_index,
            secondary_indexes: HashMap::new(),
            events: EventBus::default(),
            open: true,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.primary_index.length()
    }

    fn ensure_open(&self, what: &'static str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::NotOpen { what })
        }
    }

    fn resolve_partition_id(&mut self, name: &str) -> Result<PartitionId> {
        if let Some(pos) = self.partition_names.iter().position(|n| n == name) {
            return Ok(PartitionId::new(pos as u32));
        }
        self.partition_names.push(name.to_string());
        save_partition_names(&partitions_sidecar_path(&self.options), &self.partition_names)?;
        let id = PartitionId::new(self.partition_names.len() as u32 - 1);
        self.events.emit(StorageEvent::PartitionCreated { id });
        Ok(id)
    }

    /// Opens (or returns the cached handle to) the partition named `name`,
    /// creating it if this is the first document routed there.
    pub fn get_partition(&mut self, name: &str) -> Result<&mut Partition> {
        self.ensure_open("get partition")?;
        let id = self.resolve_partition_id(name)?;
        self.get_or_open_partition(id)
    }

    fn get_or_open_partition(&mut self, id: PartitionId) -> Result<&mut Partition> {
        if !self.partitions.contains_key(&id) {
            let path = partition_file_path(&self.options, id);
            let partition = Partition::open(id, path, partition_options(&self.options))?;
            self.partitions.insert(id, partition);
        }
        Ok(self.partitions.get_mut(&id).expect("just inserted"))
    }

    /// Serializes and appends `document`, routing it to a partition via
    /// the configured partitioner, recording its primary index entry, and
    /// evaluating every registered secondary index. `callback` is queued on
    /// the partition and fires once its write buffer is actually flushed
    /// (immediately, if the partition has no buffering configured).
    /// Returns the new document's 1-based number.
    pub fn write(&mut self, document: Document, callback: Option<Box<dyn FnOnce() + Send>>) -> Result<DocumentNumber> {
        self.ensure_open("storage write")?;

        let bytes = self.serializer.serialize(&document);
        let partition_name = (self.partitioner)(&document);
        let partition_id = self.resolve_partition_id(&partition_name)?;

        let partition = self.get_or_open_partition(partition_id)?;
        let position = partition.write(&bytes, callback)?;

        let number = DocumentNumber::new(self.primary_index.length() + 1);
        let entry = Entry {
            number,
            position: ByteOffset::from(position),
            size: bytes.len() as u32,
            partition: partition_id,
        };
        self.primary_index.add(entry)?;

        self.events.emit(StorageEvent::Wrote {
            document: document.clone(),
            entry,
            position: number,
        });

        for (name, (index, matcher)) in &mut self.secondary_indexes {
            if matches(&document, matcher.as_ref()) {
                index.add(entry)?;
                self.events.emit(StorageEvent::IndexAdd {
                    name: name.clone(),
                    number,
                    document: document.clone(),
                });
            }
        }

        Ok(number)
    }

    /// Reads the document recorded as `number`, or `None` if it has been
    /// truncated away or never existed.
    pub fn read(&mut self, number: DocumentNumber) -> Result<Option<Document>> {
        self.ensure_open("storage read")?;
        let Some(entry) = self.primary_index.get(number.as_u32())? else {
            return Ok(None);
        };
        self.read_entry(&entry)
    }

    fn read_entry(&mut self, entry: &Entry) -> Result<Option<Document>> {
        let partition = self.get_or_open_partition(entry.partition)?;
        let Some(bytes) = partition.read_from(entry.position.as_u32(), Some(framed_len(entry.size)))? else {
            return Ok(None);
        };
        let document = self.serializer.deserialize(&bytes).map_err(|reason| StorageError::CorruptFile {
            path: partition.path().to_path_buf(),
            reason,
        })?;
        Ok(Some(document))
    }

    /// A lazy, finite sequence of documents over the inclusive 1-based
    /// range `[from, until]` of global document numbers. Negative bounds
    /// count back from the end; `from > until` (after normalization)
    /// iterates in reverse. `until` defaults to the storage's current
    /// length when omitted. An out-of-bounds range raises
    /// [`StorageError::Range`] on the sequence's first advance, not here.
    #[must_use]
    pub fn read_range(&mut self, from: i64, until: Option<i64>) -> DocumentRangeIter<'_> {
        let until = until.unwrap_or_else(|| i64::from(self.primary_index.length()));
        DocumentRangeIter {
            storage: self,
            selector: IndexSelector::Primary,
            state: DocumentRangeState::Pending { from, until },
        }
    }

    /// Reads the document at local position `number` within the named
    /// secondary index, rather than by global document number. A
    /// secondary index's own positions are 1-based and dense (1, 2, 3,
    /// ... over only the documents it accepted), distinct from the
    /// primary document number stored inside each of its entries.
    pub fn read_indexed(&mut self, index_name: &str, number: u32) -> Result<Option<Document>> {
        self.ensure_open("storage read indexed")?;
        let entry = {
            let (index, _) = self
                .secondary_indexes
                .get_mut(index_name)
                .ok_or(StorageError::NotOpen { what: "named index" })?;
            index.get(number)?
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        self.read_entry(&entry)
    }

    /// A lazy, finite sequence of documents over the inclusive 1-based
    /// local-position range `[from, until]` within the named secondary
    /// index. Same negative/reverse/deferred-error semantics as
    /// [`Self::read_range`]; `until` defaults to the index's current
    /// length when omitted.
    #[must_use]
    pub fn read_range_indexed(&mut self, index_name: &str, from: i64, until: Option<i64>) -> DocumentRangeIter<'_> {
        let length = self
            .secondary_indexes
            .get(index_name)
            .map_or(0, |(index, _)| index.length());
        let until = until.unwrap_or_else(|| i64::from(length));
        DocumentRangeIter {
            storage: self,
            selector: IndexSelector::Secondary(index_name.to_string()),
            state: DocumentRangeState::Pending { from, until },
        }
    }

    /// Current length of the named secondary index.
    pub fn secondary_index_length(&self, index_name: &str) -> Result<u32> {
        self.secondary_indexes
            .get(index_name)
            .map(|(index, _)| index.length())
            .ok_or(StorageError::NotOpen { what: "named index" })
    }

    /// The canonical path for a consumer cursor file tailing `index_name`,
    /// identified by `identifier` (distinguishing multiple independent
    /// consumers of the same index).
    #[must_use]
    pub fn consumer_cursor_path(&self, index_name: &str, identifier: &str) -> PathBuf {
        self.options
            .effective_index_directory()
            .join("consumers")
            .join(format!("{}.{index_name}.{identifier}", self.options.storage_file))
    }

    fn index_options(&self) -> IndexOptions {
        IndexOptions {
            hmac_secret: self.hmac_secret.clone(),
            sync_on_write: self.options.sync_on_flush,
        }
    }

    /// Creates the named secondary index if it does not already exist
    /// (emitting [`StorageEvent::IndexCreated`]) and backfills every
    /// already-written document it missed while absent.
    ///
    /// # Errors
    /// [`StorageError::MatcherMismatch`] if an existing index on disk was
    /// created with a different matcher.
    pub fn ensure_index(&mut self, name: &str, matcher: Option<Matcher>) -> Result<()> {
        self.ensure_open("ensure index")?;
        let path = secondary_index_path(&self.options, name);
        let existed = path.exists();
        let mut index = Index::open(path, name, matcher.as_ref(), self.index_options())?;

        if !existed {
            self.events.emit(StorageEvent::IndexCreated { name: name.to_string() });
        }

        let already_indexed = index.length();
        let total = self.primary_index.length();
        let backlog: Vec<Entry> = self
            .primary_index
            .bounded(already_indexed + 1, total - already_indexed)
            .collect::<Result<_>>()?;

        for primary_entry in backlog {
            if let Some(document) = self.read_entry(&primary_entry)? {
                if matches(&document, matcher.as_ref()) {
                    index.add(primary_entry)?;
                    self.events.emit(StorageEvent::IndexAdd {
                        name: name.to_string(),
                        number: primary_entry.number,
                        document,
                    });
                }
            }
        }

        self.secondary_indexes.insert(name.to_string(), (index, matcher));
        Ok(())
    }

    /// Opens an already-created secondary index without backfilling,
    /// trusting it is already caught up (the normal startup path once
    /// [`Self::ensure_index`] has run at least once).
    pub fn open_index(&mut self, name: &str, matcher: Option<Matcher>) -> Result<()> {
        self.ensure_open("open index")?;
        let path = secondary_index_path(&self.options, name);
        let index = Index::open(path, name, matcher.as_ref(), self.index_options())?;
        self.secondary_indexes.insert(name.to_string(), (index, matcher));
        Ok(())
    }

    /// Whether `document` would be accepted into the named secondary
    /// index, given its registered matcher.
    #[must_use]
    pub fn document_matches(&self, name: &str, document: &Document) -> bool {
        self.secondary_indexes
            .get(name)
            .is_some_and(|(_, matcher)| matches(document, matcher.as_ref()))
    }

    /// Discards every document numbered `number_to_keep_up_to` or later,
    /// from the primary index, every secondary index, and the underlying
    /// partition files.
    pub fn truncate(&mut self, number_to_keep_up_to: u32) -> Result<()> {
        self.ensure_open("storage truncate")?;
        let keep = number_to_keep_up_to.min(self.primary_index.length());
        let kept: Vec<Entry> = self.primary_index.bounded(1, keep).collect::<Result<_>>()?;

        let mut partition_boundary: HashMap<PartitionId, u32> = HashMap::new();
        for entry in &kept {
            let end = entry.position.as_u32() + framed_len(entry.size);
            partition_boundary
                .entry(entry.partition)
                .and_modify(|b| *b = (*b).max(end))
                .or_insert(end);
        }

        let prev_length = self.primary_index.length();
        self.primary_index.truncate(keep)?;
        self.events.emit(StorageEvent::Truncate {
            prev_length,
            new_length: keep,
        });

        for (index, _) in self.secondary_indexes.values_mut() {
            let mut new_len = index.length();
            while new_len > 0 {
                match index.get(new_len)? {
                    Some(e) if e.number.as_u32() > keep => new_len -= 1,
                    _ => break,
                }
            }
            index.truncate(new_len)?;
        }

        for (partition_id, boundary) in partition_boundary {
            if let Some(partition) = self.partitions.get_mut(&partition_id) {
                partition.truncate(i64::from(boundary))?;
            }
        }

        Ok(())
    }

    /// Flushes every open partition's write buffer.
    pub fn flush(&mut self) -> Result<()> {
        for partition in self.partitions.values_mut() {
            partition.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.flush()?;
        for partition in self.partitions.values_mut() {
            partition.close()?;
        }
        self.primary_index.close()?;
        for (index, _) in self.secondary_indexes.values_mut() {
            index.close()?;
        }
        self.open = false;
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close storage on drop");
            }
        }
    }
}

enum IndexSelector {
    Primary,
    Secondary(String),
}

#[derive(Debug, Clone, Copy)]
enum DocumentRangeState {
    Pending { from: i64, until: i64 },
    Forward { current: u32, remaining: u32 },
    Reverse { current: u32, remaining: u32 },
    Done,
}

/// Lazy sequence of documents produced by [`Storage::read_range`] and
/// [`Storage::read_range_indexed`]. Range-bound validity is checked on
/// the first call to `next`, not when the iterator is built.
pub struct DocumentRangeIter<'a> {
    storage: &'a mut Storage,
    selector: IndexSelector,
    state: DocumentRangeState,
}

impl DocumentRangeIter<'_> {
    fn selected_length(&self) -> Result<u32> {
        match &self.selector {
            IndexSelector::Primary => Ok(self.storage.primary_index.length()),
            IndexSelector::Secondary(name) => self
                .storage
                .secondary_indexes
                .get(name)
                .map(|(index, _)| index.length())
                .ok_or(StorageError::NotOpen { what: "named index" }),
        }
    }

    fn selected_entry(&mut self, number: u32) -> Result<Option<Entry>> {
        match &self.selector {
            IndexSelector::Primary => self.storage.primary_index.get(number),
            IndexSelector::Secondary(name) => {
                let (index, _) = self
                    .storage
                    .secondary_indexes
                    .get_mut(name)
                    .ok_or(StorageError::NotOpen { what: "named index" })?;
                index.get(number)
            }
        }
    }

    fn yield_document(&mut self, number: u32) -> Option<Result<Document>> {
        let entry = match self.selected_entry(number) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        match self.storage.read_entry(&entry) {
            Ok(Some(document)) => Some(Ok(document)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for DocumentRangeIter<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if let DocumentRangeState::Pending { from, until } = self.state {
            if let Err(e) = self.storage.ensure_open("storage read range") {
                self.state = DocumentRangeState::Done;
                return Some(Err(e));
            }
            let length = match self.selected_length() {
                Ok(length) => length,
                Err(e) => {
                    self.state = DocumentRangeState::Done;
                    return Some(Err(e));
                }
            };
            let normalized_from = normalize_range_bound(from, length);
            let normalized_until = normalize_range_bound(until, length);
            let in_bounds = |v: i64| v >= 1 && v <= i64::from(length);
            if !in_bounds(normalized_from) || !in_bounds(normalized_until) {
                self.state = DocumentRangeState::Done;
                return Some(Err(StorageError::Range { from, until, length }));
            }
            self.state = if normalized_from <= normalized_until {
                DocumentRangeState::Forward {
                    current: normalized_from as u32,
                    remaining: (normalized_until - normalized_from + 1) as u32,
                }
            } else {
                DocumentRangeState::Reverse {
                    current: normalized_from as u32,
                    remaining: (normalized_from - normalized_until + 1) as u32,
                }
            };
        }

        match self.state {
            DocumentRangeState::Forward { current, remaining } if remaining > 0 => {
                self.state = DocumentRangeState::Forward {
                    current: current + 1,
                    remaining: remaining - 1,
                };
                self.yield_document(current)
            }
            DocumentRangeState::Reverse { current, remaining } if remaining > 0 => {
                self.state = DocumentRangeState::Reverse {
                    current: current.saturating_sub(1),
                    remaining: remaining - 1,
                };
                self.yield_document(current)
            }
            _ => {
                self.state = DocumentRangeState::Done;
                None
            }
        }
    }
}

/// A read-only view of another process's storage, tailing the primary
/// index and partition files via filesystem notification instead of
/// holding the writer lock.
pub struct ReadOnlyStorage {
    options: StorageOptions,
    serializer: Arc<dyn Serializer>,
    hmac_secret: Option<Vec<u8>>,
    shared: Arc<Mutex<ReadOnlyShared>>,
    events: EventBus<StorageEvent>,
    watcher_shutdown: Option<mpsc::Sender<()>>,
}

struct ReadOnlyShared {
    primary_index: Index,
    partitions: HashMap<PartitionId, ReadOnlyPartition>,
    partition_names: Vec<String>,
}

impl ReadOnlyStorage {
    /// Opens a read-only view of `options.data_directory`. Does not
    /// require (or take) the writer lock.
    pub fn open(options: StorageOptions, serializer: Arc<dyn Serializer>, hmac_secret: Option<Vec<u8>>) -> Result<Self> {
        let index_options = IndexOptions {
            hmac_secret: hmac_secret.clone(),
            sync_on_write: false,
        };
        let primary_index = Index::open(primary_index_path(&options), PRIMARY_INDEX_NAME, None, index_options)?;
        let partition_names = load_partition_names(&partitions_sidecar_path(&options))?;

        let shared = Arc::new(Mutex::new(ReadOnlyShared {
            primary_index,
            partitions: HashMap::new(),
            partition_names,
        }));
        let events: EventBus<StorageEvent> = EventBus::default();

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        spawn_index_watcher(
            primary_index_path(&options),
            Arc::clone(&shared),
            serializer.clone(),
            options.clone(),
            hmac_secret.clone(),
            events.clone(),
            shutdown_rx,
        );

        Ok(Self {
            options,
            serializer,
            hmac_secret,
            shared,
            events,
            watcher_shutdown: Some(shutdown_tx),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.shared.lock().expect("mutex poisoned").primary_index.length()
    }

    pub fn read(&self, number: DocumentNumber) -> Result<Option<Document>> {
        let mut shared = self.shared.lock().expect("mutex poisoned");
        let Some(entry) = shared.primary_index.get(number.as_u32())? else {
            return Ok(None);
        };
        read_entry_shared(&mut shared, &self.options, &self.serializer, &entry)
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.watcher_shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ReadOnlyStorage {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_entry_shared(
    shared: &mut ReadOnlyShared,
    options: &StorageOptions,
    serializer: &Arc<dyn Serializer>,
    entry: &Entry,
) -> Result<Option<Document>> {
    if !shared.partitions.contains_key(&entry.partition) {
        let path = partition_file_path(options, entry.partition);
        let partition = ReadOnlyPartition::open(entry.partition, path, partition_options(options))?;
        shared.partitions.insert(entry.partition, partition);
    }
    let partition = shared.partitions.get(&entry.partition).expect("just inserted");
    let Some(bytes) = partition.read_from(entry.position.as_u32(), Some(framed_len(entry.size)))? else {
        return Ok(None);
    };
    let document = serializer.deserialize(&bytes).map_err(|reason| StorageError::CorruptFile {
        path: partition_file_path(options, entry.partition),
        reason,
    })?;
    Ok(Some(document))
}

#[allow(clippy::too_many_arguments)]
fn spawn_index_watcher(
    index_path: PathBuf,
    shared: Arc<Mutex<ReadOnlyShared>>,
    serializer: Arc<dyn Serializer>,
    options: StorageOptions,
    hmac_secret: Option<Vec<u8>>,
    events: EventBus<StorageEvent>,
    shutdown: mpsc::Receiver<()>,
) {
    std::thread::spawn(move || loop {
        if shutdown.recv_timeout(std::time::Duration::from_millis(200)).is_ok() {
            return;
        }
        if shutdown.try_recv() == Err(mpsc::TryRecvError::Disconnected) {
            return;
        }

        let fresh = IndexOptions {
            hmac_secret: hmac_secret.clone(),
            sync_on_write: false,
        };
        let Ok(mut reopened) = Index::open(index_path.clone(), PRIMARY_INDEX_NAME, None, fresh) else {
            continue;
        };

        let mut shared_guard = shared.lock().expect("mutex poisoned");
        let previous_length = shared_guard.primary_index.length();
        let new_length = reopened.length();
        if new_length <= previous_length {
            continue;
        }

        let new_entries: Vec<Entry> = match reopened
            .bounded(previous_length + 1, new_length - previous_length)
            .collect()
        {
            Ok(v) => v,
            Err(_) => continue,
        };
        shared_guard.primary_index = reopened;

        for entry in new_entries {
            if let Ok(Some(document)) = read_entry_shared(&mut shared_guard, &options, &serializer, &entry) {
                events.emit(StorageEvent::Wrote {
                    document,
                    entry,
                    position: entry.number,
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestor_types::JsonSerializer;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(dir: &Path) -> StorageOptions {
        let mut opts = StorageOptions {
            data_directory: dir.to_path_buf(),
            ..StorageOptions::default()
        };
        opts.resolve_paths(dir);
        opts
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        let number = storage.write(json!({"type": "Greeting"}), None).unwrap();
        let doc = storage.read(number).unwrap().unwrap();
        assert_eq!(doc, json!({"type": "Greeting"}));
    }

    #[test]
    fn document_numbers_are_sequential() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        let first = storage.write(json!({"n": 0}), None).unwrap();
        let second = storage.write(json!({"n": 1}), None).unwrap();
        assert_eq!(second.as_u32(), first.as_u32() + 1);
        assert_eq!(storage.length(), 2);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        let err = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None);
        assert!(matches!(err, Err(StorageError::StorageLocked { .. })));
    }

    #[test]
    fn secondary_index_filters_by_shape() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        storage
            .ensure_index("greetings", Some(Matcher::shape(json!({"type": "Greeting"}))))
            .unwrap();

        storage.write(json!({"type": "Greeting"}), None).unwrap();
        storage.write(json!({"type": "Other"}), None).unwrap();

        assert!(storage.document_matches("greetings", &json!({"type": "Greeting"})));
        assert!(!storage.document_matches("greetings", &json!({"type": "Other"})));
    }

    #[test]
    fn ensure_index_backfills_existing_documents() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        storage.write(json!({"type": "Greeting"}), None).unwrap();
        storage.write(json!({"type": "Other"}), None).unwrap();

        storage
            .ensure_index("greetings", Some(Matcher::shape(json!({"type": "Greeting"}))))
            .unwrap();

        let (index, _) = storage.secondary_indexes.get("greetings").unwrap();
        assert_eq!(index.length(), 1);
    }

    #[test]
    fn truncate_removes_documents_from_every_index() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        storage
            .ensure_index("all", Some(Matcher::predicate("always", |_| true)))
            .unwrap();
        for i in 0..5 {
            storage.write(json!({"n": i}), None).unwrap();
        }
        storage.truncate(2).unwrap();
        assert_eq!(storage.length(), 2);
        let (index, _) = storage.secondary_indexes.get("all").unwrap();
        assert_eq!(index.length(), 2);
    }

    #[test]
    fn secondary_index_reads_are_positioned_locally() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        storage
            .ensure_index("odd", Some(Matcher::predicate("odd", |doc| doc["foo"].as_i64().is_some_and(|v| v % 2 == 1))))
            .unwrap();
        for i in 1..=10 {
            storage.write(json!({"foo": i}), None).unwrap();
        }
        assert_eq!(storage.read_indexed("odd", 3).unwrap(), Some(json!({"foo": 5})));
        let range: Vec<Document> = storage.read_range_indexed("odd", 1, Some(3)).collect::<Result<_>>().unwrap();
        assert_eq!(range, vec![json!({"foo": 1}), json!({"foo": 3}), json!({"foo": 5})]);
    }

    #[test]
    fn read_range_covers_end_to_end_scenarios() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        for i in 1..=10 {
            storage.write(json!({"foo": i}), None).unwrap();
        }

        let forward: Vec<Document> = storage.read_range(1, None).collect::<Result<_>>().unwrap();
        assert_eq!(forward.len(), 10);
        assert_eq!(forward[0], json!({"foo": 1}));

        let tail: Vec<Document> = storage.read_range(-4, None).collect::<Result<_>>().unwrap();
        assert_eq!(tail, vec![json!({"foo": 7}), json!({"foo": 8}), json!({"foo": 9}), json!({"foo": 10})]);

        let head: Vec<Document> = storage.read_range(1, Some(-4)).collect::<Result<_>>().unwrap();
        assert_eq!(head.len(), 7);
        assert_eq!(head.last().unwrap(), &json!({"foo": 7}));

        let reversed: Vec<Document> = storage.read_range(10, Some(1)).collect::<Result<_>>().unwrap();
        let expected: Vec<Document> = (1..=10).rev().map(|i| json!({"foo": i})).collect();
        assert_eq!(reversed, expected);
    }

    #[test]
    fn read_range_raises_on_first_advance_not_at_call_site() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(options(dir.path()), Arc::new(JsonSerializer), None, None).unwrap();
        storage.write(json!({"n": 1}), None).unwrap();
        let mut range = storage.read_range(1, Some(100));
        assert!(matches!(range.next(), Some(Err(StorageError::Range { .. }))));
    }

    #[test]
    fn documents_route_by_partitioner() {
        let dir = tempdir().unwrap();
        let partitioner: Partitioner = Arc::new(|doc: &Document| {
            doc.get("type").and_then(|v| v.as_str()).unwrap_or("default").to_string()
        });
        let mut storage =
            Storage::open(options(dir.path()), Arc::new(JsonSerializer), Some(partitioner), None).unwrap();
        storage.write(json!({"type": "a"}), None).unwrap();
        storage.write(json!({"type": "b"}), None).unwrap();
        assert_eq!(storage.partition_names, vec!["a".to_string(), "b".to_string()]);
    }
}
