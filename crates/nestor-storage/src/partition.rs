//! The append-only partition file format: buffered writes, dirty reads of
//! unflushed data, torn-write detection on open, truncation at document
//! boundaries, and a read-only variant that tails a writer's file via
//! filesystem notification.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use nestor_types::PartitionId;

use crate::error::{Result, StorageError};
use crate::events::{EventBus, PartitionEvent};
use crate::framing::{
    decode_ascii_field, encode_ascii_field, validate_magic, FRAME_TERMINATOR, LENGTH_PREFIX_LEN,
    PARTITION_HEADER_LEN, WIDTH_FIELD_LEN,
};

/// Tunable knobs a [`Partition`] is opened with. Mirrors the subset of
/// `Storage`'s construction options relevant to a single partition file.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_buffered_documents: usize,
    pub sync_on_flush: bool,
    pub dirty_reads: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            write_buffer_size: 16384,
            max_buffered_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
        }
    }
}

pub(crate) type FlushCallback = Box<dyn FnOnce() + Send>;

/// One append-only file holding a subset of documents for one storage.
pub struct Partition {
    id: PartitionId,
    path: PathBuf,
    file: File,
    /// Committed on-disk bytes, excluding the partition header.
    size: u32,
    options: PartitionOptions,
    write_buffer: Vec<u8>,
    write_buffer_docs: usize,
    flush_callbacks: Vec<FlushCallback>,
    read_buffer: Vec<u8>,
    read_buffer_pos: Option<u32>,
    open: bool,
    events: EventBus<PartitionEvent>,
}

impl Partition {
    /// Opens (creating if absent) the partition file at `path`.
    pub fn open(id: PartitionId, path: impl Into<PathBuf>, options: PartitionOptions) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let size = if existed {
            let len = file.metadata().map_err(|e| StorageError::io(&path, e))?.len();
            if len < PARTITION_HEADER_LEN as u64 {
                return Err(StorageError::CorruptFile {
                    path: path.clone(),
                    reason: "file shorter than partition header".to_string(),
                });
            }
            let mut header = [0u8; PARTITION_HEADER_LEN];
            file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(&path, e))?;
            file.read_exact(&mut header).map_err(|e| StorageError::io(&path, e))?;
            validate_magic(&header, &path)?;
            let width = decode_ascii_field(
                &header[PARTITION_HEADER_LEN - WIDTH_FIELD_LEN..],
                &path,
                "length-prefix width",
            )?;
            if width as usize != LENGTH_PREFIX_LEN {
                return Err(StorageError::CorruptFile {
                    path: path.clone(),
                    reason: format!("unexpected length-prefix width {width}"),
                });
            }
            (len - PARTITION_HEADER_LEN as u64) as u32
        } else {
            write_header(&mut file, &path)?;
            0
        };

        let mut partition = Self {
            id,
            path,
            file,
            size,
            options,
            write_buffer: Vec::new(),
            write_buffer_docs: 0,
            flush_callbacks: Vec::new(),
            read_buffer: Vec::new(),
            read_buffer_pos: None,
            open: true,
            events: EventBus::default(),
        };

        if existed {
            partition.validate_tail()?;
        }

        Ok(partition)
    }

    #[must_use]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    fn ensure_open(&self, what: &'static str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::NotOpen { what })
        }
    }

    /// Scans the last frame for torn-write damage: a tail that does not
    /// end with the terminator, or whose declared length disagrees with
    /// its actual length, is corrupt.
    fn validate_tail(&mut self) -> Result<()> {
        if self.size == 0 {
            return Ok(());
        }
        let end = self.size;
        let last_byte = self.read_raw(end - 1, 1)?;
        if last_byte[0] != FRAME_TERMINATOR {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: "tail does not end with frame terminator".to_string(),
            });
        }
        let start = self.scan_previous_boundary(end)?;
        let frame = self.read_raw(start, end - start)?;
        let frame_len = self.validate_frame_bytes(&frame)?;
        if frame_len != end - start {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: "tail frame length disagrees with declared length".to_string(),
            });
        }
        Ok(())
    }

    /// Checks that `frame` parses as `prefix + payload + terminator` and
    /// returns its total length, without caring where it sits on disk.
    fn validate_frame_bytes(&self, frame: &[u8]) -> Result<u32> {
        if frame.len() < LENGTH_PREFIX_LEN + 1 {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: "frame shorter than minimum length-prefix + terminator".to_string(),
            });
        }
        let data_len = decode_ascii_field(&frame[..LENGTH_PREFIX_LEN], &self.path, "length prefix")? as u32;
        let frame_len = LENGTH_PREFIX_LEN as u32 + data_len + 1;
        if frame_len as usize != frame.len() {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: "declared payload length does not match frame length".to_string(),
            });
        }
        if frame[frame.len() - 1] != FRAME_TERMINATOR {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: "frame missing terminator".to_string(),
            });
        }
        Ok(frame_len)
    }

    /// Reads `len` raw bytes at data-relative `offset` directly from disk,
    /// bypassing both buffers.
    fn read_raw(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let pos = PARTITION_HEADER_LEN as u64 + u64::from(offset);
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| StorageError::io(&self.path, e))?;
        let mut buf = vec![0u8; len as usize];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| StorageError::io(&self.path, e))?;
        Ok(buf)
    }

    /// Scans backward from `end` (the byte right after a frame's
    /// terminator) to find where that frame starts, by locating the
    /// previous terminator. Doubles its read window until the boundary is
    /// found or the start of the data area is reached.
    fn scan_previous_boundary(&mut self, end: u32) -> Result<u32> {
        if end == 0 {
            return Ok(0);
        }
        let mut window: u32 = (self.options.read_buffer_size as u32).max(256);
        loop {
            let window_start = end.saturating_sub(window);
            let buf = self.read_raw(window_start, end - window_start)?;
            let search_region = &buf[..buf.len().saturating_sub(1)];
            if let Some(rel) = search_region.iter().rposition(|&b| b == FRAME_TERMINATOR) {
                return Ok(window_start + rel as u32 + 1);
            }
            if window_start == 0 {
                return Ok(0);
            }
            window = window.saturating_mul(2);
        }
    }

    /// Writes `payload` framed as a document, queuing `callback` to fire
    /// once the write is durably flushed. Returns the pre-write logical
    /// offset of the document.
    pub fn write(&mut self, payload: &[u8], callback: Option<FlushCallback>) -> Result<u32> {
        self.ensure_open("partition write")?;
        let framed = frame_document(payload);
        let offset = self.size + self.write_buffer.len() as u32;

        if let Some(cb) = callback {
            self.flush_callbacks.push(cb);
        }

        if framed.len() > self.options.write_buffer_size {
            self.flush()?;
            self.commit(&framed)?;
        } else {
            self.write_buffer.extend_from_slice(&framed);
            self.write_buffer_docs += 1;
            if self.options.max_buffered_documents > 0
                && self.write_buffer_docs >= self.options.max_buffered_documents
            {
                self.flush()?;
            }
        }

        Ok(offset)
    }

    /// Writes all buffered bytes to disk, advances `size`, drains and
    /// fires queued callbacks, and emits a `flush` event. Safe to call
    /// when nothing is buffered.
    pub fn flush(&mut self) -> Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.write_buffer);
        self.write_buffer_docs = 0;
        self.commit(&bytes)
    }

    fn commit(&mut self, bytes: &[u8]) -> Result<()> {
        let pos = PARTITION_HEADER_LEN as u64 + u64::from(self.size);
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.file.write_all(bytes).map_err(|e| StorageError::io(&self.path, e))?;
        if self.options.sync_on_flush {
            self.file.sync_data().map_err(|e| StorageError::io(&self.path, e))?;
        }
        self.size += bytes.len() as u32;

        for cb in std::mem::take(&mut self.flush_callbacks) {
            cb();
        }
        self.events.emit(PartitionEvent::Flush { size: self.size });
        Ok(())
    }

    /// Reads the document at data-relative `offset`, serving unflushed
    /// bytes from the write buffer when `dirtyReads` is enabled. Returns
    /// `Ok(None)` when `offset` names no document (past the end of
    /// committed — or, with dirty reads, buffered — data).
    pub fn read_from(&mut self, offset: u32, expected_size: Option<u32>) -> Result<Option<Vec<u8>>> {
        self.ensure_open("partition read")?;

        let buffered_start = self.size;
        let buffered_end = self.size + self.write_buffer.len() as u32;
        if self.options.dirty_reads && offset >= buffered_start && offset < buffered_end {
            let local = (offset - buffered_start) as usize;
            if local + LENGTH_PREFIX_LEN > self.write_buffer.len() {
                return Err(StorageError::CorruptFile {
                    path: self.path.clone(),
                    reason: "buffered frame prefix truncated".to_string(),
                });
            }
            let data_len =
                decode_ascii_field(&self.write_buffer[local..local + LENGTH_PREFIX_LEN], &self.path, "length prefix")?
                    as u32;
            let frame_len = LENGTH_PREFIX_LEN as u32 + data_len + 1;
            let frame_end = local + frame_len as usize;
            if frame_end > self.write_buffer.len() {
                return Err(StorageError::CorruptFile {
                    path: self.path.clone(),
                    reason: "buffered frame extends past the write buffer".to_string(),
                });
            }
            // Slice exactly this one frame -- the buffer may hold several
            // documents still awaiting flush.
            let frame = self.write_buffer[local..frame_end].to_vec();
            let frame_len = self.validate_frame_bytes(&frame)?;
            return self.finish_read(offset, frame, frame_len, expected_size).map(Some);
        }

        if offset >= self.size {
            return Ok(None);
        }

        let (payload, frame_len) = match self.read_frame_at(offset)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if let Some(expected) = expected_size {
            if expected != frame_len {
                return Err(StorageError::InvalidDataSize {
                    offset,
                    expected,
                    actual: frame_len,
                });
            }
        }
        Ok(Some(payload))
    }

    fn finish_read(
        &self,
        offset: u32,
        frame: Vec<u8>,
        frame_len: u32,
        expected_size: Option<u32>,
    ) -> Result<Vec<u8>> {
        if let Some(expected) = expected_size {
            if expected != frame_len {
                return Err(StorageError::InvalidDataSize {
                    offset,
                    expected,
                    actual: frame_len,
                });
            }
        }
        Ok(frame[LENGTH_PREFIX_LEN..frame.len() - 1].to_vec())
    }

    /// Reads the committed document starting at data-relative `offset`,
    /// via the read buffer where possible. Returns the payload and the
    /// frame's total on-disk length. `Ok(None)` if the frame would extend
    /// past committed `size`.
    fn read_frame_at(&mut self, offset: u32) -> Result<Option<(Vec<u8>, u32)>> {
        self.ensure_buffer_covers(offset, LENGTH_PREFIX_LEN as u32)?;
        let pos = self.read_buffer_pos.expect("just ensured");
        let local = (offset - pos) as usize;
        let prefix = &self.read_buffer[local..local + LENGTH_PREFIX_LEN];
        let data_len = decode_ascii_field(prefix, &self.path, "length prefix")? as u32;
        let frame_len = LENGTH_PREFIX_LEN as u32 + data_len + 1;

        if offset + frame_len > self.size {
            return Ok(None);
        }

        self.ensure_buffer_covers(offset, frame_len)?;
        let pos = self.read_buffer_pos.expect("just ensured");
        let local = (offset - pos) as usize;

        let payload = if local + frame_len as usize <= self.read_buffer.len() {
            self.read_buffer[local + LENGTH_PREFIX_LEN..local + frame_len as usize - 1].to_vec()
        } else {
            // Frame does not fit the read buffer: a one-shot allocation
            // read of exactly the declared payload length.
            self.read_raw(offset + LENGTH_PREFIX_LEN as u32, data_len)?
        };
        Ok(Some((payload, frame_len)))
    }

    fn ensure_buffer_covers(&mut self, offset: u32, needed: u32) -> Result<()> {
        let covers = self.read_buffer_pos.is_some_and(|pos| {
            offset >= pos && offset + needed <= pos + self.read_buffer.len() as u32
        });
        if covers {
            return Ok(());
        }
        let want = (self.options.read_buffer_size as u32).max(needed);
        let available = self.size.saturating_sub(offset);
        let to_read = want.min(available);
        self.read_buffer = self.read_raw(offset, to_read)?;
        self.read_buffer_pos = Some(offset);
        Ok(())
    }

    /// A lazy, finite, non-restartable forward sequence of documents
    /// starting at `from_offset` (negative values count back from the
    /// current committed `size`).
    #[must_use]
    pub fn read_all(&mut self, from_offset: i64) -> ReadAllIter<'_> {
        ReadAllIter {
            partition: self,
            requested: Some(from_offset),
            cursor: 0,
            done: false,
        }
    }

    /// A lazy, finite, non-restartable backward sequence of documents
    /// ending at `from_offset` (default: current committed `size`).
    #[must_use]
    pub fn read_all_backwards(&mut self, from_offset: Option<i64>) -> ReadAllBackwardsIter<'_> {
        ReadAllBackwardsIter {
            partition: self,
            requested: Some(from_offset.unwrap_or(-1)),
            cursor: 0,
            done: false,
        }
    }

    /// Truncates the file to `offset_to_keep_up_to` data-relative bytes.
    /// Negative truncates to zero; an offset at or past `size` is a no-op.
    /// Otherwise `offset_to_keep_up_to` must land on an exact document
    /// boundary.
    pub fn truncate(&mut self, offset_to_keep_up_to: i64) -> Result<()> {
        self.ensure_open("partition truncate")?;
        // Buffered-but-unflushed documents are not yet reflected in `size`;
        // flush first so the boundary check and the `size` comparison below
        // see the whole logical log, not just its committed prefix.
        self.flush()?;

        let target = if offset_to_keep_up_to < 0 {
            0
        } else {
            offset_to_keep_up_to as u32
        };
        if target >= self.size {
            return Ok(());
        }

        self.validate_boundary(target)?;

        let prev_size = self.size;
        self.file
            .set_len(PARTITION_HEADER_LEN as u64 + u64::from(target))
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.size = target;
        self.read_buffer.clear();
        self.read_buffer_pos = None;

        self.events.emit(PartitionEvent::Truncate {
            prev_size,
            new_size: target,
        });
        Ok(())
    }

    /// Confirms `offset` is exactly the boundary between two frames (or
    /// the start/end of the data area) by walking frames forward from 0.
    fn validate_boundary(&mut self, offset: u32) -> Result<()> {
        let mut cursor = 0u32;
        while cursor < offset {
            match self.read_frame_at(cursor)? {
                Some((_, frame_len)) => cursor += frame_len,
                None => break,
            }
        }
        if cursor != offset {
            return Err(StorageError::CorruptFile {
                path: self.path.clone(),
                reason: format!("offset {offset} does not fall on a document boundary"),
            });
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.flush()?;
        self.open = false;
        Ok(())
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.flush() {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to flush partition on drop");
            }
        }
    }
}

fn write_header(file: &mut File, path: &Path) -> Result<()> {
    let mut header = Vec::with_capacity(PARTITION_HEADER_LEN);
    header.extend_from_slice(nestor_types::HEADER_MAGIC);
    header.extend_from_slice(&encode_ascii_field(LENGTH_PREFIX_LEN as u64, WIDTH_FIELD_LEN));
    file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(path, e))?;
    file.write_all(&header).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// Frames `payload` as `SSSSSSSSSS` + payload + `\n`.
fn frame_document(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len() + 1);
    framed.extend_from_slice(&encode_ascii_field(payload.len() as u64, LENGTH_PREFIX_LEN));
    framed.extend_from_slice(payload);
    framed.push(FRAME_TERMINATOR);
    framed
}

/// Lazy forward iterator produced by [`Partition::read_all`].
pub struct ReadAllIter<'a> {
    partition: &'a mut Partition,
    requested: Option<i64>,
    cursor: u32,
    done: bool,
}

impl Iterator for ReadAllIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(requested) = self.requested.take() {
            let size = i64::from(self.partition.size);
            let resolved = if requested < 0 { size + requested } else { requested };
            if resolved < 0 || resolved as u32 > self.partition.size {
                self.done = true;
                return Some(Err(StorageError::Range {
                    from: requested,
                    until: size,
                    length: self.partition.size,
                }));
            }
            self.cursor = resolved as u32;
        }
        match self.partition.read_frame_at(self.cursor) {
            Ok(Some((payload, frame_len))) => {
                self.cursor += frame_len;
                Some(Ok(payload))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy backward iterator produced by [`Partition::read_all_backwards`].
pub struct ReadAllBackwardsIter<'a> {
    partition: &'a mut Partition,
    requested: Option<i64>,
    cursor: u32,
    done: bool,
}

impl Iterator for ReadAllBackwardsIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(requested) = self.requested.take() {
            let size = i64::from(self.partition.size);
            let resolved = if requested < 0 { size + requested + 1 } else { requested };
            if resolved < 0 || resolved as u32 > self.partition.size {
                self.done = true;
                return Some(Err(StorageError::Range {
                    from: requested,
                    until: size,
                    length: self.partition.size,
                }));
            }
            self.cursor = resolved as u32;
        }
        if self.cursor == 0 {
            self.done = true;
            return None;
        }
        let result = (|| -> Result<(u32, Vec<u8>)> {
            let start = self.partition.scan_previous_boundary(self.cursor)?;
            let frame = self.partition.read_raw(start, self.cursor - start)?;
            self.partition.validate_frame_bytes(&frame)?;
            let payload = frame[LENGTH_PREFIX_LEN..frame.len() - 1].to_vec();
            Ok((start, payload))
        })();
        match result {
            Ok((start, payload)) => {
                self.cursor = start;
                Some(Ok(payload))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A reader opened without the writer lock, tailing a partition file via
/// filesystem notification instead of owning it.
pub struct ReadOnlyPartition {
    inner: Arc<Mutex<Partition>>,
    watcher_shutdown: Option<mpsc::Sender<()>>,
    events: EventBus<PartitionEvent>,
}

impl ReadOnlyPartition {
    /// Opens `path` read-only and starts watching it for size changes,
    /// renames, and removal.
    pub fn open(id: PartitionId, path: impl Into<PathBuf>, options: PartitionOptions) -> Result<Self> {
        let path = path.into();
        let partition = Partition::open(id, &path, options)?;
        let inner = Arc::new(Mutex::new(partition));
        let events: EventBus<PartitionEvent> = EventBus::default();

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        spawn_watcher(path, Arc::clone(&inner), events.clone(), shutdown_rx)?;

        Ok(Self {
            inner,
            watcher_shutdown: Some(shutdown_tx),
            events,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("partition mutex poisoned").is_open()
    }

    pub fn read_from(&self, offset: u32, expected_size: Option<u32>) -> Result<Option<Vec<u8>>> {
        self.inner
            .lock()
            .expect("partition mutex poisoned")
            .read_from(offset, expected_size)
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.watcher_shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.inner.lock().expect("partition mutex poisoned").close();
    }
}

impl Drop for ReadOnlyPartition {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_watcher(
    path: PathBuf,
    inner: Arc<Mutex<Partition>>,
    events: EventBus<PartitionEvent>,
    shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    use notify::{RecursiveMode, Watcher};

    let (tx, rx) = mpsc::channel();
    let mut watcher =
        notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| StorageError::CorruptFile {
            path: path.clone(),
            reason: format!("failed to start file watcher: {e}"),
        })?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| StorageError::CorruptFile {
            path: path.clone(),
            reason: format!("failed to watch partition file: {e}"),
        })?;

    std::thread::spawn(move || {
        // Keep the watcher alive for the thread's lifetime.
        let _watcher = watcher;
        loop {
            if shutdown.try_recv().is_ok() {
                return;
            }
            match rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(Ok(event)) => handle_watch_event(&event, &path, &inner, &events),
                Ok(Err(_)) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    });
    Ok(())
}

fn handle_watch_event(
    event: &notify::Event,
    path: &Path,
    inner: &Arc<Mutex<Partition>>,
    events: &EventBus<PartitionEvent>,
) {
    use notify::EventKind;

    let mut partition = inner.lock().expect("partition mutex poisoned");
    if !partition.is_open() {
        return;
    }
    match event.kind {
        EventKind::Remove(_) => {
            let _ = partition.close();
        }
        EventKind::Modify(_) | EventKind::Create(_) => {
            let Ok(metadata) = std::fs::metadata(path) else {
                let _ = partition.close();
                return;
            };
            let new_size = metadata.len().saturating_sub(PARTITION_HEADER_LEN as u64) as u32;
            let prev_size = partition.size;
            if new_size > prev_size {
                partition.size = new_size;
                partition.read_buffer.clear();
                partition.read_buffer_pos = None;
                events.emit(PartitionEvent::Append { prev_size, new_size });
            } else if new_size < prev_size {
                partition.size = new_size;
                partition.read_buffer.clear();
                partition.read_buffer_pos = None;
                events.emit(PartitionEvent::Truncate { prev_size, new_size });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_fresh(dir: &Path) -> Partition {
        Partition::open(PartitionId::new(0), dir.join("storage"), PartitionOptions::default())
            .expect("open should succeed")
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        let offset = p.write(b"hello", None).unwrap();
        p.flush().unwrap();
        let back = p.read_from(offset, None).unwrap().unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn dirty_read_sees_unflushed_data() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        let offset = p.write(b"pending", None).unwrap();
        let back = p.read_from(offset, None).unwrap().unwrap();
        assert_eq!(back, b"pending");
    }

    #[test]
    fn dirty_read_addresses_one_of_several_buffered_documents() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        let first = p.write(b"first", None).unwrap();
        let second = p.write(b"second", None).unwrap();
        let third = p.write(b"third", None).unwrap();
        // None of these have been flushed -- the write buffer holds all
        // three frames back to back.
        assert_eq!(p.read_from(second, None).unwrap().unwrap(), b"second");
        assert_eq!(p.read_from(first, None).unwrap().unwrap(), b"first");
        assert_eq!(p.read_from(third, None).unwrap().unwrap(), b"third");
    }

    #[test]
    fn dirty_reads_disabled_hides_unflushed_data() {
        let dir = tempdir().unwrap();
        let mut options = PartitionOptions::default();
        options.dirty_reads = false;
        let mut p =
            Partition::open(PartitionId::new(0), dir.path().join("storage"), options).unwrap();
        let offset = p.write(b"pending", None).unwrap();
        assert!(p.read_from(offset, None).unwrap().is_none());
    }

    #[test]
    fn invalid_expected_size_errors() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        let offset = p.write(b"hello", None).unwrap();
        p.flush().unwrap();
        let err = p.read_from(offset, Some(999));
        assert!(matches!(err, Err(StorageError::InvalidDataSize { .. })));
    }

    #[test]
    fn read_past_committed_size_returns_none() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        assert!(p.read_from(1000, None).unwrap().is_none());
    }

    #[test]
    fn read_all_yields_documents_in_order() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        for i in 0..5 {
            p.write(format!("doc-{i}").as_bytes(), None).unwrap();
        }
        p.flush().unwrap();
        let docs: Vec<Vec<u8>> = p.read_all(0).collect::<Result<_>>().unwrap();
        let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("doc-{i}").into_bytes()).collect();
        assert_eq!(docs, expected);
    }

    #[test]
    fn read_all_backwards_yields_documents_in_reverse() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        for i in 0..5 {
            p.write(format!("doc-{i}").as_bytes(), None).unwrap();
        }
        p.flush().unwrap();
        let docs: Vec<Vec<u8>> = p.read_all_backwards(None).collect::<Result<_>>().unwrap();
        let expected: Vec<Vec<u8>> = (0..5).rev().map(|i| format!("doc-{i}").into_bytes()).collect();
        assert_eq!(docs, expected);
    }

    #[test]
    fn truncate_on_boundary_succeeds() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        let first = p.write(b"one", None).unwrap();
        p.write(b"two", None).unwrap();
        p.flush().unwrap();
        let boundary = p.size();
        let _ = first;
        p.write(b"three", None).unwrap();
        p.flush().unwrap();
        p.truncate(i64::from(boundary)).unwrap();
        assert_eq!(p.size(), boundary);
    }

    #[test]
    fn truncate_off_boundary_fails() {
        let dir = tempdir().unwrap();
        let mut p = open_fresh(dir.path());
        p.write(b"one", None).unwrap();
        p.write(b"two", None).unwrap();
        p.flush().unwrap();
        let err = p.truncate(5);
        assert!(matches!(err, Err(StorageError::CorruptFile { .. })));
    }

    #[test]
    fn reopen_detects_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage");
        {
            let mut p = open_fresh(dir.path());
            p.write(b"hello", None).unwrap();
            p.flush().unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        drop(file);

        let err = Partition::open(PartitionId::new(0), &path, PartitionOptions::default());
        assert!(matches!(err, Err(StorageError::CorruptFile { .. })));
    }
}
