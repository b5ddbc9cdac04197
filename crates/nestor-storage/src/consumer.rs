//! Durable consumer cursors: bounded-batch catch-up followed by
//! event-driven tailing, with a persisted position and optional user
//! state.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nestor_types::{Document, DocumentNumber};
use tokio::sync::broadcast;

use crate::error::{Result, StorageError};
use crate::events::StorageEvent;
use crate::storage::Storage;

/// Width in bytes of the cursor file's binary position prefix.
const POSITION_WIDTH: usize = 4;

/// How many documents `catch_up` replays per batch before persisting and
/// checking for cancellation.
const MAX_CATCHUP_BATCH: u32 = 10;

/// A durable cursor over a storage's primary or a named secondary index:
/// replays everything since the last persisted position, then tails live
/// writes via the storage's event bus. `set_state` is legal only from
/// inside the handler passed to [`Consumer::catch_up`]/[`Consumer::poll`].
pub struct Consumer {
    cursor_path: PathBuf,
    index_name: Option<String>,
    position: DocumentNumber,
    state: serde_json::Value,
    handling: bool,
    consuming: bool,
    caught_up: bool,
    subscription: Option<broadcast::Receiver<StorageEvent>>,
}

impl Consumer {
    /// Opens (or creates) a cursor at `cursor_path`, tailing the primary
    /// index when `index_name` is `None` or the named secondary index
    /// otherwise. Starts from document 0 if no cursor file exists yet.
    pub fn open(cursor_path: impl Into<PathBuf>, index_name: Option<String>) -> Result<Self> {
        let cursor_path = cursor_path.into();
        if let Some(parent) = cursor_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let (position, state) = if cursor_path.exists() {
            Self::read_cursor(&cursor_path)?
        } else {
            (DocumentNumber::new(0), serde_json::Value::Null)
        };
        Ok(Self {
            cursor_path,
            index_name,
            position,
            state,
            handling: false,
            consuming: false,
            caught_up: false,
            subscription: None,
        })
    }

    fn read_cursor(path: &Path) -> Result<(DocumentNumber, serde_json::Value)> {
        let mut file = File::open(path).map_err(|e| StorageError::io(path, e))?;
        let mut position_bytes = [0u8; POSITION_WIDTH];
        file.read_exact(&mut position_bytes).map_err(|e| StorageError::io(path, e))?;
        let position = DocumentNumber::new(u32::from_le_bytes(position_bytes));

        let mut state_bytes = Vec::new();
        file.read_to_end(&mut state_bytes).map_err(|e| StorageError::io(path, e))?;
        let state = if state_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&state_bytes).map_err(|e| StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("invalid consumer cursor state: {e}"),
            })?
        };
        Ok((position, state))
    }

    fn persist(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.cursor_path)
            .map_err(|e| StorageError::io(&self.cursor_path, e))?;
        file.write_all(&self.position.as_u32().to_le_bytes())
            .map_err(|e| StorageError::io(&self.cursor_path, e))?;
        let state_bytes = serde_json::to_vec(&self.state).expect("Value always serializes");
        file.write_all(&state_bytes).map_err(|e| StorageError::io(&self.cursor_path, e))?;
        Ok(())
    }

    #[must_use]
    pub fn position(&self) -> DocumentNumber {
        self.position
    }

    #[must_use]
    pub fn state(&self) -> &serde_json::Value {
        &self.state
    }

    #[must_use]
    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    /// Updates the consumer's persisted state. Only legal from inside a
    /// handler invoked by [`Self::catch_up`]/[`Self::poll`].
    ///
    /// # Errors
    /// [`StorageError::StateMutation`] if called outside a handler.
    pub fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        if !self.handling {
            return Err(StorageError::StateMutation);
        }
        self.state = state;
        Ok(())
    }

    /// Marks this consumer as cancelled: an in-progress `catch_up` halts
    /// at the next batch boundary without persisting stale state, as if
    /// `stop()` had been called between batches.
    pub fn stop(&mut self) {
        self.consuming = false;
        self.subscription = None;
    }

    fn deliver<F>(&mut self, number: DocumentNumber, document: &Document, handler: &mut F) -> Result<()>
    where
        F: FnMut(&mut Self, DocumentNumber, &Document) -> Result<()>,
    {
        self.handling = true;
        let result = handler(self, number, document);
        self.handling = false;
        result
    }

    /// Replays every document from the cursor's position up to the
    /// tailed index's current length, in batches of at most
    /// [`MAX_CATCHUP_BATCH`], persisting the cursor after each batch.
    /// Cooperative: call [`Self::stop`] from within a handler to halt
    /// before the next batch starts. Subscribes for live tailing once
    /// caught up — call [`Self::poll`] afterward to deliver new writes.
    pub fn catch_up(
        &mut self,
        storage: &mut Storage,
        mut handler: impl FnMut(&mut Self, DocumentNumber, &Document) -> Result<()>,
    ) -> Result<()> {
        self.consuming = true;
        loop {
            if !self.consuming {
                return Ok(());
            }
            let total = match &self.index_name {
                None => storage.length(),
                Some(name) => storage.secondary_index_length(name)?,
            };
            if self.position.as_u32() >= total {
                break;
            }
            let batch_end = total.min(self.position.as_u32() + MAX_CATCHUP_BATCH);
            let from = i64::from(self.position.as_u32() + 1);
            let until = i64::from(batch_end);
            let documents: Vec<Document> = match &self.index_name {
                None => storage.read_range(from, Some(until)).collect::<Result<_>>()?,
                Some(name) => storage.read_range_indexed(name, from, Some(until)).collect::<Result<_>>()?,
            };
            for document in documents {
                let number = DocumentNumber::new(self.position.as_u32() + 1);
                self.deliver(number, &document, &mut handler)?;
                self.position = number;
            }
            self.persist()?;
            if !self.consuming {
                return Ok(());
            }
        }
        self.caught_up = true;
        self.subscription = Some(storage.subscribe());
        Ok(())
    }

    /// Non-blocking: delivers any live writes that have arrived on the
    /// subscribed event bus since the last poll. Only an event whose
    /// number is exactly `position + 1` is accepted — catch-up overlap
    /// and any future gap are both skipped; a handler error leaves the
    /// cursor unmoved so the same document is retried on the next call —
    /// the at-least-once guarantee.
    ///
    /// # Errors
    /// [`StorageError::NotOpen`] if called before [`Self::catch_up`].
    pub fn poll(&mut self, mut handler: impl FnMut(&mut Self, DocumentNumber, &Document) -> Result<()>) -> Result<()> {
        if self.subscription.is_none() {
            return Err(StorageError::NotOpen {
                what: "consumer (call catch_up first)",
            });
        }
        loop {
            let Some(rx) = self.subscription.as_mut() else {
                break;
            };
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.subscription = None;
                    break;
                }
            };
            let (number, document) = match (&self.index_name, event) {
                (None, StorageEvent::Wrote { document, position, .. }) => (position, document),
                (Some(name), StorageEvent::IndexAdd { name: event_name, number, document }) if *name == event_name => {
                    (number, document)
                }
                _ => continue,
            };
            if number.as_u32() != self.position.as_u32() + 1 {
                continue;
            }
            self.deliver(number, &document, &mut handler)?;
            self.position = number;
            self.persist()?;
        }
        Ok(())
    }
}
