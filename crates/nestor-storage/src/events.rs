//! Event-emitter surfaces for partitions, storage and consumers.
//!
//! Each component that fires events owns a broadcast channel and exposes
//! `subscribe()`; events are fired synchronously at defined points in the
//! write/flush/truncate path. Subscribers that fall behind lose the
//! oldest buffered events (`RecvError::Lagged`) rather than blocking the
//! writer — event delivery is advisory (it drives cache invalidation and
//! consumer tailing), never a correctness requirement: correctness always
//! flows through the on-disk index and partition state.

use nestor_types::{Document, DocumentNumber, Entry, PartitionId};
use tokio::sync::broadcast;

/// Events fired by a [`crate::partition::Partition`].
#[derive(Debug, Clone)]
pub enum PartitionEvent {
    /// The write buffer was flushed to disk; `size` is the new committed
    /// size.
    Flush { size: u32 },
    /// The file was truncated from `prev_size` to `new_size`.
    Truncate { prev_size: u32, new_size: u32 },
    /// (Reader variant only) the file grew from `prev_size` to `new_size`
    /// as observed by the file watcher.
    Append { prev_size: u32, new_size: u32 },
}

/// Events fired by a [`crate::storage::Storage`].
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// A document was durably written (or, for a read-only storage,
    /// replayed from a primary-index growth notification).
    Wrote {
        document: Document,
        entry: Entry,
        position: DocumentNumber,
    },
    /// `entry` was appended to the named secondary index because its
    /// document matched.
    IndexAdd {
        name: String,
        number: DocumentNumber,
        document: Document,
    },
    /// A secondary index file was created (either via `ensureIndex` or
    /// observed by a read-only storage's directory watcher).
    IndexCreated { name: String },
    /// A new partition file was opened or observed.
    PartitionCreated { id: PartitionId },
    /// The primary index shrank (read-only storages do not re-emit
    /// secondary-index truncations).
    Truncate {
        prev_length: u32,
        new_length: u32,
    },
}

/// Events fired by a [`crate::consumer::Consumer`].
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// Catch-up finished; the consumer is now tailing live writes.
    CaughtUp,
    /// The cursor file was durably updated.
    Persisted { position: DocumentNumber },
}

/// A broadcast channel wrapper shared by every event-emitting component in
/// this crate.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Creates a new bus buffering up to `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fires `event` to all subscribers, returning how many received it.
    pub fn emit(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to future events. Events fired before subscription are
    /// not included.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_subscribers() {
        let bus: EventBus<PartitionEvent> = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(PartitionEvent::Flush { size: 10 }), 1);
        assert!(matches!(rx.try_recv().unwrap(), PartitionEvent::Flush { size: 10 }));
    }

    #[test]
    fn lagging_subscriber_observes_lag() {
        let bus: EventBus<PartitionEvent> = EventBus::new(2);
        let mut rx = bus.subscribe();
        for size in 0..5 {
            bus.emit(PartitionEvent::Flush { size });
        }
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
