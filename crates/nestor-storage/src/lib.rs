//! Append-only event storage engine core: partitions, indexes, a storage
//! facade that multiplexes writes across both, and durable consumer
//! cursors for at-least-once streaming delivery.
//!
//! See [`partition`] for the on-disk file format, [`index`] for the
//! positional index, [`storage`] for the facade tying them together
//! behind exclusive-writer semantics, and [`consumer`] for durable
//! tailing cursors.

pub mod consumer;
pub mod error;
pub mod events;
pub mod framing;
pub mod index;
pub mod lock;
pub mod matcher;
pub mod partition;
pub mod storage;

pub use consumer::Consumer;
pub use error::{Result, StorageError};
pub use events::{ConsumerEvent, EventBus, PartitionEvent, StorageEvent};
pub use index::{Index, IndexMetadata, IndexOptions, RangeIter};
pub use lock::WriterLock;
pub use matcher::{Matcher, MatcherDescription};
pub use partition::{Partition, PartitionOptions, ReadOnlyPartition};
pub use storage::{DocumentRangeIter, Partitioner, ReadOnlyStorage, Storage};
