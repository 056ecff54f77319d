//! `tempoq` is a persistent, file-backed priority queue keyed by a signed
//! 64-bit integer, typically a nanosecond timestamp. Producers push batches
//! of `(key, blob)` items; consumers read the globally lowest keys first
//! through a zero-copy callback. Named forks give independent read cursors
//! over the same data, and the resident set stays small no matter how much
//! lives on disk.
//!
//! The key space is partitioned into bucket directories by a configurable
//! split function. Each bucket owns a memory-mapped, append-only value log
//! and one append-only index log per fork; reads hand out slices of the
//! map directly, and crash recovery rebuilds any damaged index from the
//! value log.
//!
//! ```no_run
//! use tempoq::{Item, Key, Options, Queue, ReadOp};
//!
//! # fn main() -> tempoq::Result<()> {
//! let queue = Queue::open("/tmp/example-queue", Options::default())?;
//! queue.push(&[
//!     Item { key: Key(2), blob: b"world" },
//!     Item { key: Key(1), blob: b"hello" },
//! ])?;
//!
//! queue.read(2, |_tx, items| {
//!     for item in items {
//!         println!("{}: {:?}", item.key, item.blob);
//!     }
//!     Ok(ReadOp::Pop)
//! })?;
//! # Ok(())
//! # }
//! ```

mod bucket;
pub mod error;
mod index;
pub mod options;
pub mod queue;
mod registry;
pub mod types;
mod vlog;

pub use crate::error::{QueueError, Result};
pub use crate::options::{ErrorMode, Options, SplitConf, SyncMode};
pub use crate::queue::{Fork, Queue, Transaction};
pub use crate::types::{ForkName, Item, Key, Location, OwnedItem, ReadOp};
