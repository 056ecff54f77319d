//! The public queue surface. A [`Queue`] owns one registry behind a single
//! mutex; every public operation serializes on it. [`Fork`] is a thin
//! handle that routes reads and deletes to a named cursor.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{QueueError, Result};
use crate::options::Options;
use crate::registry::Registry;
use crate::types::{ForkName, Item, Key, OwnedItem, ReadOp};

/// Handle available to the read callback. Pushing through it is the only
/// queue operation allowed from inside a callback: the items are buffered
/// and applied once the read finishes, so the value logs backing the
/// callback's slices cannot move underneath it.
pub struct Transaction {
    pending: Vec<OwnedItem>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, items: &[Item<'_>]) -> Result<()> {
        self.pending.extend(items.iter().map(Item::to_owned));
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> Vec<OwnedItem> {
        std::mem::take(&mut self.pending)
    }
}

/// A persistent priority queue in a directory. Lower keys pop first.
///
/// Blob slices handed to read callbacks alias the queue's memory maps and
/// are only valid for the duration of the callback; copy what you need to
/// keep (see [`Item::to_owned`]).
pub struct Queue {
    registry: Mutex<Registry>,
}

impl Queue {
    /// Opens the queue in `dir`, creating it if nothing is there yet.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(Registry::open(dir.as_ref(), opts)?),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Pushes a batch of items. The batch may be unsorted and may span any
    /// number of buckets; an empty batch is a no-op. Calling this from
    /// inside a read callback deadlocks; use [`Transaction::push`] there.
    pub fn push(&self, items: &[Item<'_>]) -> Result<()> {
        self.lock().push(items)
    }

    /// Hands up to `n` items to `f` in ascending key order, one contiguous
    /// run per call; `n < 0` means everything. The callback decides per
    /// chunk whether to pop or peek; returning an error aborts the read
    /// with the chunk untouched. Returns the number of items handed out.
    pub fn read<F>(&self, n: i64, f: F) -> Result<u64>
    where
        F: FnMut(&mut Transaction, &[Item<'_>]) -> Result<ReadOp>,
    {
        self.lock().read(n, &ForkName::default(), f)
    }

    /// Deletes all items with keys in `from..=to` (both inclusive) and
    /// returns how many were removed.
    pub fn delete(&self, from: Key, to: Key) -> Result<u64> {
        self.lock().delete(&ForkName::default(), from, to)
    }

    /// Number of items the default cursor can still read. Buckets that are
    /// not currently open answer from their index trailers, so this does
    /// not fault anything back in.
    pub fn len(&self) -> u64 {
        self.lock().len(&ForkName::default()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes all buckets to disk regardless of the configured sync mode.
    pub fn sync(&self) -> Result<()> {
        self.lock().sync()
    }

    /// Deletes the whole queue contents. Fork names survive with empty
    /// cursors.
    pub fn clear(&self) -> Result<()> {
        self.lock().clear()
    }

    /// Moves everything the default cursor can read into `dst`, returning
    /// the number of items moved. Both queues must use the same split
    /// function; shovelling between different split functions is
    /// undefined. Afterwards this queue's default cursor is empty.
    pub fn shovel(&self, dst: &Queue) -> Result<u64> {
        self.shovel_fork(dst, &ForkName::default())
    }

    fn shovel_fork(&self, dst: &Queue, fork: &ForkName) -> Result<u64> {
        if std::ptr::eq(self, dst) {
            return Err(QueueError::InvalidOptions(
                "cannot shovel a queue into itself",
            ));
        }

        // lock both queues in address order so two concurrent shovels in
        // opposite directions cannot deadlock.
        let self_first =
            (&self.registry as *const _ as usize) < (&dst.registry as *const _ as usize);
        let (mut src_guard, mut dst_guard) = if self_first {
            let src = self.registry.lock();
            let dst = dst.registry.lock();
            (src, dst)
        } else {
            let dst = dst.registry.lock();
            let src = self.registry.lock();
            (src, dst)
        };
        src_guard.shovel(&mut dst_guard, fork)
    }

    /// Splits off a named cursor that starts at the default cursor's
    /// current position and advances independently. Forking onto an
    /// existing name returns a handle to it.
    pub fn fork(&self, name: &str) -> Result<Fork<'_>> {
        let name = ForkName::new(name)?;
        self.lock().fork(&ForkName::default(), &name)?;
        Ok(Fork {
            queue: Some(self),
            name,
        })
    }

    /// Names of all forks. The default cursor is not listed.
    pub fn forks(&self) -> Vec<ForkName> {
        self.lock().fork_names()
    }

    /// Pops up to `n` items and returns them as owned copies. Convenient,
    /// but pays for the copy; prefer [`Queue::read`] on hot paths.
    pub fn pop_copy(&self, n: i64) -> Result<Vec<OwnedItem>> {
        let mut got = Vec::new();
        self.read(n, |_tx, items| {
            got.extend(items.iter().map(Item::to_owned));
            Ok(ReadOp::Pop)
        })?;
        Ok(got)
    }

    /// Like [`Queue::pop_copy`] but leaves the items in the queue.
    pub fn peek_copy(&self, n: i64) -> Result<Vec<OwnedItem>> {
        let mut got = Vec::new();
        self.read(n, |_tx, items| {
            got.extend(items.iter().map(Item::to_owned));
            Ok(ReadOp::Peek)
        })?;
        Ok(got)
    }

    /// Flushes and unmaps everything. The queue stays usable; buckets are
    /// faulted back in on demand.
    pub fn close(&self) -> Result<()> {
        self.lock().close()
    }
}

/// A named reader cursor. Reads and deletes through a fork do not affect
/// the queue's default cursor or any other fork. Dropping the handle keeps
/// the fork; [`Fork::remove`] deletes it.
pub struct Fork<'q> {
    queue: Option<&'q Queue>,
    name: ForkName,
}

impl<'q> Fork<'q> {
    fn queue(&self) -> Result<&'q Queue> {
        self.queue
            .ok_or_else(|| QueueError::NoSuchFork(self.name.clone()))
    }

    pub fn name(&self) -> &ForkName {
        &self.name
    }

    /// Like [`Queue::read`], starting from this fork's cursor.
    pub fn read<F>(&self, n: i64, f: F) -> Result<u64>
    where
        F: FnMut(&mut Transaction, &[Item<'_>]) -> Result<ReadOp>,
    {
        self.queue()?.lock().read(n, &self.name, f)
    }

    /// Like [`Queue::delete`], applied to this fork only.
    pub fn delete(&self, from: Key, to: Key) -> Result<u64> {
        self.queue()?.lock().delete(&self.name, from, to)
    }

    /// Number of items left on this fork's cursor. A removed fork reads
    /// as empty.
    pub fn len(&self) -> u64 {
        match self.queue {
            Some(queue) => queue.lock().len(&self.name).unwrap_or(0),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Like [`Queue::shovel`], moving this fork's view of the data.
    pub fn shovel(&self, dst: &Queue) -> Result<u64> {
        self.queue()?.shovel_fork(dst, &self.name)
    }

    /// Forks again, inheriting this fork's current cursor rather than the
    /// queue's.
    pub fn fork(&self, name: &str) -> Result<Fork<'q>> {
        let queue = self.queue()?;
        let name = ForkName::new(name)?;
        queue.lock().fork(&self.name, &name)?;
        Ok(Fork {
            queue: Some(queue),
            name,
        })
    }

    pub fn pop_copy(&self, n: i64) -> Result<Vec<OwnedItem>> {
        let mut got = Vec::new();
        self.read(n, |_tx, items| {
            got.extend(items.iter().map(Item::to_owned));
            Ok(ReadOp::Pop)
        })?;
        Ok(got)
    }

    pub fn peek_copy(&self, n: i64) -> Result<Vec<OwnedItem>> {
        let mut got = Vec::new();
        self.read(n, |_tx, items| {
            got.extend(items.iter().map(Item::to_owned));
            Ok(ReadOp::Peek)
        })?;
        Ok(got)
    }

    /// Deletes the fork. Every later call through this handle returns
    /// [`QueueError::NoSuchFork`].
    pub fn remove(&mut self) -> Result<()> {
        let queue = self.queue()?;
        self.queue = None;
        queue.lock().remove_fork(&self.name)
    }
}
