//! The bucket registry: an ordered map from bucket key to bucket, loaded
//! lazily from directory trailers, with a bound on how many buckets stay
//! mapped at once.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::bucket::Bucket;
use crate::error::{QueueError, Result};
use crate::index::log as index_log;
use crate::options::{ErrorMode, Options};
use crate::queue::Transaction;
use crate::types::{ForkName, Item, Key, ReadOp};

enum Handle {
    Loaded { bucket: Bucket, last_access: u64 },
    /// Per-fork item counts recovered from the index log trailers. Keeps
    /// `len` answerable without mapping the bucket.
    Summary { forks: BTreeMap<ForkName, u64> },
}

pub(crate) struct Registry {
    dir: PathBuf,
    opts: Options,
    buckets: BTreeMap<Key, Handle>,
    /// Named forks known to the queue (the default fork is implicit).
    forks: BTreeSet<ForkName>,
    tick: u64,
}

impl Registry {
    pub fn open(dir: &Path, opts: Options) -> Result<Self> {
        opts.validate()?;
        fs::create_dir_all(dir)?;

        let mut buckets = BTreeMap::new();
        let mut forks = BTreeSet::new();
        let mut damaged: Vec<Key> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let key: Key = name.parse().map_err(|_| {
                QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("not a bucket directory: {name:?}"),
                ))
            })?;
            if opts.split.split(key) != key {
                return Err(QueueError::ChangedSplitFunc(key));
            }

            let mut counts = BTreeMap::new();
            let mut needs_repair = false;
            for (fork, trailer) in index_log::read_trailers(&entry.path())? {
                if !fork.is_default() {
                    forks.insert(fork.clone());
                }
                match trailer {
                    Some(trailer) => {
                        counts.insert(fork, trailer);
                    }
                    None => {
                        needs_repair = true;
                        counts.insert(fork, 0);
                    }
                }
            }
            if counts.is_empty() {
                // a bucket without any index at all still counts as
                // damaged when its value log holds data.
                let log_len = fs::metadata(entry.path().join(crate::bucket::DATA_LOG_NAME))
                    .map(|m| m.len())
                    .unwrap_or(0);
                needs_repair = log_len > 0;
            }
            counts.entry(ForkName::default()).or_insert(0);
            if needs_repair {
                damaged.push(key);
            }
            buckets.insert(key, Handle::Summary { forks: counts });
        }

        // Rebuild damaged indexes right away; skipping them would hide
        // their items behind a zero trailer forever.
        for key in damaged {
            let bucket_dir = dir.join(key.to_string());
            let mut bucket = Bucket::open(&bucket_dir, key, &forks, &opts)?;
            let counts = bucket.fork_lens();
            bucket.close()?;
            buckets.insert(key, Handle::Summary { forks: counts });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            opts,
            buckets,
            forks,
            tick: 0,
        })
    }

    fn check_fork(&self, fork: &ForkName) -> Result<()> {
        if fork.is_default() || self.forks.contains(fork) {
            return Ok(());
        }
        Err(QueueError::NoSuchFork(fork.clone()))
    }

    fn bucket_dir(&self, key: Key) -> PathBuf {
        self.dir.join(key.to_string())
    }

    /// Item count of `fork` in the bucket without loading it.
    fn fork_count(&self, key: Key, fork: &ForkName) -> u64 {
        match self.buckets.get(&key) {
            Some(Handle::Loaded { bucket, .. }) => bucket.len(fork).unwrap_or(0),
            Some(Handle::Summary { forks }) => forks.get(fork).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Loads the bucket behind `key`, evicting other buckets if the open
    /// cap is exceeded. `pinned` buckets are never evicted.
    fn load_bucket(&mut self, key: Key, pinned: &[Key]) -> Result<&mut Bucket> {
        self.tick += 1;
        let tick = self.tick;

        if matches!(self.buckets.get(&key), None | Some(Handle::Summary { .. })) {
            let dir = self.bucket_dir(key);
            let bucket = Bucket::open(&dir, key, &self.forks, &self.opts)?;
            self.buckets.insert(
                key,
                Handle::Loaded {
                    bucket,
                    last_access: tick,
                },
            );
            self.evict_excess(pinned)?;
        }

        match self.buckets.get_mut(&key) {
            Some(Handle::Loaded {
                bucket,
                last_access,
            }) => {
                *last_access = tick;
                Ok(bucket)
            }
            _ => unreachable!("bucket was loaded just above"),
        }
    }

    /// Closes least-recently-used buckets until the configured cap holds
    /// again. Closed handles keep their per-fork counts so `len` answers
    /// without a reopen.
    fn evict_excess(&mut self, pinned: &[Key]) -> Result<()> {
        let cap = self.opts.max_parallel_open_buckets;
        if cap <= 0 {
            return Ok(());
        }

        loop {
            let loaded: Vec<(Key, u64)> = self
                .buckets
                .iter()
                .filter_map(|(key, handle)| match handle {
                    Handle::Loaded { last_access, .. } => Some((*key, *last_access)),
                    Handle::Summary { .. } => None,
                })
                .collect();
            if loaded.len() <= cap as usize {
                return Ok(());
            }

            let victim = loaded
                .iter()
                .filter(|(key, _)| !pinned.contains(key))
                .min_by_key(|(_, tick)| *tick)
                .map(|(key, _)| *key);
            let Some(victim) = victim else {
                // everything open is pinned by the current operation; the
                // cap is a steady-state budget, not a hard ceiling.
                return Ok(());
            };
            self.unload_bucket(victim)?;
        }
    }

    /// Flushes and unmaps one bucket, demoting its handle to a summary.
    fn unload_bucket(&mut self, key: Key) -> Result<()> {
        if let Some(Handle::Loaded { mut bucket, .. }) = self.buckets.remove(&key) {
            let counts = bucket.fork_lens();
            let res = bucket.close();
            self.buckets.insert(key, Handle::Summary { forks: counts });
            res?;
        }
        Ok(())
    }

    /// Closes the bucket and deletes its directory. Only valid when the
    /// bucket is globally empty.
    fn drop_bucket(&mut self, key: Key) -> Result<()> {
        if let Some(handle) = self.buckets.remove(&key) {
            if let Handle::Loaded { mut bucket, .. } = handle {
                bucket.close()?;
            }
            fs::remove_dir_all(self.bucket_dir(key))?;
        }
        Ok(())
    }

    /// Pushes a batch, splitting it into per-bucket prefixes. The batch is
    /// stable-sorted by key first, so ties keep their arrival order.
    pub fn push(&mut self, items: &[Item<'_>]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut batch: Vec<Item<'_>> = items.to_vec();
        batch.sort_by_key(|item| item.key);

        let mut rest = &batch[..];
        while !rest.is_empty() {
            let bucket_key = self.opts.split.split(rest[0].key);
            let end = rest.partition_point(|item| self.opts.split.split(item.key) == bucket_key);
            let prefix = &rest[..end];
            rest = &rest[end..];

            let pushed = self
                .load_bucket(bucket_key, &[bucket_key])
                .and_then(|bucket| bucket.push(prefix, false));
            match pushed {
                Ok(()) => {}
                Err(err) if self.opts.error_mode == ErrorMode::Continue && err.is_recoverable() => {
                    warn!(bucket = %bucket_key, error = %err, "skipping bucket during push");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Merged read across all buckets in ascending key order. Bucket key
    /// ranges are disjoint, so walking buckets in key order pops globally
    /// lowest keys first. Pushes issued through the transaction are
    /// buffered and applied once no callback slice can alias a map.
    pub fn read<F>(&mut self, n: i64, fork: &ForkName, mut f: F) -> Result<u64>
    where
        F: FnMut(&mut Transaction, &[Item<'_>]) -> Result<ReadOp>,
    {
        self.check_fork(fork)?;

        let mut remaining = if n < 0 { u64::MAX } else { n as u64 };
        let mut handled_total = 0u64;
        let mut tx = Transaction::new();
        let mut failure: Option<QueueError> = None;

        let keys: Vec<Key> = self.buckets.keys().copied().collect();
        for key in keys {
            if remaining == 0 {
                break;
            }
            if self.fork_count(key, fork) == 0 {
                continue;
            }

            let mut callback_err: Option<QueueError> = None;
            let outcome = self.load_bucket(key, &[key]).and_then(|bucket| {
                bucket.read(remaining, fork, |items| match f(&mut tx, items) {
                    Ok(op) => Ok(op),
                    Err(err) => {
                        callback_err = Some(err);
                        Err(QueueError::Callback("aborted".into()))
                    }
                })
            });

            match outcome {
                Ok(handled) => {
                    handled_total += handled;
                    remaining = remaining.saturating_sub(handled);
                }
                Err(_) if callback_err.is_some() => {
                    // an error from the user callback always surfaces,
                    // whatever the error mode says.
                    failure = callback_err;
                    break;
                }
                Err(err) if self.opts.error_mode == ErrorMode::Continue && err.is_recoverable() => {
                    warn!(bucket = %key, error = %err, "skipping bucket during read");
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let pending = tx.take_pending();
        let pushed = if pending.is_empty() {
            Ok(())
        } else {
            let borrowed: Vec<Item<'_>> = pending.iter().map(|item| item.as_item()).collect();
            self.push(&borrowed)
        };
        self.evict_excess(&[])?;

        if let Some(err) = failure {
            return Err(err);
        }
        pushed?;
        Ok(handled_total)
    }

    /// Deletes all items with keys in `from..=to` from `fork`, across all
    /// affected buckets. Buckets left globally empty are unlinked.
    pub fn delete(&mut self, fork: &ForkName, from: Key, to: Key) -> Result<u64> {
        if from > to {
            return Err(QueueError::DeleteRangeInverted { from, to });
        }
        self.check_fork(fork)?;

        // the bucket holding `from` starts at split(from); buckets beyond
        // `to` cannot contain keys <= to.
        let lo = self.opts.split.split(from);
        let keys: Vec<Key> = self.buckets.range(lo..=to).map(|(key, _)| *key).collect();

        let mut total = 0u64;
        for key in keys {
            if self.fork_count(key, fork) == 0 {
                continue;
            }

            let deleted = self
                .load_bucket(key, &[key])
                .and_then(|bucket| bucket.delete(fork, from, to));
            match deleted {
                Ok(count) => total += count,
                Err(err) if self.opts.error_mode == ErrorMode::Continue && err.is_recoverable() => {
                    warn!(bucket = %key, error = %err, "skipping bucket during delete");
                    continue;
                }
                Err(err) => return Err(err),
            }

            let empty = match self.buckets.get(&key) {
                Some(Handle::Loaded { bucket, .. }) => bucket.globally_empty(),
                _ => false,
            };
            if empty {
                self.drop_bucket(key)?;
            }
        }

        self.evict_excess(&[])?;
        Ok(total)
    }

    pub fn len(&self, fork: &ForkName) -> Result<u64> {
        self.check_fork(fork)?;
        Ok(self
            .buckets
            .keys()
            .map(|key| self.fork_count(*key, fork))
            .sum())
    }

    /// Duplicates the `src` cursor under the name `new` in every bucket.
    /// Buckets that are not currently loaded get their index file copied
    /// instead of being mapped.
    pub fn fork(&mut self, src: &ForkName, new: &ForkName) -> Result<()> {
        self.check_fork(src)?;
        if self.forks.contains(new) {
            return Ok(());
        }

        for (key, handle) in self.buckets.iter_mut() {
            match handle {
                Handle::Loaded { bucket, .. } => bucket.fork(src, new)?,
                Handle::Summary { forks } => {
                    let dir = self.dir.join(key.to_string());
                    let src_file = index_log::path_for(&dir, src);
                    let new_file = index_log::path_for(&dir, new);
                    match fs::copy(&src_file, &new_file) {
                        Ok(_) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    let count = forks.get(src).copied().unwrap_or(0);
                    forks.insert(new.clone(), count);
                }
            }
        }

        self.forks.insert(new.clone());
        Ok(())
    }

    /// Drops the fork everywhere. Buckets left globally empty are
    /// unlinked.
    pub fn remove_fork(&mut self, name: &ForkName) -> Result<()> {
        if name.is_default() {
            return Err(QueueError::InvalidForkName {
                name: String::new(),
                pos: 0,
            });
        }
        self.check_fork(name)?;

        let keys: Vec<Key> = self.buckets.keys().copied().collect();
        for key in keys {
            let empty = match self.buckets.get_mut(&key) {
                Some(Handle::Loaded { bucket, .. }) => {
                    bucket.remove_fork(name)?;
                    bucket.globally_empty()
                }
                Some(Handle::Summary { forks }) => {
                    let file = index_log::path_for(&self.dir.join(key.to_string()), name);
                    match fs::remove_file(&file) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    forks.remove(name);
                    forks.values().all(|count| *count == 0)
                }
                None => false,
            };
            if empty {
                self.drop_bucket(key)?;
            }
        }

        self.forks.remove(name);
        Ok(())
    }

    pub fn fork_names(&self) -> Vec<ForkName> {
        self.forks.iter().cloned().collect()
    }

    /// Moves everything `fork` can read over to `dst`. Buckets whose key
    /// is free in the destination move by directory rename, preserving the
    /// value log byte for byte; the rest is read and re-pushed. Both
    /// queues must use the same split function.
    pub fn shovel(&mut self, dst: &mut Registry, fork: &ForkName) -> Result<u64> {
        self.check_fork(fork)?;
        if self.opts.split.name != dst.opts.split.name {
            warn!(
                src = %self.opts.split.name,
                dst = %dst.opts.split.name,
                "shovelling between different split functions is undefined"
            );
        }

        let keys: Vec<Key> = self.buckets.keys().copied().collect();
        let mut moved = 0u64;

        for key in keys {
            let count = self.fork_count(key, fork);
            if count == 0 {
                continue;
            }

            if !dst.buckets.contains_key(&key) {
                self.unload_bucket(key)?;
                self.buckets.remove(&key);

                let src_dir = self.bucket_dir(key);
                let dst_dir = dst.bucket_dir(key);
                fs::rename(&src_dir, &dst_dir)?;
                Self::adopt_moved_bucket(&dst_dir, fork, &dst.forks)?;

                let mut counts = BTreeMap::new();
                counts.insert(ForkName::default(), count);
                for name in &dst.forks {
                    counts.insert(name.clone(), count);
                }
                dst.buckets.insert(key, Handle::Summary { forks: counts });
                moved += count;
            } else {
                let bucket = self.load_bucket(key, &[key])?;
                let handled = bucket.read(u64::MAX, fork, |items| {
                    dst.push(items)?;
                    Ok(ReadOp::Pop)
                })?;
                moved += handled;

                let empty = match self.buckets.get(&key) {
                    Some(Handle::Loaded { bucket, .. }) => bucket.globally_empty(),
                    _ => false,
                };
                if empty {
                    self.drop_bucket(key)?;
                }
            }
        }

        self.evict_excess(&[])?;
        dst.evict_excess(&[])?;
        Ok(moved)
    }

    /// After a directory rename, the moved bucket still carries the source
    /// queue's fork files. The shovelled fork's index becomes the view of
    /// every destination fork; everything else goes away.
    fn adopt_moved_bucket(dir: &Path, fork: &ForkName, dst_forks: &BTreeSet<ForkName>) -> Result<()> {
        let src_file = index_log::path_for(dir, fork);

        let mut wanted: BTreeSet<ForkName> = dst_forks.clone();
        wanted.insert(ForkName::default());

        for name in &wanted {
            let target = index_log::path_for(dir, name);
            if target != src_file {
                fs::copy(&src_file, &target)?;
            }
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(parsed) = ForkName::from_index_file_name(name) else {
                continue;
            };
            let parsed = parsed?;
            if !wanted.contains(&parsed) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Flushes every loaded bucket.
    pub fn sync(&mut self) -> Result<()> {
        for handle in self.buckets.values_mut() {
            if let Handle::Loaded { bucket, .. } = handle {
                bucket.sync()?;
            }
        }
        Ok(())
    }

    /// Deletes all queue contents. Fork names survive; their cursors are
    /// simply empty afterwards.
    pub fn clear(&mut self) -> Result<()> {
        let keys: Vec<Key> = self.buckets.keys().copied().collect();
        for key in keys {
            self.drop_bucket(key)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let keys: Vec<Key> = self.buckets.keys().copied().collect();
        for key in keys {
            self.unload_bucket(key)?;
        }
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // best effort flush; an explicit close reports errors.
        let _ = self.close();
    }
}
