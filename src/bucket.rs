//! One bucket: a value log plus one index per fork, all under a single
//! directory named after the bucket key. A bucket only ever holds keys
//! that the configured split function maps to its own key.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{QueueError, Result};
use crate::index::{log as index_log, Index, IndexLog};
use crate::options::{Options, SyncMode};
use crate::types::{ForkName, Item, Key, Location, ReadOp};
use crate::vlog::{RunIter, VLog};

pub(crate) const DATA_LOG_NAME: &str = "dat.log";

struct ForkIndex {
    mem: Index,
    log: IndexLog,
}

pub(crate) struct Bucket {
    key: Key,
    dir: PathBuf,
    vlog: VLog,
    forks: BTreeMap<ForkName, ForkIndex>,
    sync_mode: SyncMode,
}

/// Walks one live run during a read. `live_key` tracks the index entry the
/// run's unconsumed suffix currently lives under; `None` once the run is
/// fully consumed or fell out of the index.
struct ReadCursor<'a> {
    iter: RunIter<'a>,
    live_key: Option<Key>,
}

impl Bucket {
    /// Opens (or creates) the bucket directory. Index files that are
    /// missing, unreadable or not a whole number of records are rebuilt
    /// from the value log; a bucket whose forks are all drained is wiped
    /// back to its empty state to reclaim the dead log bytes.
    pub fn open(
        dir: &Path,
        key: Key,
        known_forks: &BTreeSet<ForkName>,
        opts: &Options,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut names: BTreeSet<ForkName> = known_forks.clone();
        names.insert(ForkName::default());
        let mut on_disk: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(fork) = ForkName::from_index_file_name(name) {
                names.insert(fork?);
                on_disk.push(entry.path());
            }
        }

        let vlog_path = dir.join(DATA_LOG_NAME);
        let stale_log_bytes = fs::metadata(&vlog_path).map(|m| m.len()).unwrap_or(0) > 0;
        if stale_log_bytes && !on_disk.is_empty() && Self::fully_drained(&on_disk) {
            // Every fork advanced past every batch; the log is dead weight.
            fs::remove_file(&vlog_path)?;
            for path in &on_disk {
                fs::remove_file(path)?;
            }
        }

        let vlog = VLog::open(&vlog_path)?;

        let mut forks = BTreeMap::new();
        for name in names {
            let path = index_log::path_for(dir, &name);
            let loaded = if index_log::is_loadable(&path) {
                index_log::load(&path).ok()
            } else {
                None
            };

            let fork_index = match loaded {
                Some(mem) => ForkIndex {
                    mem,
                    log: IndexLog::open(&path)?,
                },
                None => Self::regenerate(&vlog, &path, key, &name)?,
            };
            forks.insert(name, fork_index);
        }

        Ok(Self {
            key,
            dir: dir.to_path_buf(),
            vlog,
            forks,
            sync_mode: opts.sync_mode,
        })
    }

    /// True when every index file is intact and its trailer reports zero
    /// live items, i.e. every fork advanced past every batch. Unreadable
    /// files count as not drained so they go through regeneration instead.
    fn fully_drained(index_files: &[PathBuf]) -> bool {
        index_files.iter().all(|path| {
            index_log::is_loadable(path) && matches!(index_log::read_trailer(path), Ok(0))
        })
    }

    fn regenerate(vlog: &VLog, path: &Path, key: Key, fork: &ForkName) -> Result<ForkIndex> {
        let mut mem = Index::new();
        for loc in vlog.regenerate_locations()? {
            if mem.set_with_skew(loc).0.is_none() {
                warn!(
                    bucket = %key,
                    fork = %fork,
                    batch = %loc.key,
                    "no free slot within the skew window; dropping batch from rebuilt index"
                );
            }
        }

        // Write-only index files (e.g. after a botched chmod) cannot be
        // appended through the old handle state; recreate from scratch.
        let _ = fs::remove_file(path);
        let mut log = IndexLog::open(path)?;
        log.rewrite(&mem)?;
        log.sync()?;

        if vlog.size() > 0 {
            warn!(bucket = %key, fork = %fork, "regenerated index from value log");
        }
        Ok(ForkIndex { mem, log })
    }

    /// Appends the batch to the value log and records it in every fork's
    /// index, so existing forks see newly pushed data too.
    pub fn push(&mut self, items: &[Item<'_>], sort: bool) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut batch: Vec<Item<'_>> = items.to_vec();
        if sort {
            batch.sort_by_key(|item| item.key);
        }

        let loc = self.vlog.push(&batch, self.sync_mode.data())?;
        for (name, fi) in self.forks.iter_mut() {
            match fi.mem.set_with_skew(loc) {
                (Some(actual), _) => {
                    fi.log.append(actual, fi.mem.item_count())?;
                    if self.sync_mode.index() {
                        fi.log.sync()?;
                    }
                }
                (None, _) => warn!(
                    bucket = %self.key,
                    fork = %name,
                    batch = %loc.key,
                    "no free slot within the skew window; batch stays unindexed until a rebuild"
                ),
            }
        }
        Ok(())
    }

    /// Hands up to `budget` items to `f` in ascending key order, one
    /// contiguous run chunk per call. Runs can interleave (batches overlap
    /// in key range), so this is a merge over all live runs ordered by
    /// `(current item key, batch key)`; the batch key breaks ties in push
    /// order. Returns the number of items handed out.
    pub fn read<F>(&mut self, budget: u64, fork: &ForkName, mut f: F) -> Result<u64>
    where
        F: FnMut(&[Item<'_>]) -> Result<ReadOp>,
    {
        if budget == 0 {
            return Ok(0);
        }

        let Bucket {
            vlog,
            forks,
            sync_mode,
            key: bucket_key,
            ..
        } = self;
        let vlog: &VLog = vlog;
        let fi = forks
            .get_mut(fork)
            .ok_or_else(|| QueueError::NoSuchFork(fork.clone()))?;

        let mut cursors: Vec<ReadCursor<'_>> = Vec::with_capacity(fi.mem.num_entries());
        for (key, loc) in fi.mem.iter() {
            vlog.check_location(&loc)?;
            cursors.push(ReadCursor {
                iter: vlog.iter(loc)?,
                live_key: Some(key),
            });
        }

        let mut handled = 0u64;
        let mut committed = false;
        let mut chunk: Vec<Item<'_>> = Vec::new();

        while handled < budget {
            let Some(best) = cursors
                .iter()
                .enumerate()
                .filter(|(_, c)| c.live_key.is_some())
                .filter_map(|(i, c)| c.iter.current().map(|item| ((item.key, c.iter.batch_key()), i)))
                .min_by_key(|(pair, _)| *pair)
                .map(|(_, i)| i)
            else {
                break;
            };

            // Keys up to this bound still belong to the chosen run; at the
            // bound another run takes over (ties go to the lower batch key,
            // i.e. the earlier push).
            let bound = cursors
                .iter()
                .enumerate()
                .filter(|(i, c)| *i != best && c.live_key.is_some())
                .filter_map(|(_, c)| c.iter.current().map(|item| (item.key, c.iter.batch_key())))
                .min();

            chunk.clear();
            while handled + (chunk.len() as u64) < budget {
                let Some(item) = cursors[best].iter.current() else {
                    break;
                };
                if let Some(bound) = bound {
                    if (item.key, cursors[best].iter.batch_key()) > bound {
                        break;
                    }
                }
                chunk.push(item);
                cursors[best].iter.advance()?;
            }

            match f(&chunk)? {
                ReadOp::Peek => handled += chunk.len() as u64,
                ReadOp::Pop => {
                    handled += chunk.len() as u64;
                    commit_pop(fi, &mut cursors[best], *bucket_key, fork)?;
                    committed = true;
                }
            }
        }

        if committed && sync_mode.index() {
            fi.log.sync()?;
        }
        Ok(handled)
    }

    /// Removes all items with a key in `from..=to` from the fork. Runs
    /// wholly inside the range are dropped; overhanging runs are trimmed
    /// or split. Returns the number of removed items.
    pub fn delete(&mut self, fork: &ForkName, from: Key, to: Key) -> Result<u64> {
        if from > to {
            return Err(QueueError::DeleteRangeInverted { from, to });
        }

        let Bucket {
            vlog,
            forks,
            sync_mode,
            key: bucket_key,
            ..
        } = self;
        let vlog: &VLog = vlog;
        let fi = forks
            .get_mut(fork)
            .ok_or_else(|| QueueError::NoSuchFork(fork.clone()))?;

        struct Trim {
            entry: Key,
            left: Option<Location>,
            right: Option<Location>,
            removed: u64,
        }

        let mut trims: Vec<Trim> = Vec::new();
        for (entry, loc) in fi.mem.iter() {
            vlog.check_location(&loc)?;
            let mut iter = vlog.iter(loc)?;

            let mut left = 0u32;
            let mut removed = 0u32;
            let mut right: Option<Location> = None;
            while let Some(item) = iter.current() {
                if item.key < from {
                    left += 1;
                } else if item.key <= to {
                    removed += 1;
                } else {
                    right = Some(Location {
                        key: item.key,
                        off: iter.offset(),
                        len: iter.remaining(),
                    });
                    break;
                }
                iter.advance()?;
            }

            if removed == 0 {
                continue;
            }
            trims.push(Trim {
                entry,
                left: (left > 0).then_some(Location {
                    key: entry,
                    off: loc.off,
                    len: left,
                }),
                right,
                removed: removed as u64,
            });
        }

        let mut total = 0u64;
        for trim in &trims {
            total += trim.removed;

            match trim.left {
                Some(left) => {
                    // The leading keep shrinks the run in place under its
                    // original entry key.
                    fi.mem.set(left);
                    fi.log.append(left, fi.mem.item_count())?;
                }
                None => {
                    fi.mem.remove(trim.entry);
                    fi.log
                        .append(Location::tombstone(trim.entry), fi.mem.item_count())?;
                }
            }

            if let Some(right) = trim.right {
                match fi.mem.set_with_skew(right) {
                    (Some(actual), _) => fi.log.append(actual, fi.mem.item_count())?,
                    (None, _) => warn!(
                        bucket = %bucket_key,
                        fork = %fork,
                        batch = %right.key,
                        "no free slot within the skew window; trailing keep stays unindexed until a rebuild"
                    ),
                }
            }
        }

        if !trims.is_empty() && sync_mode.index() {
            fi.log.sync()?;
        }
        Ok(total)
    }

    /// Gives `new` its own copy of `src`'s cursor. Forking twice onto the
    /// same name is a no-op.
    pub fn fork(&mut self, src: &ForkName, new: &ForkName) -> Result<()> {
        if self.forks.contains_key(new) {
            return Ok(());
        }
        let src_fi = self
            .forks
            .get(src)
            .ok_or_else(|| QueueError::NoSuchFork(src.clone()))?;
        let mem = src_fi.mem.clone();

        let mut log = IndexLog::open(&index_log::path_for(&self.dir, new))?;
        log.rewrite(&mem)?;
        log.sync()?;
        self.forks.insert(new.clone(), ForkIndex { mem, log });
        Ok(())
    }

    pub fn remove_fork(&mut self, name: &ForkName) -> Result<()> {
        if self.forks.remove(name).is_none() {
            return Err(QueueError::NoSuchFork(name.clone()));
        }
        fs::remove_file(index_log::path_for(&self.dir, name))?;
        Ok(())
    }

    pub fn len(&self, fork: &ForkName) -> Result<u64> {
        self.forks
            .get(fork)
            .map(|fi| fi.mem.item_count())
            .ok_or_else(|| QueueError::NoSuchFork(fork.clone()))
    }

    pub fn is_empty(&self, fork: &ForkName) -> Result<bool> {
        Ok(self.len(fork)? == 0)
    }

    /// A bucket is globally empty when no fork can read anything from it;
    /// only then may its directory be deleted.
    pub fn globally_empty(&self) -> bool {
        self.forks.values().all(|fi| fi.mem.is_empty())
    }

    pub fn fork_lens(&self) -> BTreeMap<ForkName, u64> {
        self.forks
            .iter()
            .map(|(name, fi)| (name.clone(), fi.mem.item_count()))
            .collect()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.vlog.sync()?;
        for fi in self.forks.values_mut() {
            fi.log.sync()?;
        }
        Ok(())
    }

    /// Flushes everything out. File descriptors and the map are released
    /// when the bucket is dropped.
    pub fn close(&mut self) -> Result<()> {
        self.sync()
    }
}

fn commit_pop(
    fi: &mut ForkIndex,
    cursor: &mut ReadCursor<'_>,
    bucket_key: Key,
    fork: &ForkName,
) -> Result<()> {
    let Some(live) = cursor.live_key else {
        return Ok(());
    };

    match cursor.iter.current() {
        None => {
            // whole run consumed.
            fi.mem.remove(live);
            fi.log
                .append(Location::tombstone(live), fi.mem.item_count())?;
            cursor.live_key = None;
        }
        Some(cur) => {
            let suffix = Location {
                key: cur.key,
                off: cursor.iter.offset(),
                len: cursor.iter.remaining(),
            };
            if suffix.key == live {
                fi.mem.set(suffix);
                fi.log.append(suffix, fi.mem.item_count())?;
            } else {
                // The suffix starts at a different key. Replaying a bare
                // overwrite would leave the consumed prefix live, so the
                // old entry is tombstoned first.
                fi.mem.remove(live);
                fi.log
                    .append(Location::tombstone(live), fi.mem.item_count())?;
                match fi.mem.set_with_skew(suffix) {
                    (Some(actual), _) => {
                        fi.log.append(actual, fi.mem.item_count())?;
                        cursor.live_key = Some(actual.key);
                    }
                    (None, _) => {
                        warn!(
                            bucket = %bucket_key,
                            fork = %fork,
                            batch = %suffix.key,
                            "no free slot within the skew window; suffix stays unindexed until a rebuild"
                        );
                        cursor.live_key = None;
                    }
                }
            }
        }
    }
    Ok(())
}
