//! Append-only, memory-mapped value log. The ground truth of item data.
//!
//! Record layout, repeating and big-endian: `u32 blob_len | u64 key | blob`.
//! Items appear in push order; ordering comes from the per-fork indexes.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{QueueError, Result};
use crate::types::{Item, Key, Location, ITEM_HEADER_SIZE, MAX_BLOB_SIZE};

pub(crate) struct VLog {
    file: File,
    map: MmapMut,
    /// Logical end of the log. May be smaller than the file length right
    /// after creation, because zero-length files cannot be mapped and get
    /// truncated up to one item header first.
    size: u64,
}

impl VLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();
        if size == 0 {
            file.set_len(ITEM_HEADER_SIZE as u64)?;
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a batch as one contiguous run and returns its location.
    /// The batch must be non-empty and sorted by key.
    pub fn push(&mut self, items: &[Item<'_>], sync: bool) -> Result<Location> {
        debug_assert!(!items.is_empty());

        let mut added = 0u64;
        for item in items {
            if item.blob.len() > MAX_BLOB_SIZE as usize {
                return Err(QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("blob of {} bytes exceeds the 4 MiB item limit", item.blob.len()),
                )));
            }
            added += (ITEM_HEADER_SIZE + item.blob.len()) as u64;
        }

        let loc = Location {
            key: items[0].key,
            off: self.size,
            len: items.len() as u32,
        };

        // Extend the file to fit the new items, then remap. memmap2 has no
        // mremap, so growth is a fresh map of the same file.
        let new_size = self.size + added;
        self.file.set_len(new_size.max(ITEM_HEADER_SIZE as u64))?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };

        let mut off = self.size as usize;
        for item in items {
            self.map[off..off + 4].copy_from_slice(&(item.blob.len() as u32).to_be_bytes());
            self.map[off + 4..off + 12].copy_from_slice(&(item.key.0 as u64).to_be_bytes());
            off += ITEM_HEADER_SIZE;
            self.map[off..off + item.blob.len()].copy_from_slice(item.blob);
            off += item.blob.len();
        }
        self.size = new_size;

        if sync {
            self.sync()?;
        }
        Ok(loc)
    }

    /// Decodes the item starting at `off`. The blob slices the map
    /// directly; callers must not hold it across a push or close.
    pub fn read_item_at(&self, off: u64) -> Result<Item<'_>> {
        if off + ITEM_HEADER_SIZE as u64 > self.size {
            return Err(QueueError::BucketCorrupt(format!(
                "bad offset: off={} size={} (header beyond log)",
                off, self.size
            )));
        }

        let off = off as usize;
        let len = u32::from_be_bytes(self.map[off..off + 4].try_into().unwrap());
        let key = u64::from_be_bytes(self.map[off + 4..off + 12].try_into().unwrap());

        if len > MAX_BLOB_SIZE {
            return Err(QueueError::BucketCorrupt(format!(
                "blob length {len} at offset {off} exceeds the 4 MiB item limit"
            )));
        }
        if off as u64 + (ITEM_HEADER_SIZE as u64) + len as u64 > self.size {
            return Err(QueueError::BucketCorrupt(format!(
                "bad offset: {}+{} beyond size {} (blob beyond log)",
                off, len, self.size
            )));
        }

        let blob_off = off + ITEM_HEADER_SIZE;
        Ok(Item {
            key: Key(key as i64),
            blob: &self.map[blob_off..blob_off + len as usize],
        })
    }

    /// Starts iterating the run described by `loc`.
    pub fn iter(&self, loc: Location) -> Result<RunIter<'_>> {
        RunIter::new(self, loc)
    }

    /// Cheap structural check that a location can possibly fit in this log.
    /// Full validation happens item by item while iterating.
    pub fn check_location(&self, loc: &Location) -> Result<()> {
        let min_bytes = loc.len as u64 * ITEM_HEADER_SIZE as u64;
        if loc.off + min_bytes > self.size {
            return Err(QueueError::BucketCorrupt(format!(
                "run of {} items at offset {} cannot fit in log of {} bytes",
                loc.len, loc.off, self.size
            )));
        }
        Ok(())
    }

    /// Rebuilds batch locations from the raw log: every maximal run of
    /// non-decreasing keys becomes one location. Push boundaries are not
    /// recorded on disk, so this is the best reconstruction possible.
    pub fn regenerate_locations(&self) -> Result<Vec<Location>> {
        let mut locations = Vec::new();
        let mut off = 0u64;
        let mut run: Option<(Location, Key)> = None;

        while off + ITEM_HEADER_SIZE as u64 <= self.size {
            let item = self.read_item_at(off)?;
            run = Some(match run.take() {
                Some((mut loc, last_key)) if item.key >= last_key => {
                    loc.len += 1;
                    (loc, item.key)
                }
                prev => {
                    if let Some((loc, _)) = prev {
                        locations.push(loc);
                    }
                    (
                        Location {
                            key: item.key,
                            off,
                            len: 1,
                        },
                        item.key,
                    )
                }
            });
            off += (ITEM_HEADER_SIZE + item.blob.len()) as u64;
        }

        if let Some((loc, _)) = run {
            locations.push(loc);
        }
        Ok(locations)
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Lazy walk over one contiguous run of items. Tracks the offset of the
/// current item so partial consumption can be committed as a suffix
/// location.
pub(crate) struct RunIter<'a> {
    log: &'a VLog,
    batch_key: Key,
    off: u64,
    remaining: u32,
    cur: Option<Item<'a>>,
}

impl<'a> RunIter<'a> {
    fn new(log: &'a VLog, loc: Location) -> Result<Self> {
        debug_assert!(!loc.is_tombstone());
        let cur = if loc.len > 0 {
            Some(log.read_item_at(loc.off)?)
        } else {
            None
        };
        Ok(Self {
            log,
            batch_key: loc.key,
            off: loc.off,
            remaining: loc.len,
            cur,
        })
    }

    /// The key the run is indexed under (first item key plus skew).
    pub fn batch_key(&self) -> Key {
        self.batch_key
    }

    pub fn current(&self) -> Option<Item<'a>> {
        self.cur
    }

    /// Offset of the current item, i.e. the start of the unconsumed suffix.
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Number of items left, including the current one.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Moves past the current item.
    pub fn advance(&mut self) -> Result<()> {
        let Some(cur) = self.cur else {
            return Ok(());
        };
        self.off += (ITEM_HEADER_SIZE + cur.blob.len()) as u64;
        self.remaining -= 1;
        self.cur = if self.remaining > 0 {
            Some(self.log.read_item_at(self.off)?)
        } else {
            None
        };
        Ok(())
    }
}
