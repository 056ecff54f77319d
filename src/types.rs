use std::fmt;
use std::str::FromStr;

use crate::error::{QueueError, Result};

/// Size of the fixed header in front of every value log item
/// (4 bytes blob length, 8 bytes key).
pub const ITEM_HEADER_SIZE: usize = 12;

/// Upper bound for a single item's blob.
pub const MAX_BLOB_SIZE: u32 = 4 * 1024 * 1024;

/// Physical size of one index log record: 8 bytes key, 8 bytes value log
/// offset, 4 bytes run length, 4 bytes trailer.
pub const LOCATION_SIZE: usize = 24;

/// Size of the running item-count trailer at the end of each index record.
pub const TRAILER_SIZE: usize = 4;

/// How far a duplicate batch key may be nudged to find a free index slot.
pub const MAX_SKEW: i64 = 100;

/// Priority of an item. Lower keys are read first. Typically a nanosecond
/// timestamp, but any mostly-monotonic signed integer works.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Key(pub i64);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Key {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<i64>().map(Key)
    }
}

/// A single queue entry. The blob borrows whatever storage backs it; on the
/// read path that is the bucket's memory map, so it must not be kept around
/// after the read callback returns. Use [`Item::to_owned`] to retain data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Item<'a> {
    pub key: Key,
    pub blob: &'a [u8],
}

impl Item<'_> {
    pub fn to_owned(&self) -> OwnedItem {
        OwnedItem {
            key: self.key,
            blob: self.blob.to_vec(),
        }
    }
}

/// An item that owns its blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedItem {
    pub key: Key,
    pub blob: Vec<u8>,
}

impl OwnedItem {
    pub fn new(key: Key, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            blob: blob.into(),
        }
    }

    pub fn as_item(&self) -> Item<'_> {
        Item {
            key: self.key,
            blob: &self.blob,
        }
    }
}

/// Points to a contiguous run of `len` items in a value log, starting at
/// byte offset `off`. `key` is the key the run is indexed under, which is
/// the first item's key plus a possible skew. A `len` of zero is a
/// tombstone: on replay it removes whatever was indexed at `key`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub key: Key,
    pub off: u64,
    pub len: u32,
}

impl Location {
    pub fn is_tombstone(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn tombstone(key: Key) -> Self {
        Self { key, off: 0, len: 0 }
    }
}

/// Verdict returned by a read callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadOp {
    /// Consume the items; they will not be handed out again.
    Pop,
    /// Leave the items in place.
    Peek,
}

/// Name of a reader fork. The empty name is reserved for the default
/// cursor; user-supplied names consist of `[A-Za-z0-9_-]` only.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ForkName(String);

const DEFAULT_INDEX_FILE: &str = "idx.log";
const INDEX_FILE_SUFFIX: &str = ".idx.log";

impl ForkName {
    /// Validates and wraps a user-supplied fork name.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(QueueError::InvalidForkName {
                name: name.to_string(),
                pos: 0,
            });
        }

        for (pos, ch) in name.chars().enumerate() {
            let ok = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_';
            if !ok {
                return Err(QueueError::InvalidForkName {
                    name: name.to_string(),
                    pos,
                });
            }
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// File name of this fork's index log inside a bucket directory.
    pub(crate) fn index_file_name(&self) -> String {
        if self.is_default() {
            DEFAULT_INDEX_FILE.to_string()
        } else {
            format!("{}{}", self.0, INDEX_FILE_SUFFIX)
        }
    }

    /// Inverse of [`ForkName::index_file_name`]. Returns `None` for files
    /// that are not index logs at all; invalid fork names are an error.
    pub(crate) fn from_index_file_name(file: &str) -> Option<Result<Self>> {
        if file == DEFAULT_INDEX_FILE {
            return Some(Ok(Self::default()));
        }
        file.strip_suffix(INDEX_FILE_SUFFIX).map(Self::new)
    }
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "(default)")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
