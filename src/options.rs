use std::fmt;
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::types::Key;

/// Controls how aggressively mutations are flushed to disk. The choices
/// mirror SQLite's synchronous pragma: more syncing buys durability at the
/// cost of throughput.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Only sync when the queue is closed.
    None,
    /// Sync the value log on every mutation.
    Data,
    /// Sync the index logs on every mutation.
    Index,
    /// Sync both logs on every mutation.
    #[default]
    Full,
}

impl SyncMode {
    pub(crate) fn data(self) -> bool {
        matches!(self, SyncMode::Data | SyncMode::Full)
    }

    pub(crate) fn index(self) -> bool {
        matches!(self, SyncMode::Index | SyncMode::Full)
    }
}

/// How non-fatal corruption is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Abort the current operation on the first error that could mean
    /// data loss.
    #[default]
    Abort,
    /// Log a warning, skip the faulty bucket and keep going.
    Continue,
}

/// Maps every key to the key of the bucket it belongs to.
///
/// The function must be idempotent (`f(f(k)) == f(k)`), monotone
/// non-decreasing, and `f(k) <= k`, so that the returned value is the
/// minimum key of the bucket. The name identifies the function across
/// opens; a queue may not be reopened with a split function that does not
/// reproduce its on-disk bucket keys.
#[derive(Clone)]
pub struct SplitConf {
    pub name: String,
    func: Arc<dyn Fn(Key) -> Key + Send + Sync>,
}

impl SplitConf {
    pub fn new(name: impl Into<String>, func: impl Fn(Key) -> Key + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Buckets keys by masking the `shift` least significant bits. With
    /// nanosecond keys, a shift of 37 yields roughly two-minute buckets:
    /// `(2 ** shift) / (1e9 / 60)` minutes.
    pub fn shift(shift: u32) -> Self {
        let mask = !0i64 << shift;
        Self::new(format!("shift:{shift}"), move |key: Key| Key(key.0 & mask))
    }

    /// Buckets keys into fixed ranges of `n` consecutive key values.
    pub fn fixed_size(n: u64) -> Self {
        // avoid zero division.
        let n = n.max(1) as i64;
        Self::new(format!("fixed:{n}"), move |key: Key| {
            Key(key.0.div_euclid(n) * n)
        })
    }

    pub fn split(&self, key: Key) -> Key {
        (self.func)(key)
    }
}

impl fmt::Debug for SplitConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitConf").field("name", &self.name).finish()
    }
}

impl Default for SplitConf {
    fn default() -> Self {
        Self::shift(37)
    }
}

/// Queue configuration. `Options::default()` is a safe starting point;
/// benchmark before loosening the sync mode.
#[derive(Clone, Debug)]
pub struct Options {
    pub sync_mode: SyncMode,
    pub error_mode: ErrorMode,
    pub split: SplitConf,
    /// Maximum number of buckets kept open (mapped) at the same time.
    /// Values <= 0 disable eviction, which is not recommended: every
    /// bucket ever touched then keeps its map and file descriptors.
    pub max_parallel_open_buckets: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            error_mode: ErrorMode::default(),
            split: SplitConf::default(),
            max_parallel_open_buckets: 4,
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.split.name.is_empty() {
            return Err(QueueError::InvalidOptions("split function needs a name"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_split_truncates_to_buckets() {
        let conf = SplitConf::shift(4);
        assert_eq!(conf.split(Key(0)), Key(0));
        assert_eq!(conf.split(Key(15)), Key(0));
        assert_eq!(conf.split(Key(16)), Key(16));
        assert_eq!(conf.split(Key(17)), Key(16));
        // negative keys round towards negative infinity.
        assert_eq!(conf.split(Key(-1)), Key(-16));
        // idempotent.
        assert_eq!(conf.split(conf.split(Key(12345))), conf.split(Key(12345)));
    }

    #[test]
    fn fixed_size_split() {
        let conf = SplitConf::fixed_size(100);
        for idx in 0..1000 {
            assert_eq!(conf.split(Key(idx)), Key((idx / 100) * 100));
        }
        assert_eq!(conf.split(Key(-1)), Key(-100));
        assert_eq!(conf.split(Key(-100)), Key(-100));
        assert_eq!(conf.split(Key(-101)), Key(-200));
    }

    #[test]
    fn zero_sized_split_does_not_divide_by_zero() {
        let conf = SplitConf::fixed_size(0);
        assert_eq!(conf.split(Key(42)), Key(42));
    }

    #[test]
    fn options_validate() {
        assert!(Options::default().validate().is_ok());

        let mut opts = Options::default();
        opts.split = SplitConf::new("", |k| k);
        assert!(opts.validate().is_err());
    }
}
