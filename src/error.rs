use std::io;

use thiserror::Error;

use crate::types::{ForkName, Key};

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    #[error("split function changed: bucket {0} is not a fixed point of the configured split")]
    ChangedSplitFunc(Key),

    #[error("no such fork: {0}")]
    NoSuchFork(ForkName),

    #[error("invalid fork name at position {pos}: {name:?} (allowed: [A-Za-z0-9_-])")]
    InvalidForkName { name: String, pos: usize },

    #[error("delete range inverted: {from} > {to}")]
    DeleteRangeInverted { from: Key, to: Key },

    #[error("bucket corrupt: {0}")]
    BucketCorrupt(String),

    #[error("read callback: {0}")]
    Callback(String),
}

impl QueueError {
    /// Errors a continue-mode operation may log and step over. Everything
    /// else aborts regardless of the configured error mode.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(self, QueueError::BucketCorrupt(_) | QueueError::Io(_))
    }
}
