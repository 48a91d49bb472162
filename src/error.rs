// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block_store::BlockId;

/// Represents errors that can occur in the block store, partition/key
/// tables and key-file log.
///
/// The taxonomy is fixed by the storage format: callers that want to treat
/// cancellation as a normal unwind can match on `Error::Cancelled`
/// specifically rather than treating every error the same way.
#[derive(Debug)]
pub enum Error {
    /// Underlying OS read/write/flush failure.
    Io(std::io::Error),

    /// A structural invariant was violated (bad version, impossible
    /// offset, cycle, non-monotonic hash range, key block under/overflow).
    Corrupt(String),

    /// An argument was out of domain (key too long, unknown id, array too
    /// short).
    Invalid(String),

    /// An operation observed cancellation.
    Cancelled,

    /// Duplicate insertion into a set that forbids duplicates.
    Exists,

    /// Lookup or remove on a missing key / id.
    NotFound,
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn corrupt_block(id: BlockId, msg: impl std::fmt::Display) -> Self {
        Self::Corrupt(format!("block {id}: {msg}"))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            Self::Cancelled => write!(f, "operation was cancelled"),
            Self::Exists => write!(f, "key already exists"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
