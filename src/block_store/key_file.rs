// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The key-file: an append-only log of key-id runs, each record carrying
//! the offset of the record it supersedes so that a reader can walk the
//! chain backward from any known offset.
//!
//! Grounded in `camel-key-file.h`'s `CamelKeyFile`. Unlike the block store,
//! records here are variable-length and never rewritten in place; summary
//! upgraders append a new run and repoint callers at its offset rather than
//! mutating history.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::coding::read_u32;
use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"EKF1";
const HEADER_LEN: u64 = 8;
const RECORD_HEADER_LEN: usize = 8; // previous:u32, count:u32

/// The sentinel "no previous record" offset. Valid record offsets are
/// always `>= HEADER_LEN`, so zero is free to use.
pub const KEY_FILE_START: u32 = 0;

/// Configuration for opening a [`KeyFile`].
#[derive(Debug, Clone, Copy)]
pub struct KeyFileConfig {
    /// Whether [`KeyFile::write`] issues an `fsync` after each append.
    pub fsync_on_write: bool,
}

impl Default for KeyFileConfig {
    fn default() -> Self {
        Self { fsync_on_write: true }
    }
}

/// An append-only log of key-id runs.
///
/// Appends are serialized through an internal lock, so multiple threads may
/// call [`KeyFile::write`] concurrently without external synchronization.
/// On POSIX, unlinking the path out from under an open `KeyFile` is safe:
/// the underlying file descriptor keeps working for anyone still holding
/// this handle, it simply stops being reachable by path for new openers.
pub struct KeyFile {
    path: PathBuf,
    file: Mutex<File>,
    fsync_on_write: bool,
}

impl KeyFile {
    /// Opens or creates the key-file at `path`.
    pub fn open(path: impl AsRef<Path>, config: KeyFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            log::debug!("creating new key file at {}", path.display());
            file.write_all(&MAGIC)?;
            file.write_all(&[0u8; 4])?;
            if config.fsync_on_write {
                file.sync_data()?;
            }
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if magic != MAGIC {
                log::error!("key file {} failed header validation", path.display());
                return Err(Error::invalid("key file magic mismatch"));
            }
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            fsync_on_write: config.fsync_on_write,
        })
    }

    /// The path this key-file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record of `keys`, chained after `parent` (pass
    /// [`KEY_FILE_START`] for the first record in a chain), and returns the
    /// new record's own offset.
    pub fn write(&self, parent: u32, keys: &[u32]) -> Result<u32> {
        let mut file = self.file.lock().expect("lock is poisoned");
        let offset = file.seek(SeekFrom::End(0))?;
        let offset = u32::try_from(offset).map_err(|_| Error::corrupt("key file exceeds 4GiB"))?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + keys.len() * 4);
        buf.extend_from_slice(&parent.to_le_bytes());
        buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
        for key in keys {
            buf.extend_from_slice(&key.to_le_bytes());
        }

        file.write_all(&buf)?;
        if self.fsync_on_write {
            file.sync_data()?;
        }

        log::trace!("key file appended {} keys at offset {offset}", keys.len());
        Ok(offset)
    }

    /// Reads the record at `start`, returning its keys and the offset of
    /// the record it supersedes (or [`KEY_FILE_START`] if `start` was the
    /// first record written).
    pub fn read(&self, start: u32) -> Result<(Vec<u32>, u32)> {
        if start < HEADER_LEN as u32 {
            return Err(Error::invalid("key file offset precedes header"));
        }

        let mut file = self.file.lock().expect("lock is poisoned");
        file.seek(SeekFrom::Start(u64::from(start)))?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        file.read_exact(&mut header)?;
        let previous = read_u32(&header, 0);
        let count = read_u32(&header, 4) as usize;

        let mut raw = vec![0u8; count * 4];
        file.read_exact(&mut raw)?;

        let mut keys = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(4) {
            keys.push(u32::from_le_bytes(chunk.try_into().expect("chunks_exact(4)")));
        }

        Ok((keys, previous))
    }

    /// Flushes buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock().expect("lock is poisoned");
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let kf = KeyFile::open(dir.path().join("keys.log"), KeyFileConfig::default()).unwrap();

        let offset = kf.write(KEY_FILE_START, &[1, 2, 3]).unwrap();
        let (keys, previous) = kf.read(offset).unwrap();

        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(previous, KEY_FILE_START);
    }

    #[test]
    fn chain_of_writes_walks_backward() {
        let dir = tempfile::tempdir().unwrap();
        let kf = KeyFile::open(dir.path().join("keys.log"), KeyFileConfig::default()).unwrap();

        let first = kf.write(KEY_FILE_START, &[1]).unwrap();
        let second = kf.write(first, &[2, 3]).unwrap();
        let third = kf.write(second, &[4]).unwrap();

        let (keys3, prev3) = kf.read(third).unwrap();
        assert_eq!(keys3, vec![4]);
        assert_eq!(prev3, second);

        let (keys2, prev2) = kf.read(prev3).unwrap();
        assert_eq!(keys2, vec![2, 3]);
        assert_eq!(prev2, first);

        let (keys1, prev1) = kf.read(prev2).unwrap();
        assert_eq!(keys1, vec![1]);
        assert_eq!(prev1, KEY_FILE_START);
    }

    #[test]
    fn reopen_after_close_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");

        let offset = {
            let kf = KeyFile::open(&path, KeyFileConfig::default()).unwrap();
            kf.write(KEY_FILE_START, &[9, 8, 7]).unwrap()
        };

        let kf = KeyFile::open(&path, KeyFileConfig::default()).unwrap();
        let (keys, previous) = kf.read(offset).unwrap();
        assert_eq!(keys, vec![9, 8, 7]);
        assert_eq!(previous, KEY_FILE_START);
    }

    #[test]
    fn reopening_with_bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");
        std::fs::write(&path, b"NOTMAGIC").unwrap();
        let err = KeyFile::open(&path, KeyFileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
