// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The paged block file: a 1024-byte-page store with an LRU cache of dirty
//! blocks, a free list threaded through freed block contents, and a fixed
//! root block at offset 0.
//!
//! Grounded in `camel-block-file.h`'s `CamelBlockFile`/`CamelBlock`/
//! `CamelBlockRoot`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxBuildHasher;

use crate::coding::{read_u32, write_u32};
use crate::error::{Error, Result};
use crate::primitives::dlist::{DList, Handle};

/// Size, in bytes, of a block. Fixed by the on-disk format.
pub const BLOCK_SIZE: usize = 1024;

/// Number of low bits of a [`BlockId`] that are always zero.
pub const BLOCK_SIZE_BITS: u32 = 10;

const BLOCK_MASK: u32 = (BLOCK_SIZE as u32) - 1;

const ROOT_HEADER_LEN: usize = 8 + 4 + 4 + 4 + 4;

const FLAG_DIRTY: u32 = 1 << 0;
const FLAG_DETACHED: u32 = 1 << 1;

/// A 32-bit file offset identifying a block. The low [`BLOCK_SIZE_BITS`]
/// bits are always zero, i.e. every block is aligned on [`BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The sentinel "no block" id, used to terminate the free list.
    pub const NONE: Self = Self(0);

    /// Returns `true` if this is the sentinel id.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block@{:#x}", self.0)
    }
}

/// The root block stored at file offset 0.
#[derive(Debug, Clone)]
pub struct RootBlock {
    pub version: [u8; 8],
    pub flags: u32,
    pub block_size: u32,
    pub free: BlockId,
    pub last: BlockId,
    /// The remainder of the root block, available for subclass data, kept
    /// verbatim across reads/writes.
    pub extra: Vec<u8>,
}

impl RootBlock {
    fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0..8].copy_from_slice(&self.version);
        write_u32(&mut buf, 8, self.flags);
        write_u32(&mut buf, 12, self.block_size);
        write_u32(&mut buf, 16, self.free.0);
        write_u32(&mut buf, 20, self.last.0);
        let extra_len = self.extra.len().min(BLOCK_SIZE - ROOT_HEADER_LEN);
        buf[ROOT_HEADER_LEN..ROOT_HEADER_LEN + extra_len]
            .copy_from_slice(&self.extra[..extra_len]);
        buf
    }

    fn decode(buf: &[u8; BLOCK_SIZE]) -> Self {
        let mut version = [0u8; 8];
        version.copy_from_slice(&buf[0..8]);
        Self {
            version,
            flags: read_u32(buf, 8),
            block_size: read_u32(buf, 12),
            free: BlockId(read_u32(buf, 16)),
            last: BlockId(read_u32(buf, 20)),
            extra: buf[ROOT_HEADER_LEN..].to_vec(),
        }
    }
}

struct Entry {
    data: [u8; BLOCK_SIZE],
    flags: u32,
    refcount: u32,
    lru: Option<Handle>,
}

impl Entry {
    fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    fn is_detached(&self) -> bool {
        self.flags & FLAG_DETACHED != 0
    }
}

struct Inner {
    file: File,
    root: RootBlock,
    root_dirty: bool,
    cache: HashMap<BlockId, Entry, FxBuildHasher>,
    lru: DList<BlockId>,
    limit: usize,
}

/// Configuration for opening a [`BlockFile`].
#[derive(Debug, Clone)]
pub struct BlockFileConfig {
    /// Maximum number of attached blocks kept resident before eviction
    /// kicks in.
    pub block_cache_limit: usize,
    /// Whether `sync()` issues an `fsync` after writing dirty blocks.
    pub fsync_on_sync: bool,
}

impl Default for BlockFileConfig {
    fn default() -> Self {
        Self {
            block_cache_limit: 256,
            fsync_on_sync: true,
        }
    }
}

/// A paged, block-cached file.
pub struct BlockFile {
    path: PathBuf,
    version: [u8; 8],
    fsync_on_sync: bool,
    inner: Mutex<Inner>,
}

impl BlockFile {
    /// Opens or creates the block file at `path`.
    ///
    /// On creation the root block is zero-initialized with the given
    /// `version` tag and `block_size` fixed at [`BLOCK_SIZE`]. On open, the
    /// stored version and block size are compared against the expected
    /// ones and an [`Error::Invalid`] is returned on mismatch.
    pub fn open(path: impl AsRef<Path>, version: [u8; 8], config: BlockFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();

        let (root, root_dirty) = if len == 0 {
            log::debug!("creating new block file at {}", path.display());
            let root = RootBlock {
                version,
                flags: 0,
                block_size: BLOCK_SIZE as u32,
                free: BlockId::NONE,
                last: BlockId(BLOCK_SIZE as u32),
                extra: Vec::new(),
            };
            (root, true)
        } else {
            let mut buf = [0u8; BLOCK_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let root = RootBlock::decode(&buf);
            if root.version != version || root.block_size != BLOCK_SIZE as u32 {
                log::error!("block file {} failed root validation", path.display());
                return Err(Error::invalid("root block version/size mismatch"));
            }
            (root, false)
        };

        let inner = Inner {
            file,
            root,
            root_dirty,
            cache: HashMap::with_hasher(FxBuildHasher),
            lru: DList::new(),
            limit: config.block_cache_limit.max(1),
        };

        let this = Self {
            path,
            version,
            fsync_on_sync: config.fsync_on_sync,
            inner: Mutex::new(inner),
        };

        if root_dirty {
            this.sync()?;
        }

        Ok(this)
    }

    /// The path this block file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The version tag this block file was opened with.
    #[must_use]
    pub fn version(&self) -> [u8; 8] {
        self.version
    }

    fn read_block_from_disk(file: &mut File, id: BlockId) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(u64::from(id.0)))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block_to_disk(file: &mut File, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        file.seek(SeekFrom::Start(u64::from(id.0)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn evict_if_needed(inner: &mut Inner) {
        while inner.cache.len() > inner.limit {
            let mut victim = None;
            for (handle, id) in inner.lru.iter() {
                let entry = inner.cache.get(id).expect("lru and cache must agree");
                if entry.refcount == 0 && !entry.is_dirty() {
                    victim = Some((handle, *id));
                    break;
                }
            }
            match victim {
                Some((handle, id)) => {
                    inner.lru.remove(handle);
                    inner.cache.remove(&id);
                    log::debug!("evicted {id} from block cache");
                }
                None => break,
            }
        }
    }

    /// Allocates a new writable block, preferring the free list before
    /// extending the file.
    pub fn new_block(&self) -> Result<BlockGuard<'_>> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let id = if !inner.root.free.is_none() {
            let id = inner.root.free;
            let data = if let Some(entry) = inner.cache.get(&id) {
                entry.data
            } else {
                Self::read_block_from_disk(&mut inner.file, id)?
            };
            inner.root.free = BlockId(read_u32(&data, 0));
            id
        } else {
            let id = inner.root.last;
            inner.root.last = BlockId(inner.root.last.0 + BLOCK_SIZE as u32);
            let empty = [0u8; BLOCK_SIZE];
            inner.file.set_len(u64::from(inner.root.last.0))?;
            Self::write_block_to_disk(&mut inner.file, id, &empty)?;
            id
        };
        inner.root_dirty = true;

        let handle = inner.lru.add_tail(id);
        inner.cache.insert(
            id,
            Entry {
                data: [0u8; BLOCK_SIZE],
                flags: FLAG_DIRTY,
                refcount: 1,
                lru: Some(handle),
            },
        );
        Self::evict_if_needed(&mut inner);

        log::trace!("allocated new {id}");
        Ok(BlockGuard {
            file: self,
            id,
            fresh: true,
        })
    }

    /// Prepends `id` to the free list. The block's contents become
    /// unspecified.
    pub fn free_block(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let next = inner.root.free;

        let mut data = [0u8; BLOCK_SIZE];
        write_u32(&mut data, 0, next.0);

        if let Some(entry) = inner.cache.get_mut(&id) {
            entry.data = data;
            entry.flags |= FLAG_DIRTY;
            if let Some(handle) = entry.lru {
                inner.lru.remove(handle);
                let new_handle = inner.lru.add_tail(id);
                inner.cache.get_mut(&id).expect("just inserted").lru = Some(new_handle);
            }
        } else {
            let handle = inner.lru.add_tail(id);
            inner.cache.insert(
                id,
                Entry {
                    data,
                    flags: FLAG_DIRTY,
                    refcount: 0,
                    lru: Some(handle),
                },
            );
        }

        inner.root.free = id;
        inner.root_dirty = true;
        Self::evict_if_needed(&mut inner);
        log::debug!("freed {id}");
        Ok(())
    }

    /// Fetches `id`, inserting it into the cache on a miss.
    pub fn get_block(&self, id: BlockId) -> Result<BlockGuard<'_>> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if let Some(entry) = inner.cache.get_mut(&id) {
            entry.refcount += 1;
            log::trace!("cache hit for {id}");
            return Ok(BlockGuard {
                file: self,
                id,
                fresh: false,
            });
        }

        let data = Self::read_block_from_disk(&mut inner.file, id)?;
        let handle = inner.lru.add_tail(id);
        inner.cache.insert(
            id,
            Entry {
                data,
                flags: 0,
                refcount: 1,
                lru: Some(handle),
            },
        );
        Self::evict_if_needed(&mut inner);
        log::trace!("cache miss, loaded {id} from disk");

        Ok(BlockGuard {
            file: self,
            id,
            fresh: false,
        })
    }

    fn unref(&self, id: BlockId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        if let Some(entry) = inner.cache.get_mut(&id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 && !entry.is_detached() {
                Self::evict_if_needed(&mut inner);
            }
        }
    }

    fn touch(&self, id: BlockId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        if let Some(handle) = inner.cache.get(&id).and_then(|e| e.lru) {
            inner.lru.remove(handle);
            let new_handle = inner.lru.add_tail(id);
            if let Some(entry) = inner.cache.get_mut(&id) {
                entry.lru = Some(new_handle);
                entry.flags |= FLAG_DIRTY;
            }
        }
    }

    /// Detaches `id` from the LRU so it is never evicted, and excluded from
    /// generic `sync()`.
    pub fn detach_block(&self, id: BlockId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let handle = inner.cache.get(&id).and_then(|e| e.lru);
        if let Some(handle) = handle {
            inner.lru.remove(handle);
        }
        if let Some(entry) = inner.cache.get_mut(&id) {
            entry.lru = None;
            entry.flags |= FLAG_DETACHED;
        }
    }

    /// Re-attaches a previously detached block.
    pub fn attach_block(&self, id: BlockId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        if inner.cache.get(&id).map(Entry::is_detached) == Some(true) {
            let handle = inner.lru.add_tail(id);
            if let Some(entry) = inner.cache.get_mut(&id) {
                entry.lru = Some(handle);
                entry.flags &= !FLAG_DETACHED;
            }
            Self::evict_if_needed(&mut inner);
        }
    }

    /// Writes `id`'s bytes at its offset and clears its dirty flag.
    pub fn sync_block(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let data = match inner.cache.get(&id) {
            Some(entry) => entry.data,
            None => return Ok(()),
        };
        Self::write_block_to_disk(&mut inner.file, id, &data)?;
        if let Some(entry) = inner.cache.get_mut(&id) {
            entry.flags &= !FLAG_DIRTY;
        }
        Ok(())
    }

    /// Writes every dirty, attached block plus the root block.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let dirty: Vec<BlockId> = inner
            .cache
            .iter()
            .filter(|(_, e)| e.is_dirty() && !e.is_detached())
            .map(|(id, _)| *id)
            .collect();

        for id in dirty {
            let data = inner.cache.get(&id).expect("collected above").data;
            Self::write_block_to_disk(&mut inner.file, id, &data).map_err(|e| {
                log::error!("failed to sync {id}: {e}");
                e
            })?;
            if let Some(entry) = inner.cache.get_mut(&id) {
                entry.flags &= !FLAG_DIRTY;
            }
        }

        if inner.root_dirty {
            let encoded = inner.root.encode();
            Self::write_block_to_disk(&mut inner.file, BlockId::NONE, &encoded)?;
            inner.root_dirty = false;
        }

        if self.fsync_on_sync {
            inner.file.sync_data()?;
        }

        Ok(())
    }

    /// Returns the current `(free, last)` root pointers — used by tests and
    /// tooling to inspect free-list state without reopening the file.
    #[must_use]
    pub fn root_pointers(&self) -> (BlockId, BlockId) {
        let inner = self.inner.lock().expect("lock is poisoned");
        (inner.root.free, inner.root.last)
    }

    /// Walks the free list from the root, returning every id on it.
    pub fn free_list(&self) -> Result<Vec<BlockId>> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let mut cur = inner.root.free;
        while !cur.is_none() {
            if !seen.insert(cur) {
                return Err(Error::corrupt_block(cur, "cycle in free list"));
            }
            out.push(cur);
            let data = if let Some(entry) = inner.cache.get(&cur) {
                entry.data
            } else {
                Self::read_block_from_disk(&mut inner.file, cur)?
            };
            cur = BlockId(read_u32(&data, 0));
        }
        Ok(out)
    }

    /// Allocates a fresh root-relative extra data id range is not needed;
    /// exposes raw data-block read access for the key/partition tables,
    /// which address blocks that were allocated through [`new_block`].
    pub(crate) fn read_raw(&self, id: BlockId) -> Result<[u8; BLOCK_SIZE]> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        if let Some(entry) = inner.cache.get(&id) {
            return Ok(entry.data);
        }
        Self::read_block_from_disk(&mut inner.file, id)
    }
}

/// A cache-backed handle to a single block.
///
/// Dropping the guard decrements the block's refcount (Design Notes §9:
/// "owning handles plus borrowed references" in place of the original's
/// manually ref-counted `CamelBlock *`).
pub struct BlockGuard<'a> {
    file: &'a BlockFile,
    id: BlockId,
    fresh: bool,
}

impl<'a> BlockGuard<'a> {
    /// The id of the underlying block.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// `true` if this guard was returned by [`BlockFile::new_block`] rather
    /// than [`BlockFile::get_block`].
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Reads the block's 1024 bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
        let inner = self.file.inner.lock().expect("lock is poisoned");
        let entry = inner.cache.get(&self.id).expect("guard implies cache residency");
        f(&entry.data)
    }

    /// Mutates the block's 1024 bytes and marks it dirty (the write-intent
    /// gate the Design Notes ask for: only a `&mut BlockGuard` can reach
    /// this).
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        let result = {
            let mut inner = self.file.inner.lock().expect("lock is poisoned");
            let entry = inner
                .cache
                .get_mut(&self.id)
                .expect("guard implies cache residency");
            let result = f(&mut entry.data);
            entry.flags |= FLAG_DIRTY;
            result
        };
        self.file.touch(self.id);
        result
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.file.unref(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open(path: &Path) -> BlockFile {
        BlockFile::open(path, *b"edsp0001", BlockFileConfig::default()).unwrap()
    }

    #[test]
    fn new_block_allocates_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let bf = open(&path);

        let a = bf.new_block().unwrap().id();
        let b = bf.new_block().unwrap().id();
        let c = bf.new_block().unwrap().id();

        assert_eq!(a, BlockId(1024));
        assert_eq!(b, BlockId(2048));
        assert_eq!(c, BlockId(3072));
    }

    #[test]
    fn free_then_reopen_reuses_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let bf = open(&path);
            let _a = bf.new_block().unwrap().id();
            let b = bf.new_block().unwrap().id();
            let _c = bf.new_block().unwrap().id();
            bf.free_block(b).unwrap();
            bf.sync().unwrap();
        }

        let bf = open(&path);
        let free = bf.free_list().unwrap();
        assert_eq!(free, vec![BlockId(2048)]);

        let reused = bf.new_block().unwrap().id();
        assert_eq!(reused, BlockId(2048));
    }

    #[test]
    fn write_then_read_round_trips_after_sync_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let id = {
            let bf = open(&path);
            let mut guard = bf.new_block().unwrap();
            let id = guard.id();
            guard.write(|data| data[0..5].copy_from_slice(b"hello"));
            bf.sync().unwrap();
            id
        };

        let bf = open(&path);
        let guard = bf.get_block(id).unwrap();
        guard.read(|data| assert_eq!(&data[0..5], b"hello"));
    }

    #[test]
    fn validate_root_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let _bf = BlockFile::open(&path, *b"edsp0001", BlockFileConfig::default()).unwrap();
        }
        let err = BlockFile::open(&path, *b"other000", BlockFileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn eviction_skips_refcounted_and_dirty_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let bf = BlockFile::open(
            &path,
            *b"edsp0001",
            BlockFileConfig {
                block_cache_limit: 1,
                fsync_on_sync: false,
            },
        )
        .unwrap();

        let held = bf.new_block().unwrap(); // refcount 1, stays held
        let _second = bf.new_block().unwrap(); // triggers eviction attempt

        // The held block must still be readable: it was never evicted.
        held.read(|_| ());
    }
}
