// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The key table: a chained run of blocks holding `(string, data-block,
//! flags)` records, addressed by [`KeyId`].
//!
//! Grounded in `camel-partition-table.h`'s `CamelKeyTable`/`CamelKeyBlock`/
//! `CamelKeyKey`.

use std::sync::Arc;

use crate::block_store::block::{BlockFile, BlockId, BLOCK_SIZE};
use crate::coding::{read_u32, write_u32};
use crate::error::{Error, Result};

/// Maximum length, in bytes, of any key string.
pub const KEY_TABLE_MAX_KEY: usize = 128;

const KEY_BLOCK_HEADER_LEN: usize = 8; // next:u32, used:u32
const RECORD_LEN: usize = 8; // data_block:u32, (str_offset:10 | flags:22)
const MAX_SLOTS_PER_BLOCK: u32 = ((BLOCK_SIZE - KEY_BLOCK_HEADER_LEN) / RECORD_LEN) as u32;
const STR_OFFSET_BITS: u32 = 10;
const STR_OFFSET_MASK: u32 = (1 << STR_OFFSET_BITS) - 1;

/// A bitfield identifier: high bits are a block offset into the owning
/// block file, low [`BLOCK_SIZE_BITS`](crate::block_store::BLOCK_SIZE_BITS)
/// bits are the slot within that block. Slot `0` is never assigned, so a
/// valid `KeyId` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeyId(pub u32);

impl KeyId {
    /// The "no id" sentinel.
    pub const NONE: Self = Self(0);

    fn new(block: BlockId, slot: u32) -> Self {
        debug_assert!(slot >= 1 && slot <= MAX_SLOTS_PER_BLOCK);
        Self(block.0 | slot)
    }

    fn block(self) -> BlockId {
        BlockId(self.0 & !((BLOCK_SIZE as u32) - 1))
    }

    fn slot(self) -> u32 {
        self.0 & ((BLOCK_SIZE as u32) - 1)
    }

    /// Returns `true` if this is the sentinel id.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key@{:#x}", self.0)
    }
}

fn record_offset(slot: u32) -> usize {
    KEY_BLOCK_HEADER_LEN + (slot as usize - 1) * RECORD_LEN
}

/// Reads the `(data_block, str_offset, flags)` triple of `slot` out of a
/// raw key block buffer.
fn read_record(buf: &[u8; BLOCK_SIZE], slot: u32) -> (BlockId, u32, u32) {
    let off = record_offset(slot);
    let data = BlockId(read_u32(buf, off));
    let packed = read_u32(buf, off + 4);
    (data, packed & STR_OFFSET_MASK, packed >> STR_OFFSET_BITS)
}

fn write_record(buf: &mut [u8; BLOCK_SIZE], slot: u32, data: BlockId, str_offset: u32, flags: u32) {
    let off = record_offset(slot);
    write_u32(buf, off, data.0);
    write_u32(buf, off + 4, (flags << STR_OFFSET_BITS) | (str_offset & STR_OFFSET_MASK));
}

fn read_used(buf: &[u8; BLOCK_SIZE]) -> u32 {
    read_u32(buf, 4)
}

fn write_used(buf: &mut [u8; BLOCK_SIZE], used: u32) {
    write_u32(buf, 4, used);
}

fn read_next(buf: &[u8; BLOCK_SIZE]) -> BlockId {
    BlockId(read_u32(buf, 0))
}

fn write_next(buf: &mut [u8; BLOCK_SIZE], next: BlockId) {
    write_u32(buf, 0, next.0);
}

fn read_string(buf: &[u8; BLOCK_SIZE], str_offset: u32) -> String {
    let off = str_offset as usize;
    let len = buf[off] as usize;
    String::from_utf8_lossy(&buf[off + 1..off + 1 + len]).into_owned()
}

/// The lowest currently-occupied string offset in `buf`, or `BLOCK_SIZE` if
/// no strings have been written yet — i.e. the exclusive upper bound of the
/// next string to append.
fn string_tail(buf: &[u8; BLOCK_SIZE], used: u32) -> u32 {
    let mut tail = BLOCK_SIZE as u32;
    for slot in 1..=used {
        let (_, str_offset, _) = read_record(buf, slot);
        tail = tail.min(str_offset);
    }
    tail
}

/// A chained run of blocks mapping [`KeyId`] to `(key, data block, flags)`.
pub struct KeyTable {
    blocks: Arc<BlockFile>,
    root_id: BlockId,
}

struct Root {
    first: BlockId,
    last: BlockId,
}

impl KeyTable {
    /// Opens (or initializes, if `root` was just allocated and is all
    /// zeroes) a key table rooted at `root` within `blocks`.
    pub fn new(blocks: Arc<BlockFile>, root: BlockId) -> Result<Self> {
        let table = Self {
            blocks,
            root_id: root,
        };
        // Zero-initialized roots (first == last == BlockId(0)) are already
        // valid "empty table" state; nothing further to do.
        Ok(table)
    }

    fn read_root(&self) -> Result<Root> {
        let guard = self.blocks.get_block(self.root_id)?;
        let (first, last) = guard.read(|buf| (BlockId(read_u32(buf, 0)), BlockId(read_u32(buf, 4))));
        Ok(Root { first, last })
    }

    fn write_root(&self, root: &Root) -> Result<()> {
        let mut guard = self.blocks.get_block(self.root_id)?;
        guard.write(|buf| {
            write_u32(buf, 0, root.first.0);
            write_u32(buf, 4, root.last.0);
        });
        Ok(())
    }

    /// Appends a new `(key, data, flags)` record, returning its id.
    pub fn add(&self, key: &str, data: BlockId, flags: u32) -> Result<KeyId> {
        if key.len() > KEY_TABLE_MAX_KEY {
            return Err(Error::invalid(format!(
                "key of {} bytes exceeds KEY_TABLE_MAX_KEY ({KEY_TABLE_MAX_KEY})",
                key.len()
            )));
        }

        let mut root = self.read_root()?;
        let needed = 1 + key.len() as u32;

        let (block_id, is_new_block) = if root.last.is_none() {
            (self.blocks.new_block()?.id(), true)
        } else {
            (root.last, false)
        };

        let mut guard = self.blocks.get_block(block_id)?;
        let fits = guard.read(|buf| {
            let used = read_used(buf);
            if used >= MAX_SLOTS_PER_BLOCK {
                return false;
            }
            let tail = string_tail(buf, used);
            let record_end = KEY_BLOCK_HEADER_LEN + (used as usize + 1) * RECORD_LEN;
            record_end + needed as usize <= tail as usize
        });

        let (target_block, slot) = if fits || is_new_block {
            // `is_new_block` blocks are guaranteed to fit a single first
            // record (1024 - 8 header bytes comfortably covers one
            // KEY_TABLE_MAX_KEY-sized entry).
            let slot = guard.read(|buf| read_used(buf) + 1);
            guard.write(|buf| {
                let used = read_used(buf);
                let tail = string_tail(buf, used);
                let str_offset = tail - needed;
                buf[str_offset as usize] = key.len() as u8;
                buf[str_offset as usize + 1..str_offset as usize + 1 + key.len()]
                    .copy_from_slice(key.as_bytes());
                write_record(buf, slot, data, str_offset, flags);
                write_used(buf, slot);
            });
            drop(guard);
            (block_id, slot)
        } else {
            drop(guard);
            let new_block = self.blocks.new_block()?;
            let new_id = new_block.id();
            drop(new_block);

            let mut old = self.blocks.get_block(block_id)?;
            old.write(|buf| write_next(buf, new_id));
            drop(old);

            let mut fresh = self.blocks.get_block(new_id)?;
            fresh.write(|buf| {
                let str_offset = BLOCK_SIZE as u32 - needed;
                buf[str_offset as usize] = key.len() as u8;
                buf[str_offset as usize + 1..str_offset as usize + 1 + key.len()]
                    .copy_from_slice(key.as_bytes());
                write_record(buf, 1, data, str_offset, flags);
                write_used(buf, 1);
            });
            log::debug!("key table chained new block {new_id}");
            (new_id, 1)
        };

        if root.first.is_none() {
            root.first = target_block;
        }
        if target_block != root.last {
            root.last = target_block;
        }
        self.write_root(&root)?;

        Ok(KeyId::new(target_block, slot))
    }

    /// Updates the data-block pointer for `keyid`.
    pub fn set_data(&self, keyid: KeyId, data: BlockId) -> Result<()> {
        if keyid.is_none() {
            return Err(Error::invalid("KeyId::NONE has no record"));
        }
        let mut guard = self.blocks.get_block(keyid.block())?;
        guard.write(|buf| {
            let (_, str_offset, flags) = read_record(buf, keyid.slot());
            write_record(buf, keyid.slot(), data, str_offset, flags);
        });
        Ok(())
    }

    /// Sets or clears the bits in `mask` on `keyid`'s flags.
    pub fn set_flags(&self, keyid: KeyId, mask: u32, set: bool) -> Result<()> {
        if keyid.is_none() {
            return Err(Error::invalid("KeyId::NONE has no record"));
        }
        let mut guard = self.blocks.get_block(keyid.block())?;
        guard.write(|buf| {
            let (data, str_offset, flags) = read_record(buf, keyid.slot());
            let new_flags = if set { flags | mask } else { flags & !mask };
            write_record(buf, keyid.slot(), data, str_offset, new_flags);
        });
        Ok(())
    }

    /// Looks up `(key, data, flags)` for `keyid`.
    pub fn lookup(&self, keyid: KeyId) -> Result<(String, BlockId, u32)> {
        if keyid.is_none() {
            return Err(Error::NotFound);
        }
        let guard = self.blocks.get_block(keyid.block())?;
        guard.read(|buf| {
            let used = read_used(buf);
            if keyid.slot() == 0 || keyid.slot() > used {
                return Err(Error::NotFound);
            }
            let (data, str_offset, flags) = read_record(buf, keyid.slot());
            let key = read_string(buf, str_offset);
            Ok((key, data, flags))
        })
    }

    /// Returns the key string only, for [`crate::block_store::PartitionTable`]
    /// to disambiguate hash collisions.
    pub(crate) fn lookup_key(&self, keyid: KeyId) -> Result<String> {
        self.lookup(keyid).map(|(key, _, _)| key)
    }

    /// Returns the next valid id after `prev` in block/slot order, or
    /// [`KeyId::NONE`] when iteration is exhausted. Passing
    /// [`KeyId::NONE`] starts iteration from the beginning.
    pub fn next(&self, prev: KeyId) -> Result<KeyId> {
        let root = self.read_root()?;

        let (mut block, mut slot) = if prev.is_none() {
            (root.first, 0)
        } else {
            (prev.block(), prev.slot())
        };

        if block.is_none() {
            return Ok(KeyId::NONE);
        }

        loop {
            let guard = self.blocks.get_block(block)?;
            let (used, next_block) = guard.read(|buf| (read_used(buf), read_next(buf)));
            if slot < used {
                return Ok(KeyId::new(block, slot + 1));
            }
            if next_block.is_none() {
                return Ok(KeyId::NONE);
            }
            block = next_block;
            slot = 0;
        }
    }

    /// Delegates to the owning block file's `sync()`.
    pub fn sync(&self) -> Result<()> {
        self.blocks.sync()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_store::block::BlockFileConfig;

    fn new_table(path: &std::path::Path) -> (Arc<BlockFile>, KeyTable) {
        let blocks = Arc::new(BlockFile::open(path, *b"edsp0001", BlockFileConfig::default()).unwrap());
        let root = blocks.new_block().unwrap().id();
        let table = KeyTable::new(blocks.clone(), root).unwrap();
        (blocks, table)
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, table) = new_table(&dir.path().join("keys.db"));

        let id = table.add("alpha", BlockId(4096), 7).unwrap();
        let (key, data, flags) = table.lookup(id).unwrap();
        assert_eq!(key, "alpha");
        assert_eq!(data, BlockId(4096));
        assert_eq!(flags, 7);
    }

    #[test]
    fn set_data_and_set_flags_mutate_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, table) = new_table(&dir.path().join("keys.db"));

        let id = table.add("beta", BlockId(1024), 0).unwrap();
        table.set_data(id, BlockId(2048)).unwrap();
        table.set_flags(id, 0b101, true).unwrap();

        let (_key, data, flags) = table.lookup(id).unwrap();
        assert_eq!(data, BlockId(2048));
        assert_eq!(flags, 0b101);

        table.set_flags(id, 0b100, false).unwrap();
        let (_, _, flags) = table.lookup(id).unwrap();
        assert_eq!(flags, 0b001);
    }

    #[test]
    fn next_iterates_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, table) = new_table(&dir.path().join("keys.db"));

        let a = table.add("a", BlockId::NONE, 0).unwrap();
        let b = table.add("b", BlockId::NONE, 0).unwrap();
        let c = table.add("c", BlockId::NONE, 0).unwrap();

        let mut cur = KeyId::NONE;
        let mut seen = Vec::new();
        loop {
            cur = table.next(cur).unwrap();
            if cur.is_none() {
                break;
            }
            seen.push(cur);
        }
        assert_eq!(seen, vec![a, b, c]);
    }

    #[test]
    fn key_too_long_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, table) = new_table(&dir.path().join("keys.db"));
        let long_key = "x".repeat(KEY_TABLE_MAX_KEY + 1);
        let err = table.add(&long_key, BlockId::NONE, 0).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn chains_new_block_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, table) = new_table(&dir.path().join("keys.db"));

        // Each ~120-byte key forces the block to chain well before the
        // 127-record structural limit, exercising the `next` pointer path.
        let mut ids = Vec::new();
        for i in 0..20 {
            let key = format!("{i:0>120}");
            ids.push(table.add(&key, BlockId::NONE, 0).unwrap());
        }

        for (i, id) in ids.iter().enumerate() {
            let (key, _, _) = table.lookup(*id).unwrap();
            assert_eq!(key, format!("{i:0>120}"));
        }
    }
}
