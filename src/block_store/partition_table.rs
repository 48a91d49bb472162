// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The partition table: a hash-keyed index mapping string keys to
//! [`KeyId`]s, stored as a linked list of partition-map blocks (hash-range
//! → leaf block) over leaf partition-key blocks (hash, keyid pairs).
//!
//! Grounded in `camel-partition-table.h`'s `CamelPartitionTable` /
//! `CamelPartitionMapBlock` / `CamelPartitionKeyBlock`.

use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::block_store::block::{BlockFile, BlockId, BLOCK_SIZE};
use crate::block_store::key_table::{KeyId, KeyTable};
use crate::coding::{read_u32, write_u32};
use crate::error::{Error, Result};

const MAP_HEADER_LEN: usize = 8; // next:u32, used:u32
const MAP_ENTRY_LEN: usize = 8; // hash:u32, blockid:u32
const MAP_CAPACITY: usize = (BLOCK_SIZE - MAP_HEADER_LEN) / MAP_ENTRY_LEN;

const KEY_HEADER_LEN: usize = 4; // used:u32
const KEY_ENTRY_LEN: usize = 8; // hash:u32, keyid:u32
const KEY_CAPACITY: usize = (BLOCK_SIZE - KEY_HEADER_LEN) / KEY_ENTRY_LEN;

/// Hashes `key` to the 32-bit value used to order it within the partition
/// table. Any stable hash works; the teacher's dependency on `rustc-hash`
/// is reused here rather than introducing a second hashing story.
fn hash_key(key: &str) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() & 0xffff_ffff) as u32
}

fn read_map_block(buf: &[u8; BLOCK_SIZE]) -> (BlockId, Vec<(u32, u32)>) {
    let next = BlockId(read_u32(buf, 0));
    let used = read_u32(buf, 4) as usize;
    let mut entries = Vec::with_capacity(used);
    for i in 0..used {
        let off = MAP_HEADER_LEN + i * MAP_ENTRY_LEN;
        entries.push((read_u32(buf, off), read_u32(buf, off + 4)));
    }
    (next, entries)
}

fn write_map_block(buf: &mut [u8; BLOCK_SIZE], next: BlockId, entries: &[(u32, u32)]) {
    debug_assert!(entries.len() <= MAP_CAPACITY);
    *buf = [0u8; BLOCK_SIZE];
    write_u32(buf, 0, next.0);
    write_u32(buf, 4, entries.len() as u32);
    for (i, (hash, blockid)) in entries.iter().enumerate() {
        let off = MAP_HEADER_LEN + i * MAP_ENTRY_LEN;
        write_u32(buf, off, *hash);
        write_u32(buf, off + 4, *blockid);
    }
}

fn read_key_block(buf: &[u8; BLOCK_SIZE]) -> Vec<(u32, u32)> {
    let used = read_u32(buf, 0) as usize;
    let mut entries = Vec::with_capacity(used);
    for i in 0..used {
        let off = KEY_HEADER_LEN + i * KEY_ENTRY_LEN;
        entries.push((read_u32(buf, off), read_u32(buf, off + 4)));
    }
    entries
}

fn write_key_block(buf: &mut [u8; BLOCK_SIZE], entries: &[(u32, u32)]) {
    debug_assert!(entries.len() <= KEY_CAPACITY);
    *buf = [0u8; BLOCK_SIZE];
    write_u32(buf, 0, entries.len() as u32);
    for (i, (hash, keyid)) in entries.iter().enumerate() {
        let off = KEY_HEADER_LEN + i * KEY_ENTRY_LEN;
        write_u32(buf, off, *hash);
        write_u32(buf, off + 4, *keyid);
    }
}

struct Located {
    map_block: BlockId,
    map_prev: Option<BlockId>,
    entry_index: usize,
    leaf: BlockId,
}

/// A hash-keyed index of `key -> KeyId`, chained over partition-map and
/// partition-key blocks in a [`BlockFile`].
pub struct PartitionTable {
    blocks: Arc<BlockFile>,
    root_id: BlockId,
}

impl PartitionTable {
    /// Opens (or initializes) a partition table whose map chain starts at
    /// `root` within `blocks`. `root` must already be a block allocated via
    /// [`BlockFile::new_block`]; a freshly-allocated, all-zero block is a
    /// valid empty table.
    pub fn new(blocks: Arc<BlockFile>, root: BlockId) -> Self {
        Self {
            blocks,
            root_id: root,
        }
    }

    fn locate(&self, target_hash: u32) -> Result<Option<Located>> {
        let mut map_block = self.root_id;
        let mut prev = None;
        loop {
            let guard = self.blocks.get_block(map_block)?;
            let (next, entries) = guard.read(read_map_block);
            if let Some(index) = entries.iter().position(|(hash, _)| target_hash <= *hash) {
                return Ok(Some(Located {
                    map_block,
                    map_prev: prev,
                    entry_index: index,
                    leaf: BlockId(entries[index].1),
                }));
            }
            if next.is_none() {
                return Ok(None);
            }
            prev = Some(map_block);
            map_block = next;
        }
    }

    /// Looks up `key`, returning its [`KeyId`] or [`KeyId::NONE`] if absent.
    pub fn lookup(&self, key: &str, key_table: &KeyTable) -> Result<KeyId> {
        let target = hash_key(key);
        let Some(located) = self.locate(target)? else {
            return Ok(KeyId::NONE);
        };

        let guard = self.blocks.get_block(located.leaf)?;
        let entries = guard.read(read_key_block);
        drop(guard);

        for (hash, keyid) in entries {
            if hash != target {
                continue;
            }
            let candidate = KeyId(keyid);
            if key_table.lookup_key(candidate)? == key {
                return Ok(candidate);
            }
        }
        Ok(KeyId::NONE)
    }

    /// Inserts `key -> keyid`. Fails with [`Error::Exists`] if `key` is
    /// already present.
    pub fn add(&self, key: &str, keyid: KeyId, key_table: &KeyTable) -> Result<()> {
        if !self.lookup(key, key_table)?.is_none() {
            return Err(Error::Exists);
        }

        let target = hash_key(key);

        let located = match self.locate(target)? {
            Some(l) => l,
            None => {
                // Table is entirely empty: create the first leaf and a
                // single map entry spanning the whole hash range.
                let leaf = self.blocks.new_block()?.id();
                let mut leaf_guard = self.blocks.get_block(leaf)?;
                leaf_guard.write(|buf| write_key_block(buf, &[]));
                drop(leaf_guard);

                let mut root_guard = self.blocks.get_block(self.root_id)?;
                root_guard.write(|buf| write_map_block(buf, BlockId::NONE, &[(u32::MAX, leaf.0)]));
                drop(root_guard);

                Located {
                    map_block: self.root_id,
                    map_prev: None,
                    entry_index: 0,
                    leaf,
                }
            }
        };

        let mut leaf_guard = self.blocks.get_block(located.leaf)?;
        let mut entries = leaf_guard.read(read_key_block);

        if entries.len() < KEY_CAPACITY {
            entries.push((target, keyid.0));
            leaf_guard.write(|buf| write_key_block(buf, &entries));
            return Ok(());
        }
        drop(leaf_guard);

        self.split_leaf(located, target, keyid.0)
    }

    fn split_leaf(&self, located: Located, target: u32, new_blockid: u32) -> Result<()> {
        let guard = self.blocks.get_block(located.leaf)?;
        let mut entries = guard.read(read_key_block);
        drop(guard);

        entries.push((target, new_blockid));
        entries.sort_by_key(|e| e.0);

        let mid = entries.len() / 2;
        let median = entries[mid - 1].0;
        let (lower, upper) = entries.split_at(mid);

        let sibling = self.blocks.new_block()?.id();

        let mut leaf_guard = self.blocks.get_block(located.leaf)?;
        leaf_guard.write(|buf| write_key_block(buf, lower));
        drop(leaf_guard);

        let mut sibling_guard = self.blocks.get_block(sibling)?;
        sibling_guard.write(|buf| write_key_block(buf, upper));
        drop(sibling_guard);

        log::debug!(
            "split partition leaf {} into {} (lower) and {sibling} (upper)",
            located.leaf,
            located.leaf
        );

        // The map entry that used to cover the whole range now covers only
        // the upper half, pointed at the sibling; a new entry bounded at
        // the median covers the lower half, still pointed at the original
        // leaf.
        let guard = self.blocks.get_block(located.map_block)?;
        let (next, mut map_entries) = guard.read(read_map_block);
        drop(guard);

        map_entries[located.entry_index].1 = sibling.0;
        map_entries.insert(located.entry_index, (median, located.leaf.0));

        if map_entries.len() <= MAP_CAPACITY {
            let mut guard = self.blocks.get_block(located.map_block)?;
            guard.write(|buf| write_map_block(buf, next, &map_entries));
            Ok(())
        } else {
            self.split_map_block(located.map_block, next, map_entries)
        }
    }

    fn split_map_block(&self, map_block: BlockId, next: BlockId, entries: Vec<(u32, u32)>) -> Result<()> {
        let mid = entries.len() / 2;
        let (lower, upper) = entries.split_at(mid);

        let new_map = self.blocks.new_block()?.id();

        let mut guard = self.blocks.get_block(map_block)?;
        guard.write(|buf| write_map_block(buf, new_map, lower));
        drop(guard);

        let mut new_guard = self.blocks.get_block(new_map)?;
        new_guard.write(|buf| write_map_block(buf, next, upper));

        log::debug!("split partition map block {map_block} into {map_block} and {new_map}");
        Ok(())
    }

    /// Removes `key`, if present. A no-op if `key` is absent.
    pub fn remove(&self, key: &str, key_table: &KeyTable) -> Result<()> {
        let target = hash_key(key);
        let Some(located) = self.locate(target)? else {
            return Ok(());
        };

        let guard = self.blocks.get_block(located.leaf)?;
        let mut entries = guard.read(read_key_block);
        drop(guard);

        let mut found = None;
        for (i, (hash, keyid)) in entries.iter().enumerate() {
            if *hash == target && key_table.lookup_key(KeyId(*keyid))? == key {
                found = Some(i);
                break;
            }
        }
        let Some(index) = found else {
            return Ok(());
        };
        entries.remove(index);

        let now_empty = entries.is_empty();
        let mut leaf_guard = self.blocks.get_block(located.leaf)?;
        leaf_guard.write(|buf| write_key_block(buf, &entries));
        drop(leaf_guard);

        if now_empty && located.map_prev.is_some() {
            self.coalesce_empty_map_entry(&located)?;
        }

        self.blocks.sync_block(located.leaf).ok();
        Ok(())
    }

    /// Removes the map entry pointing at a now-empty leaf and, if that
    /// empties the whole non-root map block, unlinks and frees it.
    fn coalesce_empty_map_entry(&self, located: &Located) -> Result<()> {
        let guard = self.blocks.get_block(located.map_block)?;
        let (next, mut entries) = guard.read(read_map_block);
        drop(guard);

        if located.entry_index < entries.len() {
            entries.remove(located.entry_index);
        }

        self.blocks.free_block(located.leaf)?;

        if entries.is_empty() && located.map_block != self.root_id {
            if let Some(prev) = located.map_prev {
                let mut prev_guard = self.blocks.get_block(prev)?;
                let (_, prev_entries) = prev_guard.read(read_map_block);
                prev_guard.write(|buf| write_map_block(buf, next, &prev_entries));
            }
            self.blocks.free_block(located.map_block)?;
            log::debug!("coalesced empty partition map block {}", located.map_block);
        } else {
            let mut guard = self.blocks.get_block(located.map_block)?;
            guard.write(|buf| write_map_block(buf, next, &entries));
        }

        Ok(())
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

    fn new_tables(path: &std::path::Path) -> (Arc<BlockFile>, PartitionTable, KeyTable) {
        let blocks = Arc::new(BlockFile::open(path, *b"edsp0001", BlockFileConfig::default()).unwrap());
        let part_root = blocks.new_block().unwrap().id();
        let key_root = blocks.new_block().unwrap().id();
        let part = PartitionTable::new(blocks.clone(), part_root);
        let keys = KeyTable::new(blocks.clone(), key_root).unwrap();
        (blocks, part, keys)
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, part, keys) = new_tables(&dir.path().join("part.db"));

        let alpha_id = keys.add("alpha", BlockId::NONE, 0).unwrap();
        let beta_id = keys.add("beta", BlockId::NONE, 0).unwrap();

        part.add("alpha", alpha_id, &keys).unwrap();
        part.add("beta", beta_id, &keys).unwrap();

        assert_eq!(part.lookup("alpha", &keys).unwrap(), alpha_id);
        assert_eq!(part.lookup("beta", &keys).unwrap(), beta_id);

        part.remove("alpha", &keys).unwrap();
        assert!(part.lookup("alpha", &keys).unwrap().is_none());
        assert_eq!(part.lookup("beta", &keys).unwrap(), beta_id);
    }

    #[test]
    fn duplicate_add_fails_with_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, part, keys) = new_tables(&dir.path().join("part.db"));
        let id = keys.add("dup", BlockId::NONE, 0).unwrap();
        part.add("dup", id, &keys).unwrap();
        let err = part.add("dup", id, &keys).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }

    #[test]
    fn lookup_of_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, part, keys) = new_tables(&dir.path().join("part.db"));
        assert!(part.lookup("missing", &keys).unwrap().is_none());
    }

    #[test]
    fn splits_leaf_after_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let (_blocks, part, keys) = new_tables(&dir.path().join("part.db"));

        let mut ids = Vec::new();
        for i in 0..(KEY_CAPACITY + 10) {
            let key = format!("key-{i}");
            let id = keys.add(&key, BlockId::NONE, 0).unwrap();
            part.add(&key, id, &keys).unwrap();
            ids.push((key, id));
        }

        for (key, id) in ids {
            assert_eq!(part.lookup(&key, &keys).unwrap(), id);
        }
    }
}
