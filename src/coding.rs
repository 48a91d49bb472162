// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Little-endian fixed-width encoding helpers for the on-disk block, key and
//! key-file layouts described in the storage format.

use byteorder::{ByteOrder, LittleEndian};

/// Reads a `u32` out of `buf` at `offset`.
///
/// # Panics
///
/// Panics if `offset + 4 > buf.len()`. Callers only ever call this at
/// offsets computed from the fixed block layout, so an out-of-range read
/// means the block itself is corrupt and should have been rejected earlier.
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

/// Writes a `u32` into `buf` at `offset`.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

/// Reads a `u64` out of `buf` at `offset`.
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&buf[offset..offset + 8])
}

/// Writes a `u64` into `buf` at `offset`.
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}
