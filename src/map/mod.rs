//! # Open-Addressing Map
//!
//! A hash table materialized entirely inside one chunk's payload bytes. No
//! host-language collection backs it: the table is a header plus a dense
//! array of fixed-size slots, addressed by index arithmetic, so the whole
//! structure is exactly as durable and as shareable as the chunk it lives
//! in.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field                Description
//! ------  ----  -------------------  --------------------------------
//! 0       4     capacity             Slot count
//! 4       4     key_size             Max key bytes per slot
//! 8       4     payload_size         Max payload bytes per slot
//! 12      1     key_length_size      0 = fixed keys, 2 = u16 prefix
//! 13      1     payload_length_size  0 = fixed payloads, 2 = u16 prefix
//! 14      2     flags                Reserved, zero
//! 16      4     count                Live entries
//! 20      ...   capacity × entry     Slots
//! ```
//!
//! Each slot is `[1B mode][key area][payload area]`; the key area is
//! `key_length_size + key_size` bytes and the payload area is
//! `payload_length_size + payload_size` bytes, so `entry_size` is identical
//! for every slot and slot `i` lives at `20 + i * entry_size`. Mode is one
//! of:
//!
//! - `NULL` (0): never used — probing stops here
//! - `FILLED` (1): a live entry
//! - `SKIP` (2): a tombstone — probing continues past it, inserts reuse it
//!
//! ## Probing
//!
//! The home slot is `fnv1a64(key) % capacity`; collisions probe linearly
//! with wrap-around. Deletion writes a tombstone rather than emptying the
//! slot, otherwise entries probed past the deleted slot would become
//! unreachable.
//!
//! ## Growth
//!
//! The map never grows itself. When [`store::is_full`] reports true the
//! caller allocates a fresh, larger map (see [`store::next_grow_size`]) and
//! re-adds every live entry via [`store::copy_to`] — the only resize path.
//! Adding to a table with no free or tombstoned slot is an error that
//! signals a broken grow policy upstream, not a condition to retry.

pub mod store;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const MAP_HEADER_SIZE: u64 = 20;

pub const MODE_NULL: u8 = 0;
pub const MODE_FILLED: u8 = 1;
pub const MODE_SKIP: u8 = 2;

/// FNV-1a over the key bytes; the home-slot hash for every map in the
/// engine and the striping hash for lock pools.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct MapHeader {
    pub capacity: u32,
    pub key_size: u32,
    pub payload_size: u32,
    pub key_length_size: u8,
    pub payload_length_size: u8,
    pub flags: u16,
    pub count: u32,
}

/// Decoded map header plus the derived slot geometry. Cheap to rebuild from
/// a filer at any time; the authoritative `count` also lives in the chunk
/// and is kept in sync by every mutation.
#[derive(Debug, Clone)]
pub struct MapContext {
    pub capacity: u32,
    pub key_size: u32,
    pub payload_size: u32,
    pub key_length_size: u8,
    pub payload_length_size: u8,
    count: u32,
}

impl MapContext {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.count = count;
    }

    pub fn key_area(&self) -> u64 {
        self.key_length_size as u64 + self.key_size as u64
    }

    pub fn payload_area(&self) -> u64 {
        self.payload_length_size as u64 + self.payload_size as u64
    }

    pub fn entry_size(&self) -> u64 {
        1 + self.key_area() + self.payload_area()
    }

    pub fn slot_offset(&self, index: u32) -> u64 {
        MAP_HEADER_SIZE + index as u64 * self.entry_size()
    }

    pub(crate) fn key_offset(&self, index: u32) -> u64 {
        self.slot_offset(index) + 1
    }

    /// Start of the payload area (including any length prefix) for a slot.
    /// The skip list addresses its pointer columns relative to this.
    pub fn payload_offset(&self, index: u32) -> u64 {
        self.slot_offset(index) + 1 + self.key_area()
    }

    pub(crate) fn validate_key(&self, key: &[u8]) -> Result<()> {
        if self.key_length_size == 0 {
            ensure!(
                key.len() == self.key_size as usize,
                "key of {} bytes does not match fixed key size {}",
                key.len(),
                self.key_size
            );
        } else {
            ensure!(
                key.len() <= self.key_size as usize,
                "key of {} bytes exceeds declared key size {}",
                key.len(),
                self.key_size
            );
        }
        Ok(())
    }

    pub(crate) fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        if self.payload_length_size == 0 {
            ensure!(
                payload.len() == self.payload_size as usize,
                "payload of {} bytes does not match fixed payload size {}",
                payload.len(),
                self.payload_size
            );
        } else {
            ensure!(
                payload.len() <= self.payload_size as usize,
                "payload of {} bytes exceeds declared payload size {}",
                payload.len(),
                self.payload_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_is_deterministic_and_spreads() {
        assert_eq!(fnv1a64(b"key"), fnv1a64(b"key"));
        assert_ne!(fnv1a64(b"key"), fnv1a64(b"kez"));
        assert_ne!(fnv1a64(b""), fnv1a64(b"\0"));
    }

    #[test]
    fn entry_geometry_accounts_for_length_prefixes() {
        let fixed = MapContext {
            capacity: 8,
            key_size: 4,
            payload_size: 8,
            key_length_size: 0,
            payload_length_size: 0,
            count: 0,
        };
        assert_eq!(fixed.entry_size(), 1 + 4 + 8);
        assert_eq!(fixed.slot_offset(2), MAP_HEADER_SIZE + 2 * 13);

        let variable = MapContext {
            key_length_size: 2,
            ..fixed
        };
        assert_eq!(variable.entry_size(), 1 + 2 + 4 + 8);
        assert_eq!(variable.payload_offset(0), MAP_HEADER_SIZE + 1 + 6);
    }
}
