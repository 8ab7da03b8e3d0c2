//! # Skip-List Ordered Index
//!
//! An ordered index built entirely out of an open-addressing map chunk: no
//! tree, no host-language pointers, no rebalancing. Every stored key's
//! payload area is extended with a *column* — a probabilistic height plus
//! forward pointers expressed as plain slot indices into the same map —
//! which yields logarithmic expected-time ordered insert, remove, lookup
//! and range scans over data that is nothing but bytes in a chunk.
//!
//! ## Column Layout
//!
//! The backing map is created with a fixed payload of
//! `1 + 4 × max_height + user_payload_size` bytes:
//!
//! ```text
//! Offset            Size             Description
//! ------            ----             ------------------------------------
//! 0                 1                height: levels in use for this key
//! 1                 4 × max_height   level pointers (i32 slot index, -1 = none)
//! 1+4×max_height    user size        caller payload
//! ```
//!
//! Level 0 is always the *back* link; level 1 is the primary forward chain
//! that visits every key in order; higher levels skip geometrically further
//! ahead. Every column reserves all `max_height` pointer slots so that the
//! map's fixed-size payload contract holds; the height byte says how many
//! are meaningful.
//!
//! ## The Head Sentinel
//!
//! Each list reserves one key as the head sentinel, inserted at full height
//! when the list is created. The head is excluded from counts and from all
//! user-visible iteration, and user keys must never collide with it —
//! `add` rejects the head key outright. By convention callers pick a key
//! that sorts strictly before all user keys (the empty key for
//! variable-size maps, all zero bytes otherwise).
//!
//! ## Heights
//!
//! `max_height` is a pure function of map capacity (one level of headroom
//! per doubling), so reopening a chunk always reconstructs the same
//! geometry. New columns draw their height geometrically: start at 2, grow
//! while a fair coin lands heads, capped below `max_height`.
//!
//! ## Growth
//!
//! Like the map underneath, a skip list never grows in place. `copy_to`
//! re-inserts every live key into a larger list, rebuilding columns fresh;
//! the statistical height distribution is preserved, individual heights are
//! not.

pub mod store;

use std::cmp::Ordering;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::map::MapContext;

/// Pointer slots are 4-byte slot indices; -1 marks the absent pointer.
pub const COLUMN_KEY_SIZE: u32 = 4;

const MAX_COLUMN_HEIGHT: u8 = 32;

pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Unsigned byte-wise ordering; the default comparator.
pub fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Half-open key range `[start, stop)` for range scans.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start_inclusive: Vec<u8>,
    pub stop_exclusive: Vec<u8>,
}

impl KeyRange {
    pub fn new(start_inclusive: impl Into<Vec<u8>>, stop_exclusive: impl Into<Vec<u8>>) -> Self {
        Self {
            start_inclusive: start_inclusive.into(),
            stop_exclusive: stop_exclusive.into(),
        }
    }

    pub fn contains(&self, key: &[u8], comparator: KeyComparator) -> bool {
        comparator(key, &self.start_inclusive) != Ordering::Less
            && comparator(key, &self.stop_exclusive) == Ordering::Less
    }
}

/// An ordered view over one map chunk: the backing map context plus the
/// sentinel bookkeeping and the comparator that defines key order.
pub struct SkipListMapContext {
    pub map: MapContext,
    head_index: u32,
    head_key: Vec<u8>,
    max_height: u8,
    comparator: KeyComparator,
    rng: SmallRng,
}

impl std::fmt::Debug for SkipListMapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipListMapContext")
            .field("map", &self.map)
            .field("head_index", &self.head_index)
            .field("max_height", &self.max_height)
            .finish_non_exhaustive()
    }
}

impl SkipListMapContext {
    pub(crate) fn new(
        map: MapContext,
        head_index: u32,
        head_key: Vec<u8>,
        comparator: KeyComparator,
    ) -> Self {
        let max_height = height_fit(map.capacity);
        Self {
            map,
            head_index,
            head_key,
            max_height,
            comparator,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn head_index(&self) -> u32 {
        self.head_index
    }

    pub fn head_key(&self) -> &[u8] {
        &self.head_key
    }

    pub fn max_height(&self) -> u8 {
        self.max_height
    }

    pub fn comparator(&self) -> KeyComparator {
        self.comparator
    }

    pub(crate) fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Bytes of caller payload per entry, after the pointer column.
    pub fn user_payload_size(&self) -> u32 {
        self.map.payload_size - column_size(self.max_height)
    }
}

/// Pointer-column bytes for a given maximum height.
pub fn column_size(max_height: u8) -> u32 {
    1 + COLUMN_KEY_SIZE * max_height as u32
}

/// Maximum column height for a map of `capacity` slots: one level of
/// headroom per doubling, floored at 2, capped at 32.
pub fn height_fit(capacity: u32) -> u8 {
    for i in 1..=64u32 {
        if (capacity as u64) < (1u64 << i) {
            return ((1 + i) as u8).min(MAX_COLUMN_HEIGHT).max(2);
        }
    }
    MAX_COLUMN_HEIGHT
}

/// Draw a column height from `random_bits`: start at 2, one more level per
/// trailing one bit, always strictly below `max_height` (the head sentinel
/// alone stands at full height).
pub fn column_height(random_bits: u64, max_height: u8) -> u8 {
    let mut height = 2u8;
    let mut bits = random_bits;
    while bits & 1 == 1 {
        if height + 1 >= max_height {
            break;
        }
        height += 1;
        bits >>= 1;
    }
    height
}
