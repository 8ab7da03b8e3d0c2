//! The grow protocol: three operations over a "monkey" (a materialized
//! context decoded from chunk bytes) and its backing filer.
//!
//! - `acquire` is the optimistic check: `None` means the current capacity
//!   accommodates the pending operation, `Some(hint)` names the capacity a
//!   replacement chunk needs.
//! - `grow_and_acquire` copies every live entry from the old chunk into the
//!   freshly allocated one. If the new capacity still falls short the
//!   policy that produced the hint is defective, and the protocol fails
//!   loudly rather than retrying.
//! - `release` undoes the bookkeeping of whichever acquire succeeded.
//!
//! Callers hold the affected slot's write guard across the whole sequence
//! and touch the old chunk before the new one; see the module docs in
//! [`crate::tx`].

use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{ensure, Result};

use crate::map::{self, MapContext};
use crate::skiplist::{self, KeyComparator, SkipListMapContext};
use crate::storage::Filer;

/// Decode a context ("monkey") from an existing chunk.
pub trait OpenFiler<M>: Send + Sync {
    fn open(&self, filer: &Filer) -> Result<M>;
}

/// Size and initialize a fresh chunk for a given capacity hint.
pub trait CreateFiler<M>: Send + Sync {
    /// Payload bytes a chunk needs to hold `hint` units.
    fn required_size(&self, hint: u64) -> u64;

    fn create(&self, hint: u64, filer: &Filer) -> Result<M>;
}

/// The grow policy for one family of chunks.
pub trait GrowFiler<M>: Send + Sync {
    /// `None` when the current chunk fits; otherwise the capacity hint for
    /// the replacement.
    fn acquire(&self, monkey: &M, filer: &Filer) -> Result<Option<u64>>;

    fn grow_and_acquire(
        &self,
        current: &M,
        current_filer: &Filer,
        new: &mut M,
        new_filer: &Filer,
    ) -> Result<()>;

    fn release(&self, _monkey: &M) {}
}

// ---------------------------------------------------------------------
// Raw chunks (no interior structure)
// ---------------------------------------------------------------------

/// Opener for chunks with no decoded context.
pub struct NoOpOpenFiler;

impl OpenFiler<()> for NoOpOpenFiler {
    fn open(&self, _filer: &Filer) -> Result<()> {
        Ok(())
    }
}

/// Creator for raw byte chunks: the hint is the payload size itself.
pub struct RawFilerCreator;

impl CreateFiler<()> for RawFilerCreator {
    fn required_size(&self, hint: u64) -> u64 {
        hint
    }

    fn create(&self, _hint: u64, _filer: &Filer) -> Result<()> {
        Ok(())
    }
}

/// Grow-to-fit for raw chunks: when the current payload is shorter than the
/// requested size, the replacement carries the old bytes verbatim.
pub struct OverwriteGrower {
    size_hint: u64,
}

impl OverwriteGrower {
    pub fn new(size_hint: u64) -> Self {
        Self { size_hint }
    }
}

impl GrowFiler<()> for OverwriteGrower {
    fn acquire(&self, _monkey: &(), filer: &Filer) -> Result<Option<u64>> {
        if filer.length() < self.size_hint {
            Ok(Some(self.size_hint))
        } else {
            Ok(None)
        }
    }

    fn grow_and_acquire(
        &self,
        _current: &(),
        current_filer: &Filer,
        _new: &mut (),
        new_filer: &Filer,
    ) -> Result<()> {
        ensure!(
            new_filer.length() >= self.size_hint,
            "grown chunk of {} bytes still cannot hold {} bytes: sizing policy is defective",
            new_filer.length(),
            self.size_hint
        );

        let mut buf = [0u8; 4096];
        let mut offset = 0u64;
        let len = current_filer.length();
        while offset < len {
            let n = (len - offset).min(buf.len() as u64) as usize;
            current_filer.read_at(offset, &mut buf[..n])?;
            new_filer.write_at(offset, &buf[..n])?;
            offset += n as u64;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Open-addressing map chunks
// ---------------------------------------------------------------------

pub struct MapOpener;

impl OpenFiler<MapContext> for MapOpener {
    fn open(&self, filer: &Filer) -> Result<MapContext> {
        map::store::open(filer)
    }
}

/// Creator for map chunks; the hint is the slot capacity.
pub struct MapIndexCreator {
    pub key_size: u32,
    pub variable_key: bool,
    pub payload_size: u32,
    pub variable_payload: bool,
}

impl CreateFiler<MapContext> for MapIndexCreator {
    fn required_size(&self, hint: u64) -> u64 {
        map::store::compute_filer_size(
            hint as u32,
            self.key_size,
            self.variable_key,
            self.payload_size,
            self.variable_payload,
        )
    }

    fn create(&self, hint: u64, filer: &Filer) -> Result<MapContext> {
        map::store::create(
            filer,
            hint as u32,
            self.key_size,
            self.variable_key,
            self.payload_size,
            self.variable_payload,
        )
    }
}

/// "Always room for N more keys": a reservation counter tracks how many
/// slots concurrent holders have spoken for, and the hint doubles the
/// capacity until the reservation fits.
pub struct MapGrower {
    room_for: u32,
    reserved: AtomicU32,
}

impl MapGrower {
    pub fn new(room_for: u32) -> Self {
        Self {
            room_for,
            reserved: AtomicU32::new(0),
        }
    }
}

impl GrowFiler<MapContext> for MapGrower {
    fn acquire(&self, monkey: &MapContext, _filer: &Filer) -> Result<Option<u64>> {
        let reserved = self.reserved.load(Ordering::Acquire);
        if monkey.count() + reserved + self.room_for <= monkey.capacity {
            self.reserved.fetch_add(self.room_for, Ordering::AcqRel);
            return Ok(None);
        }
        let mut target = map::store::next_grow_size(monkey).max(1);
        while target < monkey.count() + reserved + self.room_for {
            target = target.saturating_mul(2);
        }
        Ok(Some(target as u64))
    }

    fn grow_and_acquire(
        &self,
        current: &MapContext,
        current_filer: &Filer,
        new: &mut MapContext,
        new_filer: &Filer,
    ) -> Result<()> {
        ensure!(
            current.count() + self.room_for <= new.capacity,
            "grown map of {} slots still cannot hold {} live keys plus {} reserved: sizing policy is defective",
            new.capacity,
            current.count(),
            self.room_for
        );
        map::store::copy_to(current_filer, current, new_filer, new, None)?;
        self.reserved.fetch_add(self.room_for, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, _monkey: &MapContext) {
        self.reserved.fetch_sub(self.room_for, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------
// Skip-list chunks
// ---------------------------------------------------------------------

pub struct SkipListOpener {
    pub head_key: Vec<u8>,
    pub comparator: KeyComparator,
}

impl OpenFiler<SkipListMapContext> for SkipListOpener {
    fn open(&self, filer: &Filer) -> Result<SkipListMapContext> {
        skiplist::store::open(filer, &self.head_key, self.comparator)
    }
}

/// Creator for skip-list chunks; the hint is the user key capacity
/// (sentinel slots excluded).
pub struct SkipListIndexCreator {
    pub key_size: u32,
    pub variable_key: bool,
    pub payload_size: u32,
    pub head_key: Vec<u8>,
    pub comparator: KeyComparator,
}

impl CreateFiler<SkipListMapContext> for SkipListIndexCreator {
    fn required_size(&self, hint: u64) -> u64 {
        skiplist::store::compute_filer_size(
            hint as u32,
            self.key_size,
            self.variable_key,
            self.payload_size,
        )
    }

    fn create(&self, hint: u64, filer: &Filer) -> Result<SkipListMapContext> {
        skiplist::store::create(
            filer,
            hint as u32,
            &self.head_key,
            self.key_size,
            self.variable_key,
            self.payload_size,
            self.comparator,
        )
    }
}

/// The skip-list twin of [`MapGrower`]; capacities are counted in user keys.
pub struct SkipListGrower {
    room_for: u32,
    reserved: AtomicU32,
}

impl SkipListGrower {
    pub fn new(room_for: u32) -> Self {
        Self {
            room_for,
            reserved: AtomicU32::new(0),
        }
    }
}

impl GrowFiler<SkipListMapContext> for SkipListGrower {
    fn acquire(&self, monkey: &SkipListMapContext, _filer: &Filer) -> Result<Option<u64>> {
        let reserved = self.reserved.load(Ordering::Acquire);
        if monkey.map.count() + reserved + self.room_for <= monkey.map.capacity {
            self.reserved.fetch_add(self.room_for, Ordering::AcqRel);
            return Ok(None);
        }
        let mut target = skiplist::store::next_grow_size(monkey).max(1);
        while target + 2 < monkey.map.count() + reserved + self.room_for {
            target = target.saturating_mul(2);
        }
        Ok(Some(target as u64))
    }

    fn grow_and_acquire(
        &self,
        current: &SkipListMapContext,
        current_filer: &Filer,
        new: &mut SkipListMapContext,
        new_filer: &Filer,
    ) -> Result<()> {
        ensure!(
            current.map.count() + self.room_for <= new.map.capacity,
            "grown skip list of {} slots still cannot hold {} live keys plus {} reserved: sizing policy is defective",
            new.map.capacity,
            current.map.count(),
            self.room_for
        );
        skiplist::store::copy_to(current_filer, current, new_filer, new)?;
        self.reserved.fetch_add(self.room_for, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, _monkey: &SkipListMapContext) {
        self.reserved.fetch_sub(self.room_for, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MODE_FILLED;
    use crate::storage::{ByteRegion, ChunkStore};

    #[test]
    fn overwrite_grower_acquires_only_when_short() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let fp = store.new_chunk(64).unwrap();
        let filer = store.filer(fp).unwrap();

        let fits = OverwriteGrower::new(32);
        assert!(fits.acquire(&(), &filer).unwrap().is_none());

        let short = OverwriteGrower::new(4096);
        assert_eq!(short.acquire(&(), &filer).unwrap(), Some(4096));
    }

    #[test]
    fn overwrite_grower_copies_old_bytes_forward() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let old_fp = store.new_chunk(64).unwrap();
        let old = store.filer(old_fp).unwrap();
        old.write_at(0, b"carried forward").unwrap();

        let grower = OverwriteGrower::new(1024);
        let new_fp = store.new_chunk(1024).unwrap();
        let new = store.filer(new_fp).unwrap();
        grower.grow_and_acquire(&(), &old, &mut (), &new).unwrap();

        let mut buf = [0u8; 15];
        new.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"carried forward");
    }

    #[test]
    fn map_grower_reserves_and_releases() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let creator = MapIndexCreator {
            key_size: 4,
            variable_key: false,
            payload_size: 8,
            variable_payload: false,
        };
        let fp = store.new_chunk(creator.required_size(4)).unwrap();
        let filer = store.filer(fp).unwrap();
        let ctx = creator.create(4, &filer).unwrap();

        let grower = MapGrower::new(1);
        assert!(grower.acquire(&ctx, &filer).unwrap().is_none());
        assert_eq!(grower.reserved.load(Ordering::Acquire), 1);
        grower.release(&ctx);
        assert_eq!(grower.reserved.load(Ordering::Acquire), 0);
    }

    #[test]
    fn map_grower_hints_a_doubling_when_full() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let creator = MapIndexCreator {
            key_size: 4,
            variable_key: false,
            payload_size: 8,
            variable_payload: false,
        };
        let fp = store.new_chunk(creator.required_size(2)).unwrap();
        let filer = store.filer(fp).unwrap();
        let mut ctx = creator.create(2, &filer).unwrap();

        map::store::add(&filer, &mut ctx, MODE_FILLED, b"aaaa", &0u64.to_le_bytes()).unwrap();
        map::store::add(&filer, &mut ctx, MODE_FILLED, b"bbbb", &0u64.to_le_bytes()).unwrap();

        let grower = MapGrower::new(1);
        assert_eq!(grower.acquire(&ctx, &filer).unwrap(), Some(4));
    }

    #[test]
    fn map_grower_rejects_an_insufficient_replacement() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let creator = MapIndexCreator {
            key_size: 4,
            variable_key: false,
            payload_size: 8,
            variable_payload: false,
        };

        let old_fp = store.new_chunk(creator.required_size(4)).unwrap();
        let old_filer = store.filer(old_fp).unwrap();
        let mut old = creator.create(4, &old_filer).unwrap();
        for k in [b"aaaa", b"bbbb", b"cccc", b"dddd"] {
            map::store::add(&old_filer, &mut old, MODE_FILLED, k, &0u64.to_le_bytes()).unwrap();
        }

        // A replacement no bigger than the live set plus headroom must fail.
        let new_fp = store.new_chunk(creator.required_size(4)).unwrap();
        let new_filer = store.filer(new_fp).unwrap();
        let mut new = creator.create(4, &new_filer).unwrap();

        let grower = MapGrower::new(1);
        let err = grower
            .grow_and_acquire(&old, &old_filer, &mut new, &new_filer)
            .unwrap_err();
        assert!(err.to_string().contains("sizing policy is defective"));
    }
}
