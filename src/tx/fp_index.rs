//! Key→FP indexes that live inside chunks of the store they index, plus the
//! sky-hook bootstrap and the generic commit combinator.
//!
//! ## The Sky Hook
//!
//! The first chunk a store ever allocates is the bootstrap chunk:
//!
//! ```text
//! Offset  Size     Description
//! ------  ----     ---------------------------------------------
//! 0       8        Sky-hook magic
//! 8       64 × 8   Per-power index FP (i64, -1 until allocated)
//! ```
//!
//! Slot `p` points at the key→FP index for keys whose length falls in the
//! power-of-two bucket `p` (`power = ceil(log2(max(len, 1)))`). Slots are
//! allocated lazily on the first touch of a key of that size class, under a
//! double-checked lock with an atomic slot cache, so keys of wildly
//! different lengths never share one fixed-key-size map. Because variable
//! keys carry a u16 length prefix, powers above 16 stay reserved.
//!
//! A magic mismatch on an existing bootstrap chunk is fatal corruption:
//! nothing else in the store can be trusted past it.
//!
//! ## Index Flavors
//!
//! [`MapBackedKeyedFPIndex`] stores key→FP in a plain open-addressing map;
//! [`SkipListBackedKeyedFPIndex`] stores it in a skip list so key streaming
//! honors ranges in comparator order. Both grow their own backing map
//! through the grow protocol and reseat themselves by rewriting their sky
//! hook slot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::map::{self, MapContext, MODE_FILLED};
use crate::skiplist::{self, lexicographic, KeyRange, SkipListMapContext};
use crate::storage::{ChunkStore, Filer, STORE_HEADER_SIZE};

use super::grow::{
    CreateFiler, GrowFiler, MapGrower, MapIndexCreator, OpenFiler, SkipListGrower,
    SkipListIndexCreator,
};
use super::locks::StripedRwLocks;

/// The bootstrap chunk is always the first allocation of a store.
pub const SKY_HOOK_FP: u64 = STORE_HEADER_SIZE;

/// Largest supported key-length power; the u16 length prefix of variable
/// keys cannot express anything longer. Sky hook slots above this stay
/// reserved.
pub const MAX_KEY_POWER: u8 = 16;

const SKY_HOOK_MAGIC: u64 = u64::from_le_bytes(*b"loamhook");
const SKY_HOOK_SIZE: u64 = 8 + 64 * 8;
const INITIAL_INDEX_CAPACITY: u64 = 2;
const INDEX_STRIPES: usize = 64;
const INDEX_PAYLOAD: u32 = 8;

/// How per-power indexes order their keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrdering {
    /// Plain open-addressing maps; key streams come back in slot order.
    Unordered,
    /// Skip-list maps; key streams honor ranges in comparator order.
    Ordered,
}

/// Re-seat an index after its backing map moved to a new chunk.
type Relocate = Box<dyn Fn(u64) -> Result<()> + Send + Sync>;

/// The contract [`commit`] runs against: a key→FP mapping whose `lookup`
/// and `insert` are called with the key slot's permit already held. Both
/// still serialize against the index's own table lock internally — permits
/// order commits per key, the table lock keeps the shared map itself
/// consistent across keys.
pub trait BackingFPIndex: Send + Sync {
    /// Striped permits for this index; one slot per key hash.
    fn permits(&self) -> &StripedRwLocks;

    /// Lookup without taking a permit — the caller holds this key's permit.
    fn lookup(&self, key: &[u8]) -> Result<Option<u64>>;

    /// Insert without taking a permit — the caller holds this key's write
    /// permit. Grows the backing map as needed.
    fn insert(&self, key: &[u8], fp: u64) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let _permit = self.permits().read_key(key);
        self.lookup(key)
    }

    fn set(&self, key: &[u8], fp: u64) -> Result<()> {
        let _permit = self.permits().write_key(key);
        self.insert(key, fp)
    }

    /// Drop the mapping, returning the FP it held.
    fn remove_key(&self, key: &[u8]) -> Result<Option<u64>>;

    /// Visit mapped keys; ordered flavors honor `ranges` in comparator
    /// order, unordered flavors filter a slot-order scan.
    fn stream_keys(
        &self,
        ranges: Option<&[KeyRange]>,
        visitor: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool>;

    fn count(&self) -> Result<u32>;
}

/// Resolve the chunk holding `key`'s value and run `tx` against it.
///
/// Misses allocate through `creator` when a `hint` is supplied (otherwise
/// the commit returns `None` untouched). When the grower reports the
/// current chunk too small, a replacement is allocated and filled under
/// the same guard, the index is swapped to the new FP, the old chunk is
/// recycled, and the lookup re-derived — the transaction always sees the
/// final, grown structure.
pub fn commit<M, R>(
    index: &dyn BackingFPIndex,
    store: &Arc<ChunkStore>,
    key: &[u8],
    hint: Option<u64>,
    creator: &dyn CreateFiler<M>,
    opener: &dyn OpenFiler<M>,
    grower: Option<&dyn GrowFiler<M>>,
    tx: impl FnOnce(&mut M, &Filer) -> Result<R>,
) -> Result<Option<R>> {
    let _guard = index.permits().write_key(key);

    let mut fp = match index.lookup(key)? {
        Some(fp) => fp,
        None => {
            let Some(hint) = hint else {
                return Ok(None);
            };
            let fp = store.new_chunk(creator.required_size(hint))?;
            let filer = store.filer(fp)?;
            creator.create(hint, &filer)?;
            index.insert(key, fp)?;
            fp
        }
    };

    let mut filer = store.filer(fp)?;
    let mut monkey = opener.open(&filer)?;

    if let Some(grower) = grower {
        if let Some(grow_hint) = grower.acquire(&monkey, &filer)? {
            let new_fp = store.new_chunk(creator.required_size(grow_hint))?;
            let new_filer = store.filer(new_fp)?;
            let mut new_monkey = creator.create(grow_hint, &new_filer)?;
            grower.grow_and_acquire(&monkey, &filer, &mut new_monkey, &new_filer)?;
            index.insert(key, new_fp)?;
            store.recycle(fp)?;
            debug!(old_fp = fp, new_fp, "grew keyed chunk");

            fp = new_fp;
            filer = store.filer(fp)?;
            monkey = opener.open(&filer)?;
        }
        let result = tx(&mut monkey, &filer);
        grower.release(&monkey);
        return result.map(Some);
    }

    tx(&mut monkey, &filer).map(Some)
}

// ---------------------------------------------------------------------
// Map-backed flavor
// ---------------------------------------------------------------------

pub struct MapBackedKeyedFPIndex {
    store: Arc<ChunkStore>,
    fp: AtomicU64,
    creator: MapIndexCreator,
    grower: MapGrower,
    permits: StripedRwLocks,
    table: RwLock<()>,
    relocate: Relocate,
}

impl MapBackedKeyedFPIndex {
    /// Allocate and initialize a fresh index map chunk; returns its FP.
    pub fn create(store: &Arc<ChunkStore>, key_size: u32, capacity: u32) -> Result<u64> {
        let creator = Self::index_creator(key_size);
        let fp = store.new_chunk(creator.required_size(capacity as u64))?;
        let filer = store.filer(fp)?;
        creator.create(capacity as u64, &filer)?;
        Ok(fp)
    }

    pub fn open(
        store: Arc<ChunkStore>,
        fp: u64,
        key_size: u32,
        relocate: Relocate,
    ) -> Result<Self> {
        map::store::open(&store.filer(fp)?)?;
        Ok(Self {
            store,
            fp: AtomicU64::new(fp),
            creator: Self::index_creator(key_size),
            grower: MapGrower::new(1),
            permits: StripedRwLocks::new(INDEX_STRIPES),
            table: RwLock::new(()),
            relocate,
        })
    }

    pub fn fp(&self) -> u64 {
        self.fp.load(Ordering::Acquire)
    }

    /// Resolve `key`'s chunk through this index and run `tx` against it;
    /// see the free-standing [`commit`] for the full contract.
    pub fn commit<M, R>(
        &self,
        key: &[u8],
        hint: Option<u64>,
        creator: &dyn CreateFiler<M>,
        opener: &dyn OpenFiler<M>,
        grower: Option<&dyn GrowFiler<M>>,
        tx: impl FnOnce(&mut M, &Filer) -> Result<R>,
    ) -> Result<Option<R>> {
        commit(self, &self.store, key, hint, creator, opener, grower, tx)
    }

    fn index_creator(key_size: u32) -> MapIndexCreator {
        MapIndexCreator {
            key_size,
            variable_key: true,
            payload_size: INDEX_PAYLOAD,
            variable_payload: false,
        }
    }

    fn filer_ctx(&self) -> Result<(Filer, MapContext)> {
        let filer = self.store.filer(self.fp())?;
        let ctx = map::store::open(&filer)?;
        Ok((filer, ctx))
    }
}

impl BackingFPIndex for MapBackedKeyedFPIndex {
    fn permits(&self) -> &StripedRwLocks {
        &self.permits
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<u64>> {
        let _table = self.table.read();
        let (filer, ctx) = self.filer_ctx()?;
        Ok(map::store::get_payload(&filer, &ctx, key)?
            .map(|payload| u64::from_le_bytes(payload.try_into().unwrap_or([0; 8]))))
    }

    fn insert(&self, key: &[u8], fp: u64) -> Result<()> {
        let _table = self.table.write();
        let (filer, mut ctx) = self.filer_ctx()?;

        if let Some(hint) = self.grower.acquire(&ctx, &filer)? {
            let new_fp = self.store.new_chunk(self.creator.required_size(hint))?;
            let new_filer = self.store.filer(new_fp)?;
            let mut new_ctx = self.creator.create(hint, &new_filer)?;
            self.grower.grow_and_acquire(&ctx, &filer, &mut new_ctx, &new_filer)?;

            let old_fp = self.fp();
            (self.relocate)(new_fp)?;
            self.fp.store(new_fp, Ordering::Release);
            self.store.recycle(old_fp)?;
            debug!(old_fp, new_fp, "grew map-backed key index");

            map::store::add(&new_filer, &mut new_ctx, MODE_FILLED, key, &fp.to_le_bytes())?;
            self.grower.release(&new_ctx);
            return Ok(());
        }

        map::store::add(&filer, &mut ctx, MODE_FILLED, key, &fp.to_le_bytes())?;
        self.grower.release(&ctx);
        Ok(())
    }

    fn remove_key(&self, key: &[u8]) -> Result<Option<u64>> {
        let _permit = self.permits.write_key(key);
        let _table = self.table.write();
        let (filer, mut ctx) = self.filer_ctx()?;
        let previous = map::store::get_payload(&filer, &ctx, key)?
            .map(|payload| u64::from_le_bytes(payload.try_into().unwrap_or([0; 8])));
        if previous.is_some() {
            map::store::remove(&filer, &mut ctx, key)?;
        }
        Ok(previous)
    }

    fn stream_keys(
        &self,
        ranges: Option<&[KeyRange]>,
        visitor: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool> {
        let _table = self.table.read();
        let (filer, ctx) = self.filer_ctx()?;
        map::store::stream_keys(&filer, &ctx, |key| {
            if let Some(ranges) = ranges {
                if !ranges.iter().any(|r| r.contains(key, lexicographic)) {
                    return Ok(true);
                }
            }
            visitor(key)
        })
    }

    fn count(&self) -> Result<u32> {
        let _table = self.table.read();
        let (_, ctx) = self.filer_ctx()?;
        Ok(ctx.count())
    }
}

// ---------------------------------------------------------------------
// Skip-list-backed flavor
// ---------------------------------------------------------------------

pub struct SkipListBackedKeyedFPIndex {
    store: Arc<ChunkStore>,
    fp: AtomicU64,
    creator: SkipListIndexCreator,
    grower: SkipListGrower,
    permits: StripedRwLocks,
    table: RwLock<()>,
    relocate: Relocate,
}

impl SkipListBackedKeyedFPIndex {
    pub fn create(store: &Arc<ChunkStore>, key_size: u32, capacity: u32) -> Result<u64> {
        let creator = Self::index_creator(key_size);
        let fp = store.new_chunk(creator.required_size(capacity as u64))?;
        let filer = store.filer(fp)?;
        creator.create(capacity as u64, &filer)?;
        Ok(fp)
    }

    pub fn open(
        store: Arc<ChunkStore>,
        fp: u64,
        key_size: u32,
        relocate: Relocate,
    ) -> Result<Self> {
        skiplist::store::open(&store.filer(fp)?, b"", lexicographic)?;
        Ok(Self {
            store,
            fp: AtomicU64::new(fp),
            creator: Self::index_creator(key_size),
            grower: SkipListGrower::new(1),
            permits: StripedRwLocks::new(INDEX_STRIPES),
            table: RwLock::new(()),
            relocate,
        })
    }

    pub fn fp(&self) -> u64 {
        self.fp.load(Ordering::Acquire)
    }

    /// Resolve `key`'s chunk through this index and run `tx` against it;
    /// see the free-standing [`commit`] for the full contract.
    pub fn commit<M, R>(
        &self,
        key: &[u8],
        hint: Option<u64>,
        creator: &dyn CreateFiler<M>,
        opener: &dyn OpenFiler<M>,
        grower: Option<&dyn GrowFiler<M>>,
        tx: impl FnOnce(&mut M, &Filer) -> Result<R>,
    ) -> Result<Option<R>> {
        commit(self, &self.store, key, hint, creator, opener, grower, tx)
    }

    fn index_creator(key_size: u32) -> SkipListIndexCreator {
        // The empty key sorts before every user key and no user key can be
        // empty, so it serves as the reserved head sentinel.
        SkipListIndexCreator {
            key_size,
            variable_key: true,
            payload_size: INDEX_PAYLOAD,
            head_key: Vec::new(),
            comparator: lexicographic,
        }
    }

    fn filer_ctx(&self) -> Result<(Filer, SkipListMapContext)> {
        let filer = self.store.filer(self.fp())?;
        let ctx = skiplist::store::open(&filer, &self.creator.head_key, self.creator.comparator)?;
        Ok((filer, ctx))
    }
}

impl BackingFPIndex for SkipListBackedKeyedFPIndex {
    fn permits(&self) -> &StripedRwLocks {
        &self.permits
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<u64>> {
        let _table = self.table.read();
        let (filer, ctx) = self.filer_ctx()?;
        Ok(skiplist::store::get_existing_payload(&filer, &ctx, key)?
            .map(|payload| u64::from_le_bytes(payload.try_into().unwrap_or([0; 8]))))
    }

    fn insert(&self, key: &[u8], fp: u64) -> Result<()> {
        let _table = self.table.write();
        let (filer, mut ctx) = self.filer_ctx()?;

        if let Some(hint) = self.grower.acquire(&ctx, &filer)? {
            let new_fp = self.store.new_chunk(self.creator.required_size(hint))?;
            let new_filer = self.store.filer(new_fp)?;
            let mut new_ctx = self.creator.create(hint, &new_filer)?;
            self.grower.grow_and_acquire(&ctx, &filer, &mut new_ctx, &new_filer)?;

            let old_fp = self.fp();
            (self.relocate)(new_fp)?;
            self.fp.store(new_fp, Ordering::Release);
            self.store.recycle(old_fp)?;
            debug!(old_fp, new_fp, "grew skip-list-backed key index");

            skiplist::store::add(&new_filer, &mut new_ctx, key, &fp.to_le_bytes())?;
            self.grower.release(&new_ctx);
            return Ok(());
        }

        skiplist::store::add(&filer, &mut ctx, key, &fp.to_le_bytes())?;
        self.grower.release(&ctx);
        Ok(())
    }

    fn remove_key(&self, key: &[u8]) -> Result<Option<u64>> {
        let _permit = self.permits.write_key(key);
        let _table = self.table.write();
        let (filer, mut ctx) = self.filer_ctx()?;
        let previous = skiplist::store::get_existing_payload(&filer, &ctx, key)?
            .map(|payload| u64::from_le_bytes(payload.try_into().unwrap_or([0; 8])));
        if previous.is_some() {
            skiplist::store::remove(&filer, &mut ctx, key)?;
        }
        Ok(previous)
    }

    fn stream_keys(
        &self,
        ranges: Option<&[KeyRange]>,
        visitor: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool> {
        let _table = self.table.read();
        let (filer, ctx) = self.filer_ctx()?;
        skiplist::store::stream_keys(&filer, &ctx, ranges, |key| visitor(key))
    }

    fn count(&self) -> Result<u32> {
        let _table = self.table.read();
        let (_, ctx) = self.filer_ctx()?;
        Ok(skiplist::store::count(&ctx))
    }
}

// ---------------------------------------------------------------------
// The power-partitioned sky hook view
// ---------------------------------------------------------------------

struct SlotCache([AtomicI64; 64]);

pub struct PowerKeyedFPIndex {
    store: Arc<ChunkStore>,
    fp: u64,
    ordering: IndexOrdering,
    slots: Arc<SlotCache>,
    sub: RwLock<Vec<Option<Arc<dyn BackingFPIndex>>>>,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for PowerKeyedFPIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerKeyedFPIndex")
            .field("fp", &self.fp)
            .field("ordering", &self.ordering)
            .finish_non_exhaustive()
    }
}

impl PowerKeyedFPIndex {
    /// Open the store's bootstrap chunk, creating it on first touch. The
    /// sky hook must be the first chunk the store ever allocates; an
    /// existing bootstrap chunk with the wrong magic is fatal corruption.
    pub fn bootstrap(store: &Arc<ChunkStore>, ordering: IndexOrdering) -> Result<Self> {
        if store.is_valid(SKY_HOOK_FP) {
            let filer = store.filer(SKY_HOOK_FP)?;
            let magic = filer.read_u64_at(0)?;
            ensure!(
                magic == SKY_HOOK_MAGIC,
                "sky hook magic mismatch: expected {:#018x}, found {:#018x} — store is corrupt",
                SKY_HOOK_MAGIC,
                magic
            );
        } else {
            let fp = store.new_chunk(SKY_HOOK_SIZE)?;
            ensure!(
                fp == SKY_HOOK_FP,
                "expected the first allocated chunk at fp {} but it landed at {}",
                SKY_HOOK_FP,
                fp
            );
            let filer = store.filer(fp)?;
            filer.write_u64_at(0, SKY_HOOK_MAGIC)?;
            for power in 0..64u64 {
                filer.write_i64_at(8 + power * 8, -1)?;
            }
            debug!("bootstrapped sky hook chunk");
        }

        Ok(Self {
            store: Arc::clone(store),
            fp: SKY_HOOK_FP,
            ordering,
            slots: Arc::new(SlotCache(std::array::from_fn(|_| AtomicI64::new(0)))),
            sub: RwLock::new(vec![None; 64]),
            init_lock: Mutex::new(()),
        })
    }

    pub fn ordering(&self) -> IndexOrdering {
        self.ordering
    }

    /// The per-power index, lazily allocated on first touch when `create`
    /// is set. `Ok(None)` means the slot was never allocated and creation
    /// was not requested.
    pub fn power_index(
        &self,
        power: u8,
        create: bool,
    ) -> Result<Option<Arc<dyn BackingFPIndex>>> {
        ensure!((power as usize) < 64, "key power {} out of range", power);

        if let Some(index) = self.sub.read()[power as usize].clone() {
            return Ok(Some(index));
        }

        let mut slot_fp = self.slot_fp(power)?;
        if slot_fp < 0 {
            if !create {
                return Ok(None);
            }
            ensure!(
                power <= MAX_KEY_POWER,
                "keys of power {} are unsupported (length prefixes are u16)",
                power
            );

            let _init = self.init_lock.lock();
            slot_fp = self.read_disk_slot(power)?;
            if slot_fp < 0 {
                let key_size = (1u64 << power).min(u16::MAX as u64) as u32;
                let fp = match self.ordering {
                    IndexOrdering::Unordered => MapBackedKeyedFPIndex::create(
                        &self.store,
                        key_size,
                        INITIAL_INDEX_CAPACITY as u32,
                    )?,
                    IndexOrdering::Ordered => SkipListBackedKeyedFPIndex::create(
                        &self.store,
                        key_size,
                        INITIAL_INDEX_CAPACITY as u32,
                    )?,
                };
                self.write_disk_slot(power, fp as i64)?;
                self.slots.0[power as usize].store(fp as i64, Ordering::Release);
                slot_fp = fp as i64;
                debug!(power, fp, "allocated per-power key index");
            }
        }

        let mut sub = self.sub.write();
        if let Some(existing) = sub[power as usize].clone() {
            return Ok(Some(existing));
        }

        let relocate = self.relocator(power);
        let key_size = (1u64 << power).min(u16::MAX as u64) as u32;
        let index: Arc<dyn BackingFPIndex> = match self.ordering {
            IndexOrdering::Unordered => Arc::new(MapBackedKeyedFPIndex::open(
                Arc::clone(&self.store),
                slot_fp as u64,
                key_size,
                relocate,
            )?),
            IndexOrdering::Ordered => Arc::new(SkipListBackedKeyedFPIndex::open(
                Arc::clone(&self.store),
                slot_fp as u64,
                key_size,
                relocate,
            )?),
        };
        sub[power as usize] = Some(Arc::clone(&index));
        Ok(Some(index))
    }

    fn relocator(&self, power: u8) -> Relocate {
        let store = Arc::clone(&self.store);
        let slots = Arc::clone(&self.slots);
        let sky_fp = self.fp;
        Box::new(move |new_fp| {
            let filer = store.filer(sky_fp)?;
            filer.write_i64_at(8 + power as u64 * 8, new_fp as i64)?;
            slots.0[power as usize].store(new_fp as i64, Ordering::Release);
            Ok(())
        })
    }

    fn slot_fp(&self, power: u8) -> Result<i64> {
        let cached = self.slots.0[power as usize].load(Ordering::Acquire);
        if cached != 0 {
            return Ok(cached);
        }
        let disk = self.read_disk_slot(power)?;
        if disk > 0 {
            let _ = self.slots.0[power as usize].compare_exchange(
                0,
                disk,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        Ok(disk)
    }

    fn read_disk_slot(&self, power: u8) -> Result<i64> {
        let filer = self.store.filer(self.fp)?;
        filer.read_i64_at(8 + power as u64 * 8)
    }

    fn write_disk_slot(&self, power: u8, fp: i64) -> Result<()> {
        let filer = self.store.filer(self.fp)?;
        filer.write_i64_at(8 + power as u64 * 8, fp)
    }
}
