//! User-facing facades over the FP-index machinery.
//!
//! [`KeyedStore`] turns one chunk store into a uniform auto-growing byte
//! k/v store: every key resolves through the sky hook to the per-power
//! index for its length class, then to the chunk holding its value, with
//! grow-by-copy handled transparently on the way. [`MultiChunkStore`]
//! stripes that same resolution horizontally — each key hashes to one of
//! several fully independent chunk stores, each carrying its own sky hook
//! bootstrap — so stores can live on separate backing files or regions.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::trace;

use crate::map::fnv1a64;
use crate::skiplist::KeyRange;
use crate::storage::{chunk_power, ChunkStore, Filer};

use super::fp_index::{commit, IndexOrdering, PowerKeyedFPIndex, MAX_KEY_POWER};
use super::grow::{NoOpOpenFiler, OverwriteGrower, RawFilerCreator};
use super::locks::StripedLocks;

const MULTI_STRIPING_LEVEL: usize = 1024;

/// A single-store keyed filer store: byte keys of any supported length
/// resolve to their own auto-growing chunk.
pub struct KeyedStore {
    store: Arc<ChunkStore>,
    power_index: PowerKeyedFPIndex,
}

impl KeyedStore {
    /// Open the store's keyed view, bootstrapping the sky hook on first
    /// touch. `ordering` decides whether key streams honor ranges in
    /// comparator order (skip-list indexes) or slot order (plain maps).
    pub fn new(store: Arc<ChunkStore>, ordering: IndexOrdering) -> Result<Self> {
        let power_index = PowerKeyedFPIndex::bootstrap(&store, ordering)?;
        Ok(Self { store, power_index })
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Resolve `key`'s chunk and run `tx` against a cursor over it.
    ///
    /// With `capacity` set, a missing chunk is allocated at that size and
    /// an existing one grown (copy-and-swap) until it fits; without it a
    /// miss returns `Ok(None)` and nothing is written.
    pub fn execute<R>(
        &self,
        key: &[u8],
        capacity: Option<u64>,
        tx: impl FnOnce(&mut Filer) -> Result<R>,
    ) -> Result<Option<R>> {
        let index = match self.index_for(key, capacity.is_some())? {
            Some(index) => index,
            None => return Ok(None),
        };

        let run = |filer: &Filer| {
            let mut cursor = filer.duplicate();
            tx(&mut cursor)
        };
        match capacity {
            Some(capacity) => {
                let grower = OverwriteGrower::new(capacity);
                commit(
                    index.as_ref(),
                    &self.store,
                    key,
                    Some(capacity),
                    &RawFilerCreator,
                    &NoOpOpenFiler,
                    Some(&grower),
                    |_, filer| run(filer),
                )
            }
            None => commit(
                index.as_ref(),
                &self.store,
                key,
                None,
                &RawFilerCreator,
                &NoOpOpenFiler,
                None,
                |_, filer| run(filer),
            ),
        }
    }

    /// Store a value as `[8B length][bytes]` in the key's chunk.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.execute(key, Some(8 + value.len() as u64), |filer| {
            filer.seek(0)?;
            filer.write_u64(value.len() as u64)?;
            filer.write_all(value)
        })?;
        Ok(())
    }

    /// Read back a value written by [`KeyedStore::put`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.execute(key, None, |filer| {
            filer.seek(0)?;
            let len = filer.read_u64()?;
            ensure!(
                len <= filer.length() - 8,
                "value length {} exceeds chunk payload of {} bytes",
                len,
                filer.length()
            );
            let mut value = vec![0u8; len as usize];
            filer.read_exact(&mut value)?;
            Ok(value)
        })
    }

    /// Drop the key and permanently invalidate its chunk.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let Some(index) = self.index_for(key, false)? else {
            return Ok(false);
        };
        match index.remove_key(key)? {
            Some(fp) => {
                self.store.remove(fp)?;
                trace!(fp, "removed keyed chunk");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Visit every stored key, power bucket by power bucket. Within a
    /// bucket, ordered stores honor `ranges` in comparator order. The
    /// visitor must not mutate the store; return `Ok(false)` to stop.
    pub fn stream_keys(
        &self,
        ranges: Option<&[KeyRange]>,
        mut visitor: impl FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool> {
        for power in 0..=MAX_KEY_POWER {
            let Some(index) = self.power_index.power_index(power, false)? else {
                continue;
            };
            if !index.stream_keys(ranges, &mut visitor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Visit every stored key together with a cursor over its chunk. Keys
    /// are collected per power bucket before their chunks are opened, so
    /// the visitor is free to call back into the store.
    pub fn stream(
        &self,
        ranges: Option<&[KeyRange]>,
        mut visitor: impl FnMut(&[u8], &mut Filer) -> Result<bool>,
    ) -> Result<bool> {
        for power in 0..=MAX_KEY_POWER {
            let Some(index) = self.power_index.power_index(power, false)? else {
                continue;
            };
            let mut keys = Vec::new();
            index.stream_keys(ranges, &mut |key| {
                keys.push(key.to_vec());
                Ok(true)
            })?;

            for key in keys {
                let proceed = self.execute(&key, None, |filer| visitor(&key, filer))?;
                if proceed == Some(false) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    fn index_for(
        &self,
        key: &[u8],
        create: bool,
    ) -> Result<Option<Arc<dyn super::fp_index::BackingFPIndex>>> {
        ensure!(!key.is_empty(), "keys must not be empty");
        ensure!(
            key.len() <= u16::MAX as usize,
            "key of {} bytes exceeds the supported maximum of {}",
            key.len(),
            u16::MAX
        );
        let power = chunk_power(key.len() as u64, 0);
        self.power_index.power_index(power, create)
    }
}

/// Hash fan-out across several independent chunk stores. Each shard keeps
/// its own sky hook, per-power indexes and striping locks; a key's shard is
/// a pure function of its bytes, so lookups never consult more than one
/// store.
pub struct MultiChunkStore {
    shards: Vec<Shard>,
}

struct Shard {
    store: Arc<ChunkStore>,
    index: PowerKeyedFPIndex,
    locks: StripedLocks,
}

impl MultiChunkStore {
    pub fn new(stores: Vec<Arc<ChunkStore>>) -> Result<Self> {
        Self::with_striping_level(stores, MULTI_STRIPING_LEVEL)
    }

    pub fn with_striping_level(
        stores: Vec<Arc<ChunkStore>>,
        striping_level: usize,
    ) -> Result<Self> {
        ensure!(!stores.is_empty(), "at least one chunk store is required");
        let shards = stores
            .into_iter()
            .map(|store| {
                let index = PowerKeyedFPIndex::bootstrap(&store, IndexOrdering::Unordered)?;
                Ok(Shard {
                    store,
                    index,
                    locks: StripedLocks::new(striping_level),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[(fnv1a64(key) % self.shards.len() as u64) as usize]
    }

    /// The filer for `key`'s chunk, if one was ever allocated.
    pub fn get(&self, key: &[u8]) -> Result<Option<Filer>> {
        let shard = self.shard(key);
        let power = chunk_power(key.len().max(1) as u64, 0);
        let Some(index) = shard.index.power_index(power, false)? else {
            return Ok(None);
        };
        match index.get(key)? {
            Some(fp) => Ok(Some(shard.store.filer(fp)?)),
            None => Ok(None),
        }
    }

    /// The filer for `key`'s chunk, allocating `capacity` payload bytes on
    /// a miss.
    pub fn allocate(&self, key: &[u8], capacity: u64) -> Result<Filer> {
        ensure!(capacity > 0, "allocation capacity must be positive");
        let shard = self.shard(key);
        let _lock = shard.locks.lock(key);

        let power = chunk_power(key.len().max(1) as u64, 0);
        let Some(index) = shard.index.power_index(power, true)? else {
            bail!("per-power index creation failed for power {}", power);
        };
        if let Some(fp) = index.get(key)? {
            return shard.store.filer(fp);
        }

        let fp = shard.store.new_chunk(capacity)?;
        index.set(key, fp)?;
        trace!(fp, capacity, "allocated keyed chunk");
        shard.store.filer(fp)
    }

    /// Move `key`'s value into a chunk of at least `new_capacity` bytes:
    /// allocate new, copy the old bytes forward (old chunk first, then
    /// new, both under the key's stripe lock), swap the index, recycle the
    /// old chunk.
    pub fn reallocate(&self, key: &[u8], new_capacity: u64) -> Result<Filer> {
        ensure!(new_capacity > 0, "allocation capacity must be positive");
        let shard = self.shard(key);
        let _lock = shard.locks.lock(key);

        let power = chunk_power(key.len().max(1) as u64, 0);
        let Some(index) = shard.index.power_index(power, true)? else {
            bail!("per-power index creation failed for power {}", power);
        };
        let old_fp = index.get(key)?;

        let new_fp = shard.store.new_chunk(new_capacity)?;
        if let Some(old_fp) = old_fp {
            let old = shard.store.filer(old_fp)?;
            let new = shard.store.filer(new_fp)?;
            let mut buf = [0u8; 4096];
            let len = old.length().min(new.length());
            let mut offset = 0u64;
            while offset < len {
                let n = (len - offset).min(buf.len() as u64) as usize;
                old.read_at(offset, &mut buf[..n])?;
                new.write_at(offset, &buf[..n])?;
                offset += n as u64;
            }
        }
        index.set(key, new_fp)?;
        if let Some(old_fp) = old_fp {
            shard.store.recycle(old_fp)?;
        }
        shard.store.filer(new_fp)
    }

    /// Drop the key and permanently invalidate its chunk.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let shard = self.shard(key);
        let _lock = shard.locks.lock(key);

        let power = chunk_power(key.len().max(1) as u64, 0);
        let Some(index) = shard.index.power_index(power, false)? else {
            return Ok(false);
        };
        match index.remove_key(key)? {
            Some(fp) => {
                shard.store.remove(fp)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every live FP across every shard, bootstrap chunks included.
    pub fn all_chunks(&self, mut visitor: impl FnMut(u64) -> Result<bool>) -> Result<bool> {
        for shard in &self.shards {
            if !shard.store.all_chunks(&mut visitor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn sync_all(&self) -> Result<()> {
        for shard in &self.shards {
            shard.store.sync()?;
        }
        Ok(())
    }
}
