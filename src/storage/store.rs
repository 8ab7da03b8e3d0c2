//! # Chunk Store
//!
//! Carves power-of-two chunks out of one [`ByteRegion`] and hands out stable
//! file pointers. Allocation prefers the per-power free list; only when a
//! size class is empty does the store append at the end offset, doubling the
//! region when it runs out of room.
//!
//! The store never locks reads: a [`Filer`] is a plain cursor and callers
//! bring their own locking convention (striped locks keyed by whatever the
//! chunk logically belongs to). Allocation, recycling and removal are
//! serialized by one internal mutex — those paths are rare compared to slot
//! reads and writes.
//!
//! ## Validation
//!
//! Every chunk header carries a magic tag: one value while live, another
//! once freed. `filer()` refuses both freed chunks and offsets that were
//! never written, so a stale FP read from an uninitialized index slot fails
//! loudly instead of returning garbage bytes. A store-header magic mismatch
//! on `open` aborts immediately — that region was not written by this
//! engine, or was corrupted, and nothing downstream can be trusted.

use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result};
use tracing::{debug, trace};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{chunk_power, ByteRegion, Filer, MIN_CHUNK_POWER};

pub const STORE_HEADER_SIZE: u64 = 8 + 8 + 64 * 8;
pub const CHUNK_HEADER_SIZE: u64 = 24;

const STORE_MAGIC: u64 = u64::from_le_bytes(*b"loamstor");
const LIVE_MAGIC: u64 = u64::from_le_bytes(*b"loamchnk");
const FREE_MAGIC: u64 = u64::from_le_bytes(*b"loamfree");

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ChunkHeader {
    magic: u64,
    power: u32,
    reserved: u32,
    next_free: u64,
}

struct AllocState {
    end: u64,
    free_heads: [u64; 64],
}

pub struct ChunkStore {
    region: Arc<ByteRegion>,
    alloc: parking_lot::Mutex<AllocState>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore").finish_non_exhaustive()
    }
}

impl ChunkStore {
    /// Initialize a fresh store header in `region` and take ownership of it.
    pub fn create(region: ByteRegion) -> Result<Self> {
        region.grow(STORE_HEADER_SIZE.next_power_of_two())?;
        region.write_at(0, &STORE_MAGIC.to_le_bytes())?;
        region.write_at(8, &STORE_HEADER_SIZE.to_le_bytes())?;
        region.write_at(16, &[0u8; 64 * 8])?;

        Ok(Self {
            region: Arc::new(region),
            alloc: parking_lot::Mutex::new(AllocState {
                end: STORE_HEADER_SIZE,
                free_heads: [0; 64],
            }),
        })
    }

    /// Open a store previously written by [`ChunkStore::create`].
    pub fn open(region: ByteRegion) -> Result<Self> {
        ensure!(
            region.len() >= STORE_HEADER_SIZE,
            "region of {} bytes is too small to hold a store header",
            region.len()
        );

        let mut buf = [0u8; 8];
        region.read_at(0, &mut buf)?;
        let magic = u64::from_le_bytes(buf);
        ensure!(
            magic == STORE_MAGIC,
            "store magic mismatch: expected {:#018x}, found {:#018x}",
            STORE_MAGIC,
            magic
        );

        region.read_at(8, &mut buf)?;
        let end = u64::from_le_bytes(buf);
        ensure!(
            end >= STORE_HEADER_SIZE && end <= region.len(),
            "store end offset {} outside region of {} bytes",
            end,
            region.len()
        );

        let mut free_heads = [0u64; 64];
        for (power, head) in free_heads.iter_mut().enumerate() {
            region.read_at(16 + power as u64 * 8, &mut buf)?;
            *head = u64::from_le_bytes(buf);
        }

        Ok(Self {
            region: Arc::new(region),
            alloc: parking_lot::Mutex::new(AllocState { end, free_heads }),
        })
    }

    /// Allocate a chunk whose payload holds at least `capacity` bytes. The
    /// total size (header + payload) is rounded up to the next power of two.
    /// Payload bytes are not cleared; callers initialize their own layout.
    pub fn new_chunk(&self, capacity: u64) -> Result<u64> {
        let power = chunk_power(CHUNK_HEADER_SIZE + capacity, MIN_CHUNK_POWER);
        ensure!(power < 64, "chunk capacity {} is unrepresentable", capacity);
        let size = 1u64 << power;

        let mut alloc = self.alloc.lock();

        let fp = if alloc.free_heads[power as usize] != 0 {
            let fp = alloc.free_heads[power as usize];
            let header = self.read_header(fp)?;
            ensure!(
                header.magic == FREE_MAGIC && header.power == power as u32,
                "free list for power {} points at fp {} with bad header",
                power,
                fp
            );
            alloc.free_heads[power as usize] = header.next_free;
            self.persist_free_head(power, header.next_free)?;
            trace!(fp, power, "reusing recycled chunk");
            fp
        } else {
            let fp = alloc.end;
            if fp + size > self.region.len() {
                let new_len = (fp + size).next_power_of_two();
                debug!(new_len, "growing backing region");
                self.region.grow(new_len)?;
            }
            alloc.end = fp + size;
            self.region.write_at(8, &alloc.end.to_le_bytes())?;
            fp
        };

        self.write_header(
            fp,
            ChunkHeader {
                magic: LIVE_MAGIC,
                power: power as u32,
                reserved: 0,
                next_free: 0,
            },
        )?;
        Ok(fp)
    }

    /// A cursor over the chunk's payload. Fails for FPs this store never
    /// allocated and for chunks that have been recycled or removed.
    pub fn filer(&self, fp: u64) -> Result<Filer> {
        let header = self.live_header(fp)?;
        let payload = (1u64 << header.power) - CHUNK_HEADER_SIZE;
        Ok(Filer::new(
            Arc::clone(&self.region),
            fp,
            fp + CHUNK_HEADER_SIZE,
            payload,
        ))
    }

    /// Whether `fp` names a live chunk of this store. Guards reads of index
    /// slots that may never have been initialized.
    pub fn is_valid(&self, fp: u64) -> bool {
        self.live_header(fp).is_ok()
    }

    /// Return the chunk's space to the free list for its size class.
    pub fn recycle(&self, fp: u64) -> Result<()> {
        self.release(fp, false)
    }

    /// Permanently invalidate the chunk. Like [`ChunkStore::recycle`], but
    /// also clears the head of the payload so a stale FP can never pass a
    /// higher layer's magic check after the space is reused.
    pub fn remove(&self, fp: u64) -> Result<()> {
        self.release(fp, true)
    }

    /// Visit every live FP, in address order. The visitor returns `Ok(false)`
    /// to stop early; the scan itself never mutates the store, so it can be
    /// restarted at will.
    pub fn all_chunks(&self, mut visitor: impl FnMut(u64) -> Result<bool>) -> Result<bool> {
        let end = self.alloc.lock().end;
        self.region.prefetch(STORE_HEADER_SIZE, end - STORE_HEADER_SIZE);
        let mut offset = STORE_HEADER_SIZE;
        while offset < end {
            let header = self.read_header(offset)?;
            ensure!(
                header.power >= MIN_CHUNK_POWER as u32 && header.power < 64,
                "chunk scan found impossible power {} at fp {}",
                header.power,
                offset
            );
            match header.magic {
                LIVE_MAGIC => {
                    if !visitor(offset)? {
                        return Ok(false);
                    }
                }
                FREE_MAGIC => {}
                other => bail!(
                    "chunk scan found bad magic {:#018x} at fp {}",
                    other,
                    offset
                ),
            }
            offset += 1u64 << header.power;
        }
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> {
        self.region.sync()
    }

    fn release(&self, fp: u64, clear: bool) -> Result<()> {
        let mut alloc = self.alloc.lock();
        let header = self.live_header(fp)?;
        let power = header.power as usize;

        if clear {
            self.region.write_at(fp + CHUNK_HEADER_SIZE, &[0u8; 8])?;
        }
        self.write_header(
            fp,
            ChunkHeader {
                magic: FREE_MAGIC,
                power: header.power,
                reserved: 0,
                next_free: alloc.free_heads[power],
            },
        )?;
        alloc.free_heads[power] = fp;
        self.persist_free_head(header.power as u8, fp)?;
        trace!(fp, power, "released chunk");
        Ok(())
    }

    fn live_header(&self, fp: u64) -> Result<ChunkHeader> {
        ensure!(
            fp >= STORE_HEADER_SIZE && fp + CHUNK_HEADER_SIZE <= self.region.len(),
            "no chunk allocated at fp {}",
            fp
        );
        let header = self.read_header(fp)?;
        match header.magic {
            LIVE_MAGIC => Ok(header),
            FREE_MAGIC => bail!("chunk at fp {} has been recycled", fp),
            _ => bail!("no chunk allocated at fp {}", fp),
        }
    }

    fn read_header(&self, fp: u64) -> Result<ChunkHeader> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        self.region.read_at(fp, &mut buf)?;
        ChunkHeader::read_from_bytes(&buf)
            .map_err(|e| eyre!("failed to decode chunk header at fp {}: {:?}", fp, e))
    }

    fn write_header(&self, fp: u64, header: ChunkHeader) -> Result<()> {
        self.region.write_at(fp, header.as_bytes())
    }

    fn persist_free_head(&self, power: u8, fp: u64) -> Result<()> {
        self.region.write_at(16 + power as u64 * 8, &fp.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn heap_store() -> ChunkStore {
        ChunkStore::create(ByteRegion::heap(0)).unwrap()
    }

    #[test]
    fn new_chunk_rounds_capacity_to_power_of_two() {
        let store = heap_store();

        let fp = store.new_chunk(100).unwrap();
        let filer = store.filer(fp).unwrap();

        // 24 header + 100 payload rounds to 128 total.
        assert_eq!(filer.length(), 128 - CHUNK_HEADER_SIZE);
    }

    #[test]
    fn fps_are_unique_and_stable() {
        let store = heap_store();

        let a = store.new_chunk(10).unwrap();
        let b = store.new_chunk(10).unwrap();
        let c = store.new_chunk(2000).unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(store.filer(a).unwrap().fp(), a);
    }

    #[test]
    fn chunk_bytes_round_trip() {
        let store = heap_store();
        let fp = store.new_chunk(64).unwrap();

        let mut filer = store.filer(fp).unwrap();
        filer.write_all(b"payload bytes").unwrap();

        let mut read = store.filer(fp).unwrap();
        let mut buf = [0u8; 13];
        read.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"payload bytes");
    }

    #[test]
    fn filer_for_unallocated_fp_is_an_error() {
        let store = heap_store();
        store.new_chunk(10).unwrap();

        assert!(store.filer(0).is_err());
        assert!(store.filer(STORE_HEADER_SIZE + 7).is_err());
        assert!(store.filer(1 << 40).is_err());
    }

    #[test]
    fn is_valid_distinguishes_live_from_everything_else() {
        let store = heap_store();
        let fp = store.new_chunk(10).unwrap();

        assert!(store.is_valid(fp));
        assert!(!store.is_valid(0));
        assert!(!store.is_valid(fp + 1));

        store.remove(fp).unwrap();
        assert!(!store.is_valid(fp));
    }

    #[test]
    fn recycle_reuses_the_same_size_class() {
        let store = heap_store();

        let fp = store.new_chunk(100).unwrap();
        store.recycle(fp).unwrap();

        let reused = store.new_chunk(100).unwrap();
        assert_eq!(reused, fp);

        // A different size class must not see the freed chunk.
        let other = store.new_chunk(5000).unwrap();
        assert_ne!(other, fp);
    }

    #[test]
    fn remove_clears_payload_head() {
        let store = heap_store();
        let fp = store.new_chunk(64).unwrap();
        let mut filer = store.filer(fp).unwrap();
        filer.write_u64(u64::from_le_bytes(*b"oldmagic")).unwrap();

        store.remove(fp).unwrap();
        let reused = store.new_chunk(64).unwrap();
        assert_eq!(reused, fp);

        let filer = store.filer(reused).unwrap();
        assert_eq!(filer.read_u64_at(0).unwrap(), 0);
    }

    #[test]
    fn all_chunks_visits_only_live_chunks() {
        let store = heap_store();
        let a = store.new_chunk(10).unwrap();
        let b = store.new_chunk(10).unwrap();
        let c = store.new_chunk(10).unwrap();
        store.recycle(b).unwrap();

        let mut seen = Vec::new();
        store
            .all_chunks(|fp| {
                seen.push(fp);
                Ok(true)
            })
            .unwrap();

        assert_eq!(seen, vec![a, c]);
    }

    #[test]
    fn all_chunks_honors_early_termination() {
        let store = heap_store();
        store.new_chunk(10).unwrap();
        store.new_chunk(10).unwrap();

        let mut seen = 0;
        let completed = store
            .all_chunks(|_| {
                seen += 1;
                Ok(false)
            })
            .unwrap();

        assert!(!completed);
        assert_eq!(seen, 1);
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.loam");

        let fp = {
            let store = ChunkStore::create(ByteRegion::create(&path, 64).unwrap()).unwrap();
            let fp = store.new_chunk(64).unwrap();
            let mut filer = store.filer(fp).unwrap();
            filer.write_all(b"durable").unwrap();
            store.sync().unwrap();
            fp
        };

        let store = ChunkStore::open(ByteRegion::open(&path).unwrap()).unwrap();
        let filer = store.filer(fp).unwrap();
        let mut buf = [0u8; 7];
        filer.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");

        // Free lists survive reopen too.
        store.recycle(fp).unwrap();
        drop(store);
        let store = ChunkStore::open(ByteRegion::open(&path).unwrap()).unwrap();
        assert_eq!(store.new_chunk(64).unwrap(), fp);
    }

    #[test]
    fn open_rejects_foreign_bytes() {
        let region = ByteRegion::heap(4096);
        region.write_at(0, b"notastor").unwrap();

        let err = ChunkStore::open(region).unwrap_err();
        assert!(err.to_string().contains("store magic mismatch"));
    }
}
