//! # Storage Layer
//!
//! The foundation of LoamDB: a growable byte region (heap or memory-mapped
//! file), a positionable cursor type over one chunk's bytes, and the chunk
//! store that carves power-of-two regions out of the backing medium.
//!
//! ## Chunks and File Pointers
//!
//! Every allocation is a *chunk*: a contiguous region whose total size
//! (header + payload) is a power of two. A chunk is identified by its *file
//! pointer* (FP) — the region offset of its header — which never changes for
//! the lifetime of the store. Higher layers persist FPs inside other chunks,
//! so stability is the load-bearing property here.
//!
//! ## Region Layout
//!
//! ```text
//! Offset   Size     Description
//! ------   ------   --------------------------------------------
//! 0        8        Store magic
//! 8        8        End offset (next fresh allocation position)
//! 16       64 × 8   Free-list head FP per chunk power (0 = empty)
//! 528      ...      Chunks, densely packed
//! ```
//!
//! ## Chunk Layout
//!
//! ```text
//! Offset   Size   Description
//! ------   ----   --------------------------------------------
//! 0        8      Chunk magic (one value for live, one for free)
//! 8        4      Power (total chunk size = 2^power)
//! 12       4      Reserved
//! 16       8      Next-free FP (free-list link, meaningful when free)
//! 24       ...    Payload (2^power - 24 bytes)
//! ```
//!
//! All integers are little-endian. Freed chunks are threaded onto a
//! per-power intrusive free list through their `next_free` field and are
//! reused before the region is extended.
//!
//! ## Concurrency
//!
//! `ByteRegion` allows any number of concurrent readers and writers to
//! *disjoint* byte ranges; region growth takes the exclusive path and blocks
//! all I/O while the buffer is remapped. Writers to overlapping ranges must
//! be serialized externally (see [`crate::tx::StripedLocks`]) — the region
//! itself provides no transactional isolation.

mod filer;
mod region;
mod store;

pub use filer::Filer;
pub use region::ByteRegion;
pub use store::{ChunkStore, CHUNK_HEADER_SIZE, STORE_HEADER_SIZE};

/// Smallest power used for chunk sizing; 2^5 = 32 bytes holds the chunk
/// header plus a minimal payload.
pub const MIN_CHUNK_POWER: u8 = 5;

/// Size-class bucketing: the smallest `p` with `length <= 2^p`, floored at
/// `min_power`. Used both to size chunks and to partition keys by length.
pub fn chunk_power(length: u64, min_power: u8) -> u8 {
    if length <= 1 {
        return min_power;
    }
    let power = 64 - (length - 1).leading_zeros() as u8;
    power.max(min_power)
}
