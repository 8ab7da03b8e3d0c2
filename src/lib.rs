//! # LoamDB
//!
//! LoamDB is an embedded storage engine built directly on raw byte regions:
//! a power-of-two chunk allocator, an open-addressing hash map materialized
//! inside chunk bytes, and a skip-list ordered index whose forward pointers
//! are plain slot indices into the same map. A generic grow/acquire/release
//! protocol lets many independent map and skip-list instances be resized
//! safely under concurrent access.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  KeyedStore / MultiChunkStore  (tx::keyed_store)     │
//! │  auto-growing, key-length-partitioned k/v facade     │
//! ├──────────────────────────────────────────────────────┤
//! │  PowerKeyedFPIndex / MapBackedKeyedFPIndex (tx)      │
//! │  sky hook + per-power key→FP indexes, grow protocol  │
//! ├───────────────────────────┬──────────────────────────┤
//! │  map                      │  skiplist                │
//! │  open-addressing hash     │  ordered index encoded   │
//! │  table in chunk bytes     │  in map payload columns  │
//! ├───────────────────────────┴──────────────────────────┤
//! │  storage::ChunkStore                                 │
//! │  power-of-two chunk allocator, stable FPs, free list │
//! ├──────────────────────────────────────────────────────┤
//! │  storage::ByteRegion                                 │
//! │  heap Vec or memory-mapped file (memmap2)            │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Stable addresses**: a chunk's file pointer (FP) never changes after
//!   allocation; structures reference each other by FP and by slot index,
//!   never by host pointer.
//! - **Grow by copy**: the only resize path allocates a larger chunk, copies
//!   every live entry forward, swaps the referencing FP, and recycles the
//!   old chunk. Readers never observe a partially migrated structure.
//! - **Striped locking**: fixed pools of locks indexed by key hash bound the
//!   lock table size independent of the key space.
//!
//! ## Module Overview
//!
//! - [`storage`]: byte regions, chunk filer cursors, the chunk store
//! - [`map`]: fixed-layout open-addressing hash map over chunk bytes
//! - [`skiplist`]: skip-list ordered index layered on a map chunk
//! - [`tx`]: grow protocol, power-partitioned FP indexes, striped locks,
//!   keyed store facades

pub mod map;
pub mod skiplist;
pub mod storage;
pub mod tx;

pub use storage::{ByteRegion, ChunkStore, Filer};
pub use tx::{IndexOrdering, KeyedStore, MultiChunkStore};
