//! # Transactional Layer
//!
//! Everything that turns raw chunks, maps and skip lists into a safely
//! concurrent, auto-growing store:
//!
//! - **Striped locks** ([`StripedLocks`], [`StripedRwLocks`]): fixed pools
//!   of locks indexed by key hash. A read guard on a striped `RwLock` is one
//!   permit; a write guard drains them all, which is exactly the discipline
//!   the grow protocol needs.
//! - **The grow protocol** ([`GrowFiler`] with [`CreateFiler`] /
//!   [`OpenFiler`]): `acquire` answers "does the current chunk still fit?"
//!   with an optional size hint, `grow_and_acquire` copies live state into a
//!   freshly allocated chunk and fails loudly if the new capacity is still
//!   short (a sizing-policy bug, never a transient), `release` undoes the
//!   bookkeeping of a successful `acquire`.
//! - **FP indexes** ([`MapBackedKeyedFPIndex`],
//!   [`SkipListBackedKeyedFPIndex`], [`PowerKeyedFPIndex`]): key→FP maps
//!   that live in chunks themselves, partitioned by key-length power so keys
//!   of wildly different sizes never share one fixed-key-size map. The
//!   [`commit`] combinator is the generic entry point: resolve (allocating
//!   if necessary) the chunk holding a key's value, grow it when the grower
//!   asks, re-derive the lookup so the transaction always sees the final
//!   structure, then run the caller's closure against it.
//! - **Facades** ([`KeyedStore`], [`MultiChunkStore`]): a single-store
//!   auto-growing byte k/v API, and the hash fan-out that stripes one
//!   logical store across several independent chunk stores.
//!
//! ## Lock Ordering
//!
//! Grows hold the affected key slot's write guard for the entire
//! copy-and-swap, and within it touch the old chunk strictly before the new
//! one. Nested index levels (sky hook → per-power index → value chunk)
//! always acquire outer guards before inner ones and never in reverse, so
//! no cycle can form between two concurrent grow attempts.

mod fp_index;
mod grow;
mod keyed_store;
mod locks;

pub use fp_index::{
    commit, BackingFPIndex, IndexOrdering, MapBackedKeyedFPIndex, PowerKeyedFPIndex,
    SkipListBackedKeyedFPIndex, MAX_KEY_POWER, SKY_HOOK_FP,
};
pub use grow::{
    CreateFiler, GrowFiler, MapGrower, MapIndexCreator, MapOpener, NoOpOpenFiler, OpenFiler,
    OverwriteGrower, RawFilerCreator, SkipListGrower, SkipListIndexCreator, SkipListOpener,
};
pub use keyed_store::{KeyedStore, MultiChunkStore};
pub use locks::{StripedLocks, StripedRwLocks};
