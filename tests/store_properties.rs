//! # Store Property Tests
//!
//! End-to-end properties of the keyed store and the chunk allocator
//! underneath it:
//!
//! 1. Round-trip: a value written under a key reads back identically, and
//!    is gone after removal.
//! 2. Idempotent overwrite: re-putting a key leaves exactly one entry with
//!    the newest value.
//! 3. Capacity/grow: pushing far past initial capacities grows every level
//!    (value chunks, index maps, the backing region) without losing or
//!    duplicating a key.
//! 4. Durability: a file-backed store reopened from disk serves every key
//!    written before close.

use std::sync::Arc;

use tempfile::tempdir;

use loamdb::storage::{ByteRegion, ChunkStore};
use loamdb::tx::{IndexOrdering, KeyedStore};

fn heap_keyed_store() -> KeyedStore {
    let store = Arc::new(ChunkStore::create(ByteRegion::heap(0)).unwrap());
    KeyedStore::new(store, IndexOrdering::Unordered).unwrap()
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn every_written_key_reads_back() {
        let store = heap_keyed_store();

        for i in 0..200u32 {
            let key = format!("key-{:04}", i);
            let value = format!("value number {}", i);
            store.put(key.as_bytes(), value.as_bytes()).unwrap();
        }

        for i in 0..200u32 {
            let key = format!("key-{:04}", i);
            let value = format!("value number {}", i);
            assert_eq!(
                store.get(key.as_bytes()).unwrap().unwrap(),
                value.as_bytes(),
                "key {} came back wrong",
                key
            );
        }
    }

    #[test]
    fn removed_keys_are_absent() {
        let store = heap_keyed_store();

        for i in 0..50u32 {
            store
                .put(format!("key-{:02}", i).as_bytes(), b"here")
                .unwrap();
        }
        for i in (0..50u32).step_by(2) {
            assert!(store.remove(format!("key-{:02}", i).as_bytes()).unwrap());
        }

        for i in 0..50u32 {
            let got = store.get(format!("key-{:02}", i).as_bytes()).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none(), "removed key {} still resolves", i);
            } else {
                assert_eq!(got.unwrap(), b"here");
            }
        }
    }

    #[test]
    fn values_of_very_different_sizes_coexist() {
        let store = heap_keyed_store();

        let tiny = b"x".to_vec();
        let large = vec![0x5A; 100_000];
        store.put(b"tiny", &tiny).unwrap();
        store.put(b"large", &large).unwrap();

        assert_eq!(store.get(b"tiny").unwrap().unwrap(), tiny);
        assert_eq!(store.get(b"large").unwrap().unwrap(), large);
    }
}

mod overwrite_tests {
    use super::*;

    #[test]
    fn overwrite_keeps_exactly_one_entry() {
        let store = heap_keyed_store();

        store.put(b"key", b"first").unwrap();
        store.put(b"key", b"second").unwrap();
        store.put(b"key", b"third").unwrap();

        assert_eq!(store.get(b"key").unwrap().unwrap(), b"third");

        let mut occurrences = 0;
        store
            .stream_keys(None, |key| {
                if key == b"key" {
                    occurrences += 1;
                }
                Ok(true)
            })
            .unwrap();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn shrinking_overwrite_is_served_from_the_same_chunk() {
        let store = heap_keyed_store();

        store.put(b"key", &vec![1u8; 4000]).unwrap();
        store.put(b"key", b"short now").unwrap();

        assert_eq!(store.get(b"key").unwrap().unwrap(), b"short now");
    }
}

mod grow_tests {
    use super::*;

    #[test]
    fn thousands_of_keys_survive_repeated_index_grows() {
        let store = heap_keyed_store();

        // Initial index capacity is 2 per power bucket; this forces many
        // doublings in one bucket.
        for i in 0..2000u32 {
            let key = format!("k{:06}", i);
            store.put(key.as_bytes(), &i.to_le_bytes()).unwrap();
        }

        let mut seen = 0u32;
        store
            .stream_keys(None, |_| {
                seen += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, 2000, "grow lost or duplicated keys");

        for i in (0..2000u32).step_by(97) {
            let key = format!("k{:06}", i);
            assert_eq!(
                store.get(key.as_bytes()).unwrap().unwrap(),
                i.to_le_bytes()
            );
        }
    }

    #[test]
    fn chunk_recycling_reuses_space_for_equal_powers() {
        let store = Arc::new(ChunkStore::create(ByteRegion::heap(0)).unwrap());

        let fp = store.new_chunk(500).unwrap();
        store.recycle(fp).unwrap();
        assert_eq!(store.new_chunk(500).unwrap(), fp);
    }
}

mod durability_tests {
    use super::*;

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.loam");

        {
            let store =
                Arc::new(ChunkStore::create(ByteRegion::create(&path, 64).unwrap()).unwrap());
            let keyed = KeyedStore::new(store, IndexOrdering::Unordered).unwrap();
            for i in 0..300u32 {
                let key = format!("durable-{:03}", i);
                keyed.put(key.as_bytes(), &(i * 7).to_le_bytes()).unwrap();
            }
            keyed.sync().unwrap();
        }

        let store = Arc::new(ChunkStore::open(ByteRegion::open(&path).unwrap()).unwrap());
        let keyed = KeyedStore::new(store, IndexOrdering::Unordered).unwrap();
        for i in 0..300u32 {
            let key = format!("durable-{:03}", i);
            assert_eq!(
                keyed.get(key.as_bytes()).unwrap().unwrap(),
                (i * 7).to_le_bytes(),
                "key {} lost across reopen",
                key
            );
        }
    }

    #[test]
    fn reopen_with_foreign_bytes_fails_loudly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-store.loam");
        std::fs::write(&path, vec![0xFFu8; 4096]).unwrap();

        assert!(ChunkStore::open(ByteRegion::open(&path).unwrap()).is_err());
    }
}
