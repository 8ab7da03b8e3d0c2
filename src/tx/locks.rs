//! Striped lock pools: a fixed number of lock slots, selected by key hash.
//! Concurrency granularity is bounded without allocating a lock per key,
//! and the slot for a given key is stable for the pool's lifetime.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::map::fnv1a64;

/// A pool of mutexes indexed by byte-key hash. Two keys in the same stripe
/// serialize against each other; keys in different stripes never do.
pub struct StripedLocks {
    locks: Vec<Mutex<()>>,
}

impl StripedLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            locks: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripes(&self) -> usize {
        self.locks.len()
    }

    pub fn slot(&self, key: &[u8]) -> usize {
        (fnv1a64(key) % self.locks.len() as u64) as usize
    }

    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.locks[self.slot(key)].lock()
    }
}

/// A pool of reader-writer locks indexed by key hash or small integer. The
/// read guard stands for one permit of the slot's semaphore; the write
/// guard drains all permits, giving the grow protocol its exclusive window.
pub struct StripedRwLocks {
    locks: Vec<RwLock<()>>,
}

impl StripedRwLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            locks: (0..stripes).map(|_| RwLock::new(())).collect(),
        }
    }

    pub fn stripes(&self) -> usize {
        self.locks.len()
    }

    pub fn read_index(&self, index: usize) -> RwLockReadGuard<'_, ()> {
        self.locks[index % self.locks.len()].read()
    }

    pub fn write_index(&self, index: usize) -> RwLockWriteGuard<'_, ()> {
        self.locks[index % self.locks.len()].write()
    }

    pub fn read_key(&self, key: &[u8]) -> RwLockReadGuard<'_, ()> {
        self.read_index(fnv1a64(key) as usize)
    }

    pub fn write_key(&self, key: &[u8]) -> RwLockWriteGuard<'_, ()> {
        self.write_index(fnv1a64(key) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_key_always_maps_to_the_same_stripe() {
        let locks = StripedLocks::new(64);
        assert_eq!(locks.slot(b"stable"), locks.slot(b"stable"));
    }

    #[test]
    fn zero_stripes_is_clamped_to_one() {
        let locks = StripedLocks::new(0);
        assert_eq!(locks.stripes(), 1);
        let _guard = locks.lock(b"anything");
    }

    #[test]
    fn disjoint_stripes_do_not_block_each_other() {
        let locks = Arc::new(StripedRwLocks::new(8));

        let _writer = locks.write_index(0);

        let locks2 = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let _reader = locks2.read_index(1);
        });
        handle.join().unwrap();
    }

    #[test]
    fn write_guard_excludes_readers_of_the_same_stripe() {
        let locks = StripedRwLocks::new(4);

        {
            let _r1 = locks.read_index(2);
            let _r2 = locks.read_index(2);
            assert!(locks.locks[2].try_write().is_none());
        }
        let _w = locks.write_index(2);
        assert!(locks.locks[2].try_read().is_none());
    }
}
