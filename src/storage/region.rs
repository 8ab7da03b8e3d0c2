//! # Byte Regions
//!
//! `ByteRegion` is the backing medium every other layer writes into: either
//! an anonymous heap buffer (ephemeral) or a memory-mapped file (durable).
//! Both variants expose the same contract — bounds-checked `read_at` /
//! `write_at`, grow, sync — so the chunk store and everything above it are
//! indifferent to where the bytes live.
//!
//! ## Concurrency Model
//!
//! Region I/O runs under a shared `RwLock` guard: any number of cursors may
//! read and write concurrently, provided writers target disjoint ranges
//! (enforced by the striped locks of the layers above, not here). `grow`
//! takes the exclusive guard, so all in-flight I/O drains before the buffer
//! is reallocated or remapped and no cursor can ever observe a dangling
//! mapping.
//!
//! This trades the borrow-checker discipline a single-owner mmap type would
//! give us for multi-cursor concurrency, which the chunk store requires. The
//! raw-pointer writes below are sound only because of the exclusive-grow
//! rule; every unsafe block states its obligations.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

pub struct ByteRegion {
    buf: RwLock<RegionBuf>,
}

struct RegionBuf {
    base: *mut u8,
    len: usize,
    backing: Backing,
}

enum Backing {
    Heap(Vec<u8>),
    Mmap { file: File, mmap: MmapMut },
}

// SAFETY: RegionBuf's raw base pointer aliases memory owned by `backing`,
// which lives exactly as long as the RegionBuf. All access to the pointer
// happens through ByteRegion's RwLock: shared guards only perform reads and
// writes to caller-disjoint ranges, and the pointer is only invalidated by
// grow(), which holds the exclusive guard.
unsafe impl Send for RegionBuf {}
unsafe impl Sync for RegionBuf {}

impl RegionBuf {
    fn heap(mut bytes: Vec<u8>) -> Self {
        Self {
            base: bytes.as_mut_ptr(),
            len: bytes.len(),
            backing: Backing::Heap(bytes),
        }
    }

    fn mapped(file: File, mut mmap: MmapMut) -> Self {
        Self {
            base: mmap.as_mut_ptr(),
            len: mmap.len(),
            backing: Backing::Mmap { file, mmap },
        }
    }
}

impl ByteRegion {
    /// An anonymous in-memory region. Contents are lost on drop.
    pub fn heap(len: u64) -> Self {
        Self {
            buf: RwLock::new(RegionBuf::heap(vec![0u8; len as usize])),
        }
    }

    /// Create a new file-backed region, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let path = path.as_ref();
        ensure!(len > 0, "region length must be at least 1 byte");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create region file '{}'", path.display()))?;

        file.set_len(len)
            .wrap_err_with(|| format!("failed to set region file size to {} bytes", len))?;

        // SAFETY: the file was just created with exclusive read+write access
        // and sized before mapping. The mmap's lifetime is tied to the
        // RegionBuf, and remapping only happens under the exclusive guard.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            buf: RwLock::new(RegionBuf::mapped(file, mmap)),
        })
    }

    /// Open an existing file-backed region.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(len > 0, "cannot open empty region file '{}'", path.display());

        // SAFETY: same obligations as in create(); database region files are
        // not modified by external processes while the store is open.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            buf: RwLock::new(RegionBuf::mapped(file, mmap)),
        })
    }

    pub fn len(&self) -> u64 {
        self.buf.read().len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let buf = self.buf.read();
        let end = offset + dst.len() as u64;
        ensure!(
            end <= buf.len as u64,
            "region read [{}, {}) out of bounds (len={})",
            offset,
            end,
            buf.len
        );

        // SAFETY: the range was bounds-checked against the current length,
        // which cannot change while the shared guard is held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.base.add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    pub fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let buf = self.buf.read();
        let end = offset + src.len() as u64;
        ensure!(
            end <= buf.len as u64,
            "region write [{}, {}) out of bounds (len={})",
            offset,
            end,
            buf.len
        );

        // SAFETY: bounds-checked as above. Concurrent writers under shared
        // guards target disjoint ranges by the striping contract; writes to
        // the same range without an external lock are a caller bug, not UB
        // on the mapping itself (the backing storage stays valid).
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), buf.base.add(offset as usize), src.len());
        }
        Ok(())
    }

    /// Extend the region. A no-op when `new_len` does not exceed the current
    /// length. Blocks until all in-flight reads and writes complete.
    pub fn grow(&self, new_len: u64) -> Result<()> {
        let mut guard = self.buf.write();
        let buf = &mut *guard;
        if new_len as usize <= buf.len {
            return Ok(());
        }

        match &mut buf.backing {
            Backing::Heap(bytes) => {
                bytes.resize(new_len as usize, 0);
                buf.base = bytes.as_mut_ptr();
                buf.len = bytes.len();
            }
            Backing::Mmap { file, mmap } => {
                mmap.flush().wrap_err("failed to flush mmap before grow")?;
                file.set_len(new_len)
                    .wrap_err_with(|| format!("failed to extend region file to {} bytes", new_len))?;

                // SAFETY: the exclusive guard guarantees no reader or writer
                // holds the old base pointer; the old mapping is dropped when
                // the new one is assigned.
                let remapped = unsafe {
                    MmapMut::map_mut(&*file).wrap_err("failed to remap region after grow")?
                };
                *mmap = remapped;
                buf.base = mmap.as_mut_ptr();
                buf.len = mmap.len();
            }
        }
        Ok(())
    }

    /// Flush dirty pages to disk. A no-op for heap regions.
    pub fn sync(&self) -> Result<()> {
        let buf = self.buf.read();
        match &buf.backing {
            Backing::Heap(_) => Ok(()),
            Backing::Mmap { mmap, .. } => mmap.flush().wrap_err("failed to sync region to disk"),
        }
    }

    /// Hint the kernel to fault in `[offset, offset + len)` ahead of a scan.
    pub fn prefetch(&self, offset: u64, len: u64) {
        let buf = self.buf.read();
        if offset as usize >= buf.len {
            return;
        }
        let len = len.min(buf.len as u64 - offset) as usize;

        #[cfg(unix)]
        if let Backing::Mmap { .. } = buf.backing {
            // SAFETY: the range is clamped to the mapping and madvise with
            // MADV_WILLNEED is advisory only.
            unsafe {
                libc::madvise(
                    buf.base.add(offset as usize) as *mut libc::c_void,
                    len,
                    libc::MADV_WILLNEED,
                );
            }
        }
        #[cfg(not(unix))]
        let _ = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn heap_region_round_trips_bytes() {
        let region = ByteRegion::heap(128);

        region.write_at(10, b"hello").unwrap();

        let mut got = [0u8; 5];
        region.read_at(10, &mut got).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let region = ByteRegion::heap(16);

        assert!(region.write_at(12, b"hello").is_err());
        let mut buf = [0u8; 8];
        assert!(region.read_at(9, &mut buf).is_err());
        assert!(region.read_at(8, &mut buf).is_ok());
    }

    #[test]
    fn grow_preserves_heap_contents() {
        let region = ByteRegion::heap(32);
        region.write_at(0, b"keep me").unwrap();

        region.grow(1024).unwrap();

        assert_eq!(region.len(), 1024);
        let mut got = [0u8; 7];
        region.read_at(0, &mut got).unwrap();
        assert_eq!(&got, b"keep me");
    }

    #[test]
    fn grow_to_smaller_len_is_a_noop() {
        let region = ByteRegion::heap(64);
        region.grow(32).unwrap();
        assert_eq!(region.len(), 64);
    }

    #[test]
    fn mapped_region_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.loam");

        {
            let region = ByteRegion::create(&path, 256).unwrap();
            region.write_at(100, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
            region.sync().unwrap();
        }

        let region = ByteRegion::open(&path).unwrap();
        assert_eq!(region.len(), 256);
        let mut got = [0u8; 4];
        region.read_at(100, &mut got).unwrap();
        assert_eq!(got, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn mapped_region_grow_extends_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.loam");

        let region = ByteRegion::create(&path, 64).unwrap();
        region.write_at(0, b"front").unwrap();
        region.grow(4096).unwrap();
        region.write_at(4090, b"back").unwrap();

        assert_eq!(region.len(), 4096);
        let mut front = [0u8; 5];
        region.read_at(0, &mut front).unwrap();
        assert_eq!(&front, b"front");
    }

    #[test]
    fn open_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(ByteRegion::open(dir.path().join("absent.loam")).is_err());
    }
}
