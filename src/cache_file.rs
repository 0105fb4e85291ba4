//! Sparse, pre-sized cache file for mirrored content, backed by a
//! memory-mapped region for reads and positional writes for fetched chunks.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::errors::CacheResult;

/// A sparse file of exactly `total_size` bytes, created (not truncated) at
/// open time so the filesystem can leave unfetched regions as holes.
pub struct CacheFile {
    file: File,
    mmap: Mutex<MmapMut>,
    total_size: u64,
}

impl CacheFile {
    /// Open or create the cache file at `path`, sized to `total_size`.
    pub fn open(path: &Path, total_size: u64) -> CacheResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let current_len = file.metadata()?.len();
        if current_len != total_size {
            file.set_len(total_size)?;
        }

        let mmap = if total_size == 0 {
            MmapOptions::new().len(1).map_anon()?
        } else {
            unsafe { MmapOptions::new().len(total_size as usize).map_mut(&file)? }
        };

        Ok(Self {
            file,
            mmap: Mutex::new(mmap),
            total_size,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Write `data` at `offset`, flushing just that byte range to disk.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        let start = offset as usize;
        let end = start + data.len();
        let mut mmap = self.mmap.lock();
        mmap[start..end].copy_from_slice(data);
        mmap.flush_range(start, data.len())?;
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` into a fresh buffer.
    ///
    /// Callers are expected to have already confirmed (via `State`) that
    /// every leaf in `[offset, offset+len)` is valid; this call does not
    /// itself check validity.
    pub fn read_at(&self, offset: u64, len: u64) -> Vec<u8> {
        let start = offset as usize;
        let end = start + len as usize;
        let mmap = self.mmap.lock();
        mmap[start..end].to_vec()
    }

    /// Read-only mmap view, for callers that want zero-copy access to a
    /// range they have already verified as valid.
    pub fn map_readonly(&self) -> CacheResult<Mmap> {
        Ok(unsafe { MmapOptions::new().map(&self.file)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let cache = CacheFile::open(&path, 4096).unwrap();

        cache.write_at(100, b"hello").unwrap();
        assert_eq!(cache.read_at(100, 5), b"hello");
    }

    #[test]
    fn unwritten_regions_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let cache = CacheFile::open(&path, 4096).unwrap();
        assert_eq!(cache.read_at(0, 10), vec![0u8; 10]);
    }

    #[test]
    fn reopening_preserves_previously_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        {
            let cache = CacheFile::open(&path, 4096).unwrap();
            cache.write_at(0, b"persisted").unwrap();
        }
        let cache = CacheFile::open(&path, 4096).unwrap();
        assert_eq!(&cache.read_at(0, 9), b"persisted");
    }
}
