//! Mutable, crash-safe validity state for one content descriptor: which
//! leaves have been fetched and hash-verified so far, persisted as
//! `leaf hashes | bitmap | footer` (a `.mrkl` file).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{CacheError, CacheResult};
use crate::geometry::TreeGeometry;
use crate::state::bitmap::ValidityBitmap;
use crate::tree::footer::{Footer, FOOTER_LEN};
use crate::tree::reference::ReferenceTree;
use crate::utils::{hash_bytes, Hash};

/// Mutable validity state backing a `VerifiedChannel`.
///
/// Leaf hashes are copied in from the reference tree at creation time so
/// that `save_if_valid` can verify fetched bytes without holding a
/// reference to the `ReferenceTree` itself. Bits only ever flip 0 -> 1;
/// `save_if_valid` writes the caller's bytes (via `commit`) before it
/// flips the bit, so a crash mid-write never leaves a bit set for data
/// that was not durably committed.
pub struct State {
    path: PathBuf,
    geometry: TreeGeometry,
    leaf_hashes: Vec<Hash>,
    bitmap: ValidityBitmap,
}

impl State {
    /// Materialize a fresh, all-invalid state file for `reference`.
    pub fn create(reference: &ReferenceTree, path: &Path) -> CacheResult<Self> {
        let geometry = *reference.geometry();
        let leaf_hashes = reference.leaf_hashes().to_vec();
        let bitmap = ValidityBitmap::new(geometry.n_leaves());

        let state = Self {
            path: path.to_path_buf(),
            geometry,
            leaf_hashes,
            bitmap,
        };
        state.write_fresh()?;
        Ok(state)
    }

    /// Load a previously persisted state file, verifying its leaf hashes
    /// against `reference` (the two must describe the same content).
    pub fn load(reference: &ReferenceTree, path: &Path) -> CacheResult<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN as u64 {
            return Err(CacheError::Corrupt(format!(
                "state file too short ({file_len} bytes)"
            )));
        }

        let mut footer_buf = [0u8; FOOTER_LEN];
        file.seek(SeekFrom::Start(file_len - FOOTER_LEN as u64))?;
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::from_bytes(&footer_buf)?;

        if !footer.has_embedded_bitmap() {
            return Err(CacheError::Corrupt(
                "state file footer missing embedded bitmap flag".to_string(),
            ));
        }

        let geometry = *reference.geometry();
        if footer.total_size != geometry.total_size() || footer.n_leaves as u64 != geometry.n_leaves() {
            return Err(CacheError::InvalidState(
                "state file does not describe the same content as the reference tree".to_string(),
            ));
        }

        let leaf_region_len = geometry.n_leaves() * 32;
        let bitmap_offset = footer.leaf_boundary_table_offset as u64;
        let bitmap_len = footer.leaf_boundary_table_length as u64;
        let expected_len = leaf_region_len + bitmap_len + FOOTER_LEN as u64;
        if file_len != expected_len || bitmap_offset != leaf_region_len {
            return Err(CacheError::Corrupt(
                "state file layout does not match footer offsets".to_string(),
            ));
        }

        let mut leaf_bytes = vec![0u8; leaf_region_len as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut leaf_bytes)?;
        let leaf_hashes: Vec<Hash> = leaf_bytes
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect();

        if leaf_hashes != reference.leaf_hashes() {
            return Err(CacheError::InvalidState(
                "state file leaf hashes diverge from the reference tree".to_string(),
            ));
        }

        let mut bitmap_bytes = vec![0u8; bitmap_len as usize];
        file.seek(SeekFrom::Start(bitmap_offset))?;
        file.read_exact(&mut bitmap_bytes)?;
        let bitmap = ValidityBitmap::from_bytes(&bitmap_bytes, geometry.n_leaves());

        Ok(Self {
            path: path.to_path_buf(),
            geometry,
            leaf_hashes,
            bitmap,
        })
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    pub fn is_valid(&self, leaf: u64) -> bool {
        self.bitmap.is_valid(leaf)
    }

    pub fn valid_chunks(&self) -> Vec<u64> {
        self.bitmap.iter_valid().collect()
    }

    pub fn all_valid(&self) -> bool {
        self.bitmap.all_valid()
    }

    /// Check `data` against the reference leaf hash for `leaf` without
    /// committing bytes or touching the bitmap. Lets a caller verify every
    /// leaf in a multi-leaf fetch before mutating any state (§4.6: an
    /// integrity failure must not mutate State, including for leaves in the
    /// same coalesced task that hashed correctly).
    pub fn verify_leaf(&self, leaf: u64, data: &[u8]) -> CacheResult<()> {
        let expected = self
            .leaf_hashes
            .get(leaf as usize)
            .ok_or_else(|| CacheError::InvalidArgument(format!("leaf {leaf} out of range")))?;
        if &hash_bytes(data) != expected {
            return Err(CacheError::Integrity { leaf_index: leaf });
        }
        Ok(())
    }

    /// Verify `data` against the reference leaf hash for `leaf`; on match,
    /// invoke `commit` (expected to durably write the bytes into the cache
    /// file) and only then flip the bit and flush the footer/bitmap.
    ///
    /// `commit` runs before the bit flips: a crash between the two leaves
    /// the bit unset, so a later open simply refetches the leaf.
    pub fn save_if_valid(
        &mut self,
        leaf: u64,
        data: &[u8],
        commit: impl FnOnce() -> CacheResult<()>,
    ) -> CacheResult<()> {
        self.verify_leaf(leaf, data)?;
        commit()?;
        self.bitmap.mark_valid(leaf);
        self.flush()
    }

    /// Persist the current bitmap bytes in place (footer is immutable
    /// once written, so only the bitmap region is rewritten).
    pub fn flush(&self) -> CacheResult<()> {
        let bitmap_offset = self.geometry.n_leaves() * 32;
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(bitmap_offset))?;
        file.write_all(self.bitmap.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Rebuild a `ReferenceTree` from the stored leaf hashes, independent
    /// of the `ReferenceTree` this state was created or loaded against.
    pub fn to_ref(&self) -> CacheResult<ReferenceTree> {
        ReferenceTree::from_leaf_hashes(self.geometry, self.leaf_hashes.clone())
    }

    fn write_fresh(&self) -> CacheResult<()> {
        let dir = self.path.parent().ok_or_else(|| {
            CacheError::InvalidArgument("state path has no parent directory".to_string())
        })?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for hash in &self.leaf_hashes {
            tmp.write_all(hash)?;
        }
        tmp.write_all(self.bitmap.as_bytes())?;

        let bitmap_offset = self.geometry.n_leaves() * 32;
        let footer = Footer::new_state(
            self.geometry.total_size(),
            self.geometry.n_leaves() as u32,
            compute_file_digest(&self.leaf_hashes),
            bitmap_offset as u32,
            self.bitmap.byte_len() as u32,
        );
        tmp.write_all(&footer.to_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }
}

fn compute_file_digest(leaf_hashes: &[Hash]) -> Hash {
    let mut concatenated = Vec::with_capacity(leaf_hashes.len() * 32);
    for h in leaf_hashes {
        concatenated.extend_from_slice(h);
    }
    hash_bytes(&concatenated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_reference(total_size: u64, chunk_size: u64) -> ReferenceTree {
        let content = vec![9u8; total_size as usize];
        ReferenceTree::build(Cursor::new(content), total_size, chunk_size).unwrap()
    }

    #[test]
    fn fresh_state_is_all_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let reference = build_reference(4096 * 4, 4096);
        let state = State::create(&reference, &dir.path().join("content.mrkl")).unwrap();
        assert_eq!(state.valid_chunks().len(), 0);
        assert!(!state.all_valid());
    }

    #[test]
    fn save_if_valid_rejects_wrong_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let reference = build_reference(4096, 4096);
        let mut state = State::create(&reference, &dir.path().join("content.mrkl")).unwrap();
        let result = state.save_if_valid(0, b"not the right bytes", || Ok(()));
        assert!(matches!(result, Err(CacheError::Integrity { leaf_index: 0 })));
        assert!(!state.is_valid(0));
    }

    #[test]
    fn save_if_valid_commits_then_marks_valid() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![9u8; 4096];
        let reference = ReferenceTree::build(Cursor::new(&content), 4096, 4096).unwrap();
        let mut state = State::create(&reference, &dir.path().join("content.mrkl")).unwrap();

        let committed = std::cell::Cell::new(false);
        state
            .save_if_valid(0, &content, || {
                committed.set(true);
                Ok(())
            })
            .unwrap();

        assert!(committed.get());
        assert!(state.is_valid(0));
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![3u8; 4096 * 4];
        let reference = ReferenceTree::build(Cursor::new(&content), content.len() as u64, 4096).unwrap();
        let path = dir.path().join("content.mrkl");

        let mut state = State::create(&reference, &path).unwrap();
        let chunk = &content[4096..8192];
        state.save_if_valid(1, chunk, || Ok(())).unwrap();

        let reloaded = State::load(&reference, &path).unwrap();
        assert!(reloaded.is_valid(1));
        assert!(!reloaded.is_valid(0));
    }
}
