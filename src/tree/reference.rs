//! Immutable, read-only reference hash tree: one SHA-256 leaf per chunk,
//! folded pairwise up to a root, persisted as `leaf hashes | footer`.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{CacheError, CacheResult};
use crate::geometry::{NodeIndex, TreeGeometry};
use crate::tree::footer::{Footer, FOOTER_LEN};
use crate::utils::{hash_bytes, hash_pair, hash_single, Hash};

/// Immutable hash tree over a fixed `(total_size, chunk_size)` content
/// descriptor. Treated as read-only once built or loaded.
#[derive(Debug, Clone)]
pub struct ReferenceTree {
    geometry: TreeGeometry,
    leaf_hashes: Vec<Hash>,
    /// Internal node hashes, indexed by `NodeIndex`; `None` for nodes whose
    /// entire subtree is padding (no real leaves beneath them).
    internal_hashes: Vec<Option<Hash>>,
}

impl ReferenceTree {
    /// Hash `reader` in `chunk_size`-sized pieces to build a fresh tree.
    pub fn build<R: Read>(
        mut reader: R,
        total_size: u64,
        chunk_size: u64,
    ) -> CacheResult<Self> {
        let geometry = TreeGeometry::new(total_size, chunk_size)?;
        let mut leaf_hashes = Vec::with_capacity(geometry.n_leaves() as usize);
        let mut buf = vec![0u8; chunk_size as usize];
        let mut remaining = total_size;

        while remaining > 0 {
            let this_len = std::cmp::min(chunk_size, remaining) as usize;
            reader.read_exact(&mut buf[..this_len])?;
            leaf_hashes.push(hash_bytes(&buf[..this_len]));
            remaining -= this_len as u64;
        }

        if leaf_hashes.len() as u64 != geometry.n_leaves() {
            return Err(CacheError::Corrupt(format!(
                "expected {} leaves, hashed {}",
                geometry.n_leaves(),
                leaf_hashes.len()
            )));
        }

        Self::from_leaf_hashes(geometry, leaf_hashes)
    }

    /// Reconstruct a tree from its leaf hashes and fold internal hashes.
    pub fn from_leaf_hashes(geometry: TreeGeometry, leaf_hashes: Vec<Hash>) -> CacheResult<Self> {
        if leaf_hashes.len() as u64 != geometry.n_leaves() {
            return Err(CacheError::Corrupt(format!(
                "leaf hash count {} does not match geometry n_leaves {}",
                leaf_hashes.len(),
                geometry.n_leaves()
            )));
        }

        let internal_hashes = fold_internal_hashes(&geometry, &leaf_hashes);

        Ok(Self {
            geometry,
            leaf_hashes,
            internal_hashes,
        })
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    pub fn leaf_hashes(&self) -> &[Hash] {
        &self.leaf_hashes
    }

    pub fn leaf_hash(&self, i: u64) -> Option<Hash> {
        self.leaf_hashes.get(i as usize).copied()
    }

    /// Hash of `node`, whether leaf or internal. `None` for a fully-padded
    /// internal node.
    pub fn node_hash(&self, node: NodeIndex) -> Option<Hash> {
        if self.geometry.is_leaf(node) {
            let idx = self.geometry.leaf_index(node);
            self.leaf_hashes.get(idx as usize).copied()
        } else {
            self.internal_hashes
                .get(node as usize)
                .copied()
                .flatten()
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.node_hash(self.geometry.root())
            .expect("root hash is always defined for a non-empty tree")
    }

    /// SHA-256 over the concatenation of all leaf hashes, in order.
    pub fn file_digest(&self) -> Hash {
        compute_file_digest(&self.leaf_hashes)
    }

    /// Serialize `leaf hashes | footer` to `path`, atomically (write to a
    /// temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        let dir = path.parent().ok_or_else(|| {
            CacheError::InvalidArgument("save path has no parent directory".to_string())
        })?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for hash in &self.leaf_hashes {
            tmp.write_all(hash)?;
        }
        let footer = Footer::new_reference(
            self.geometry.total_size(),
            self.geometry.n_leaves() as u32,
            self.file_digest(),
        );
        tmp.write_all(&footer.to_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    /// Load and strictly validate a tree previously written by `save`.
    ///
    /// Footer is fixed-size, so it is read as the trailing `FOOTER_LEN`
    /// bytes directly; `footer_length` is then checked as a sanity bound
    /// rather than used to locate the footer.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN as u64 {
            return Err(CacheError::Corrupt(format!(
                "file too short ({file_len} bytes) to contain a footer"
            )));
        }

        let leaf_region_len = file_len - FOOTER_LEN as u64;
        let mut footer_buf = [0u8; FOOTER_LEN];
        read_at(&mut file, leaf_region_len, &mut footer_buf)?;
        let footer = Footer::from_bytes(&footer_buf)?;

        let expected_len = footer.n_leaves as u64 * 32 + footer.footer_length as u64;
        if file_len != expected_len {
            return Err(CacheError::Corrupt(format!(
                "file size {file_len} does not match n_leaves*32+footer_length {expected_len}"
            )));
        }

        let mut leaf_bytes = vec![0u8; leaf_region_len as usize];
        read_at(&mut file, 0, &mut leaf_bytes)?;

        let leaf_hashes: Vec<Hash> = leaf_bytes
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let file_digest = compute_file_digest(&leaf_hashes);
        if file_digest != footer.file_digest {
            return Err(CacheError::Corrupt(
                "file digest does not match footer".to_string(),
            ));
        }

        let geometry = TreeGeometry::new(footer.total_size, default_chunk_size_hint(&footer))?;
        Self::from_leaf_hashes(geometry, leaf_hashes)
    }
}

/// The footer does not persist `chunk_size` directly (only `total_size` and
/// `n_leaves`); recover it as `ceil(total_size / n_leaves)` rounded up to the
/// next power of two, which is exact whenever the file was produced by this
/// crate (chunk_size is always a power of two and only the last leaf is
/// short).
fn default_chunk_size_hint(footer: &Footer) -> u64 {
    if footer.n_leaves == 0 {
        return crate::geometry::MIN_CHUNK_SIZE;
    }
    let approx = footer.total_size.div_ceil(footer.n_leaves as u64);
    approx.next_power_of_two().max(crate::geometry::MIN_CHUNK_SIZE)
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> CacheResult<()> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}

fn compute_file_digest(leaf_hashes: &[Hash]) -> Hash {
    let mut concatenated = Vec::with_capacity(leaf_hashes.len() * 32);
    for h in leaf_hashes {
        concatenated.extend_from_slice(h);
    }
    hash_bytes(&concatenated)
}

/// Bottom-up fold: pairwise hash where both children exist, single-child
/// fold where only a left child exists, `None` where the subtree is
/// entirely padding.
fn fold_internal_hashes(geometry: &TreeGeometry, leaf_hashes: &[Hash]) -> Vec<Option<Hash>> {
    let leaf_offset = geometry.leaf_offset();
    let mut internal = vec![None; leaf_offset as usize];

    if leaf_offset == 0 {
        return internal;
    }

    for node in (0..leaf_offset).rev() {
        let (left, right) = geometry.children(node).expect("internal node has children");
        let left_hash = node_hash_during_fold(geometry, leaf_hashes, &internal, left);
        let right_hash = node_hash_during_fold(geometry, leaf_hashes, &internal, right);

        internal[node as usize] = match (left_hash, right_hash) {
            (Some(l), Some(r)) => Some(hash_pair(&l, &r)),
            (Some(l), None) => Some(hash_single(&l)),
            (None, None) => None,
            (None, Some(_)) => unreachable!("left-to-right leaf ordering guarantees no gap"),
        };
    }

    internal
}

fn node_hash_during_fold(
    geometry: &TreeGeometry,
    leaf_hashes: &[Hash],
    internal: &[Option<Hash>],
    node: NodeIndex,
) -> Option<Hash> {
    if geometry.is_leaf(node) {
        let idx = geometry.leaf_index(node);
        leaf_hashes.get(idx as usize).copied()
    } else {
        internal[node as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Three chunks of the minimum legal chunk size (1024), the last one
    /// short by a single byte: `[1024 x 'A', 1024 x 'B', 1 x 'C']`.
    fn three_leaf_content() -> Vec<u8> {
        let mut content = vec![b'A'; 1024];
        content.extend(std::iter::repeat(b'B').take(1024));
        content.push(b'C');
        content
    }

    #[test]
    fn build_hashes_each_chunk_independently() {
        let content = three_leaf_content();
        let tree = ReferenceTree::build(Cursor::new(&content), content.len() as u64, 1024).unwrap();
        assert_eq!(tree.leaf_hash(0).unwrap(), hash_bytes(&content[0..1024]));
        assert_eq!(tree.leaf_hash(1).unwrap(), hash_bytes(&content[1024..2048]));
        assert_eq!(tree.leaf_hash(2).unwrap(), hash_bytes(&content[2048..2049]));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![42u8; 16 * 4096 + 7];
        let tree = ReferenceTree::build(Cursor::new(&content), content.len() as u64, 4096).unwrap();

        let path = dir.path().join("content.mref");
        tree.save(&path).unwrap();

        let loaded = ReferenceTree::load(&path).unwrap();
        assert_eq!(loaded.root_hash(), tree.root_hash());
        assert_eq!(loaded.leaf_hashes(), tree.leaf_hashes());
        assert_eq!(loaded.geometry().total_size(), tree.geometry().total_size());
        assert_eq!(loaded.geometry().n_leaves(), tree.geometry().n_leaves());
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mref");
        std::fs::write(&path, vec![0u8; 4]).unwrap();
        assert!(ReferenceTree::load(&path).is_err());
    }

    #[test]
    fn load_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; 4096 * 3];
        let tree = ReferenceTree::build(Cursor::new(&content), content.len() as u64, 4096).unwrap();
        let path = dir.path().join("tampered.mref");
        tree.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF; // corrupt first leaf hash byte
        std::fs::write(&path, bytes).unwrap();

        assert!(ReferenceTree::load(&path).is_err());
    }

    #[test]
    fn single_child_nodes_fold_with_hash_single() {
        // 3 leaves -> cap_leaf=4, node 2 (right child of root) has only one
        // real leaf beneath it (leaf 2), leaf 3 is padding.
        let content = three_leaf_content();
        let tree = ReferenceTree::build(Cursor::new(&content), content.len() as u64, 1024).unwrap();
        let geometry = *tree.geometry();
        let root = geometry.root();
        let (_, right) = geometry.children(root).unwrap();
        let (leaf2_node, leaf3_node) = geometry.children(right).unwrap();
        assert!(geometry.is_leaf(leaf2_node));
        assert!(geometry.is_leaf(leaf3_node));
        assert_eq!(
            tree.node_hash(right).unwrap(),
            hash_single(&tree.leaf_hash(2).unwrap())
        );
    }
}
