//! Bit-exact, big-endian footer shared by reference-tree (`.mref`) and
//! state (`.mrkl`) files. The two formats share this footer layout; state
//! files additionally repurpose the "leaf boundary table" slot to record
//! the offset/length of their embedded validity bitmap (see `Footer::flags`).

use crate::errors::{CacheError, CacheResult};
use crate::utils::Hash;

/// Footer format version this crate writes and accepts.
pub const FOOTER_VERSION: u8 = 0x01;
/// Hash algorithm identifier for SHA-256.
pub const HASH_ALG_SHA256: u8 = 0x01;
/// Digest length in bytes (SHA-256).
pub const DIGEST_LEN: u8 = 32;
/// Fixed, serialized footer size in bytes.
pub const FOOTER_LEN: usize = 58;

/// `flags` bit indicating the file carries an embedded validity bitmap
/// between the leaf hashes and the footer (a state file, not a pure
/// reference tree).
pub const FLAG_EMBEDDED_BITMAP: u8 = 0b0000_0001;

/// Fixed-layout footer, 58 bytes, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub version: u8,
    pub flags: u8,
    pub hash_alg_id: u8,
    pub digest_len: u8,
    pub total_size: u64,
    pub n_leaves: u32,
    pub leaf_boundary_table_offset: u32,
    pub leaf_boundary_table_length: u32,
    pub file_digest: Hash,
    pub footer_length: u16,
}

impl Footer {
    pub fn new_reference(total_size: u64, n_leaves: u32, file_digest: Hash) -> Self {
        Self {
            version: FOOTER_VERSION,
            flags: 0,
            hash_alg_id: HASH_ALG_SHA256,
            digest_len: DIGEST_LEN,
            total_size,
            n_leaves,
            leaf_boundary_table_offset: 0,
            leaf_boundary_table_length: 0,
            file_digest,
            footer_length: FOOTER_LEN as u16,
        }
    }

    pub fn new_state(
        total_size: u64,
        n_leaves: u32,
        file_digest: Hash,
        bitmap_offset: u32,
        bitmap_length: u32,
    ) -> Self {
        Self {
            version: FOOTER_VERSION,
            flags: FLAG_EMBEDDED_BITMAP,
            hash_alg_id: HASH_ALG_SHA256,
            digest_len: DIGEST_LEN,
            total_size,
            n_leaves,
            leaf_boundary_table_offset: bitmap_offset,
            leaf_boundary_table_length: bitmap_length,
            file_digest,
            footer_length: FOOTER_LEN as u16,
        }
    }

    pub fn has_embedded_bitmap(&self) -> bool {
        self.flags & FLAG_EMBEDDED_BITMAP != 0
    }

    /// Serialize to exactly `FOOTER_LEN` big-endian bytes.
    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        let mut off = 0;

        buf[off] = self.version;
        off += 1;
        buf[off] = self.flags;
        off += 1;
        buf[off] = self.hash_alg_id;
        off += 1;
        buf[off] = self.digest_len;
        off += 1;

        buf[off..off + 8].copy_from_slice(&self.total_size.to_be_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.n_leaves.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.leaf_boundary_table_offset.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.leaf_boundary_table_length.to_be_bytes());
        off += 4;
        buf[off..off + 32].copy_from_slice(&self.file_digest);
        off += 32;
        buf[off..off + 2].copy_from_slice(&self.footer_length.to_be_bytes());
        off += 2;

        debug_assert_eq!(off, FOOTER_LEN);
        buf
    }

    /// Parse a footer from exactly `FOOTER_LEN` big-endian bytes.
    ///
    /// Any version/length mismatch reports `Corrupt` rather than
    /// synthesizing a default footer.
    pub fn from_bytes(buf: &[u8]) -> CacheResult<Self> {
        if buf.len() != FOOTER_LEN {
            return Err(CacheError::Corrupt(format!(
                "footer must be {FOOTER_LEN} bytes, got {}",
                buf.len()
            )));
        }

        let mut off = 0;
        let version = buf[off];
        off += 1;
        let flags = buf[off];
        off += 1;
        let hash_alg_id = buf[off];
        off += 1;
        let digest_len = buf[off];
        off += 1;

        let total_size = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let n_leaves = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let leaf_boundary_table_offset = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let leaf_boundary_table_length = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut file_digest = [0u8; 32];
        file_digest.copy_from_slice(&buf[off..off + 32]);
        off += 32;
        let footer_length = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;
        debug_assert_eq!(off, FOOTER_LEN);

        if version != FOOTER_VERSION {
            return Err(CacheError::Corrupt(format!(
                "unsupported footer version {version}"
            )));
        }
        if digest_len != DIGEST_LEN {
            return Err(CacheError::Corrupt(format!(
                "unsupported digest length {digest_len}"
            )));
        }
        if hash_alg_id != HASH_ALG_SHA256 {
            return Err(CacheError::Corrupt(format!(
                "unsupported hash algorithm id {hash_alg_id}"
            )));
        }
        if footer_length as usize != FOOTER_LEN {
            return Err(CacheError::Corrupt(format!(
                "unexpected footer length {footer_length}"
            )));
        }

        Ok(Self {
            version,
            flags,
            hash_alg_id,
            digest_len,
            total_size,
            n_leaves,
            leaf_boundary_table_offset,
            leaf_boundary_table_length,
            file_digest,
            footer_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let footer = Footer::new_reference(12345, 10, [7u8; 32]);
        let bytes = footer.to_bytes();
        assert_eq!(bytes.len(), FOOTER_LEN);
        let parsed = Footer::from_bytes(&bytes).unwrap();
        assert_eq!(footer, parsed);
    }

    #[test]
    fn rejects_bad_version() {
        let footer = Footer::new_reference(1, 1, [0u8; 32]);
        let mut bytes = footer.to_bytes();
        bytes[0] = 0xFF;
        assert!(Footer::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let bytes = vec![0u8; FOOTER_LEN - 1];
        assert!(Footer::from_bytes(&bytes).is_err());
    }

    #[test]
    fn state_footer_records_bitmap_region() {
        let footer = Footer::new_state(100, 4, [1u8; 32], 128, 1);
        assert!(footer.has_embedded_bitmap());
        assert_eq!(footer.leaf_boundary_table_offset, 128);
        assert_eq!(footer.leaf_boundary_table_length, 1);
    }
}
