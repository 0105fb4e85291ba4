use sha2::{Digest, Sha256};

/// Hash type used throughout the system
pub type Hash = [u8; 32];

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(input: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let res = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&res);
    out
}

/// Hash a pair of child hashes together with domain separation
pub fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    // Domain separation: concatenate the two hashes
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(a);
    data[32..].copy_from_slice(b);
    hash_bytes(&data)
}

/// Hash a single left child with no right sibling (odd-node fold)
pub fn hash_single(a: &Hash) -> Hash {
    hash_bytes(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn hash_pair_is_order_sensitive() {
        let a = hash_bytes(b"left");
        let b = hash_bytes(b"right");
        assert_ne!(hash_pair(&a, &b), hash_pair(&b, &a));
    }
}
