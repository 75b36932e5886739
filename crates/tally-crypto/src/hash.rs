//! BLAKE3 hashing utilities
//!
//! All digests are 256-bit. Domain separation between Merkle leaves and
//! interior nodes is done with a one-byte prefix.

/// Prefix byte for allocation leaves
pub const LEAF_PREFIX: u8 = 0x00;

/// Prefix byte for interior nodes
pub const NODE_PREFIX: u8 = 0x01;

/// Hash data using BLAKE3 (256-bit output)
pub fn hash_blake3(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple items together
pub fn hash_concat(items: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        hasher.update(item);
    }
    *hasher.finalize().as_bytes()
}

/// Context-separated derivation, used for identifiers that must be stable
/// across runs (referral codes, cluster ids)
pub fn derive(context: &str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

/// Interior Merkle node
pub fn hash_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    hash_concat(&[&[NODE_PREFIX], left, right])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_blake3() {
        let hash = hash_blake3(b"season one");
        assert_eq!(hash, hash_blake3(b"season one"));
        assert_ne!(hash, hash_blake3(b"season two"));
    }

    #[test]
    fn test_hash_concat_matches_single_buffer() {
        assert_eq!(hash_concat(&[b"ab", b"cd"]), hash_blake3(b"abcd"));
    }

    #[test]
    fn test_node_is_order_sensitive() {
        let a = hash_blake3(b"a");
        let b = hash_blake3(b"b");
        assert_ne!(hash_node(&a, &b), hash_node(&b, &a));
    }

    #[test]
    fn test_derive_is_context_separated() {
        assert_ne!(derive("ctx one", b"x"), derive("ctx two", b"x"));
        assert_eq!(derive("ctx one", b"x"), derive("ctx one", b"x"));
    }
}
