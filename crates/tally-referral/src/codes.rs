//! Referral code derivation
//!
//! Codes are derived from the user id so the same user always lands on the
//! same code. A salt counter resolves the rare collision.

use tally_core::types::UserId;

/// Lowercase letters and digits without the easily confused `i l o 0 1`
pub const CODE_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

const CODE_CONTEXT: &str = "tally referral code v1";

/// Candidate code for `user_id` at collision attempt `salt`
pub fn derive_code(user_id: &UserId, salt: u32, prefix: &str, length: usize) -> String {
    let mut material = Vec::with_capacity(user_id.as_str().len() + 4);
    material.extend_from_slice(user_id.as_str().as_bytes());
    material.extend_from_slice(&salt.to_be_bytes());

    let mut digest = tally_crypto::derive(CODE_CONTEXT, &material);
    let mut code = String::with_capacity(prefix.len() + length);
    code.push_str(prefix);

    let mut i = 0;
    for _ in 0..length {
        if i == digest.len() {
            digest = tally_crypto::hash_blake3(&digest);
            i = 0;
        }
        let c = CODE_ALPHABET[digest[i] as usize % CODE_ALPHABET.len()];
        code.push(c as char);
        i += 1;
    }
    code
}

/// Normalize user input before lookup
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_code_is_deterministic() {
        let alice = UserId::new("alice");
        assert_eq!(derive_code(&alice, 0, "wc-", 6), derive_code(&alice, 0, "wc-", 6));
        assert_ne!(derive_code(&alice, 0, "wc-", 6), derive_code(&alice, 1, "wc-", 6));
        assert_ne!(
            derive_code(&alice, 0, "wc-", 6),
            derive_code(&UserId::new("bob"), 0, "wc-", 6)
        );
    }

    #[test]
    fn test_long_codes_extend_digest() {
        let code = derive_code(&UserId::new("alice"), 0, "", 80);
        assert_eq!(code.len(), 80);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_code("  WC-AB23CD "), "wc-ab23cd");
    }

    proptest! {
        #[test]
        fn prop_code_shape(user in "[a-z0-9_]{1,24}", salt in 0u32..8) {
            let code = derive_code(&UserId::new(user), salt, "wc-", 6);
            prop_assert!(code.starts_with("wc-"));
            prop_assert_eq!(code.len(), 9);
            prop_assert!(code[3..].bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }
}
