//! Password scrambles for `mysql_native_password` and `caching_sha2_password`.

use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::Sha256;

pub const SALT_LEN: usize = 20;

/// A fresh scramble for a greeting. Bytes stay in `1..=127` so the salt
/// never contains a NUL and survives NUL-terminated framing.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    for b in &mut salt {
        *b = rng.gen_range(1..=127);
    }
    salt
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`.
///
/// An empty password produces an empty response.
pub fn native_password_scramble(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let mask = hasher.finalize();
    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client's native-password response against the expected password.
pub fn verify_native_password(password: &[u8], salt: &[u8], response: &[u8]) -> bool {
    let expected = native_password_scramble(password, salt);
    constant_time_eq(&expected, response)
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)`.
pub fn caching_sha2_scramble(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    let mask = hasher.finalize();
    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compare without short-circuiting on the first differing byte or on a
/// length mismatch. Runs over the longer input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Plaintext password check over SHA-256 digests, so the time taken does
/// not depend on either password's length.
pub fn password_matches(expected: &[u8], given: &[u8]) -> bool {
    constant_time_eq(&Sha256::digest(expected), &Sha256::digest(given))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_has_no_nul_bytes() {
        for _ in 0..32 {
            let salt = generate_salt();
            assert!(salt.iter().all(|&b| (1..=127).contains(&b)));
        }
    }

    #[test]
    fn native_scramble_verifies() {
        let salt = generate_salt();
        let response = native_password_scramble(b"s3cret", &salt);
        assert_eq!(response.len(), 20);
        assert!(verify_native_password(b"s3cret", &salt, &response));
        assert!(!verify_native_password(b"wrong", &salt, &response));
    }

    #[test]
    fn native_scramble_depends_on_salt() {
        let a = native_password_scramble(b"pw", &[1u8; 20]);
        let b = native_password_scramble(b"pw", &[2u8; 20]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_password_means_empty_response() {
        assert!(native_password_scramble(b"", &[1u8; 20]).is_empty());
        assert!(verify_native_password(b"", &[1u8; 20], &[]));
        assert!(!verify_native_password(b"", &[1u8; 20], &[0u8; 20]));
        assert!(caching_sha2_scramble(b"", &[1u8; 20]).is_empty());
    }

    #[test]
    fn caching_sha2_is_32_bytes() {
        assert_eq!(caching_sha2_scramble(b"pw", &[9u8; 20]).len(), 32);
    }

    #[test]
    fn constant_time_eq_checks_length() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"ab", b"abc"));
        // A zero-padded prefix is still a mismatch.
        assert!(!constant_time_eq(b"ab\0", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn password_matches_compares_fixed_size_digests() {
        assert!(password_matches(b"s3cret", b"s3cret"));
        assert!(!password_matches(b"s3cret", b"s3cre"));
        assert!(!password_matches(b"s3cret", b"s3cret-and-more"));
        assert!(password_matches(b"", b""));
        assert!(!password_matches(b"", b"x"));
    }
}
