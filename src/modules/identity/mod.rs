//! Identity keys and the stable hash used to derive per-identity choices.

use sha2::{Digest, Sha256};

/// Minimum token length before its prefix is used as the identity.
const TOKEN_PREFIX_LEN: usize = 10;

/// Stable 64-bit hash of an identity. Unlike `DefaultHasher`, the value is
/// identical across processes and toolchains, so persisted choices survive.
pub fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Hex SHA-256 of `identity` and `salt`, truncated to `len` characters.
pub fn salted_digest(identity: &str, salt: &str, len: usize) -> String {
    let digest = Sha256::digest(format!("{identity}_{salt}").as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(len);
    hex
}

/// Identity for an account: the token prefix when a usable token exists,
/// otherwise an index-based key.
pub fn identity_for(index: usize, auth_token: Option<&str>) -> String {
    match auth_token {
        Some(token) if token.chars().count() >= TOKEN_PREFIX_LEN => {
            token.chars().take(TOKEN_PREFIX_LEN).collect()
        }
        _ => format!("account_{index}"),
    }
}
