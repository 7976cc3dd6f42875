//! Salted password hashes for session passwords and operator passwords.
//!
//! Hashes are stored as `pbkdf2;<salt>;<hash>` with both parts base64
//! encoded. An empty string stands for "no password".

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

const SCHEME: &str = "pbkdf2";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};
static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("failed to generate password salt")]
    Salt,
}

/// Hash a password. The empty password hashes to the empty string.
pub fn hash(password: &str) -> Result<String, PasswordError> {
    if password.is_empty() {
        return Ok(String::new());
    }
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| PasswordError::Salt)?;
    let mut derived = [0u8; HASH_LEN];
    pbkdf2::derive(ALGORITHM, ITERATIONS, &salt, password.as_bytes(), &mut derived);
    Ok(format!(
        "{SCHEME};{};{}",
        BASE64.encode(salt),
        BASE64.encode(derived)
    ))
}

/// Does `password` match `hash`? Nothing matches an empty or malformed hash.
pub fn check(password: &str, hash: &str) -> bool {
    let Some((salt, expected)) = decode(hash) else {
        return false;
    };
    pbkdf2::verify(ALGORITHM, ITERATIONS, &salt, password.as_bytes(), &expected).is_ok()
}

/// Empty, or a hash this module can check
pub fn is_valid_hash(hash: &str) -> bool {
    hash.is_empty() || decode(hash).is_some()
}

fn decode(hash: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut parts = hash.split(';');
    if parts.next()? != SCHEME {
        return None;
    }
    let salt = BASE64.decode(parts.next()?).ok()?;
    let derived = BASE64.decode(parts.next()?).ok()?;
    if parts.next().is_some() || salt.is_empty() || derived.len() != HASH_LEN {
        return None;
    }
    Some((salt, derived))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_check() {
        let h = hash("hunter2").unwrap();
        assert!(h.starts_with("pbkdf2;"));
        assert!(is_valid_hash(&h));
        assert!(check("hunter2", &h));
        assert!(!check("hunter3", &h));
        assert!(!check("", &h));
    }

    #[test]
    fn salts_differ() {
        let a = hash("same").unwrap();
        let b = hash("same").unwrap();
        assert_ne!(a, b);
        assert!(check("same", &a) && check("same", &b));
    }

    #[test]
    fn empty_means_no_password() {
        assert_eq!(hash("").unwrap(), "");
        assert!(is_valid_hash(""));
        assert!(!check("", ""));
        assert!(!check("anything", ""));
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(!is_valid_hash("plaintext"));
        assert!(!is_valid_hash("pbkdf2;AAAA"));
        assert!(!is_valid_hash("md5;AAAA;AAAA"));
        assert!(!is_valid_hash("pbkdf2;;AAAA"));
        let h = hash("x").unwrap();
        assert!(!is_valid_hash(&format!("{h};extra")));
    }
}
