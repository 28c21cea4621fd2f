//! Password hashing primitives.
//!
//! Hashes are Argon2 PHC strings with a 16-byte salt drawn from the OS RNG.
//! Verification goes through `password-hash`, whose digest comparison is
//! constant time.

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use once_cell::sync::Lazy;
use password_hash::{PasswordHash, SaltString};
use thiserror::Error;

const TEMP_PASSWORD_LEN: usize = 12;
// No 0/O/1/l/I so the password can be read out loud or copied by hand.
const TEMP_PASSWORD_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error)]
pub enum HashError {
    #[error("random source unavailable: {0}")]
    Random(getrandom::Error),
    #[error("password hashing failed: {0}")]
    Hash(password_hash::Error),
}

/// Fill `buf` from the operating system RNG.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), HashError> {
    getrandom::getrandom(buf).map_err(HashError::Random)
}

pub fn hash_password(password: &str) -> Result<String, HashError> {
    let mut salt_bytes = [0u8; 16];
    random_bytes(&mut salt_bytes)?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(HashError::Hash)?;
    let argon2 = Argon2::default();
    let phc = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(HashError::Hash)?
        .to_string();
    Ok(phc)
}

/// Returns false for a wrong password and for a hash that does not parse.
pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

// Verified against when the login name is unknown, so that path costs the
// same Argon2 work as a wrong password.
static DUMMY_HASH: Lazy<Option<String>> = Lazy::new(|| hash_password("duit-dummy-password").ok());

pub fn burn_verification(password: &str) {
    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(hash, password);
    }
}

/// Random password handed out by an administrative reset.
pub fn generate_temporary_password() -> Result<String, HashError> {
    let mut raw = [0u8; TEMP_PASSWORD_LEN];
    random_bytes(&mut raw)?;
    let n = TEMP_PASSWORD_ALPHABET.len();
    Ok(raw
        .iter()
        .map(|b| TEMP_PASSWORD_ALPHABET[usize::from(*b) % n] as char)
        .collect())
}
