use crate::error::AppError;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

/// Hashes a password into an Argon2id PHC string (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`).
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verifies a password against a stored hash. Argon2id hashes are recomputed
/// with the parameters and salt embedded in the PHC string; anything else is
/// treated as a legacy hex SHA-256 digest.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return false;
        };
        if parsed.algorithm != argon2::ARGON2ID_IDENT {
            return false;
        }
        return Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok();
    }

    let digest = format!("{:x}", Sha256::digest(password.as_bytes()));
    let stored = stored_hash.trim().to_ascii_lowercase();
    if digest.len() != stored.len() {
        return false;
    }
    digest.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Spends roughly the same time as a real verification so unknown usernames
/// cannot be told apart from wrong passwords by timing.
pub fn burn_verification(password: &str) {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    let hash = DUMMY_HASH.get_or_init(|| hash_password("procwarden-dummy-password").unwrap_or_default());
    let _ = verify_password(password, hash);
}
