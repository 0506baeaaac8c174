//! API token generation and verification
//!
//! Tokens are `lb_` followed by 32 random bytes hex-encoded. Only the
//! argon2id hash is meant to be stored; the plaintext is shown to the user
//! once at creation time.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

/// Prefix identifying lobber API tokens.
pub const TOKEN_PREFIX: &str = "lb_";

/// Error types for token operations
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to hash token: {0}")]
    HashingFailed(String),

    #[error("invalid token hash format: {0}")]
    InvalidHashFormat(String),
}

/// Create a new API token. Returns the plaintext token and the argon2id
/// hash to store.
pub fn generate_api_token() -> Result<(String, String), TokenError> {
    let bytes: [u8; 32] = rand::random();
    let plaintext = format!("{}{}", TOKEN_PREFIX, hex::encode(bytes));
    let hash = hash_token(&plaintext)?;
    Ok((plaintext, hash))
}

/// Hash a plaintext token for storage using argon2id with a random salt.
pub fn hash_token(plaintext: &str) -> Result<String, TokenError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| TokenError::HashingFailed(e.to_string()))?;
    Ok(hash.to_string())
}

/// Check a plaintext token against a stored hash.
pub fn validate_api_token(plaintext: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}
