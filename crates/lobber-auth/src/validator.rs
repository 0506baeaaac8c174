//! Pluggable bearer-token validation
//!
//! The relay consults a `TokenValidator` during the tunnel handshake.
//! Implement this trait to back tokens with whatever store you have
//! (database rows, a config file, an external identity service).

use crate::token::validate_api_token;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("validation failed: {0}")]
    Internal(String),
}

/// Validates a bearer token and resolves it to a user identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the user id the token belongs to, or `AuthError::InvalidToken`.
    async fn validate(&self, token: &str) -> Result<String, AuthError>;
}

/// In-memory plaintext token map, for tests and single-tenant deployments.
pub struct StaticTokenValidator {
    /// token -> user id
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, user)| (token.into(), user.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }
}

impl Default for StaticTokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Validates tokens against stored argon2id hashes.
///
/// Verification walks every entry, so this fits a handful of tokens; a
/// deployment with many users should index hashes in its own
/// `TokenValidator` implementation.
pub struct HashedTokenValidator {
    /// (user id, token hash)
    entries: Vec<(String, String)>,
}

impl HashedTokenValidator {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl TokenValidator for HashedTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, AuthError> {
        for (user_id, hash) in &self.entries {
            if validate_api_token(token, hash) {
                return Ok(user_id.clone());
            }
        }
        Err(AuthError::InvalidToken)
    }
}
