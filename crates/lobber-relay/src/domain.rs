//! Custom domain verification
//!
//! A custom domain points at the relay with a CNAME record. The resolver is
//! a trait so deployments plug in their own DNS client and tests use a
//! canned one.

use async_trait::async_trait;
use thiserror::Error;

/// The CNAME target custom domains must point at.
pub const SERVICE_DOMAIN: &str = "tunnel.lobber.dev";

/// Domain verification errors
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("DNS lookup failed: {0}")]
    Lookup(String),

    #[error("CNAME points to {found}, expected {expected}")]
    CnameMismatch { found: String, expected: String },
}

/// Looks up the CNAME record for a domain.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve_cname(&self, domain: &str) -> Result<String, DomainError>;
}

/// Check that `domain` has a CNAME record pointing at `expected`.
pub async fn verify_cname(
    domain: &str,
    resolver: &dyn DnsResolver,
    expected: &str,
) -> Result<(), DomainError> {
    let cname = resolver.resolve_cname(domain).await?;
    let cname = cname.trim_end_matches('.');

    if cname != expected {
        return Err(DomainError::CnameMismatch {
            found: cname.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}
