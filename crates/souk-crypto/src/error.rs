//! Error types for the crypto primitives.

/// Errors raised while encoding or decoding key material.
///
/// Signature verification never returns an error: a malformed signature or
/// key simply fails to verify.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A PEM document could not be produced or parsed.
    #[error("invalid PEM key material: {0}")]
    Pem(String),
}
