//! Cryptographic primitives for Souk federation.
//!
//! Pure, stateless helpers consumed by every protocol component:
//!
//! - Ed25519 key generation and PEM (PKCS#8 / SPKI) encoding
//! - detached signatures over canonical strings, base64 encoded
//! - HMAC-SHA256 digests for the pre-identity bootstrap call
//! - SHA-256 agreement hashes
//! - timestamp freshness checks against the replay window
//!
//! None of these functions touch storage or the network. Signing and
//! verification are CPU-only and never suspend.

mod digest;
mod error;
mod freshness;
mod keys;
mod signature;

pub use digest::{
    agreement_hash, constant_time_eq, hmac_sha256_hex, sha256_hex, verify_hmac_sha256_hex,
};
pub use error::CryptoError;
pub use freshness::{is_fresh, now_millis};
pub use keys::{
    decode_private_key_pem, decode_public_key_pem, encode_private_key_pem, encode_public_key_pem,
    generate_keypair, GeneratedKeyPair, KEY_ALGORITHM, KEY_SIZE_BITS,
};
pub use signature::{sign, verify};

/// Re-exported so callers can hold a decoded key without depending on
/// `ed25519-dalek` directly.
pub use ed25519_dalek::{SigningKey, VerifyingKey};
