//! Key generation and PEM encoding.

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::CryptoError;

/// Algorithm label stored alongside the local identity.
pub const KEY_ALGORITHM: &str = "Ed25519";

/// Key size recorded for the algorithm. Ed25519 offers roughly 128-bit
/// security, above a 2048-bit RSA key.
pub const KEY_SIZE_BITS: u32 = 256;

/// A freshly generated keypair in both decoded and PEM form.
pub struct GeneratedKeyPair {
    pub signing_key: SigningKey,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

/// Generates a new Ed25519 keypair from the OS random source.
///
/// # Errors
///
/// Returns `CryptoError::Pem` if PEM encoding fails.
pub fn generate_keypair() -> Result<GeneratedKeyPair, CryptoError> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key_pem = encode_public_key_pem(&signing_key.verifying_key())?;
    let private_key_pem = encode_private_key_pem(&signing_key)?;
    Ok(GeneratedKeyPair {
        signing_key,
        public_key_pem,
        private_key_pem,
    })
}

/// Encodes a signing key as a PKCS#8 `PRIVATE KEY` PEM document.
pub fn encode_private_key_pem(key: &SigningKey) -> Result<String, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| CryptoError::Pem(e.to_string()))
}

/// Decodes a PKCS#8 `PRIVATE KEY` PEM document.
pub fn decode_private_key_pem(pem: &str) -> Result<SigningKey, CryptoError> {
    SigningKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))
}

/// Encodes a verifying key as an SPKI `PUBLIC KEY` PEM document.
pub fn encode_public_key_pem(key: &VerifyingKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))
}

/// Decodes an SPKI `PUBLIC KEY` PEM document.
pub fn decode_public_key_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))
}
