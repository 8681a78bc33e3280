//! Detached Ed25519 signatures over canonical strings.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};

use crate::keys::decode_public_key_pem;

/// Signs `message` and returns the signature as standard base64.
pub fn sign(message: &str, key: &SigningKey) -> String {
    let signature = key.sign(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Verifies a base64 signature over `message` with a PEM public key.
///
/// Any malformed input (bad base64, wrong length, unparsable key) is a
/// verification failure rather than an error.
pub fn verify(message: &str, signature_b64: &str, public_key_pem: &str) -> bool {
    let Ok(public_key) = decode_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    public_key
        .verify(message.as_bytes(), &Signature::from_bytes(&bytes))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_keypair;

    #[test]
    fn sign_then_verify_round_trip() {
        let pair = generate_keypair().unwrap();
        let message = "a1|48.85|2.35|10|25|1700000000000";
        let signature = sign(message, &pair.signing_key);
        assert!(verify(message, &signature, &pair.public_key_pem));
    }

    #[test]
    fn flipping_any_character_breaks_verification() {
        let pair = generate_keypair().unwrap();
        let message = "a1|bike|sports|20|1700000000000";
        let signature = sign(message, &pair.signing_key);

        for (i, ch) in message.char_indices() {
            let replacement = if ch == 'x' { 'y' } else { 'x' };
            let mut tampered = message.to_string();
            tampered.replace_range(i..i + ch.len_utf8(), &replacement.to_string());
            assert!(
                !verify(&tampered, &signature, &pair.public_key_pem),
                "tampering at index {i} should invalidate the signature"
            );
        }
    }

    #[test]
    fn signature_from_other_key_fails() {
        let signer = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let signature = sign("hello", &signer.signing_key);
        assert!(!verify("hello", &signature, &other.public_key_pem));
    }

    #[test]
    fn malformed_inputs_do_not_verify() {
        let pair = generate_keypair().unwrap();
        assert!(!verify("hello", "%%%not-base64", &pair.public_key_pem));
        assert!(!verify("hello", "AAAA", &pair.public_key_pem));
        let signature = sign("hello", &pair.signing_key);
        assert!(!verify("hello", &signature, "not a pem"));
    }
}
