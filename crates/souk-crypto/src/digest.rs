//! Keyed and unkeyed digests.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use souk_types::ScopePermissions;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Deterministic digest binding both identities of a federation link, the
/// negotiated scopes and the handshake timestamp.
///
/// Both sides compute it from the same inputs: the initiator's id first,
/// the acceptor's id second, and the timestamp of the handshake request.
pub fn agreement_hash(
    initiator_id: &str,
    acceptor_id: &str,
    scopes: &ScopePermissions,
    timestamp_ms: i64,
) -> String {
    sha256_hex(&format!(
        "{}|{}|{}|{}",
        initiator_id,
        acceptor_id,
        scopes.canonical(),
        timestamp_ms
    ))
}

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256_hex(secret: &[u8], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a hex HMAC-SHA256 digest in constant time.
pub fn verify_hmac_sha256_hex(secret: &[u8], message: &str, digest_hex: &str) -> bool {
    let Ok(provided) = hex::decode(digest_hex.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// Byte comparison whose running time depends only on the lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_known_vector() {
        assert_eq!(
            hmac_sha256_hex(b"key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn client_and_server_digests_agree() {
        let secret = b"out-of-band-secret";
        let timestamp = "1700000000000";
        let client_side = hmac_sha256_hex(secret, timestamp);
        assert!(verify_hmac_sha256_hex(secret, timestamp, &client_side));
    }

    #[test]
    fn mismatched_digest_is_rejected() {
        let secret = b"out-of-band-secret";
        let digest = hmac_sha256_hex(b"wrong-secret", "1700000000000");
        assert!(!verify_hmac_sha256_hex(secret, "1700000000000", &digest));
        assert!(!verify_hmac_sha256_hex(secret, "1700000000000", "zz-not-hex"));
    }

    #[test]
    fn agreement_hash_is_reproducible_and_binding() {
        let scopes = ScopePermissions {
            users: true,
            postings: true,
            ..Default::default()
        };
        let a = agreement_hash("a1", "b1", &scopes, 1_700_000_000_000);
        let b = agreement_hash("a1", "b1", &scopes, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, agreement_hash("b1", "a1", &scopes, 1_700_000_000_000));
        assert_ne!(a, agreement_hash("a1", "b1", &scopes, 1_700_000_000_001));
        let wider = ScopePermissions {
            chat: true,
            ..scopes
        };
        assert_ne!(a, agreement_hash("a1", "b1", &wider, 1_700_000_000_000));
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token2"));
    }
}
