//! PKCE verifier/challenge generation and opaque state strings.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generates a PKCE code verifier: 32 random bytes, base64url, no padding.
pub(crate) fn generate_verifier() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes())
}

/// Derives the S256 code challenge for a verifier:
/// base64url(SHA-256(verifier)) without padding.
pub(crate) fn challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generates an opaque flow `state` string: 32 random bytes, base64url.
pub(crate) fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes())
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
