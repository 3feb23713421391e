//! Opaque credential generation.
//!
//! Tokens (issued by the server on Register) and session ids (chosen by
//! the client at tunnel time) share one format: the URL-safe base64
//! encoding of 32 random bytes, 44 characters with padding.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes behind every credential.
pub const CREDENTIAL_BYTES: usize = 32;

/// Generate a fresh credential.
pub fn generate() -> String {
    let mut raw = [0u8; CREDENTIAL_BYTES];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE.encode(raw)
}
