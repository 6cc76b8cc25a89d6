//! Cryptographic primitives used by the algorithm handlers.
//!
//! Provides the digest engine, PBKDF2 key stretching, the AES chaining layer
//! and the transport payload cipher.

pub mod aes;
pub mod kdf;
pub mod payload;
pub mod sha256;

pub use aes::{AesCtx, Direction, Feedback};
pub use kdf::pbkdf2_hmac_sha256;
pub use payload::PayloadCipher;
pub use sha256::{HmacSha256Ctx, Sha256Ctx, hmac_sha256, sha256};

use crate::error::{Error, Result};
use subtle::ConstantTimeEq;

/// Length of a SHA-256 digest (32 bytes).
pub const DIGEST_LEN: usize = 32;
/// SHA-256 compression block (64 bytes).
pub const SHA256_BLOCK_LEN: usize = 64;
/// AES block (16 bytes).
pub const AES_BLOCK_LEN: usize = 16;
/// Largest AES key (32 bytes / 256 bits).
pub const AES_KEY_MAX: usize = 32;

/// Compares an authentication tag received from a peer with one computed locally.
///
/// Session handlers only emit tags; callers that need to authenticate data
/// compare them here.
pub fn verify_tag(expected: &[u8], computed: &[u8]) -> Result<()> {
    if expected.len() == computed.len() && bool::from(expected.ct_eq(computed)) {
        Ok(())
    } else {
        Err(Error::Auth)
    }
}
