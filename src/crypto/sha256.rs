//! SHA-256 and HMAC-SHA-256 contexts.
//!
//! Thin streaming wrappers over the RustCrypto `sha2`/`hmac` crates with the
//! init / update / finalize shape the session handlers drive.

use hmac::digest::KeyInit;
use hmac::digest::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{DIGEST_LEN, SHA256_BLOCK_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Streaming SHA-256 state.
#[derive(Clone, Default)]
pub struct Sha256Ctx {
    inner: Sha256,
}

impl Sha256Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Pads, emits the digest and leaves the context freshly initialised.
    pub fn finalize(&mut self) -> [u8; DIGEST_LEN] {
        self.inner.finalize_reset().into()
    }
}

/// Streaming HMAC-SHA-256 state.
///
/// Keys longer than one SHA-256 block are hashed down first, shorter keys are
/// zero-extended (RFC 2104).
#[derive(Clone)]
pub struct HmacSha256Ctx {
    inner: HmacSha256,
}

impl HmacSha256Ctx {
    pub fn new(key: &[u8]) -> Self {
        let mut block = Zeroizing::new([0u8; SHA256_BLOCK_LEN]);
        if key.len() > SHA256_BLOCK_LEN {
            block[..DIGEST_LEN].copy_from_slice(&sha256(key));
        } else {
            block[..key.len()].copy_from_slice(key);
        }
        let inner = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&block[..]));
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Completes the inner and outer digests. The context is re-keyed with the
    /// same key afterwards.
    pub fn finalize(&mut self) -> [u8; DIGEST_LEN] {
        self.inner.finalize_reset().into_bytes().into()
    }
}

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// One-shot HMAC-SHA-256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut ctx = HmacSha256Ctx::new(key);
    ctx.update(data);
    ctx.finalize()
}
