//! Authenticated AES: encrypt-then-MAC with HMAC-SHA-256.
//!
//! The session holds the master key until the first operation. Subkeys are
//! `PBKDF2(master, nonce, 1, 2 * key_len)` split into the AES key followed by
//! the HMAC key; without an explicit SETNONCE the nonce is empty.
//!
//! One update runs these stages in order, each only when requested:
//!
//! 1. SETNONCE derives the subkeys. It must be the first operation of the
//!    session and cannot be combined with anything but FINIT, which turns the
//!    call into a no-op.
//! 2. RESET loads the IV from `datain1` (when present) and restarts the HMAC
//!    over the same bytes.
//! 3. Data in `datain2` is transformed into the output. The HMAC always covers
//!    the ciphertext: after encryption, or before decryption.
//! 4. AUTH appends the 32-byte tag and restarts the HMAC.
//!
//! The handler never checks tags. A decrypting caller compares the tag it
//! received with the AUTH output through [`crate::crypto::verify_tag`].

use core::mem::size_of;

use log::debug;
use zeroize::Zeroizing;

use super::{
    AlgoDescriptor, AlgoInfo, AlgoType, CRYPTO_MAX_DATAOUT, SessionContext, Update, flags,
    mismatch, parse_mode,
};
use crate::crypto::kdf::{self, SESSION_KDF_ITERATIONS};
use crate::crypto::{AES_BLOCK_LEN, AES_KEY_MAX, AesCtx, DIGEST_LEN, Direction, Feedback, HmacSha256Ctx};
use crate::error::{Error, Result};

enum KeyState {
    NotInitialized,
    Initialized {
        aes: AesCtx,
        hmac: HmacSha256Ctx,
        hmac_key: Zeroizing<[u8; AES_KEY_MAX]>,
    },
}

pub struct AesHmacSha256Session {
    master: Zeroizing<[u8; AES_KEY_MAX]>,
    key_len: usize,
    direction: Direction,
    feedback: Feedback,
    keys: KeyState,
}

pub const DESCRIPTOR: AlgoDescriptor = AlgoDescriptor {
    info: AlgoInfo {
        name: "AES_HMACSHA256",
        kind: AlgoType::BlockCipherAuth,
        block_size: AES_BLOCK_LEN as u16,
        key_sizes: [16, 24, 32],
    },
    context_size: size_of::<AesHmacSha256Session>(),
    init: Some(init),
    update: Some(update),
};

const KNOWN_FLAGS: u16 = flags::FINIT | flags::RESET | flags::SETNONCE | flags::AUTH;

fn init(key: &[u8], mode: u16) -> Result<SessionContext> {
    let (direction, feedback) = parse_mode(mode)?;
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(Error::Params("aes key must be 128, 192 or 256 bits"));
    }
    let mut master = Zeroizing::new([0u8; AES_KEY_MAX]);
    master[..key.len()].copy_from_slice(key);

    Ok(SessionContext::AesHmacSha256(AesHmacSha256Session {
        master,
        key_len: key.len(),
        direction,
        feedback,
        keys: KeyState::NotInitialized,
    }))
}

fn update(ctx: &mut SessionContext, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()> {
    let SessionContext::AesHmacSha256(session) = ctx else {
        return Err(mismatch());
    };
    session.update(req, out)
}

impl AesHmacSha256Session {
    fn update(&mut self, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()> {
        if req.flags & !KNOWN_FLAGS != 0 {
            return Err(Error::Params("unsupported flags for aes-hmac"));
        }

        if req.has(flags::SETNONCE) {
            if req.has(flags::RESET) || req.has(flags::AUTH) || !req.datain2.is_empty() {
                return Err(Error::Params("SETNONCE must be used alone"));
            }
            if req.has(flags::FINIT) {
                return Ok(());
            }
            if matches!(self.keys, KeyState::Initialized { .. }) {
                return Err(Error::Params("SETNONCE must be the first operation"));
            }
            return self.derive_keys(req.datain1);
        }

        self.check(req)?;

        if matches!(self.keys, KeyState::NotInitialized) {
            self.derive_keys(&[])?;
        }
        let KeyState::Initialized { aes, hmac, hmac_key } = &mut self.keys else {
            return Err(Error::Params("session keys not derived"));
        };

        if req.has(flags::RESET) {
            if !req.datain1.is_empty() {
                aes.set_iv(req.datain1)?;
            }
            *hmac = HmacSha256Ctx::new(&hmac_key[..self.key_len]);
            hmac.update(req.datain1);
        }

        if !req.datain2.is_empty() {
            let start = out.len();
            out.extend_from_slice(req.datain2);
            let data = &mut out[start..];
            match self.direction {
                Direction::Encrypt => {
                    aes.process(data)?;
                    hmac.update(data);
                }
                Direction::Decrypt => {
                    hmac.update(data);
                    aes.process(data)?;
                }
            }
        }

        if req.has(flags::AUTH) {
            out.extend_from_slice(&hmac.finalize());
        }
        Ok(())
    }

    /// Validates sizes before any state changes.
    fn check(&self, req: &Update<'_>) -> Result<()> {
        let auth_len = if req.has(flags::AUTH) { DIGEST_LEN } else { 0 };
        if req.datain2.len() + auth_len > CRYPTO_MAX_DATAOUT {
            return Err(Error::Params("output too large"));
        }
        if req.datain2.len() % AES_BLOCK_LEN != 0 {
            return Err(Error::Params("aes data must be whole blocks"));
        }
        if req.has(flags::RESET) {
            if !req.datain1.is_empty() && req.datain1.len() != AES_BLOCK_LEN {
                return Err(Error::Params("iv must be one block"));
            }
        } else if !req.datain1.is_empty() {
            return Err(Error::Params("datain1 is only used with RESET or SETNONCE"));
        }
        Ok(())
    }

    fn derive_keys(&mut self, nonce: &[u8]) -> Result<()> {
        let len = self.key_len;
        let derived = kdf::derive(&self.master[..len], nonce, SESSION_KDF_ITERATIONS, 2 * len)?;

        let aes = AesCtx::new(&derived[..len], self.direction, self.feedback)?;
        let mut hmac_key = Zeroizing::new([0u8; AES_KEY_MAX]);
        hmac_key[..len].copy_from_slice(&derived[len..]);
        let hmac = HmacSha256Ctx::new(&hmac_key[..len]);

        self.keys = KeyState::Initialized { aes, hmac, hmac_key };
        debug!("aes-hmac session keys derived ({} byte nonce)", nonce.len());
        Ok(())
    }
}
