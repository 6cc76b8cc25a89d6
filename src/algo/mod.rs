//! Algorithm handler table.
//!
//! Each algorithm contributes an `init` that builds its session context from a
//! key and mode word, and an `update` that runs one request against it. The
//! table is fixed at compile time; empty slots are reserved ids.

pub mod aes;
pub mod aes_hmac_sha256;
pub mod hmac_sha256;
pub mod sha256;

use serde::Serialize;

use crate::crypto::{Direction, Feedback};
use crate::error::{Error, Result};

/// Size of the handler table.
pub const ALGO_MAX: usize = 8;

/// Largest output a single update may produce.
pub const CRYPTO_MAX_DATAOUT: usize = 8160;

pub mod id {
    pub const AES: u16 = 0;
    pub const SHA256: u16 = 1;
    pub const HMACSHA256: u16 = 2;
    pub const AES_HMACSHA256: u16 = 3;
}

/// Mode word: feedback in the low byte, direction in bits 8..11.
pub mod mode {
    pub const ECB: u16 = 1;
    pub const CBC: u16 = 2;
    pub const OFB: u16 = 3;
    pub const CTR: u16 = 4;
    pub const CFB: u16 = 5;
    pub const FEEDBACK_MASK: u16 = 0x00FF;

    pub const ENCRYPT: u16 = 1 << 8;
    pub const DECRYPT: u16 = 2 << 8;
    pub const DIR_MASK: u16 = 0x0F00;
}

/// Update flags.
pub mod flags {
    pub const FINIT: u16 = 1 << 15;
    pub const RESET: u16 = 1 << 14;
    pub const SETIV: u16 = RESET;
    pub const SETNONCE: u16 = 1 << 13;
    pub const AUTH: u16 = 1 << 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum AlgoType {
    BlockCipher = 0,
    StreamCipher = 1,
    Digest = 2,
    BlockCipherAuth = 3,
}

/// Display metadata reported by `crypto_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlgoInfo {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: AlgoType,
    pub block_size: u16,
    /// Accepted key sizes in bytes; unused slots are zero.
    pub key_sizes: [u16; 3],
}

/// Inputs of one update request.
#[derive(Debug, Clone, Copy)]
pub struct Update<'a> {
    pub flags: u16,
    pub datain1: &'a [u8],
    pub datain2: &'a [u8],
}

impl Update<'_> {
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

pub type InitFn = fn(key: &[u8], mode: u16) -> Result<SessionContext>;
pub type UpdateFn = fn(ctx: &mut SessionContext, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()>;

pub struct AlgoDescriptor {
    pub info: AlgoInfo,
    /// Bytes charged against the session arena.
    pub context_size: usize,
    pub init: Option<InitFn>,
    pub update: Option<UpdateFn>,
}

/// Per-session state, one variant per algorithm.
pub enum SessionContext {
    Aes(aes::AesSession),
    Sha256(sha256::Sha256Session),
    HmacSha256(hmac_sha256::HmacSha256Session),
    AesHmacSha256(aes_hmac_sha256::AesHmacSha256Session),
}

pub static ALGORITHMS: [Option<AlgoDescriptor>; ALGO_MAX] = [
    Some(aes::DESCRIPTOR),
    Some(sha256::DESCRIPTOR),
    Some(hmac_sha256::DESCRIPTOR),
    Some(aes_hmac_sha256::DESCRIPTOR),
    None,
    None,
    None,
    None,
];

/// Looks up a usable handler.
pub fn descriptor(algo: u16) -> Result<&'static AlgoDescriptor> {
    match ALGORITHMS.get(usize::from(algo)) {
        Some(Some(desc)) if desc.init.is_some() && desc.update.is_some() => Ok(desc),
        _ => Err(Error::Params("unknown algorithm")),
    }
}

/// Algorithms that have both an init and an update handler, in id order.
pub fn list() -> impl Iterator<Item = &'static AlgoInfo> {
    ALGORITHMS
        .iter()
        .flatten()
        .filter(|d| d.init.is_some() && d.update.is_some())
        .map(|d| &d.info)
}

/// Splits a mode word into direction and feedback.
///
/// Stream feedbacks (OFB, CTR) may leave the direction empty.
pub fn parse_mode(word: u16) -> Result<(Direction, Feedback)> {
    if word & !(mode::FEEDBACK_MASK | mode::DIR_MASK) != 0 {
        return Err(Error::Params("unknown mode bits"));
    }
    let feedback = Feedback::try_from(word & mode::FEEDBACK_MASK)?;
    let direction = match word & mode::DIR_MASK {
        mode::ENCRYPT => Direction::Encrypt,
        mode::DECRYPT => Direction::Decrypt,
        0 if feedback.is_stream() => Direction::Encrypt,
        _ => return Err(Error::Params("missing or invalid direction")),
    };
    Ok((direction, feedback))
}

fn mismatch() -> Error {
    Error::Params("session bound to another algorithm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_reports_four_algorithms_in_id_order() {
        let names: Vec<_> = list().map(|i| i.name).collect();
        assert_eq!(names, ["AES", "SHA256", "HMACSHA256", "AES_HMACSHA256"]);
    }

    #[test]
    fn empty_and_out_of_range_ids_are_rejected() {
        assert!(descriptor(id::AES_HMACSHA256).is_ok());
        assert!(matches!(descriptor(4), Err(Error::Params(_))));
        assert!(matches!(descriptor(ALGO_MAX as u16), Err(Error::Params(_))));
        assert!(matches!(descriptor(u16::MAX), Err(Error::Params(_))));
    }

    #[test]
    fn context_sizes_are_nonzero() {
        for desc in ALGORITHMS.iter().flatten() {
            assert!(desc.context_size > 0, "{}", desc.info.name);
        }
    }

    #[test]
    fn parse_mode_accepts_documented_words() {
        assert_eq!(
            parse_mode(mode::CBC | mode::DECRYPT).unwrap(),
            (Direction::Decrypt, Feedback::Cbc)
        );
        assert_eq!(parse_mode(mode::CTR).unwrap(), (Direction::Encrypt, Feedback::Ctr));
        assert_eq!(
            parse_mode(mode::OFB | mode::DECRYPT).unwrap(),
            (Direction::Decrypt, Feedback::Ofb)
        );
    }

    #[test]
    fn parse_mode_rejects_bad_words() {
        assert!(parse_mode(0).is_err());
        assert!(parse_mode(mode::CBC).is_err());
        assert!(parse_mode(mode::ECB | mode::ENCRYPT | mode::DECRYPT).is_err());
        assert!(parse_mode(9 | mode::ENCRYPT).is_err());
        assert!(parse_mode(mode::CBC | mode::ENCRYPT | 0x1000).is_err());
    }
}
