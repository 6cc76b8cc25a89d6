//! Plain AES sessions.

use core::mem::size_of;

use super::{
    AlgoDescriptor, AlgoInfo, AlgoType, CRYPTO_MAX_DATAOUT, SessionContext, Update, flags,
    mismatch, parse_mode,
};
use crate::crypto::{AES_BLOCK_LEN, AesCtx};
use crate::error::{Error, Result};

pub struct AesSession {
    ctx: AesCtx,
}

pub const DESCRIPTOR: AlgoDescriptor = AlgoDescriptor {
    info: AlgoInfo {
        name: "AES",
        kind: AlgoType::BlockCipher,
        block_size: AES_BLOCK_LEN as u16,
        key_sizes: [16, 24, 32],
    },
    context_size: size_of::<AesSession>(),
    init: Some(init),
    update: Some(update),
};

fn init(key: &[u8], mode: u16) -> Result<SessionContext> {
    let (direction, feedback) = parse_mode(mode)?;
    let ctx = AesCtx::new(key, direction, feedback)?;
    Ok(SessionContext::Aes(AesSession { ctx }))
}

fn update(ctx: &mut SessionContext, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()> {
    let SessionContext::Aes(session) = ctx else {
        return Err(mismatch());
    };

    if req.flags & !(flags::FINIT | flags::SETIV) != 0 {
        return Err(Error::Params("unsupported flags for aes"));
    }
    let set_iv = req.has(flags::SETIV);
    if set_iv && req.datain1.len() != AES_BLOCK_LEN {
        return Err(Error::Params("iv must be one block"));
    }
    if !set_iv && !req.datain1.is_empty() {
        return Err(Error::Params("datain1 is only used with SETIV"));
    }
    if req.datain2.len() % AES_BLOCK_LEN != 0 {
        return Err(Error::Params("aes data must be whole blocks"));
    }
    if req.datain2.len() > CRYPTO_MAX_DATAOUT {
        return Err(Error::Params("output too large"));
    }

    if set_iv {
        session.ctx.set_iv(req.datain1)?;
    }
    if !req.datain2.is_empty() {
        let start = out.len();
        out.extend_from_slice(req.datain2);
        session.ctx.process(&mut out[start..])?;
    }
    Ok(())
}
