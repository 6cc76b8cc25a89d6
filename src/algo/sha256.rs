//! SHA-256 digest sessions. No key.

use core::mem::size_of;

use super::{AlgoDescriptor, AlgoInfo, AlgoType, SessionContext, Update, flags, mismatch};
use crate::crypto::{SHA256_BLOCK_LEN, Sha256Ctx};
use crate::error::{Error, Result};

pub struct Sha256Session {
    ctx: Sha256Ctx,
}

pub const DESCRIPTOR: AlgoDescriptor = AlgoDescriptor {
    info: AlgoInfo {
        name: "SHA256",
        kind: AlgoType::Digest,
        block_size: SHA256_BLOCK_LEN as u16,
        key_sizes: [0, 0, 0],
    },
    context_size: size_of::<Sha256Session>(),
    init: Some(init),
    update: Some(update),
};

fn init(_key: &[u8], _mode: u16) -> Result<SessionContext> {
    Ok(SessionContext::Sha256(Sha256Session {
        ctx: Sha256Ctx::new(),
    }))
}

fn update(ctx: &mut SessionContext, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()> {
    let SessionContext::Sha256(session) = ctx else {
        return Err(mismatch());
    };
    check_digest_request(req)?;

    session.ctx.update(req.datain1);
    if req.has(flags::FINIT) {
        out.extend_from_slice(&session.ctx.finalize());
    }
    Ok(())
}

/// Digest updates take data in `datain1` and no flag besides FINIT.
pub(super) fn check_digest_request(req: &Update<'_>) -> Result<()> {
    if req.flags & !flags::FINIT != 0 {
        return Err(Error::Params("unsupported flags for digest"));
    }
    if !req.datain2.is_empty() {
        return Err(Error::Params("digest takes data in datain1"));
    }
    Ok(())
}
