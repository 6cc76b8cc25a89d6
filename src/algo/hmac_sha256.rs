//! HMAC-SHA-256 sessions.

use core::mem::size_of;

use super::sha256::check_digest_request;
use super::{AlgoDescriptor, AlgoInfo, AlgoType, SessionContext, Update, flags, mismatch};
use crate::crypto::{DIGEST_LEN, HmacSha256Ctx, SHA256_BLOCK_LEN};
use crate::error::{Error, Result};

pub struct HmacSha256Session {
    ctx: HmacSha256Ctx,
}

pub const DESCRIPTOR: AlgoDescriptor = AlgoDescriptor {
    info: AlgoInfo {
        name: "HMACSHA256",
        kind: AlgoType::Digest,
        block_size: SHA256_BLOCK_LEN as u16,
        key_sizes: [DIGEST_LEN as u16, 0, 0],
    },
    context_size: size_of::<HmacSha256Session>(),
    init: Some(init),
    update: Some(update),
};

fn init(key: &[u8], _mode: u16) -> Result<SessionContext> {
    if key.is_empty() {
        return Err(Error::Params("hmac needs a key"));
    }
    Ok(SessionContext::HmacSha256(HmacSha256Session {
        ctx: HmacSha256Ctx::new(key),
    }))
}

fn update(ctx: &mut SessionContext, req: &Update<'_>, out: &mut Vec<u8>) -> Result<()> {
    let SessionContext::HmacSha256(session) = ctx else {
        return Err(mismatch());
    };
    check_digest_request(req)?;

    session.ctx.update(req.datain1);
    if req.has(flags::FINIT) {
        out.extend_from_slice(&session.ctx.finalize());
    }
    Ok(())
}
