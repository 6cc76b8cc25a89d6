use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::DIGEST_LEN;
use crate::error::{Error, Result};

/// Single-round stretching used for every per-session key derivation.
pub const SESSION_KDF_ITERATIONS: u32 = 1;

/// PBKDF2-HMAC-SHA-256 (RFC 8018) filling `out` completely.
pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
    if iterations < 1 {
        return Err(Error::Params("pbkdf2 iterations must be >= 1"));
    }

    let prf = <Hmac<Sha256> as Mac>::new_from_slice(password)
        .map_err(|_| Error::Params("pbkdf2 password rejected"))?;

    for (index, chunk) in out.chunks_mut(DIGEST_LEN).enumerate() {
        let counter = u32::try_from(index + 1).map_err(|_| Error::Params("pbkdf2 output too long"))?;

        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&counter.to_be_bytes());
        let mut u: [u8; DIGEST_LEN] = mac.finalize().into_bytes().into();
        let mut block = Zeroizing::new(u);

        for _ in 1..iterations {
            let mut mac = prf.clone();
            mac.update(&u);
            u = mac.finalize().into_bytes().into();
            block.iter_mut().zip(u.iter()).for_each(|(b, x)| *b ^= x);
        }

        chunk.copy_from_slice(&block[..chunk.len()]);
    }

    Ok(())
}

/// Derives `len` bytes from `password` and `salt`.
pub fn derive(password: &[u8], salt: &[u8], iterations: u32, len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    pbkdf2_hmac_sha256(password, salt, iterations, &mut out)?;
    Ok(out)
}
