//! Hardware random source collaborator.

use getrandom::fill;
use thiserror::Error;

use crate::error::Result;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RngError {
    #[error("random generator unavailable")]
    Unavailable,
}

pub trait Random {
    /// Fills `buf` with random bytes or reports a hardware failure.
    fn random(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Operating system CSPRNG, standing in for the token's TRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl Random for OsRandom {
    fn random(&mut self, buf: &mut [u8]) -> Result<()> {
        fill(buf).map_err(|_| RngError::Unavailable)?;
        Ok(())
    }
}
