use crate::flash::device::DeviceError;
use crate::rng::RngError;
use thiserror::Error;

/// Wire status codes returned alongside every response.
pub mod status {
    pub const OK: u16 = 0x0000;
    pub const HW: u16 = 0xF001;
    pub const COMMAND: u16 = 0xF005;
    pub const PARAMS: u16 = 0xF006;
    pub const RESOURCE: u16 = 0xF007;
    pub const MEMORY: u16 = 0xF008;
    pub const EXPIRED: u16 = 0xF009;
    pub const AUTH: u16 = 0xF00A;
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request fields, wrong sizes, unsupported algorithm, mode or key size.
    #[error("invalid parameters: {0}")]
    Params(&'static str),
    /// Session, key or record not found.
    #[error("resource not available: {0}")]
    Resource(&'static str),
    /// Cipher/digest primitive or flash program/erase failure.
    #[error("hardware failure: {0}")]
    Hardware(#[from] DeviceError),
    /// Random generator failure; reported with the hardware status.
    #[error("hardware failure: {0}")]
    Random(#[from] RngError),
    /// Session arena or flash space exhausted.
    #[error("out of memory: {0}")]
    Memory(&'static str),
    #[error("key {0:#010x} has expired")]
    Expired(u32),
    #[error("authentication tag mismatch")]
    Auth,
    #[error("unknown command {0:#06x}")]
    Command(u16),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Params(_) => status::PARAMS,
            Error::Resource(_) => status::RESOURCE,
            Error::Hardware(_) | Error::Random(_) => status::HW,
            Error::Memory(_) => status::MEMORY,
            Error::Expired(_) => status::EXPIRED,
            Error::Auth => status::AUTH,
            Error::Command(_) => status::COMMAND,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_a_non_ok_status() {
        let errors = [
            Error::Params("x"),
            Error::Resource("x"),
            Error::Hardware(DeviceError::PowerLoss),
            Error::Random(RngError::Unavailable),
            Error::Memory("x"),
            Error::Expired(1),
            Error::Auth,
            Error::Command(0x42),
        ];
        for e in &errors {
            assert_ne!(e.status(), status::OK, "{e}");
        }
    }

    #[test]
    fn display_names_the_key() {
        assert_eq!(Error::Expired(0x10).to_string(), "key 0x00000010 has expired");
    }
}
