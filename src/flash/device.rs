//! Flash programming collaborator.
//!
//! The store only needs byte reads, byte programs and whole-sector erases.
//! `RamFlash` emulates NOR semantics in memory (programming may clear bits but
//! never set them) and can simulate a power cut after a given number of
//! operations.

use thiserror::Error;

use super::{FLASH_SIZE, SECTOR_COUNT, SECTOR_SIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("program failed at {addr:#x}")]
    ProgramFailed { addr: usize },
    #[error("erase failed for sector {sector}")]
    EraseFailed { sector: usize },
    #[error("address {addr:#x} outside flash")]
    OutOfRange { addr: usize },
    #[error("power lost")]
    PowerLoss,
}

pub trait FlashDevice {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Programs one byte. Only `1 -> 0` bit transitions are possible.
    fn program(&mut self, addr: usize, value: u8) -> Result<(), DeviceError>;

    /// Resets a whole sector to `0xFF`.
    fn erase(&mut self, sector: usize) -> Result<(), DeviceError>;

    fn program_bytes(&mut self, addr: usize, data: &[u8]) -> Result<(), DeviceError> {
        for (i, &byte) in data.iter().enumerate() {
            self.program(addr + i, byte)?;
        }
        Ok(())
    }
}

/// In-memory two-sector NOR flash.
#[derive(Debug, Clone)]
pub struct RamFlash {
    mem: Vec<u8>,
    budget: Option<usize>,
}

impl Default for RamFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFlash {
    /// A fully erased device.
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; FLASH_SIZE],
            budget: None,
        }
    }

    /// Wraps a raw image previously obtained from [`RamFlash::image`].
    pub fn from_image(image: Vec<u8>) -> Result<Self, DeviceError> {
        if image.len() != FLASH_SIZE {
            return Err(DeviceError::OutOfRange { addr: image.len() });
        }
        Ok(Self {
            mem: image,
            budget: None,
        })
    }

    pub fn image(&self) -> &[u8] {
        &self.mem
    }

    /// Lets `ops` more program/erase operations succeed, then cuts power.
    pub fn fail_after(&mut self, ops: usize) {
        self.budget = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.budget = None;
    }

    fn spend(&mut self) -> Result<(), DeviceError> {
        match self.budget.as_mut() {
            Some(0) => Err(DeviceError::PowerLoss),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FlashDevice for RamFlash {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let src = self
            .mem
            .get(addr..addr + buf.len())
            .ok_or(DeviceError::OutOfRange { addr })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn program(&mut self, addr: usize, value: u8) -> Result<(), DeviceError> {
        let current = *self.mem.get(addr).ok_or(DeviceError::OutOfRange { addr })?;
        if value & !current != 0 {
            return Err(DeviceError::ProgramFailed { addr });
        }
        self.spend()?;
        self.mem[addr] = value;
        Ok(())
    }

    fn erase(&mut self, sector: usize) -> Result<(), DeviceError> {
        if sector >= SECTOR_COUNT {
            return Err(DeviceError::EraseFailed { sector });
        }
        self.spend()?;
        let start = sector * SECTOR_SIZE;
        self.mem[start..start + SECTOR_SIZE].fill(0xFF);
        Ok(())
    }
}
