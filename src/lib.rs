pub mod algo;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod flash;
pub mod keys;
pub mod proto;
pub mod records;
pub mod rng;
pub mod session;
mod storage;

pub use crate::engine::Se3Core;
pub use crate::error::{Error, status};
pub use crate::flash::device::{DeviceError, FlashDevice, RamFlash};
pub use crate::flash::{FlashStore, Stats};
pub use crate::keys::{KEY_INVALID, KeyInfo};
pub use crate::session::SessionConfig;
pub use crate::storage::Storage;
use anyhow::{Context, Result, bail};
use directories::ProjectDirs;

/// A token whose flash lives in an image file.
///
/// The image is loaded into a [`RamFlash`] on open and written back
/// atomically by [`Token::save`].
pub struct Token {
    core: Se3Core<RamFlash>,
    storage: Storage,
}

impl Token {
    /// Creates a freshly formatted image.
    pub fn format_with_storage(storage: Storage, config: SessionConfig) -> Result<Self> {
        if storage.exists() {
            bail!("flash image already exists");
        }
        let core = Se3Core::new(RamFlash::new(), config).context("failed to format flash")?;
        let token = Self { core, storage };
        token.save()?;
        Ok(token)
    }

    pub fn open_with_storage(storage: Storage, config: SessionConfig) -> Result<Self> {
        if !storage.exists() {
            bail!("flash image does not exist; run `se3core format` first");
        }
        let image = storage.load()?;
        let flash = RamFlash::from_image(image).context("flash image has the wrong size")?;
        let core = Se3Core::new(flash, config).context("failed to mount flash image")?;
        Ok(Self { core, storage })
    }

    pub fn open(config: SessionConfig) -> Result<Self> {
        Self::open_with_storage(default_storage()?, config)
    }

    /// Runs one wire request against the core.
    pub fn handle(&mut self, command: u16, req: &[u8]) -> (u16, Vec<u8>) {
        self.core.handle(command, req)
    }

    pub fn core(&self) -> &Se3Core<RamFlash> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Se3Core<RamFlash> {
        &mut self.core
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn info(&self) -> Result<Stats> {
        Ok(self.core.store().stats()?)
    }

    pub fn save(&self) -> Result<()> {
        self.storage.save(self.core.store().device().image())
    }
}

pub fn default_storage() -> Result<Storage> {
    let project_dirs =
        ProjectDirs::from("", "", "se3core").context("could not determine platform directories")?;

    let path = project_dirs.data_dir().join("flash.img");

    Ok(Storage::new(path))
}
