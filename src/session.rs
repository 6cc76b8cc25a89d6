//! Fixed-capacity session arena.
//!
//! Session ids are slot indices and are reused after a session is freed.
//! Every live or reserved session is charged its algorithm's context size
//! against a fixed memory budget.

use log::debug;

use crate::algo::SessionContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_sessions: usize,
    /// Context bytes shared by all sessions.
    pub memory: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            memory: 64 * 1024,
        }
    }
}

pub struct Session {
    pub algo: u16,
    pub ctx: SessionContext,
    size: usize,
}

enum Slot {
    Free,
    /// Charged but not yet initialised.
    Reserved { size: usize },
    Active(Session),
}

pub struct SessionTable {
    config: SessionConfig,
    slots: Vec<Slot>,
    in_use: usize,
}

impl SessionTable {
    pub fn new(config: SessionConfig) -> Self {
        let slots = (0..config.max_sessions).map(|_| Slot::Free).collect();
        Self {
            config,
            slots,
            in_use: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Context bytes currently charged.
    pub fn memory_in_use(&self) -> usize {
        self.in_use
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| !matches!(s, Slot::Free)).count()
    }

    /// Claims the lowest free slot and charges `size` bytes to it.
    pub fn reserve(&mut self, size: usize) -> Result<u32> {
        if self.in_use + size > self.config.memory {
            return Err(Error::Memory("session memory exhausted"));
        }
        let Some(idx) = self.slots.iter().position(|s| matches!(s, Slot::Free)) else {
            return Err(Error::Memory("session table full"));
        };
        let sid = u32::try_from(idx).map_err(|_| Error::Memory("session table full"))?;

        self.slots[idx] = Slot::Reserved { size };
        self.in_use += size;
        Ok(sid)
    }

    /// Binds an initialised context to a reserved slot.
    pub fn commit(&mut self, sid: u32, algo: u16, ctx: SessionContext) -> Result<()> {
        let slot = self.slot_mut(sid)?;
        let Slot::Reserved { size } = *slot else {
            return Err(Error::Resource("session not reserved"));
        };
        *slot = Slot::Active(Session { algo, ctx, size });
        debug!("session {sid} opened for algorithm {algo}");
        Ok(())
    }

    pub fn get_mut(&mut self, sid: u32) -> Result<&mut Session> {
        match self.slot_mut(sid)? {
            Slot::Active(session) => Ok(session),
            _ => Err(Error::Resource("no such session")),
        }
    }

    /// Returns a reserved or active slot to the arena.
    pub fn free(&mut self, sid: u32) -> Result<()> {
        let slot = self.slot_mut(sid)?;
        let size = match slot {
            Slot::Free => return Err(Error::Resource("no such session")),
            Slot::Reserved { size } => *size,
            Slot::Active(session) => session.size,
        };
        *slot = Slot::Free;
        self.in_use -= size;
        debug!("session {sid} freed");
        Ok(())
    }

    fn slot_mut(&mut self, sid: u32) -> Result<&mut Slot> {
        usize::try_from(sid)
            .ok()
            .and_then(|idx| self.slots.get_mut(idx))
            .ok_or(Error::Resource("session id out of range"))
    }
}
