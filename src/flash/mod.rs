//! Append-only, wear-levelled node store over two flash sectors.
//!
//! Sector layout:
//! ```text
//! MAGIC (32) | INDEX (2016, one byte per block) | DATA (2016 blocks x 64 bytes)
//! ```
//! Exactly one sector carries the magic. A node occupies one or more
//! consecutive blocks: the index holds its type byte for the first block and
//! `0xFE` for the rest, the data region starts with a little-endian `u16`
//! payload size. Nodes are only ever appended; deletion zeroes the index
//! bytes and the space comes back when the live nodes are compacted into the
//! other sector.

pub mod device;

use core::cell::Cell;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use device::{DeviceError, FlashDevice};

pub const BLOCK_SIZE: usize = 64;
pub const INDEX_SIZE: usize = 2016;
pub const MAGIC_SIZE: usize = 32;
pub const DATA_SIZE: usize = INDEX_SIZE * BLOCK_SIZE;
pub const SECTOR_SIZE: usize = MAGIC_SIZE + INDEX_SIZE + DATA_SIZE;
pub const SECTOR_COUNT: usize = 2;
pub const FLASH_SIZE: usize = SECTOR_COUNT * SECTOR_SIZE;

/// Size prefix stored at the start of every node.
pub const NODE_HEADER_SIZE: usize = 2;
/// Largest node, header included.
pub const NODE_MAX_SIZE: usize = 4096;
/// Largest node payload.
pub const NODE_MAX_DATA: usize = NODE_MAX_SIZE - NODE_HEADER_SIZE;

const INDEX_OFFSET: usize = MAGIC_SIZE;
const DATA_OFFSET: usize = MAGIC_SIZE + INDEX_SIZE;

pub const MAGIC: [u8; MAGIC_SIZE] = [
    0x53, 0x45, 0x33, 0x46, 0x4c, 0x41, 0x53, 0x48, 0x9c, 0x2e, 0x71, 0x05, 0xd4, 0x3b, 0x6a, 0xe8,
    0x12, 0x87, 0xc9, 0x40, 0x5f, 0xb3, 0x0d, 0x66, 0xa1, 0x7e, 0x29, 0xf4, 0x38, 0x9b, 0xc0, 0x17,
];

/// Index byte values.
pub mod node_type {
    pub const INVALID: u8 = 0x00;
    pub const SERIAL: u8 = 0x01;
    pub const KEY: u8 = 0x02;
    pub const RECORD: u8 = 0x03;
    pub const CONTINUATION: u8 = 0xFE;
    pub const EMPTY: u8 = 0xFF;
}

/// One parsed index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Invalid,
    Continuation,
    Empty,
    Typed(u8),
}

impl From<u8> for Slot {
    fn from(value: u8) -> Self {
        match value {
            node_type::INVALID => Slot::Invalid,
            node_type::CONTINUATION => Slot::Continuation,
            node_type::EMPTY => Slot::Empty,
            kind => Slot::Typed(kind),
        }
    }
}

/// Handle to a node in the active sector.
///
/// Handles are invalidated by a swap; using a stale one fails with
/// `Error::Resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pos: usize,
    kind: u8,
    blocks: usize,
    size: u16,
    generation: u32,
}

impl Node {
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// Index position of the first block.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    fn is_torn(&self) -> bool {
        self.size == u16::MAX || blocks_for(self.size()) != self.blocks
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub sector: usize,
    pub used: usize,
    pub allocated: usize,
    pub free: usize,
    pub nodes: usize,
    pub hw_error: bool,
}

fn blocks_for(size: usize) -> usize {
    (size + NODE_HEADER_SIZE).div_ceil(BLOCK_SIZE)
}

fn index_addr(sector: usize, pos: usize) -> usize {
    sector * SECTOR_SIZE + INDEX_OFFSET + pos
}

fn data_addr(sector: usize, pos: usize) -> usize {
    sector * SECTOR_SIZE + DATA_OFFSET + pos * BLOCK_SIZE
}

pub struct FlashStore<F> {
    device: F,
    sector: usize,
    first_free: usize,
    used: usize,
    allocated: usize,
    generation: u32,
    hw_error: Cell<bool>,
    /// The index tail holds a half-programmed node that could not be
    /// invalidated; the next allocation compacts first.
    dirty_tail: bool,
}

impl<F: FlashDevice> FlashStore<F> {
    /// Recovers the active sector (formatting a blank device) and rebuilds the
    /// allocation bookkeeping.
    pub fn mount(device: F) -> Result<Self> {
        let mut store = Self {
            device,
            sector: 0,
            first_free: 0,
            used: 0,
            allocated: 0,
            generation: 0,
            hw_error: Cell::new(false),
            dirty_tail: false,
        };

        store.sector = store.recover_sector()?;
        store.rescan()?;
        Ok(store)
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut F {
        &mut self.device
    }

    pub fn into_device(self) -> F {
        self.device
    }

    pub fn sector(&self) -> usize {
        self.sector
    }

    /// Sticky flag raised by any failed flash operation.
    pub fn hw_error(&self) -> bool {
        self.hw_error.get()
    }

    pub fn stats(&self) -> Result<Stats> {
        let mut nodes = 0;
        for node in self.nodes() {
            node?;
            nodes += 1;
        }
        Ok(Stats {
            sector: self.sector,
            used: self.used,
            allocated: self.allocated,
            free: DATA_SIZE - self.used,
            nodes,
            hw_error: self.hw_error(),
        })
    }

    /// Live nodes in append order. Restart by calling again.
    pub fn nodes(&self) -> Nodes<'_, F> {
        Nodes {
            store: self,
            pos: 0,
            include_torn: false,
            done: false,
        }
    }

    /// Appends a node of `kind` with room for `size` payload bytes.
    ///
    /// Compacts into the other sector first when the tail of the index is
    /// too short but deleted nodes would free enough room.
    pub fn allocate(&mut self, kind: u8, size: usize) -> Result<Node> {
        if !matches!(Slot::from(kind), Slot::Typed(_)) {
            return Err(Error::Params("reserved node type"));
        }
        if size > NODE_MAX_DATA {
            return Err(Error::Params("node too large"));
        }

        let blocks = blocks_for(size);
        let bytes = blocks * BLOCK_SIZE;
        if self.used + bytes > DATA_SIZE {
            return Err(Error::Memory("flash full"));
        }
        if self.dirty_tail || self.allocated + bytes > DATA_SIZE {
            self.swap()?;
        }

        let pos = self.first_free;
        if let Err(e) = self.program_node(pos, kind, blocks, size) {
            self.abandon(pos, blocks);
            return Err(e);
        }
        self.first_free += blocks;
        self.allocated += bytes;
        self.used += bytes;

        debug!("allocated node type {kind:#04x} at {pos} ({blocks} blocks)");
        Ok(Node {
            pos,
            kind,
            blocks,
            size: size as u16,
            generation: self.generation,
        })
    }

    fn program_node(&mut self, pos: usize, kind: u8, blocks: usize, size: usize) -> Result<()> {
        let sector = self.sector;
        self.program(index_addr(sector, pos), kind)?;
        for i in 1..blocks {
            self.program(index_addr(sector, pos + i), node_type::CONTINUATION)?;
        }
        // size < NODE_MAX_DATA fits in u16
        let header = (size as u16).to_le_bytes();
        self.program_bytes(data_addr(sector, pos), &header)
    }

    /// Cleans up after a failed `program_node` at `pos`.
    ///
    /// The reserved slots are zeroed so the scan steps over them. When that
    /// fails too and something was already programmed, the tail is left for
    /// the next allocation to compact away.
    fn abandon(&mut self, pos: usize, blocks: usize) {
        let sector = self.sector;
        let cleared = (0..blocks)
            .try_for_each(|i| self.program(index_addr(sector, pos + i), node_type::INVALID));
        if cleared.is_ok() {
            self.first_free += blocks;
            self.allocated += blocks * BLOCK_SIZE;
            return;
        }
        if !matches!(self.slot(pos), Ok(Slot::Empty)) {
            warn!("half-written node at {pos}, compacting on next allocation");
            self.dirty_tail = true;
        }
    }

    /// Programs `data` into the payload of `node` at `offset`.
    pub fn write(&mut self, node: &Node, offset: usize, data: &[u8]) -> Result<()> {
        self.check(node, offset, data.len())?;
        let addr = data_addr(self.sector, node.pos) + NODE_HEADER_SIZE + offset;
        self.program_bytes(addr, data)
    }

    pub fn read(&self, node: &Node, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(node, offset, buf.len())?;
        let addr = data_addr(self.sector, node.pos) + NODE_HEADER_SIZE + offset;
        self.read_raw(addr, buf)
    }

    /// Invalidates `node`. Its blocks stay allocated until the next swap.
    pub fn delete(&mut self, node: &Node) -> Result<()> {
        self.check(node, 0, 0)?;
        if self.slot(node.pos)? != Slot::Typed(node.kind) {
            return Err(Error::Resource("node already deleted"));
        }
        let used = self
            .used
            .checked_sub(node.blocks * BLOCK_SIZE)
            .ok_or(Error::Resource("node already deleted"))?;

        // Once the first slot is zeroed the node is gone; stray continuation
        // slots are skipped by the scan.
        self.program(index_addr(self.sector, node.pos), node_type::INVALID)?;
        self.used = used;
        for i in 1..node.blocks {
            self.program(index_addr(self.sector, node.pos + i), node_type::INVALID)?;
        }
        debug!("deleted node type {:#04x} at {}", node.kind, node.pos);
        Ok(())
    }

    /// Copies every live node into the other sector, densely, then moves the
    /// magic across.
    pub fn swap(&mut self) -> Result<()> {
        let src = self.sector;
        let dst = 1 - src;
        info!("compacting flash sector {src} into {dst}");

        let nodes = self.nodes().collect::<Result<Vec<_>>>()?;

        let erased = self.device.erase(dst);
        self.guard(erased)?;

        let mut pos = 0;
        let mut buf = [0u8; NODE_MAX_SIZE];
        for node in &nodes {
            self.program(index_addr(dst, pos), node.kind)?;
            for i in 1..node.blocks {
                self.program(index_addr(dst, pos + i), node_type::CONTINUATION)?;
            }

            let len = NODE_HEADER_SIZE + node.size();
            self.read_raw(data_addr(src, node.pos), &mut buf[..len])?;
            for (i, &byte) in buf[..len].iter().enumerate() {
                if byte != 0xFF {
                    self.program(data_addr(dst, pos) + i, byte)?;
                }
            }
            pos += node.blocks;
        }

        self.program_bytes(dst * SECTOR_SIZE, &MAGIC)?;
        self.zero_magic(src)?;

        self.sector = dst;
        self.first_free = pos;
        self.allocated = pos * BLOCK_SIZE;
        self.used = pos * BLOCK_SIZE;
        self.generation = self.generation.wrapping_add(1);
        self.dirty_tail = false;
        info!("flash sector {dst} active, {} nodes kept", nodes.len());
        Ok(())
    }

    fn recover_sector(&mut self) -> Result<usize> {
        let magic = [self.has_magic(0)?, self.has_magic(1)?];
        match magic {
            [true, false] => Ok(0),
            [false, true] => Ok(1),
            [true, true] => {
                // Interrupted swap: the copy finished before the new magic was
                // written, so both sectors hold the same live nodes.
                let mut last = [0u8; 1];
                self.read_raw(index_addr(0, INDEX_SIZE - 1), &mut last)?;
                let (keep, drop) = if last[0] != node_type::EMPTY { (0, 1) } else { (1, 0) };
                warn!("both flash sectors carry magic, keeping sector {keep}");
                self.zero_magic(drop)?;
                Ok(keep)
            }
            [false, false] => {
                info!("no formatted flash sector, formatting sector 0");
                let erased = self.device.erase(0);
                self.guard(erased)?;
                self.program_bytes(0, &MAGIC)?;
                Ok(0)
            }
        }
    }

    fn rescan(&mut self) -> Result<()> {
        let mut first_free = INDEX_SIZE;
        for pos in 0..INDEX_SIZE {
            if self.slot(pos)? == Slot::Empty {
                first_free = pos;
                break;
            }
        }
        self.first_free = first_free;
        self.allocated = first_free * BLOCK_SIZE;
        self.used = 0;

        let scan = Nodes {
            store: &*self,
            pos: 0,
            include_torn: true,
            done: false,
        };
        let nodes = scan.collect::<Result<Vec<_>>>()?;

        for node in nodes {
            if node.is_torn() {
                warn!("dropping torn node at {}", node.pos);
                for i in 0..node.blocks {
                    self.program(index_addr(self.sector, node.pos + i), node_type::INVALID)?;
                }
            } else {
                self.used += node.blocks * BLOCK_SIZE;
            }
        }
        Ok(())
    }

    fn has_magic(&self, sector: usize) -> Result<bool> {
        let mut buf = [0u8; MAGIC_SIZE];
        self.read_raw(sector * SECTOR_SIZE, &mut buf)?;
        Ok(buf == MAGIC)
    }

    fn zero_magic(&mut self, sector: usize) -> Result<()> {
        self.program_bytes(sector * SECTOR_SIZE, &[0u8; MAGIC_SIZE])
    }

    fn slot(&self, pos: usize) -> Result<Slot> {
        let mut b = [0u8; 1];
        self.read_raw(index_addr(self.sector, pos), &mut b)?;
        Ok(Slot::from(b[0]))
    }

    fn check(&self, node: &Node, offset: usize, len: usize) -> Result<()> {
        if node.generation != self.generation {
            return Err(Error::Resource("stale node handle"));
        }
        if offset + len > node.size() {
            return Err(Error::Params("access beyond node size"));
        }
        Ok(())
    }

    fn guard<T>(&self, result: core::result::Result<T, DeviceError>) -> Result<T> {
        result.map_err(|e| {
            warn!("flash hardware error: {e}");
            self.hw_error.set(true);
            Error::Hardware(e)
        })
    }

    fn read_raw(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let r = self.device.read(addr, buf);
        self.guard(r)
    }

    fn program(&mut self, addr: usize, value: u8) -> Result<()> {
        let r = self.device.program(addr, value);
        self.guard(r)
    }

    fn program_bytes(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        let r = self.device.program_bytes(addr, data);
        self.guard(r)
    }
}

/// Lazy forward scan over the active index.
pub struct Nodes<'a, F> {
    store: &'a FlashStore<F>,
    pos: usize,
    include_torn: bool,
    done: bool,
}

impl<F: FlashDevice> Iterator for Nodes<'_, F> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < INDEX_SIZE {
            match self.parse_at(self.pos) {
                Ok(None) => {}
                Ok(Some(node)) => {
                    self.pos += node.blocks;
                    if self.include_torn || !node.is_torn() {
                        return Some(Ok(node));
                    }
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            self.pos += 1;
        }
        None
    }
}

impl<F: FlashDevice> Nodes<'_, F> {
    fn parse_at(&mut self, pos: usize) -> Result<Option<Node>> {
        let kind = match self.store.slot(pos)? {
            Slot::Empty => {
                self.done = true;
                return Ok(None);
            }
            Slot::Invalid | Slot::Continuation => return Ok(None),
            Slot::Typed(kind) => kind,
        };

        let max_blocks = NODE_MAX_SIZE / BLOCK_SIZE;
        let mut blocks = 1;
        while blocks < max_blocks
            && pos + blocks < INDEX_SIZE
            && self.store.slot(pos + blocks)? == Slot::Continuation
        {
            blocks += 1;
        }

        let mut header = [0u8; NODE_HEADER_SIZE];
        self.store
            .read_raw(data_addr(self.store.sector, pos), &mut header)?;

        Ok(Some(Node {
            pos,
            kind,
            blocks,
            size: u16::from_le_bytes(header),
            generation: self.store.generation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::RamFlash;

    fn fresh() -> FlashStore<RamFlash> {
        FlashStore::mount(RamFlash::new()).unwrap()
    }

    fn remount(store: FlashStore<RamFlash>) -> FlashStore<RamFlash> {
        let image = store.into_device().image().to_vec();
        FlashStore::mount(RamFlash::from_image(image).unwrap()).unwrap()
    }

    fn put(store: &mut FlashStore<RamFlash>, kind: u8, data: &[u8]) -> Node {
        let node = store.allocate(kind, data.len()).unwrap();
        store.write(&node, 0, data).unwrap();
        node
    }

    fn contents(store: &FlashStore<RamFlash>) -> Vec<(u8, Vec<u8>)> {
        store
            .nodes()
            .map(|n| {
                let n = n.unwrap();
                let mut buf = vec![0u8; n.size()];
                store.read(&n, 0, &mut buf).unwrap();
                (n.kind(), buf)
            })
            .collect()
    }

    #[test]
    fn blank_device_is_formatted() {
        let store = fresh();
        assert_eq!(store.sector(), 0);
        assert_eq!(store.nodes().count(), 0);

        let mut magic = [0u8; MAGIC_SIZE];
        store.device().read(0, &mut magic).unwrap();
        assert_eq!(magic, MAGIC);
    }

    #[test]
    fn allocate_then_iterate_finds_node() {
        let mut store = fresh();
        let node = put(&mut store, node_type::RECORD, b"hello");

        let found: Vec<Node> = store.nodes().map(|n| n.unwrap()).collect();
        assert_eq!(found, vec![node]);
        assert_eq!(found[0].kind(), node_type::RECORD);
        assert_eq!(found[0].size(), 5);
    }

    #[test]
    fn multi_block_nodes_use_continuation_slots() {
        let mut store = fresh();
        let big = put(&mut store, node_type::KEY, &[7u8; 200]);
        let small = put(&mut store, node_type::RECORD, &[1u8; 10]);

        assert_eq!(big.blocks(), 4);
        assert_eq!(small.pos(), 4);
        assert_eq!(
            contents(&store),
            vec![(node_type::KEY, vec![7u8; 200]), (node_type::RECORD, vec![1u8; 10])]
        );
    }

    #[test]
    fn deleted_node_is_never_returned() {
        let mut store = fresh();
        let a = put(&mut store, node_type::RECORD, b"a");
        let b = put(&mut store, node_type::RECORD, b"b");
        store.delete(&a).unwrap();

        let found: Vec<Node> = store.nodes().map(|n| n.unwrap()).collect();
        assert_eq!(found, vec![b]);

        let store = remount(store);
        assert_eq!(contents(&store), vec![(node_type::RECORD, b"b".to_vec())]);
    }

    #[test]
    fn write_beyond_node_fails() {
        let mut store = fresh();
        let node = store.allocate(node_type::RECORD, 4).unwrap();
        assert!(matches!(store.write(&node, 2, b"abc"), Err(Error::Params(_))));
        assert!(store.write(&node, 1, b"abc").is_ok());
    }

    #[test]
    fn oversized_and_reserved_allocations_fail() {
        let mut store = fresh();
        assert!(matches!(
            store.allocate(node_type::RECORD, NODE_MAX_DATA + 1),
            Err(Error::Params(_))
        ));
        assert!(store.allocate(node_type::RECORD, NODE_MAX_DATA).is_ok());
        assert!(store.allocate(node_type::CONTINUATION, 1).is_err());
        assert!(store.allocate(node_type::INVALID, 1).is_err());
    }

    #[test]
    fn accounting_survives_remount() {
        let mut store = fresh();
        let a = put(&mut store, node_type::KEY, &[1u8; 100]);
        put(&mut store, node_type::KEY, &[2u8; 10]);
        store.delete(&a).unwrap();
        let before = store.stats().unwrap();

        let after = remount(store).stats().unwrap();
        assert_eq!(before.used, after.used);
        assert_eq!(before.allocated, after.allocated);
        assert_eq!(after.nodes, 1);
        assert_eq!(after.used, BLOCK_SIZE);
        assert_eq!(after.allocated, 3 * BLOCK_SIZE);
    }

    #[test]
    fn exhaustion_triggers_swap_and_keeps_survivors() {
        let mut store = fresh();
        put(&mut store, node_type::KEY, &[0xA5u8; 300]);

        // Fill the rest of the sector with nodes that get deleted straight away.
        loop {
            match store.allocate(node_type::RECORD, NODE_MAX_DATA) {
                Ok(node) if store.sector() == 0 => store.delete(&node).unwrap(),
                Ok(_) => break,
                Err(e) => panic!("unexpected {e}"),
            }
            if store.stats().unwrap().allocated + NODE_MAX_SIZE > DATA_SIZE {
                break;
            }
        }
        assert_eq!(store.sector(), 0);

        let last = put(&mut store, node_type::RECORD, &[0x3Cu8; NODE_MAX_DATA]);
        assert_eq!(store.sector(), 1);
        assert_eq!(last.pos(), blocks_for(300));

        let expected = vec![
            (node_type::KEY, vec![0xA5u8; 300]),
            (node_type::RECORD, vec![0x3Cu8; NODE_MAX_DATA]),
        ];
        assert_eq!(contents(&store), expected);

        let store = remount(store);
        assert_eq!(store.sector(), 1);
        assert_eq!(contents(&store), expected);

        let mut old_magic = [0xFFu8; MAGIC_SIZE];
        store.device().read(0, &mut old_magic).unwrap();
        assert_eq!(old_magic, [0u8; MAGIC_SIZE]);
    }

    #[test]
    fn full_of_live_data_reports_memory_error() {
        let mut store = fresh();
        while store.allocate(node_type::RECORD, NODE_MAX_DATA).is_ok() {}
        assert!(matches!(
            store.allocate(node_type::RECORD, NODE_MAX_DATA),
            Err(Error::Memory(_))
        ));
        assert_eq!(store.sector(), 0);
    }

    #[test]
    fn stale_handle_after_swap_is_rejected() {
        let mut store = fresh();
        let node = put(&mut store, node_type::RECORD, b"x");
        store.swap().unwrap();
        assert!(matches!(store.read(&node, 0, &mut [0u8; 1]), Err(Error::Resource(_))));

        let fresh_handle = store.nodes().next().unwrap().unwrap();
        let mut b = [0u8; 1];
        store.read(&fresh_handle, 0, &mut b).unwrap();
        assert_eq!(&b, b"x");
    }

    #[test]
    fn both_magics_with_partial_sector_0_keep_sector_1() {
        let mut store = fresh();
        put(&mut store, node_type::KEY, b"alpha");
        put(&mut store, node_type::RECORD, b"beta");
        let expected = contents(&store);

        let mut image = store.into_device().image().to_vec();
        image.copy_within(0..SECTOR_SIZE, SECTOR_SIZE);

        let store = FlashStore::mount(RamFlash::from_image(image).unwrap()).unwrap();
        assert_eq!(store.sector(), 1);
        assert_eq!(contents(&store), expected);

        let mut magic0 = [0xFFu8; MAGIC_SIZE];
        store.device().read(0, &mut magic0).unwrap();
        assert_eq!(magic0, [0u8; MAGIC_SIZE]);
    }

    #[test]
    fn both_magics_with_full_sector_0_keep_sector_0() {
        let mut store = fresh();
        for _ in 0..31 {
            store.allocate(node_type::RECORD, NODE_MAX_DATA).unwrap();
        }
        store.allocate(node_type::RECORD, 32 * BLOCK_SIZE - NODE_HEADER_SIZE).unwrap();
        assert_eq!(store.stats().unwrap().allocated, DATA_SIZE);

        let mut flash = store.into_device();
        flash.program_bytes(SECTOR_SIZE, &MAGIC).unwrap();

        let store = FlashStore::mount(flash).unwrap();
        assert_eq!(store.sector(), 0);
        assert_eq!(store.nodes().count(), 32);

        let mut magic1 = [0xFFu8; MAGIC_SIZE];
        store.device().read(SECTOR_SIZE, &mut magic1).unwrap();
        assert_eq!(magic1, [0u8; MAGIC_SIZE]);
    }

    #[test]
    fn power_loss_during_swap_keeps_old_sector() {
        let mut store = fresh();
        put(&mut store, node_type::KEY, b"survivor");
        let filler = store.allocate(node_type::RECORD, 100).unwrap();
        store.delete(&filler).unwrap();

        store.device_mut().fail_after(40);
        assert!(matches!(store.swap(), Err(Error::Hardware(_))));
        assert!(store.hw_error());

        let mut flash = store.into_device();
        flash.restore_power();
        let mut store = FlashStore::mount(flash).unwrap();
        assert_eq!(store.sector(), 0);
        assert!(!store.hw_error());
        assert_eq!(contents(&store), vec![(node_type::KEY, b"survivor".to_vec())]);

        store.swap().unwrap();
        assert_eq!(store.sector(), 1);
        assert_eq!(contents(&store), vec![(node_type::KEY, b"survivor".to_vec())]);
    }

    #[test]
    fn torn_allocation_is_dropped_at_mount() {
        let mut store = fresh();
        put(&mut store, node_type::KEY, b"good");

        // Power fails halfway through the size header.
        store.device_mut().fail_after(3);
        assert!(store.allocate(node_type::RECORD, 100).is_err());

        let mut flash = store.into_device();
        flash.restore_power();
        let mut store = FlashStore::mount(flash).unwrap();
        assert_eq!(contents(&store), vec![(node_type::KEY, b"good".to_vec())]);
        assert_eq!(store.stats().unwrap().used, BLOCK_SIZE);

        let next = put(&mut store, node_type::RECORD, b"after");
        assert_eq!(next.pos(), 3);
    }

    #[test]
    fn failed_allocation_does_not_hide_later_nodes() {
        let mut store = fresh();

        // Only the leading index byte of the three-block node lands.
        store.device_mut().fail_after(1);
        assert!(matches!(
            store.allocate(node_type::KEY, 150),
            Err(Error::Hardware(_))
        ));

        store.device_mut().restore_power();
        let node = put(&mut store, node_type::RECORD, b"later");
        assert_eq!(contents(&store), vec![(node_type::RECORD, b"later".to_vec())]);
        assert_eq!(store.nodes().next().unwrap().unwrap(), node);

        let mut store = remount(store);
        assert_eq!(contents(&store), vec![(node_type::RECORD, b"later".to_vec())]);
        put(&mut store, node_type::KEY, b"next");
        assert_eq!(
            contents(&store),
            vec![
                (node_type::RECORD, b"later".to_vec()),
                (node_type::KEY, b"next".to_vec())
            ]
        );
    }

    #[test]
    fn failed_allocation_is_zeroed_and_skipped() {
        let mut store = fresh();
        put(&mut store, node_type::KEY, b"first");

        // A worn slot that can no longer take a continuation byte.
        store.device_mut().program(index_addr(0, 2), 0x00).unwrap();
        assert!(matches!(
            store.allocate(node_type::RECORD, 150),
            Err(Error::Hardware(_))
        ));

        let node = put(&mut store, node_type::RECORD, b"second");
        assert_eq!(store.sector(), 0);
        assert_eq!(node.pos(), 4);
        assert_eq!(
            contents(&store),
            vec![
                (node_type::KEY, b"first".to_vec()),
                (node_type::RECORD, b"second".to_vec())
            ]
        );
        assert_eq!(store.stats().unwrap().used, 2 * BLOCK_SIZE);
    }

    #[test]
    fn unprogrammed_allocation_leaves_bookkeeping_alone() {
        let mut store = fresh();
        store.device_mut().fail_after(0);
        assert!(store.allocate(node_type::RECORD, 10).is_err());
        store.device_mut().restore_power();

        let node = put(&mut store, node_type::RECORD, b"ok");
        assert_eq!(store.sector(), 0);
        assert_eq!(node.pos(), 0);
        assert_eq!(store.stats().unwrap().allocated, BLOCK_SIZE);
    }

    #[test]
    fn deleting_twice_is_refused() {
        let mut store = fresh();
        let a = put(&mut store, node_type::RECORD, &[1u8; 100]);
        put(&mut store, node_type::RECORD, b"kept");

        store.delete(&a).unwrap();
        assert!(matches!(store.delete(&a), Err(Error::Resource(_))));

        let stats = store.stats().unwrap();
        assert_eq!(stats.used, BLOCK_SIZE);
        assert_eq!(stats.nodes, 1);
    }
}
