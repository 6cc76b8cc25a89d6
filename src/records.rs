//! Fixed-size typed records (PINs and similar device state).
//!
//! Payload layout: `TYPE (2) | DATA (32)`.

use log::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::flash::device::FlashDevice;
use crate::flash::{FlashStore, Node, node_type};

pub const RECORD_SIZE: usize = 32;
/// Number of record types.
pub const RECORD_MAX: u16 = 2;

const OFF_TYPE: usize = 0;
const OFF_DATA: usize = 2;
const NODE_SIZE: usize = OFF_DATA + RECORD_SIZE;

fn check_type(kind: u16) -> Result<()> {
    if kind >= RECORD_MAX {
        return Err(Error::Params("unknown record type"));
    }
    Ok(())
}

fn node_record_type<F: FlashDevice>(store: &FlashStore<F>, node: &Node) -> Result<Option<u16>> {
    if node.kind() != node_type::RECORD || node.size() != NODE_SIZE {
        return Ok(None);
    }
    let mut kind = [0u8; 2];
    store.read(node, OFF_TYPE, &mut kind)?;
    Ok(Some(u16::from_le_bytes(kind)))
}

/// First record node of `kind` in scan order.
pub fn find_record<F: FlashDevice>(store: &FlashStore<F>, kind: u16) -> Result<Option<Node>> {
    for node in store.nodes() {
        let node = node?;
        if node_record_type(store, &node)? == Some(kind) {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

pub fn record_get<F: FlashDevice>(
    store: &FlashStore<F>,
    kind: u16,
) -> Result<Option<Zeroizing<[u8; RECORD_SIZE]>>> {
    check_type(kind)?;
    let Some(node) = find_record(store, kind)? else {
        return Ok(None);
    };
    let mut data = Zeroizing::new([0u8; RECORD_SIZE]);
    store.read(&node, OFF_DATA, &mut data[..])?;
    Ok(Some(data))
}

/// Appends the new record, then deletes every older node of the same type.
pub fn record_set<F: FlashDevice>(
    store: &mut FlashStore<F>,
    kind: u16,
    data: &[u8; RECORD_SIZE],
) -> Result<()> {
    check_type(kind)?;

    let fresh = store.allocate(node_type::RECORD, NODE_SIZE)?;
    store.write(&fresh, OFF_TYPE, &kind.to_le_bytes())?;
    store.write(&fresh, OFF_DATA, data)?;

    let mut stale = Vec::new();
    for node in store.nodes() {
        let node = node?;
        if node.pos() != fresh.pos() && node_record_type(store, &node)? == Some(kind) {
            stale.push(node);
        }
    }
    for node in &stale {
        store.delete(node)?;
    }
    debug!("record {kind} set, {} old copies removed", stale.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::device::RamFlash;

    fn fresh() -> FlashStore<RamFlash> {
        FlashStore::mount(RamFlash::new()).unwrap()
    }

    fn count(store: &FlashStore<RamFlash>, kind: u16) -> usize {
        store
            .nodes()
            .filter(|n| node_record_type(store, n.as_ref().unwrap()).unwrap() == Some(kind))
            .count()
    }

    #[test]
    fn missing_record_is_none() {
        let store = fresh();
        assert!(record_get(&store, 0).unwrap().is_none());
    }

    #[test]
    fn set_then_get() {
        let mut store = fresh();
        record_set(&mut store, 1, &[7u8; RECORD_SIZE]).unwrap();
        assert_eq!(*record_get(&store, 1).unwrap().unwrap(), [7u8; RECORD_SIZE]);
        assert!(record_get(&store, 0).unwrap().is_none());
    }

    #[test]
    fn set_replaces_and_removes_old_copy() {
        let mut store = fresh();
        record_set(&mut store, 0, &[1u8; RECORD_SIZE]).unwrap();
        record_set(&mut store, 0, &[2u8; RECORD_SIZE]).unwrap();
        assert_eq!(count(&store, 0), 1);
        assert_eq!(*record_get(&store, 0).unwrap().unwrap(), [2u8; RECORD_SIZE]);
    }

    #[test]
    fn out_of_range_type_is_rejected() {
        let mut store = fresh();
        assert!(matches!(
            record_set(&mut store, RECORD_MAX, &[0u8; RECORD_SIZE]),
            Err(Error::Params(_))
        ));
        assert!(matches!(record_get(&store, RECORD_MAX), Err(Error::Params(_))));
    }

    #[test]
    fn duplicate_window_reads_first_match() {
        let mut store = fresh();
        record_set(&mut store, 0, &[1u8; RECORD_SIZE]).unwrap();

        // A set interrupted before its delete leaves two copies behind.
        let dup = store.allocate(node_type::RECORD, NODE_SIZE).unwrap();
        store.write(&dup, OFF_TYPE, &0u16.to_le_bytes()).unwrap();
        store.write(&dup, OFF_DATA, &[2u8; RECORD_SIZE]).unwrap();
        assert_eq!(count(&store, 0), 2);
        assert_eq!(*record_get(&store, 0).unwrap().unwrap(), [1u8; RECORD_SIZE]);

        record_set(&mut store, 0, &[3u8; RECORD_SIZE]).unwrap();
        assert_eq!(count(&store, 0), 1);
        assert_eq!(*record_get(&store, 0).unwrap().unwrap(), [3u8; RECORD_SIZE]);
    }

    #[test]
    fn repeated_sets_survive_swaps() {
        let mut store = fresh();
        for i in 0..3000u32 {
            let mut data = [0u8; RECORD_SIZE];
            data[..4].copy_from_slice(&i.to_le_bytes());
            record_set(&mut store, (i % 2) as u16, &data).unwrap();
        }
        assert_eq!(count(&store, 0), 1);
        assert_eq!(count(&store, 1), 1);
        let last = record_get(&store, 1).unwrap().unwrap();
        assert_eq!(&last[..4], &2999u32.to_le_bytes());
    }
}
