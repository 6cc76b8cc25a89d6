//! Key nodes.
//!
//! Payload layout:
//! ```text
//! ID (4) | VALIDITY (4) | DATA_LEN (2) | NAME_LEN (2) | DATA | NAME
//! ```
//! Updates append the new node and only then delete the older copies, so a
//! reader that races a power cut keeps seeing the previous key (first match in
//! scan order wins).

use log::{debug, warn};
use serde::Serialize;
use zeroize::Zeroizing;

use crate::crypto::{DIGEST_LEN, kdf};
use crate::error::{Error, Result};
use crate::flash::device::FlashDevice;
use crate::flash::{FlashStore, Node, node_type};

/// Reserved id meaning "no key".
pub const KEY_INVALID: u32 = 0xFFFF_FFFF;
pub const KEY_DATA_MAX: usize = 2048;
pub const KEY_NAME_MAX: usize = 32;

const OFF_ID: usize = 0;
const OFF_VALIDITY: usize = 4;
const OFF_DATA_LEN: usize = 8;
const OFF_NAME_LEN: usize = 10;
const HEADER_LEN: usize = 12;

pub struct Key {
    id: u32,
    validity: u32,
    data: Zeroizing<Vec<u8>>,
    name: Vec<u8>,
}

/// Public description of a stored key. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub id: u32,
    pub validity: u32,
    pub data_len: u16,
    pub name: Vec<u8>,
    pub fingerprint: [u8; DIGEST_LEN],
}

impl Key {
    pub fn new(id: u32, validity: u32, data: &[u8], name: &[u8]) -> Result<Self> {
        if id == KEY_INVALID {
            return Err(Error::Params("reserved key id"));
        }
        if data.len() > KEY_DATA_MAX {
            return Err(Error::Params("key data too long"));
        }
        if name.len() > KEY_NAME_MAX {
            return Err(Error::Params("key name too long"));
        }
        Ok(Self {
            id,
            validity,
            data: Zeroizing::new(data.to_vec()),
            name: name.to_vec(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn validity(&self) -> u32 {
        self.validity
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Fingerprint a host can compare without learning the key.
    pub fn info(&self, salt: &[u8]) -> Result<KeyInfo> {
        let mut fingerprint = [0u8; DIGEST_LEN];
        kdf::pbkdf2_hmac_sha256(&self.data, salt, kdf::SESSION_KDF_ITERATIONS, &mut fingerprint)?;
        Ok(KeyInfo {
            id: self.id,
            validity: self.validity,
            data_len: self.data.len() as u16,
            name: self.name.clone(),
            fingerprint,
        })
    }

    fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len() + self.name.len()
    }

    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(self.encoded_len()));
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.validity.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.name);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Resource("malformed key node"));
        }
        let u32_at = |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let u16_at = |off: usize| usize::from(u16::from_le_bytes([data[off], data[off + 1]]));

        let data_len = u16_at(OFF_DATA_LEN);
        let name_len = u16_at(OFF_NAME_LEN);
        if HEADER_LEN + data_len + name_len > data.len() {
            return Err(Error::Resource("malformed key node"));
        }
        let key_data = &data[HEADER_LEN..HEADER_LEN + data_len];
        let name = &data[HEADER_LEN + data_len..HEADER_LEN + data_len + name_len];

        Key::new(u32_at(OFF_ID), u32_at(OFF_VALIDITY), key_data, name)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.validity == other.validity
            && *self.data == *other.data
            && self.name == other.name
    }
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("validity", &self.validity)
            .field("data_len", &self.data.len())
            .field("name", &String::from_utf8_lossy(&self.name))
            .finish()
    }
}

fn node_key_id<F: FlashDevice>(store: &FlashStore<F>, node: &Node) -> Result<Option<u32>> {
    if node.kind() != node_type::KEY || node.size() < HEADER_LEN {
        return Ok(None);
    }
    let mut id = [0u8; 4];
    store.read(node, OFF_ID, &mut id)?;
    // An unprogrammed id belongs to a node whose payload never landed.
    match u32::from_le_bytes(id) {
        KEY_INVALID => Ok(None),
        id => Ok(Some(id)),
    }
}

fn key_nodes<F: FlashDevice>(store: &FlashStore<F>, id: u32) -> Result<Vec<Node>> {
    let mut found = Vec::new();
    for node in store.nodes() {
        let node = node?;
        if node_key_id(store, &node)? == Some(id) {
            found.push(node);
        }
    }
    Ok(found)
}

/// First key node with `id` in scan order.
pub fn find_key<F: FlashDevice>(store: &FlashStore<F>, id: u32) -> Result<Option<Node>> {
    for node in store.nodes() {
        let node = node?;
        if node_key_id(store, &node)? == Some(id) {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

pub fn read_key<F: FlashDevice>(store: &FlashStore<F>, node: &Node) -> Result<Key> {
    let mut buf = Zeroizing::new(vec![0u8; node.size()]);
    store.read(node, 0, &mut buf)?;
    Key::from_bytes(&buf)
}

pub fn load_key<F: FlashDevice>(store: &FlashStore<F>, id: u32) -> Result<Option<Key>> {
    match find_key(store, id)? {
        Some(node) => read_key(store, &node).map(Some),
        None => Ok(None),
    }
}

fn write_key<F: FlashDevice>(store: &mut FlashStore<F>, key: &Key) -> Result<Node> {
    let bytes = key.to_bytes();
    let node = store.allocate(node_type::KEY, bytes.len())?;
    if let Err(e) = store.write(&node, 0, &bytes) {
        let _ = store.delete(&node);
        return Err(e);
    }
    debug!("stored key {:#010x}", key.id);
    Ok(node)
}

pub fn insert_key<F: FlashDevice>(store: &mut FlashStore<F>, key: &Key) -> Result<()> {
    if find_key(store, key.id)?.is_some() {
        return Err(Error::Params("key id already in use"));
    }
    write_key(store, key)?;
    Ok(())
}

/// Stores `key`, replacing every older node with the same id.
pub fn upsert_key<F: FlashDevice>(store: &mut FlashStore<F>, key: &Key) -> Result<()> {
    if let Some(current) = load_key(store, key.id)? {
        if current == *key {
            return Ok(());
        }
    }

    let fresh = write_key(store, key)?;
    for node in key_nodes(store, key.id)? {
        if node.pos() != fresh.pos() {
            store.delete(&node)?;
        }
    }
    Ok(())
}

pub fn delete_key<F: FlashDevice>(store: &mut FlashStore<F>, id: u32) -> Result<()> {
    let nodes = key_nodes(store, id)?;
    if nodes.is_empty() {
        return Err(Error::Resource("key not found"));
    }
    for node in &nodes {
        store.delete(node)?;
    }
    debug!("deleted key {id:#010x}");
    Ok(())
}

/// Describes up to `max` keys after skipping the first `skip`.
pub fn list_keys<F: FlashDevice>(
    store: &FlashStore<F>,
    skip: usize,
    max: usize,
    salt: &[u8],
) -> Result<Vec<KeyInfo>> {
    let mut out = Vec::new();
    let mut seen = 0;
    for node in store.nodes() {
        let node = node?;
        let Some(id) = node_key_id(store, &node)? else {
            continue;
        };
        if out.len() == max {
            break;
        }
        let key = match read_key(store, &node) {
            Ok(key) => key,
            Err(Error::Resource(_) | Error::Params(_)) => {
                warn!("skipping unreadable key node {id:#010x} at {}", node.pos());
                continue;
            }
            Err(e) => return Err(e),
        };
        seen += 1;
        if seen <= skip {
            continue;
        }
        out.push(key.info(salt)?);
    }
    Ok(out)
}
