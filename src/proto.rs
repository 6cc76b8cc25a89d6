//! Little-endian wire layouts of the core's commands.
//!
//! Every request and response has a host-side `to_bytes` and a device-side
//! `from_bytes`; the CLI drives the core through the same encoding a token
//! host would use.

use crate::algo::{AlgoInfo, CRYPTO_MAX_DATAOUT};
use crate::crypto::DIGEST_LEN;
use crate::error::{Error, Result};
use crate::keys::KeyInfo;

/// Largest request or response payload.
pub const REQ_MAX_DATA: usize = 8176;
/// Largest `datain1` (padded) plus `datain2`.
pub const CRYPTO_MAX_DATAIN: usize = 8160;

pub mod cmd {
    pub const KEY_EDIT: u16 = 5;
    pub const KEY_LIST: u16 = 6;
    pub const CRYPTO_INIT: u16 = 7;
    pub const CRYPTO_UPDATE: u16 = 8;
    pub const CRYPTO_LIST: u16 = 9;
    pub const CRYPTO_SET_TIME: u16 = 10;
}

const UPDATE_HEADER_LEN: usize = 16;
const ALGO_NAME_LEN: usize = 16;
const ALGO_ENTRY_LEN: usize = ALGO_NAME_LEN + 2 + 2 + 3 * 2;
const KEY_EDIT_HEADER_LEN: usize = 14;
const KEY_LIST_REQ_LEN: usize = 4 + DIGEST_LEN;
const KEY_ENTRY_HEADER_LEN: usize = 12 + DIGEST_LEN;

fn u16_at(data: &[u8], off: usize) -> Result<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(Error::Params("request too short"))
}

fn u32_at(data: &[u8], off: usize) -> Result<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Error::Params("request too short"))
}

fn bytes_at(data: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    data.get(off..off + len).ok_or(Error::Params("request too short"))
}

fn pad16(len: usize) -> usize {
    len.next_multiple_of(16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoInitReq {
    pub algo: u16,
    pub mode: u16,
    pub key_id: u32,
}

impl CryptoInitReq {
    pub const LEN: usize = 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.algo.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.key_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            algo: u16_at(data, 0)?,
            mode: u16_at(data, 2)?,
            key_id: u32_at(data, 4)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoInitResp {
    pub sid: u32,
}

impl CryptoInitResp {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.sid.to_le_bytes().to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            sid: u32_at(data, 0)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoUpdateReq<'a> {
    pub sid: u32,
    pub flags: u16,
    pub datain1: &'a [u8],
    pub datain2: &'a [u8],
}

impl<'a> CryptoUpdateReq<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; UPDATE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sid.to_le_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_le_bytes());
        buf[6..8].copy_from_slice(&(self.datain1.len() as u16).to_le_bytes());
        buf[8..10].copy_from_slice(&(self.datain2.len() as u16).to_le_bytes());

        buf.extend_from_slice(self.datain1);
        buf.resize(UPDATE_HEADER_LEN + pad16(self.datain1.len()), 0);
        buf.extend_from_slice(self.datain2);
        buf
    }

    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let sid = u32_at(data, 0)?;
        let flags = u16_at(data, 4)?;
        let len1 = usize::from(u16_at(data, 6)?);
        let len2 = usize::from(u16_at(data, 8)?);
        if data.len() < UPDATE_HEADER_LEN {
            return Err(Error::Params("request too short"));
        }

        let off2 = UPDATE_HEADER_LEN + pad16(len1);
        if pad16(len1) + len2 > CRYPTO_MAX_DATAIN || off2 + len2 > REQ_MAX_DATA {
            return Err(Error::Params("update data too large"));
        }
        let datain1 = bytes_at(data, UPDATE_HEADER_LEN, len1)?;
        let datain2 = bytes_at(data, off2, len2)?;
        Ok(Self {
            sid,
            flags,
            datain1,
            datain2,
        })
    }
}

/// `dataout_len (2) | pad to 16 | dataout`.
pub fn encode_update_resp(dataout: &[u8]) -> Result<Vec<u8>> {
    if dataout.len() > CRYPTO_MAX_DATAOUT {
        return Err(Error::Params("output too large"));
    }
    let mut buf = vec![0u8; UPDATE_HEADER_LEN];
    buf[0..2].copy_from_slice(&(dataout.len() as u16).to_le_bytes());
    buf.extend_from_slice(dataout);
    Ok(buf)
}

pub fn decode_update_resp(data: &[u8]) -> Result<&[u8]> {
    let len = usize::from(u16_at(data, 0)?);
    bytes_at(data, UPDATE_HEADER_LEN, len)
}

/// One row of the algorithm listing as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoEntry {
    pub name: String,
    pub kind: u16,
    pub block_size: u16,
    pub key_sizes: [u16; 3],
}

pub fn encode_algo_list<'a>(algos: impl IntoIterator<Item = &'a AlgoInfo>) -> Vec<u8> {
    let mut count = 0u16;
    let mut buf = vec![0u8; 2];
    for info in algos {
        let mut name = [0u8; ALGO_NAME_LEN];
        let n = info.name.len().min(ALGO_NAME_LEN);
        name[..n].copy_from_slice(&info.name.as_bytes()[..n]);
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&(info.kind as u16).to_le_bytes());
        buf.extend_from_slice(&info.block_size.to_le_bytes());
        for size in info.key_sizes {
            buf.extend_from_slice(&size.to_le_bytes());
        }
        count += 1;
    }
    buf[0..2].copy_from_slice(&count.to_le_bytes());
    buf
}

pub fn decode_algo_list(data: &[u8]) -> Result<Vec<AlgoEntry>> {
    let count = usize::from(u16_at(data, 0)?);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let entry = bytes_at(data, 2 + i * ALGO_ENTRY_LEN, ALGO_ENTRY_LEN)?;
        let raw_name = &entry[..ALGO_NAME_LEN];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(ALGO_NAME_LEN);
        out.push(AlgoEntry {
            name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
            kind: u16_at(entry, 16)?,
            block_size: u16_at(entry, 18)?,
            key_sizes: [u16_at(entry, 20)?, u16_at(entry, 22)?, u16_at(entry, 24)?],
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetTimeReq {
    pub devtime: u32,
}

impl SetTimeReq {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.devtime.to_le_bytes().to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            devtime: u32_at(data, 0)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyOp {
    Insert = 1,
    Delete = 2,
    Upsert = 3,
}

impl TryFrom<u16> for KeyOp {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(KeyOp::Insert),
            2 => Ok(KeyOp::Delete),
            3 => Ok(KeyOp::Upsert),
            _ => Err(Error::Params("unknown key operation")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEditReq<'a> {
    pub op: KeyOp,
    pub id: u32,
    pub validity: u32,
    pub data: &'a [u8],
    pub name: &'a [u8],
}

impl<'a> KeyEditReq<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_EDIT_HEADER_LEN + self.data.len() + self.name.len());
        buf.extend_from_slice(&(self.op as u16).to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.validity.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.data);
        buf.extend_from_slice(self.name);
        buf
    }

    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let op = KeyOp::try_from(u16_at(data, 0)?)?;
        let data_len = usize::from(u16_at(data, 10)?);
        let name_len = usize::from(u16_at(data, 12)?);
        Ok(Self {
            op,
            id: u32_at(data, 2)?,
            validity: u32_at(data, 6)?,
            data: bytes_at(data, KEY_EDIT_HEADER_LEN, data_len)?,
            name: bytes_at(data, KEY_EDIT_HEADER_LEN + data_len, name_len)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyListReq {
    pub skip: u16,
    pub max: u16,
    pub salt: [u8; DIGEST_LEN],
}

impl KeyListReq {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_LIST_REQ_LEN);
        buf.extend_from_slice(&self.skip.to_le_bytes());
        buf.extend_from_slice(&self.max.to_le_bytes());
        buf.extend_from_slice(&self.salt);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut salt = [0u8; DIGEST_LEN];
        salt.copy_from_slice(bytes_at(data, 4, DIGEST_LEN)?);
        Ok(Self {
            skip: u16_at(data, 0)?,
            max: u16_at(data, 2)?,
            salt,
        })
    }
}

/// Encodes as many entries as fit in one response.
pub fn encode_key_list(keys: &[KeyInfo]) -> Vec<u8> {
    let mut count = 0u16;
    let mut buf = vec![0u8; 2];
    for key in keys {
        if buf.len() + KEY_ENTRY_HEADER_LEN + key.name.len() > REQ_MAX_DATA {
            break;
        }
        buf.extend_from_slice(&key.id.to_le_bytes());
        buf.extend_from_slice(&key.validity.to_le_bytes());
        buf.extend_from_slice(&key.data_len.to_le_bytes());
        buf.extend_from_slice(&(key.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&key.fingerprint);
        buf.extend_from_slice(&key.name);
        count += 1;
    }
    buf[0..2].copy_from_slice(&count.to_le_bytes());
    buf
}

pub fn decode_key_list(data: &[u8]) -> Result<Vec<KeyInfo>> {
    let count = usize::from(u16_at(data, 0)?);
    let mut out = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        let name_len = usize::from(u16_at(data, off + 10)?);
        let mut fingerprint = [0u8; DIGEST_LEN];
        fingerprint.copy_from_slice(bytes_at(data, off + 12, DIGEST_LEN)?);
        out.push(KeyInfo {
            id: u32_at(data, off)?,
            validity: u32_at(data, off + 4)?,
            data_len: u16_at(data, off + 8)?,
            name: bytes_at(data, off + KEY_ENTRY_HEADER_LEN, name_len)?.to_vec(),
            fingerprint,
        });
        off += KEY_ENTRY_HEADER_LEN + name_len;
    }
    Ok(out)
}
