//! AES with explicit chaining state.
//!
//! The block transform comes from the RustCrypto `aes` crate; this module keeps
//! the per-session feedback state (IV, counter) so a message can be processed
//! across any number of update calls. All inputs are whole blocks.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use zeroize::Zeroize;

use super::AES_BLOCK_LEN;
use crate::error::{Error, Result};

type Block = [u8; AES_BLOCK_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Feedback {
    Ecb = 1,
    Cbc = 2,
    Ofb = 3,
    Ctr = 4,
    Cfb = 5,
}

impl Feedback {
    /// OFB and CTR xor a keystream, so encryption and decryption coincide.
    pub fn is_stream(self) -> bool {
        matches!(self, Feedback::Ofb | Feedback::Ctr)
    }
}

impl TryFrom<u16> for Feedback {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Feedback::Ecb),
            2 => Ok(Feedback::Cbc),
            3 => Ok(Feedback::Ofb),
            4 => Ok(Feedback::Ctr),
            5 => Ok(Feedback::Cfb),
            _ => Err(Error::Params("unsupported feedback mode")),
        }
    }
}

#[derive(Clone)]
enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let bad_key = |_| Error::Params("aes key size");
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128).map_err(bad_key),
            24 => Aes192::new_from_slice(key).map(Self::Aes192).map_err(bad_key),
            32 => Aes256::new_from_slice(key).map(Self::Aes256).map_err(bad_key),
            _ => Err(Error::Params("aes key must be 128, 192 or 256 bits")),
        }
    }

    fn encrypt(&self, block: &mut Block) {
        let block = GenericArray::from_mut_slice(&mut block[..]);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut Block) {
        let block = GenericArray::from_mut_slice(&mut block[..]);
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes192(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// An AES key schedule bound to a direction, a feedback mode and its
/// running IV/counter.
#[derive(Clone)]
pub struct AesCtx {
    cipher: BlockCipher,
    direction: Direction,
    feedback: Feedback,
    iv: Block,
}

impl Drop for AesCtx {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

impl AesCtx {
    pub fn new(key: &[u8], direction: Direction, feedback: Feedback) -> Result<Self> {
        Ok(Self {
            cipher: BlockCipher::new(key)?,
            direction,
            feedback,
            iv: [0u8; AES_BLOCK_LEN],
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn feedback(&self) -> Feedback {
        self.feedback
    }

    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.iv = iv
            .try_into()
            .map_err(|_| Error::Params("iv must be exactly one block"))?;
        Ok(())
    }

    /// Transforms `data` in place, advancing the chaining state.
    pub fn process(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() % AES_BLOCK_LEN != 0 {
            return Err(Error::Params("data is not a whole number of blocks"));
        }

        for chunk in data.chunks_exact_mut(AES_BLOCK_LEN) {
            let mut block: Block = [0u8; AES_BLOCK_LEN];
            block.copy_from_slice(chunk);
            self.process_block(&mut block);
            chunk.copy_from_slice(&block);
        }

        Ok(())
    }

    fn process_block(&mut self, block: &mut Block) {
        match (self.feedback, self.direction) {
            (Feedback::Ecb, Direction::Encrypt) => self.cipher.encrypt(block),
            (Feedback::Ecb, Direction::Decrypt) => self.cipher.decrypt(block),
            (Feedback::Cbc, Direction::Encrypt) => {
                xor(block, &self.iv);
                self.cipher.encrypt(block);
                self.iv = *block;
            }
            (Feedback::Cbc, Direction::Decrypt) => {
                let ciphertext = *block;
                self.cipher.decrypt(block);
                xor(block, &self.iv);
                self.iv = ciphertext;
            }
            (Feedback::Cfb, Direction::Encrypt) => {
                let mut keystream = self.iv;
                self.cipher.encrypt(&mut keystream);
                xor(block, &keystream);
                self.iv = *block;
            }
            (Feedback::Cfb, Direction::Decrypt) => {
                let mut keystream = self.iv;
                self.cipher.encrypt(&mut keystream);
                self.iv = *block;
                xor(block, &keystream);
            }
            (Feedback::Ofb, _) => {
                let mut iv = self.iv;
                self.cipher.encrypt(&mut iv);
                self.iv = iv;
                xor(block, &self.iv);
            }
            (Feedback::Ctr, _) => {
                let mut keystream = self.iv;
                self.cipher.encrypt(&mut keystream);
                xor(block, &keystream);
                increment_be(&mut self.iv);
            }
        }
    }
}

fn xor(block: &mut Block, other: &Block) {
    block.iter_mut().zip(other.iter()).for_each(|(b, o)| *b ^= o);
}

fn increment_be(counter: &mut Block) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}
