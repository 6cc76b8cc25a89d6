//! Transport payload cipher.
//!
//! Request and response payloads exchanged with an authenticated host are
//! protected with AES-256-CBC and a truncated HMAC-SHA-256 tag computed over
//! `iv || ciphertext`. Both subkeys come from the shared session key through
//! single-round PBKDF2 with an empty salt.
//!
//! The CLI `seal` and `unseal` commands wrap files in the same format.

use zeroize::Zeroizing;

use super::aes::{AesCtx, Direction, Feedback};
use super::kdf::{self, SESSION_KDF_ITERATIONS};
use super::sha256::HmacSha256Ctx;
use super::{AES_BLOCK_LEN, AES_KEY_MAX, verify_tag};
use crate::error::Result;
use crate::rng::Random;

/// Length of the payload IV.
pub const IV_LEN: usize = AES_BLOCK_LEN;
/// Length of the truncated authentication tag.
pub const AUTH_LEN: usize = 16;

pub struct PayloadCipher {
    aes_key: Zeroizing<[u8; AES_KEY_MAX]>,
    hmac_key: Zeroizing<[u8; AES_KEY_MAX]>,
}

impl PayloadCipher {
    pub fn new(key: &[u8; AES_KEY_MAX]) -> Result<Self> {
        let derived = kdf::derive(key, &[], SESSION_KDF_ITERATIONS, 2 * AES_KEY_MAX)?;

        let mut aes_key = Zeroizing::new([0u8; AES_KEY_MAX]);
        let mut hmac_key = Zeroizing::new([0u8; AES_KEY_MAX]);
        aes_key.copy_from_slice(&derived[..AES_KEY_MAX]);
        hmac_key.copy_from_slice(&derived[AES_KEY_MAX..]);

        Ok(Self { aes_key, hmac_key })
    }

    /// Encrypts `data` in place and returns its tag.
    pub fn encrypt(&self, iv: &[u8; IV_LEN], data: &mut [u8]) -> Result<[u8; AUTH_LEN]> {
        let mut aes = AesCtx::new(&self.aes_key[..], Direction::Encrypt, Feedback::Cbc)?;
        aes.set_iv(iv)?;
        aes.process(data)?;
        Ok(self.tag(iv, data))
    }

    /// Authenticates then decrypts `data` in place. Nothing is decrypted when
    /// the tag does not match.
    pub fn decrypt(&self, iv: &[u8; IV_LEN], data: &mut [u8], auth: &[u8; AUTH_LEN]) -> Result<()> {
        verify_tag(auth, &self.tag(iv, data))?;

        let mut aes = AesCtx::new(&self.aes_key[..], Direction::Decrypt, Feedback::Cbc)?;
        aes.set_iv(iv)?;
        aes.process(data)
    }

    /// Encrypts under a fresh IV drawn from `rng`.
    pub fn seal<R: Random>(&self, rng: &mut R, data: &mut [u8]) -> Result<([u8; IV_LEN], [u8; AUTH_LEN])> {
        let mut iv = [0u8; IV_LEN];
        rng.random(&mut iv)?;
        let auth = self.encrypt(&iv, data)?;
        Ok((iv, auth))
    }

    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> [u8; AUTH_LEN] {
        let mut hmac = HmacSha256Ctx::new(&self.hmac_key[..]);
        hmac.update(iv);
        hmac.update(ciphertext);
        let full = hmac.finalize();

        let mut auth = [0u8; AUTH_LEN];
        auth.copy_from_slice(&full[..AUTH_LEN]);
        auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::rng::{OsRandom, RngError};

    struct DeadRandom;

    impl Random for DeadRandom {
        fn random(&mut self, _buf: &mut [u8]) -> Result<()> {
            Err(RngError::Unavailable.into())
        }
    }

    fn cipher() -> PayloadCipher {
        PayloadCipher::new(&[0x42u8; 32]).unwrap()
    }

    #[test]
    fn payload_roundtrip() {
        let c = cipher();
        let plain = vec![0xabu8; 64];
        let mut data = plain.clone();

        let (iv, auth) = c.seal(&mut OsRandom, &mut data).unwrap();
        assert_ne!(data, plain);

        c.decrypt(&iv, &mut data, &auth).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn tampered_ciphertext_is_rejected_and_left_untouched() {
        let c = cipher();
        let mut data = vec![1u8; 32];
        let iv = [3u8; IV_LEN];
        let auth = c.encrypt(&iv, &mut data).unwrap();

        data[5] ^= 0x80;
        let tampered = data.clone();
        assert!(matches!(c.decrypt(&iv, &mut data, &auth), Err(Error::Auth)));
        assert_eq!(data, tampered);
    }

    #[test]
    fn tampered_iv_is_rejected() {
        let c = cipher();
        let mut data = vec![1u8; 16];
        let mut iv = [3u8; IV_LEN];
        let auth = c.encrypt(&iv, &mut data).unwrap();

        iv[0] ^= 1;
        assert!(matches!(c.decrypt(&iv, &mut data, &auth), Err(Error::Auth)));
    }

    #[test]
    fn seal_fails_without_randomness() {
        let mut data = vec![7u8; 16];
        assert!(matches!(
            cipher().seal(&mut DeadRandom, &mut data),
            Err(Error::Random(RngError::Unavailable))
        ));
        assert_eq!(data, vec![7u8; 16]);
    }

    #[test]
    fn different_keys_produce_different_tags() {
        let a = PayloadCipher::new(&[1u8; 32]).unwrap();
        let b = PayloadCipher::new(&[2u8; 32]).unwrap();
        let iv = [0u8; IV_LEN];
        let ta = a.encrypt(&iv, &mut [0u8; 16]).unwrap();
        let tb = b.encrypt(&iv, &mut [0u8; 16]).unwrap();
        assert_ne!(ta, tb);
    }
}
