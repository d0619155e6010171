//! AES-256 cipher: CBC (no padding) block mode, CTR stream mode,
//! HMAC-SHA1 folded MAC.
//!
//! Per-call wide IV: the caller's 64-bit IV is expanded to the 16-byte
//! AES IV with HMAC-SHA1 keyed by the mount key, so identical 64-bit IVs
//! collide only under the same key. `Ctr64BE` keeps the stream mode
//! random-access friendly (64-bit big-endian counter).

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use cloakfs_core::CryptoError;

use crate::cipher::Cipher;
use crate::key::CipherKey;
use crate::registry::Interface;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr64BE = ctr::Ctr64BE<Aes256>;
type HmacSha1 = Hmac<Sha1>;

const AES_BLOCK_SIZE: usize = 16;
const AES_IV_SIZE: usize = 16;

pub struct AesCipher;

impl AesCipher {
    pub fn new() -> Self {
        AesCipher
    }

    pub fn interface() -> Interface {
        Interface::new("cipher/aes", 3, 0, 2)
    }

    /// Widen a 64-bit IV to the AES IV size, keyed by the mount key.
    fn derive_ivec(iv: u64, key: &CipherKey) -> [u8; AES_IV_SIZE] {
        let mut mac = HmacSha1::new_from_slice(key.bytes()).expect("HMAC accepts any key length");
        mac.update(&iv.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let mut ivec = [0u8; AES_IV_SIZE];
        ivec.copy_from_slice(&digest[..AES_IV_SIZE]);
        ivec
    }

    fn apply_stream(data: &mut [u8], iv: u64, key: &CipherKey) {
        let ivec = Self::derive_ivec(iv, key);
        let mut cipher = Aes256Ctr64BE::new(
            GenericArray::from_slice(key.encryption_key()),
            GenericArray::from_slice(&ivec),
        );
        cipher.apply_keystream(data);
    }
}

impl Default for AesCipher {
    fn default() -> Self {
        AesCipher::new()
    }
}

impl Cipher for AesCipher {
    fn cipher_block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn block_encode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadLength(data.len()));
        }
        let ivec = Self::derive_ivec(iv, key);
        let len = data.len();
        Aes256CbcEnc::new(
            GenericArray::from_slice(key.encryption_key()),
            GenericArray::from_slice(&ivec),
        )
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CryptoError::BadLength(len))?;
        Ok(())
    }

    fn block_decode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadLength(data.len()));
        }
        let ivec = Self::derive_ivec(iv, key);
        let len = data.len();
        Aes256CbcDec::new(
            GenericArray::from_slice(key.encryption_key()),
            GenericArray::from_slice(&ivec),
        )
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::BadLength(len))?;
        Ok(())
    }

    fn stream_encode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError> {
        Self::apply_stream(data, iv, key);
        Ok(())
    }

    fn stream_decode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError> {
        // CTR is symmetric
        Self::apply_stream(data, iv, key);
        Ok(())
    }

    fn mac_64(&self, data: &[u8], key: &CipherKey, chain: Option<&mut u64>) -> u64 {
        let mut mac = HmacSha1::new_from_slice(key.bytes()).expect("HMAC accepts any key length");
        mac.update(data);
        if let Some(chain) = &chain {
            mac.update(&chain.to_le_bytes());
        }
        let digest = mac.finalize().into_bytes();

        let mut folded = [0u8; 8];
        for (i, byte) in digest.iter().enumerate() {
            folded[i % 8] ^= byte;
        }
        let value = u64::from_be_bytes(folded);

        if let Some(chain) = chain {
            *chain = value;
        }
        value
    }

    fn randomize(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        rand::thread_rng()
            .try_fill_bytes(buf)
            .map_err(|_| CryptoError::Random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CipherKey {
        let mut bytes = [0u8; crate::key::KEY_SIZE + crate::key::IV_MATERIAL_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        CipherKey::from_bytes(bytes)
    }

    #[test]
    fn block_roundtrip() {
        let cipher = AesCipher::new();
        let key = test_key();
        let plain: Vec<u8> = (0..64u8).collect();

        let mut buf = plain.clone();
        cipher.block_encode(&mut buf, 7, &key).unwrap();
        assert_ne!(buf, plain);
        cipher.block_decode(&mut buf, 7, &key).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn block_rejects_partial_blocks() {
        let cipher = AesCipher::new();
        let key = test_key();
        let mut buf = vec![0u8; 15];
        assert_eq!(
            cipher.block_encode(&mut buf, 0, &key),
            Err(CryptoError::BadLength(15))
        );
    }

    #[test]
    fn stream_roundtrip_any_length() {
        let cipher = AesCipher::new();
        let key = test_key();
        for len in [1usize, 7, 8, 16, 17, 100, 1023] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut buf = plain.clone();
            cipher.stream_encode(&mut buf, 3, &key).unwrap();
            assert_ne!(buf, plain, "len {len}");
            cipher.stream_decode(&mut buf, 3, &key).unwrap();
            assert_eq!(buf, plain, "len {len}");
        }
    }

    #[test]
    fn different_iv_different_ciphertext() {
        let cipher = AesCipher::new();
        let key = test_key();
        let mut a = vec![0x41u8; 32];
        let mut b = vec![0x41u8; 32];
        cipher.block_encode(&mut a, 1, &key).unwrap();
        cipher.block_encode(&mut b, 2, &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mac_is_stable_and_keyed() {
        let cipher = AesCipher::new();
        let key = test_key();
        let other = CipherKey::random();

        let m1 = cipher.mac_64(b"payload", &key, None);
        let m2 = cipher.mac_64(b"payload", &key, None);
        assert_eq!(m1, m2);
        assert_ne!(m1, cipher.mac_64(b"payload", &other, None));
        assert_ne!(m1, cipher.mac_64(b"payloae", &key, None));
    }

    #[test]
    fn mac_chain_advances() {
        let cipher = AesCipher::new();
        let key = test_key();

        let mut chain = 0u64;
        let first = cipher.mac_16(b"name", &key, Some(&mut chain));
        assert_eq!(u64::from(first), {
            let m = chain;
            let m32 = ((m >> 32) as u32) ^ (m as u32);
            u64::from(((m32 >> 16) as u16) ^ (m32 as u16))
        });

        // same bytes under the advanced chain give a different MAC
        let second = cipher.mac_16(b"name", &key, Some(&mut chain));
        assert_ne!(first, second);
    }

    #[test]
    fn chain_value_contributes_to_mac() {
        let cipher = AesCipher::new();
        let key = test_key();
        let mut chain = 99u64;
        let with_chain = cipher.mac_64(b"data", &key, Some(&mut chain));
        let without = cipher.mac_64(b"data", &key, None);
        assert_ne!(with_chain, without);
    }

    #[test]
    fn randomize_fills() {
        let cipher = AesCipher::new();
        let mut buf = [0u8; 32];
        cipher.randomize(&mut buf).unwrap();
        assert_ne!(buf, [0u8; 32]);
    }
}
