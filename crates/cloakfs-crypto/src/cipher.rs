use cloakfs_core::CryptoError;

use crate::key::CipherKey;

/// The primitive cipher capability the file and name layers build on.
///
/// Block mode is length-preserving over whole cipher blocks and is used
/// for full content blocks and padded name blocks; stream mode handles
/// arbitrary lengths (tail blocks, name streams, the 8-byte IV header).
/// Both directions of both modes take the 64-bit IV the callers compute
/// (`block_index ^ file_iv`, `mac ^ chained_iv`).
///
/// The MAC is a keyed 64-bit checksum. When a chain slot is supplied, the
/// current chain value is folded into the input and the slot is advanced
/// to the result; this is what threads an IV along a directory path.
pub trait Cipher: Send + Sync {
    /// Block size of the underlying primitive. Content block sizes and
    /// name padding are multiples of this.
    fn cipher_block_size(&self) -> usize;

    fn block_encode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError>;
    fn block_decode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError>;

    fn stream_encode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError>;
    fn stream_decode(&self, data: &mut [u8], iv: u64, key: &CipherKey) -> Result<(), CryptoError>;

    /// 64-bit folded MAC. `chain`, when present, contributes to the input
    /// and receives the result.
    fn mac_64(&self, data: &[u8], key: &CipherKey, chain: Option<&mut u64>) -> u64;

    fn mac_32(&self, data: &[u8], key: &CipherKey, chain: Option<&mut u64>) -> u32 {
        let mac = self.mac_64(data, key, chain);
        ((mac >> 32) as u32) ^ (mac as u32)
    }

    fn mac_16(&self, data: &[u8], key: &CipherKey, chain: Option<&mut u64>) -> u16 {
        let mac = self.mac_32(data, key, chain);
        ((mac >> 16) as u16) ^ (mac as u16)
    }

    /// Fill `buf` with cryptographically secure random bytes.
    fn randomize(&self, buf: &mut [u8]) -> Result<(), CryptoError>;
}
