use cloakfs_core::NameError;
use cloakfs_crypto::Interface;

/// A single-component name codec.
///
/// `iv` is the chained directory IV slot: codecs that checksum the name
/// advance it as a side effect of computing the MAC, which is how sibling
/// encodings come to depend on ancestor names. Passing `None` encodes a
/// name in isolation.
pub trait NameCodec: Send + Sync {
    fn interface(&self) -> Interface;

    /// Worst-case encoded length for a plaintext of `plaintext_len` bytes.
    fn max_encoded_len(&self, plaintext_len: usize) -> usize;

    /// Worst-case decoded length for an encoded name of `encoded_len`
    /// characters.
    fn max_decoded_len(&self, encoded_len: usize) -> usize;

    fn encode_name(&self, plaintext: &[u8], iv: Option<&mut u64>) -> Result<String, NameError>;

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<Vec<u8>, NameError>;
}
