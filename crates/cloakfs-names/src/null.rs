use cloakfs_core::NameError;
use cloakfs_crypto::Interface;

use crate::codec::NameCodec;

/// Identity codec: names pass through untouched, no IV involved.
pub struct NullNameCodec;

impl NullNameCodec {
    pub fn new() -> Self {
        NullNameCodec
    }

    pub fn interface() -> Interface {
        Interface::new("nameio/null", 1, 0, 0)
    }
}

impl Default for NullNameCodec {
    fn default() -> Self {
        NullNameCodec::new()
    }
}

impl NameCodec for NullNameCodec {
    fn interface(&self) -> Interface {
        NullNameCodec::interface()
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        plaintext_len
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        encoded_len
    }

    fn encode_name(&self, plaintext: &[u8], _iv: Option<&mut u64>) -> Result<String, NameError> {
        String::from_utf8(plaintext.to_vec()).map_err(|_| NameError::Encode)
    }

    fn decode_name(&self, encoded: &str, _iv: Option<&mut u64>) -> Result<Vec<u8>, NameError> {
        Ok(encoded.as_bytes().to_vec())
    }
}
