//! Stream codec: shortest possible encoded names.
//!
//! ```text
//! [mac hi][mac lo][stream-ciphered name]  → 8→6 repack → base64 alphabet
//! ```

use std::sync::Arc;

use tracing::debug;

use cloakfs_core::NameError;
use cloakfs_crypto::{Cipher, CipherKey, Interface};

use crate::base;
use crate::codec::NameCodec;

pub struct StreamNameCodec {
    cipher: Arc<dyn Cipher>,
    key: CipherKey,
}

impl StreamNameCodec {
    pub fn new(cipher: Arc<dyn Cipher>, key: CipherKey) -> Self {
        StreamNameCodec { cipher, key }
    }

    pub fn interface() -> Interface {
        Interface::new("nameio/stream", 2, 1, 2)
    }
}

impl NameCodec for StreamNameCodec {
    fn interface(&self) -> Interface {
        StreamNameCodec::interface()
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        base::b256_to_b64_len(plaintext_len + 2)
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        base::b64_to_b256_len(encoded_len).saturating_sub(2)
    }

    fn encode_name(&self, plaintext: &[u8], iv: Option<&mut u64>) -> Result<String, NameError> {
        let chained_iv = iv.as_deref().copied().unwrap_or(0);
        let mac = self.cipher.mac_16(plaintext, &self.key, iv);

        let mut buf = Vec::with_capacity(plaintext.len() + 2);
        buf.push((mac >> 8) as u8);
        buf.push(mac as u8);
        buf.extend_from_slice(plaintext);

        self.cipher
            .stream_encode(&mut buf[2..], u64::from(mac) ^ chained_iv, &self.key)
            .map_err(|_| NameError::Encode)?;

        let six = base::change_base(&buf, 8, 6, true);
        Ok(base::b64_to_ascii(&six))
    }

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<Vec<u8>, NameError> {
        let decoded_len = base::b64_to_b256_len(encoded.len());
        if decoded_len <= 2 {
            return Err(NameError::TooSmall);
        }

        let six = base::ascii_to_b64(encoded)?;
        let bytes = base::change_base(&six, 6, 8, false);
        debug_assert_eq!(bytes.len(), decoded_len);

        let mac = (u16::from(bytes[0]) << 8) | u16::from(bytes[1]);
        let chained_iv = iv.as_deref().copied().unwrap_or(0);

        let mut plaintext = bytes[2..].to_vec();
        self.cipher
            .stream_decode(&mut plaintext, u64::from(mac) ^ chained_iv, &self.key)
            .map_err(|_| NameError::BlockDecode)?;

        let mac2 = self.cipher.mac_16(&plaintext, &self.key, iv);
        if mac2 != mac {
            debug!(expected = mac, got = mac2, len = plaintext.len(), "name checksum mismatch");
            return Err(NameError::ChecksumMismatch);
        }

        Ok(plaintext)
    }
}
