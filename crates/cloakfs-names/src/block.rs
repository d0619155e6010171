//! Block codec: pads names to whole cipher blocks before encryption.
//!
//! ```text
//! [mac hi][mac lo][block-ciphered (name || pad bytes)]
//!   pad byte value = pad count; an aligned name gets a full extra block
//! → 8→6 repack + base64, or 8→5 repack + base32 when case-insensitive
//! ```

use std::sync::Arc;

use tracing::debug;

use cloakfs_core::NameError;
use cloakfs_crypto::{Cipher, CipherKey, Interface};

use crate::base;
use crate::codec::NameCodec;

pub struct BlockNameCodec {
    cipher: Arc<dyn Cipher>,
    key: CipherKey,
    block_size: usize,
    case_insensitive: bool,
}

impl BlockNameCodec {
    pub fn new(cipher: Arc<dyn Cipher>, key: CipherKey, case_insensitive: bool) -> Self {
        let block_size = cipher.cipher_block_size();
        debug_assert!(block_size < 128, "pad bytes must fit in a byte");
        BlockNameCodec {
            cipher,
            key,
            block_size,
            case_insensitive,
        }
    }

    pub fn interface(case_insensitive: bool) -> Interface {
        if case_insensitive {
            Interface::new("nameio/block32", 4, 0, 2)
        } else {
            Interface::new("nameio/block", 4, 0, 2)
        }
    }

    fn externalize(&self, framed: &[u8]) -> String {
        if self.case_insensitive {
            base::b32_to_ascii(&base::change_base(framed, 8, 5, true))
        } else {
            base::b64_to_ascii(&base::change_base(framed, 8, 6, true))
        }
    }

    fn internalize(&self, encoded: &str) -> Result<Vec<u8>, NameError> {
        if self.case_insensitive {
            Ok(base::change_base(&base::ascii_to_b32(encoded)?, 5, 8, false))
        } else {
            Ok(base::change_base(&base::ascii_to_b64(encoded)?, 6, 8, false))
        }
    }
}

impl NameCodec for BlockNameCodec {
    fn interface(&self) -> Interface {
        BlockNameCodec::interface(self.case_insensitive)
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        let num_blocks = (plaintext_len + self.block_size) / self.block_size;
        let framed_len = num_blocks * self.block_size + 2;
        if self.case_insensitive {
            base::b256_to_b32_len(framed_len)
        } else {
            base::b256_to_b64_len(framed_len)
        }
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        let framed_len = if self.case_insensitive {
            base::b32_to_b256_len(encoded_len)
        } else {
            base::b64_to_b256_len(encoded_len)
        };
        framed_len.saturating_sub(2)
    }

    fn encode_name(&self, plaintext: &[u8], iv: Option<&mut u64>) -> Result<String, NameError> {
        // always at least one pad byte; aligned names get a whole block
        let mut padding = self.block_size - plaintext.len() % self.block_size;
        if padding == 0 {
            padding = self.block_size;
        }

        let mut framed = Vec::with_capacity(2 + plaintext.len() + padding);
        framed.extend_from_slice(&[0, 0]);
        framed.extend_from_slice(plaintext);
        framed.resize(2 + plaintext.len() + padding, padding as u8);

        let chained_iv = iv.as_deref().copied().unwrap_or(0);
        let mac = self.cipher.mac_16(&framed[2..], &self.key, iv);
        framed[0] = (mac >> 8) as u8;
        framed[1] = mac as u8;

        self.cipher
            .block_encode(&mut framed[2..], u64::from(mac) ^ chained_iv, &self.key)
            .map_err(|_| NameError::Encode)?;

        Ok(self.externalize(&framed))
    }

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<Vec<u8>, NameError> {
        let framed_len = if self.case_insensitive {
            base::b32_to_b256_len(encoded.len())
        } else {
            base::b64_to_b256_len(encoded.len())
        };
        let stream_len = framed_len.saturating_sub(2);
        if stream_len < self.block_size {
            debug!(name = encoded, "rejecting undersized filename");
            return Err(NameError::TooSmall);
        }

        let bytes = self.internalize(encoded)?;
        let mac = (u16::from(bytes[0]) << 8) | u16::from(bytes[1]);
        let chained_iv = iv.as_deref().copied().unwrap_or(0);

        let mut work = bytes[2..2 + stream_len].to_vec();
        self.cipher
            .block_decode(&mut work, u64::from(mac) ^ chained_iv, &self.key)
            .map_err(|_| NameError::BlockDecode)?;

        let padding = work[stream_len - 1] as usize;
        if padding > self.block_size || padding > stream_len {
            debug!(padding, block_size = self.block_size, "invalid name padding");
            return Err(NameError::BadPadding);
        }
        let final_len = stream_len - padding;

        let mac2 = self.cipher.mac_16(&work, &self.key, iv);
        if mac2 != mac {
            debug!(expected = mac, got = mac2, len = final_len, "name checksum mismatch");
            return Err(NameError::ChecksumMismatch);
        }

        work.truncate(final_len);
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakfs_crypto::AesCipher;

    fn codec(case_insensitive: bool) -> BlockNameCodec {
        BlockNameCodec::new(Arc::new(AesCipher::new()), CipherKey::random(), case_insensitive)
    }

    #[test]
    fn roundtrip_base64() {
        let codec = codec(false);
        for name in [
            &b"a"[..],
            b"notes.txt",
            b"exactly-16-bytes",
            b"a name well past one cipher block in length",
        ] {
            let encoded = codec.encode_name(name, None).unwrap();
            assert!(encoded.len() <= codec.max_encoded_len(name.len()));
            assert_eq!(codec.decode_name(&encoded, None).unwrap(), name, "{encoded}");
        }
    }

    #[test]
    fn roundtrip_base32() {
        let codec = codec(true);
        let encoded = codec.encode_name(b"mixed-Case.file", None).unwrap();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert_eq!(codec.decode_name(&encoded, None).unwrap(), b"mixed-Case.file");
        // survives a case-mangling backing store
        assert_eq!(
            codec.decode_name(&encoded.to_lowercase(), None).unwrap(),
            b"mixed-Case.file"
        );
    }

    #[test]
    fn aligned_name_gets_full_pad_block() {
        let codec = codec(false);
        let name = [0x61u8; 16]; // one cipher block exactly
        let encoded = codec.encode_name(&name, None).unwrap();
        // framed = 2 + 16 + 16 pad
        assert_eq!(encoded.len(), base::b256_to_b64_len(34));
        assert_eq!(codec.decode_name(&encoded, None).unwrap(), name);
    }

    #[test]
    fn chained_iv_roundtrip_and_divergence() {
        let codec = codec(false);
        let (mut enc_iv, mut dec_iv) = (77u64, 77u64);
        let encoded = codec.encode_name(b"leaf", Some(&mut enc_iv)).unwrap();
        assert_eq!(codec.decode_name(&encoded, Some(&mut dec_iv)).unwrap(), b"leaf");
        assert_eq!(enc_iv, dec_iv);

        let mut other_iv = 78u64;
        let other = codec.encode_name(b"leaf", Some(&mut other_iv)).unwrap();
        assert_ne!(encoded, other);
    }

    #[test]
    fn undersized_name_rejected() {
        let codec = codec(false);
        assert_eq!(codec.decode_name("AAAA", None), Err(NameError::TooSmall));
    }

    #[test]
    fn corruption_detected() {
        let codec = codec(false);
        let encoded = codec.encode_name(b"target", None).unwrap();
        let mut chars: Vec<char> = encoded.chars().collect();
        let i = chars.len() - 1;
        chars[i] = if chars[i] == 'z' { 'y' } else { 'z' };
        let corrupted: String = chars.into_iter().collect();
        assert!(codec.decode_name(&corrupted, None).is_err());
    }
}
