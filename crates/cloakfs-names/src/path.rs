//! Path-level encoding: component-by-component codec application with an
//! IV threaded from the root.
//!
//! With chaining on, component i's MAC feeds the IV for component i+1, so
//! the same leaf name under different parents produces different
//! ciphertext. The root is the empty path and starts the chain at 0.

use std::sync::Arc;

use cloakfs_core::NameError;

use crate::codec::NameCodec;

pub struct PathCodec {
    codec: Arc<dyn NameCodec>,
    chained: bool,
}

impl PathCodec {
    pub fn new(codec: Arc<dyn NameCodec>, chained_name_iv: bool) -> Self {
        PathCodec {
            codec,
            chained: chained_name_iv,
        }
    }

    /// Whether sibling encodings depend on ancestor names (and therefore
    /// whether directory renames must re-encode the whole subtree).
    pub fn chained(&self) -> bool {
        self.chained
    }

    pub fn codec(&self) -> &Arc<dyn NameCodec> {
        &self.codec
    }

    pub fn encode_path(&self, path: &str) -> Result<String, NameError> {
        let mut iv = 0;
        self.encode_path_iv(path, &mut iv)
    }

    /// Encode a path and leave the directory IV of the *last* component's
    /// parent chain in `iv` (what a subsequent child encode would start
    /// from).
    pub fn encode_path_iv(&self, path: &str, iv: &mut u64) -> Result<String, NameError> {
        let mut out = String::new();
        let mut first = true;
        for component in path.split('/') {
            if !first {
                out.push('/');
            }
            first = false;
            if component.is_empty() {
                continue;
            }
            out.push_str(&self.encode_name_iv(component.as_bytes(), iv)?);
        }
        Ok(out)
    }

    pub fn decode_path(&self, path: &str) -> Result<String, NameError> {
        let mut iv = 0;
        self.decode_path_iv(path, &mut iv)
    }

    pub fn decode_path_iv(&self, path: &str, iv: &mut u64) -> Result<String, NameError> {
        let mut out = String::new();
        let mut first = true;
        for component in path.split('/') {
            if !first {
                out.push('/');
            }
            first = false;
            if component.is_empty() {
                continue;
            }
            let plain = self.decode_name_iv(component, iv)?;
            out.push_str(std::str::from_utf8(&plain).map_err(|_| NameError::BadEncoding)?);
        }
        Ok(out)
    }

    /// Encode one component, advancing `iv` when chaining is on.
    pub fn encode_name_iv(&self, name: &[u8], iv: &mut u64) -> Result<String, NameError> {
        if self.chained {
            self.codec.encode_name(name, Some(iv))
        } else {
            self.codec.encode_name(name, None)
        }
    }

    /// Decode one component, advancing `iv` when chaining is on.
    pub fn decode_name_iv(&self, encoded: &str, iv: &mut u64) -> Result<Vec<u8>, NameError> {
        if self.chained {
            self.codec.decode_name(encoded, Some(iv))
        } else {
            self.codec.decode_name(encoded, None)
        }
    }

    /// Encode a single name in isolation (no chain participation).
    pub fn encode_name(&self, name: &[u8]) -> Result<String, NameError> {
        self.codec.encode_name(name, None)
    }

    /// Decode a single name in isolation.
    pub fn decode_name(&self, encoded: &str) -> Result<Vec<u8>, NameError> {
        self.codec.decode_name(encoded, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockNameCodec;
    use crate::null::NullNameCodec;
    use crate::stream::StreamNameCodec;
    use cloakfs_crypto::{AesCipher, CipherKey};

    fn chained_block() -> PathCodec {
        PathCodec::new(
            Arc::new(BlockNameCodec::new(
                Arc::new(AesCipher::new()),
                CipherKey::random(),
                false,
            )),
            true,
        )
    }

    #[test]
    fn roundtrip_all_codecs() {
        let cipher: Arc<dyn cloakfs_crypto::Cipher> = Arc::new(AesCipher::new());
        let key = CipherKey::random();
        let codecs: Vec<Arc<dyn NameCodec>> = vec![
            Arc::new(NullNameCodec::new()),
            Arc::new(StreamNameCodec::new(cipher.clone(), key.clone())),
            Arc::new(BlockNameCodec::new(cipher.clone(), key.clone(), false)),
            Arc::new(BlockNameCodec::new(cipher, key, true)),
        ];

        for codec in codecs {
            for chained in [false, true] {
                let paths = PathCodec::new(codec.clone(), chained);
                for path in ["a", "/a", "a/b/c", "/deep/nested/path/file.txt", "/"] {
                    let encoded = paths.encode_path(path).unwrap();
                    assert_eq!(
                        paths.decode_path(&encoded).unwrap(),
                        path,
                        "chained={chained} path={path}"
                    );
                }
            }
        }
    }

    #[test]
    fn leading_slash_shape_is_preserved() {
        let paths = chained_block();
        let encoded = paths.encode_path("/a/b").unwrap();
        assert!(encoded.starts_with('/'));
        assert_eq!(encoded.matches('/').count(), 2);
    }

    #[test]
    fn same_leaf_under_different_parents_differs() {
        let paths = chained_block();
        let under_a = paths.encode_path("parent-a/leaf").unwrap();
        let under_b = paths.encode_path("parent-b/leaf").unwrap();

        let leaf_a = under_a.rsplit('/').next().unwrap();
        let leaf_b = under_b.rsplit('/').next().unwrap();
        assert_ne!(leaf_a, leaf_b);
    }

    #[test]
    fn unchained_leaf_is_parent_independent() {
        let cipher: Arc<dyn cloakfs_crypto::Cipher> = Arc::new(AesCipher::new());
        let key = CipherKey::random();
        let paths = PathCodec::new(
            Arc::new(BlockNameCodec::new(cipher, key, false)),
            false,
        );
        let under_a = paths.encode_path("parent-a/leaf").unwrap();
        let under_b = paths.encode_path("parent-b/leaf").unwrap();
        assert_eq!(
            under_a.rsplit('/').next().unwrap(),
            under_b.rsplit('/').next().unwrap()
        );
    }

    #[test]
    fn encode_iv_output_matches_child_decode() {
        let paths = chained_block();

        // IV left by encoding the parent must decode a child encoded
        // under the full path
        let mut parent_iv = 0u64;
        paths.encode_path_iv("a/b", &mut parent_iv).unwrap();

        let full = paths.encode_path("a/b/leaf").unwrap();
        let leaf_cipher = full.rsplit('/').next().unwrap();

        let mut child_iv = parent_iv;
        assert_eq!(
            paths.decode_name_iv(leaf_cipher, &mut child_iv).unwrap(),
            b"leaf"
        );
    }

    #[test]
    fn corrupt_component_fails_whole_path() {
        let paths = chained_block();
        let encoded = paths.encode_path("a/b").unwrap();
        let corrupted = encoded.replace('/', "/Q");
        assert!(paths.decode_path(&corrupted).is_err());
    }
}
