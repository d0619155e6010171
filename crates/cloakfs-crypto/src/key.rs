//! Key material: a symmetric key plus IV-derivation material, zeroized on
//! drop.

use rand::RngCore;
use zeroize::Zeroize;

/// Symmetric key bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// Extra bytes mixed into per-call IV derivation so two mounts with equal
/// 64-bit IVs still diverge.
pub const IV_MATERIAL_SIZE: usize = 16;

/// A mount key: encryption key and IV material in one buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE + IV_MATERIAL_SIZE],
}

impl CipherKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE + IV_MATERIAL_SIZE]) -> Self {
        CipherKey { bytes }
    }

    /// A fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE + IV_MATERIAL_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        CipherKey { bytes }
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE]
    }

    pub fn iv_material(&self) -> &[u8] {
        &self.bytes[KEY_SIZE..]
    }

    /// The whole buffer, for MAC keying.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
