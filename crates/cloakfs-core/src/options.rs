use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Per-mount options that shape the encryption stack.
///
/// All of these are fixed at mount creation; none may change for the life
/// of the filesystem (the on-disk layout depends on them).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Content block size in bytes. Power-of-two multiple of the cipher
    /// block size.
    pub block_size: usize,

    /// Store a per-file 64-bit IV in an encrypted 8-byte header at
    /// ciphertext offset 0.
    pub unique_iv: bool,

    /// Mix the parent-directory IV into the per-file header encryption
    /// (reseated on rename via `set_iv`).
    pub external_iv_chaining: bool,

    /// Thread a 64-bit IV across path components so identical leaf names
    /// under different parents encrypt differently.
    pub chained_name_iv: bool,

    /// Treat all-zero ciphertext blocks as sparse holes: reads skip
    /// decryption, extension skips zero-fill of whole blocks.
    pub allow_holes: bool,

    /// Truncated per-block HMAC bytes stored ahead of each block (0..=8).
    pub block_mac_bytes: u32,

    /// Random bytes stored after the MAC in each block header.
    pub block_mac_rand_bytes: u32,

    /// Backing storage is plaintext; the application sees ciphertext
    /// views of it. Forces `no_cache`.
    pub reverse_encryption: bool,

    /// Disable the one-block read cache.
    pub no_cache: bool,

    /// Downgrade content MAC mismatches to a logged warning and return
    /// best-effort plaintext.
    pub force_decode: bool,

    /// Disable the idle-timeout auto-unmount.
    pub mount_on_demand: bool,

    /// Externalize encoded names as base32 instead of base64, for
    /// case-insensitive backing filesystems.
    pub case_insensitive: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            block_size: 1024,
            unique_iv: true,
            external_iv_chaining: false,
            chained_name_iv: true,
            allow_holes: true,
            block_mac_bytes: 0,
            block_mac_rand_bytes: 0,
            reverse_encryption: false,
            no_cache: false,
            force_decode: false,
            mount_on_demand: false,
            case_insensitive: false,
        }
    }
}

impl FsOptions {
    /// Check the invariants that do not need the cipher at hand.
    /// Block-size divisibility by the cipher block size is checked where
    /// the stack is assembled.
    pub fn validate(&self) -> FsResult<()> {
        if self.block_size <= 1 {
            return Err(FsError::NotPermitted("block size must exceed one byte"));
        }
        if self.block_mac_bytes > 8 {
            return Err(FsError::NotPermitted("at most 8 MAC bytes per block"));
        }
        if self.reverse_encryption && self.external_iv_chaining {
            return Err(FsError::NotPermitted(
                "external IV chaining is undefined for reverse mounts",
            ));
        }
        Ok(())
    }

    /// Per-block header size under MAC framing.
    pub fn mac_header_bytes(&self) -> usize {
        (self.block_mac_bytes + self.block_mac_rand_bytes) as usize
    }

    /// Payload bytes per block as seen above the MAC layer.
    pub fn data_block_size(&self) -> usize {
        self.block_size - self.mac_header_bytes()
    }

    /// The one-block cache must stay off when the backing data can change
    /// underneath us.
    pub fn cache_disabled(&self) -> bool {
        self.no_cache || self.reverse_encryption
    }
}
