//! cloakfs-crypto: the primitive cipher seam of CloakFS
//!
//! The file and name layers consume four capabilities from a cipher:
//! block-mode encode/decode (length-preserving, whole cipher blocks),
//! stream-mode encode/decode (any length), a folded keyed MAC that can
//! thread a 64-bit chain, and random bytes. [`Cipher`] is that seam;
//! [`aes::AesCipher`] is the stock implementation.
//!
//! Per-call IVs are 64-bit values (`block_index ^ file_iv` for content,
//! `mac ^ chained_iv` for names); the implementation widens them to the
//! cipher's IV size with keyed derivation so equal 64-bit IVs map to equal
//! wide IVs under one key only.

pub mod aes;
pub mod cipher;
pub mod key;
pub mod registry;

pub use aes::AesCipher;
pub use cipher::Cipher;
pub use key::{CipherKey, IV_MATERIAL_SIZE, KEY_SIZE};
pub use registry::{CipherRegistry, Interface, Registry};
