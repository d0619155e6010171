//! cloakfs-names: plaintext-name ↔ ciphertext-name codecs
//!
//! Encoded name layout (stream and block codecs):
//!
//! ```text
//! [2 bytes: MAC of the plaintext][ciphertext of the name]
//!   └ cipher IV = MAC ^ chained directory IV
//! then repack 8-bit bytes into 6-bit (base64) or 5-bit (base32) symbols
//! ```
//!
//! The 16-bit MAC doubles as a decode checksum and, through the chain
//! slot, as the link that makes a component's encryption depend on its
//! ancestors (see [`path::PathCodec`]).

pub mod base;
pub mod block;
pub mod codec;
pub mod null;
pub mod path;
pub mod stream;

pub use block::BlockNameCodec;
pub use codec::NameCodec;
pub use null::NullNameCodec;
pub use path::PathCodec;
pub use stream::StreamNameCodec;

use std::sync::Arc;

use cloakfs_crypto::Registry;

/// A registry holding the stock codecs: Null, Stream, Block and the
/// case-insensitive Block32.
pub fn default_codec_registry() -> Registry<Arc<dyn NameCodec>> {
    let mut reg: Registry<Arc<dyn NameCodec>> = Registry::new();

    reg.register(
        "Null",
        "No encryption of filenames",
        NullNameCodec::interface(),
        Box::new(|_iface, _cipher, _key| Arc::new(NullNameCodec::new()) as Arc<dyn NameCodec>),
    );
    reg.register(
        "Stream",
        "Stream encoding, keeps filenames as short as possible",
        StreamNameCodec::interface(),
        Box::new(|_iface, cipher, key| {
            Arc::new(StreamNameCodec::new(cipher, key)) as Arc<dyn NameCodec>
        }),
    );
    reg.register(
        "Block",
        "Block encoding, hides filename size somewhat",
        BlockNameCodec::interface(false),
        Box::new(|_iface, cipher, key| {
            Arc::new(BlockNameCodec::new(cipher, key, false)) as Arc<dyn NameCodec>
        }),
    );
    reg.register(
        "Block32",
        "Block encoding with base32 output for case-insensitive systems",
        BlockNameCodec::interface(true),
        Box::new(|_iface, cipher, key| {
            Arc::new(BlockNameCodec::new(cipher, key, true)) as Arc<dyn NameCodec>
        }),
    );

    reg
}
