//! cloakfs-io: the per-file I/O stack
//!
//! A file's pipeline is built by owned composition, raw backing I/O at
//! the bottom:
//!
//! ```text
//! caller offsets ─▶ [MAC framing]  (optional)
//!                      └▶ [cipher: IV header + block transforms]
//!                            └▶ [raw: pread/pwrite on the backing file]
//! ```
//!
//! The [`block::BlockFileIo`] engine turns arbitrary (offset, length)
//! requests into aligned single-block calls on a [`block::BlockLayer`];
//! the cipher and MAC layers implement that trait and stack through the
//! common [`file_io::FileIo`] capability.

pub mod block;
pub mod cipher_file;
pub mod file_io;
pub mod mac_file;
pub mod pool;
pub mod raw;

pub use block::{BlockFileIo, BlockLayer, HEADER_SIZE};
pub use cipher_file::{CipherFileIo, CipherLayer};
pub use file_io::FileIo;
pub use mac_file::{MacFileIo, MacLayer};
pub use raw::RawFileIo;
