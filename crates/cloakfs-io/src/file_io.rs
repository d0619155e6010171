use std::path::Path;

use nix::fcntl::OFlag;

use cloakfs_core::FsResult;

/// File metadata as the backing OS reports it; layers adjust `st_size`
/// on the way up.
pub type FileStat = libc::stat;

/// The capability every layer of a file's I/O stack exposes.
///
/// Offsets and sizes are in the layer's own address space: the cipher
/// layer hides its IV header from callers, the MAC layer hides its
/// per-block framing. Stacking works because each layer only ever talks
/// to the layer directly below through this same trait.
pub trait FileIo: Send {
    /// Open (or re-open) the backing file. Idempotent; a writable open
    /// satisfies later read-only requests.
    fn open(&mut self, flags: OFlag) -> FsResult<()>;

    fn set_file_name(&mut self, name: &Path);
    fn file_name(&self) -> &Path;

    fn get_attr(&self) -> FsResult<FileStat>;
    fn get_size(&mut self) -> FsResult<u64>;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize>;

    fn truncate(&mut self, size: u64) -> FsResult<()>;

    /// Install the external IV (derived from the name chain). Layers
    /// that store an IV header re-encrypt it; others pass through.
    fn set_iv(&mut self, iv: u64) -> FsResult<()>;

    fn is_writable(&self) -> bool;

    fn sync(&mut self, datasync: bool) -> FsResult<()>;
}
