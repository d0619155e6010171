//! The MAC file layer: per-block integrity framing.
//!
//! Each backing block of size B carries a header ahead of the payload:
//!
//! ```text
//! [mac_bytes truncated HMAC][rand_bytes random][payload ≤ B - header]
//! ```
//!
//! The MAC covers everything after itself (random bytes included) and is
//! stored low byte first. Callers above see blocks of `B - header`
//! bytes; the offset maps below translate between the two spaces.

use std::path::Path;
use std::sync::Arc;

use nix::fcntl::OFlag;
use tracing::{debug, warn};

use cloakfs_core::{FsError, FsOptions, FsResult};
use cloakfs_crypto::{Cipher, CipherKey};

use crate::block::{BlockFileIo, BlockLayer};
use crate::file_io::{FileIo, FileStat};
use crate::pool;

/// A full MAC file stack: the block engine over a [`MacLayer`].
pub type MacFileIo<F> = BlockFileIo<MacLayer<F>>;

fn round_up_div(numerator: u64, denominator: u64) -> u64 {
    numerator.div_ceil(denominator)
}

/// Outer (payload-space) offset to backing offset.
pub fn loc_with_header(offset: u64, block_size: u64, header_size: u64) -> u64 {
    offset + round_up_div(offset, block_size - header_size) * header_size
}

/// Backing offset (or size) to outer payload space.
pub fn loc_without_header(offset: u64, block_size: u64, header_size: u64) -> u64 {
    offset.saturating_sub(round_up_div(offset, block_size) * header_size)
}

pub struct MacLayer<F: FileIo> {
    base: F,
    cipher: Arc<dyn Cipher>,
    key: CipherKey,
    mac_bytes: usize,
    rand_bytes: usize,
    warn_only: bool,
    allow_holes: bool,
    block_size: usize,
}

impl<F: FileIo> MacLayer<F> {
    pub fn new(base: F, cipher: Arc<dyn Cipher>, key: CipherKey, opts: &FsOptions) -> Self {
        assert!(opts.block_mac_bytes <= 8);
        debug!(
            block_size = opts.block_size,
            mac_bytes = opts.block_mac_bytes,
            rand_bytes = opts.block_mac_rand_bytes,
            "stacking MAC layer"
        );
        MacLayer {
            base,
            cipher,
            key,
            mac_bytes: opts.block_mac_bytes as usize,
            rand_bytes: opts.block_mac_rand_bytes as usize,
            warn_only: opts.force_decode,
            allow_holes: opts.allow_holes,
            block_size: opts.block_size,
        }
    }

    /// Build the layer wrapped in its block engine; the engine works in
    /// payload-sized blocks.
    pub fn stacked(
        base: F,
        cipher: Arc<dyn Cipher>,
        key: CipherKey,
        opts: &FsOptions,
    ) -> MacFileIo<F> {
        let data_block_size = opts.data_block_size();
        let layer = MacLayer::new(base, cipher, key, opts);
        BlockFileIo::new(
            layer,
            data_block_size,
            opts.allow_holes,
            opts.cache_disabled(),
        )
    }

    fn header_size(&self) -> usize {
        self.mac_bytes + self.rand_bytes
    }
}

impl<F: FileIo> BlockLayer for MacLayer<F> {
    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let header = self.header_size();
        let bs = self.block_size as u64;
        let backing_offset = loc_with_header(offset, bs, header as u64);

        let mut framed = pool::allocate(header + buf.len());
        let read = self.base.read(backing_offset, &mut framed)?;
        if read <= header {
            return Ok(0);
        }

        // an all-zero framed block is a hole; nothing to verify
        let hole = self.allow_holes && framed[..read].iter().all(|&b| b == 0);

        if !hole && self.mac_bytes > 0 {
            let mut mac = self
                .cipher
                .mac_64(&framed[self.mac_bytes..read], &self.key, None);
            for stored in &framed[..self.mac_bytes] {
                let expected = (mac & 0xff) as u8;
                mac >>= 8;
                if expected != *stored {
                    warn!(
                        block = offset / (bs - header as u64),
                        "MAC comparison failure"
                    );
                    if !self.warn_only {
                        return Err(FsError::BadMessage);
                    }
                    break;
                }
            }
        }

        let payload = read - header;
        buf[..payload].copy_from_slice(&framed[header..read]);
        Ok(payload)
    }

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let header = self.header_size();
        let bs = self.block_size as u64;
        let backing_offset = loc_with_header(offset, bs, header as u64);

        let mut framed = pool::allocate(header + data.len());
        framed[..header].fill(0);
        framed[header..].copy_from_slice(data);

        if self.rand_bytes > 0 {
            self.cipher
                .randomize(&mut framed[self.mac_bytes..self.mac_bytes + self.rand_bytes])?;
        }
        if self.mac_bytes > 0 {
            let mut mac = self
                .cipher
                .mac_64(&framed[self.mac_bytes..], &self.key, None);
            for slot in framed[..self.mac_bytes].iter_mut() {
                *slot = (mac & 0xff) as u8;
                mac >>= 8;
            }
        }

        self.base.write(backing_offset, &framed)?;
        Ok(data.len())
    }

    fn layer_size(&mut self) -> FsResult<u64> {
        let size = self.base.get_size()?;
        if size == 0 {
            return Ok(0);
        }
        Ok(loc_without_header(
            size,
            self.block_size as u64,
            self.header_size() as u64,
        ))
    }

    fn truncate_backing(&mut self, size: u64) -> FsResult<()> {
        self.base.truncate(size)
    }

    fn finalize_truncate(&mut self, outer_size: u64) -> FsResult<()> {
        self.base.truncate(loc_with_header(
            outer_size,
            self.block_size as u64,
            self.header_size() as u64,
        ))
    }

    fn open(&mut self, flags: OFlag) -> FsResult<()> {
        self.base.open(flags)
    }

    fn set_file_name(&mut self, name: &Path) {
        self.base.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.base.file_name()
    }

    fn get_attr(&self) -> FsResult<FileStat> {
        let mut st = self.base.get_attr()?;
        if (st.st_mode & libc::S_IFMT) == libc::S_IFREG && st.st_size > 0 {
            st.st_size = loc_without_header(
                st.st_size as u64,
                self.block_size as u64,
                self.header_size() as u64,
            ) as i64;
        }
        Ok(st)
    }

    fn set_iv(&mut self, iv: u64) -> FsResult<()> {
        self.base.set_iv(iv)
    }

    fn is_writable(&self) -> bool {
        self.base.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> FsResult<()> {
        self.base.sync(datasync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_io::FileIo;
    use crate::raw::RawFileIo;
    use cloakfs_crypto::AesCipher;
    use std::fs;

    fn test_key() -> CipherKey {
        let mut bytes = [0u8; 48];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        CipherKey::from_bytes(bytes)
    }

    fn mac_opts() -> FsOptions {
        FsOptions {
            unique_iv: false,
            block_mac_bytes: 8,
            block_mac_rand_bytes: 0,
            allow_holes: false,
            ..FsOptions::default()
        }
    }

    fn stack(path: &std::path::Path, opts: &FsOptions) -> MacFileIo<RawFileIo> {
        MacLayer::stacked(
            RawFileIo::new(path),
            Arc::new(AesCipher::new()),
            test_key(),
            opts,
        )
    }

    #[test]
    fn offset_maps_invert() {
        for (bs, h) in [(1024u64, 8u64), (1024, 12), (4096, 8)] {
            for outer in [0u64, 1, bs - h - 1, bs - h, 2 * (bs - h) + 17, 10_000] {
                let backing = loc_with_header(outer, bs, h);
                assert_eq!(loc_without_header(backing, bs, h), outer, "bs={bs} h={h}");
            }
        }
    }

    #[test]
    fn framed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let opts = mac_opts();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();

        let data: Vec<u8> = (0..2500).map(|i| (i % 249) as u8).collect();
        io.write(0, &data).unwrap();
        assert_eq!(io.get_size().unwrap(), 2500);

        // backing carries 8 header bytes per 1016-byte payload block
        let backing = fs::metadata(&path).unwrap().len();
        assert_eq!(backing, loc_with_header(2500, 1024, 8));

        let mut back = vec![0u8; 2500];
        assert_eq!(io.read(0, &mut back).unwrap(), 2500);
        assert_eq!(back, data);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let opts = mac_opts();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &vec![0x55u8; 2000]).unwrap();
        drop(io);

        // flip one payload byte inside the second framed block
        let mut raw = fs::read(&path).unwrap();
        let victim = 1024 + 8 + 100;
        raw[victim] ^= 0x01;
        fs::write(&path, &raw).unwrap();

        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDONLY).unwrap();

        let mut buf = vec![0u8; 1016];
        assert_eq!(io.read(0, &mut buf).unwrap(), 1016);

        let err = io.read(1016, &mut buf).unwrap_err();
        assert_eq!(err.errno(), libc::EBADMSG);
    }

    #[test]
    fn force_decode_downgrades_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let opts = mac_opts();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &vec![0x66u8; 500]).unwrap();
        drop(io);

        let mut raw = fs::read(&path).unwrap();
        raw[20] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let forced = FsOptions {
            force_decode: true,
            ..mac_opts()
        };
        let mut io = stack(&path, &forced);
        io.open(OFlag::O_RDONLY).unwrap();

        let mut buf = vec![0u8; 500];
        assert_eq!(io.read(0, &mut buf).unwrap(), 500);
    }

    #[test]
    fn random_bytes_change_identical_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        fs::File::create(&path_a).unwrap();
        fs::File::create(&path_b).unwrap();

        let opts = FsOptions {
            unique_iv: false,
            block_mac_bytes: 8,
            block_mac_rand_bytes: 4,
            allow_holes: false,
            ..FsOptions::default()
        };

        let payload = vec![0x11u8; 600];
        for path in [&path_a, &path_b] {
            let mut io = stack(path, &opts);
            io.open(OFlag::O_RDWR).unwrap();
            io.write(0, &payload).unwrap();
        }

        // same payload, different random header bytes
        assert_ne!(fs::read(&path_a).unwrap(), fs::read(&path_b).unwrap());

        let mut io = stack(&path_a, &opts);
        io.open(OFlag::O_RDONLY).unwrap();
        let mut back = vec![0u8; 600];
        assert_eq!(io.read(0, &mut back).unwrap(), 600);
        assert_eq!(back, payload);
    }

    #[test]
    fn holes_skip_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let opts = FsOptions {
            unique_iv: false,
            block_mac_bytes: 8,
            allow_holes: true,
            ..FsOptions::default()
        };
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();

        // leaves blocks 0..4 as unwritten holes
        io.write(5000, &[0x99u8; 64]).unwrap();

        let mut head = vec![0xAAu8; 1016];
        assert_eq!(io.read(0, &mut head).unwrap(), 1016);
        assert!(head.iter().all(|&b| b == 0));

        let mut tail = [0u8; 64];
        assert_eq!(io.read(5000, &mut tail).unwrap(), 64);
        assert_eq!(tail, [0x99u8; 64]);
    }

    #[test]
    fn truncate_translates_backing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let opts = mac_opts();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &vec![3u8; 3000]).unwrap();

        io.truncate(1500).unwrap();
        assert_eq!(io.get_size().unwrap(), 1500);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            loc_with_header(1500, 1024, 8)
        );

        let mut back = vec![0u8; 1500];
        assert_eq!(io.read(0, &mut back).unwrap(), 1500);
        assert!(back.iter().all(|&b| b == 3));
    }
}
