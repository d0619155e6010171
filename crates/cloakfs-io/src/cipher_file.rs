//! The cipher file layer: per-file IV header plus block/stream content
//! transforms.
//!
//! Forward layout with the unique-IV header:
//!
//! ```text
//! [0..8)    file IV, stream-ciphered under the external IV
//! [8..8+B)  block 0, transformed with IV = 0 ^ file_iv
//! [8+B..)   block 1, IV = 1 ^ file_iv, ...
//! ```
//!
//! Full blocks use the block transform, tail blocks the stream transform.
//! Reverse mode inverts direction (encrypt on read, decrypt on write) and
//! derives the file IV from the backing inode so the ciphertext view is
//! stable across runs; writes there are refused.

use std::path::Path;
use std::sync::Arc;

use nix::fcntl::OFlag;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use cloakfs_core::{FsError, FsOptions, FsResult};
use cloakfs_crypto::{Cipher, CipherKey};

use crate::block::{BlockFileIo, BlockLayer, HEADER_SIZE};
use crate::file_io::{FileIo, FileStat};
use crate::pool;

/// A full cipher file stack: the block engine over a [`CipherLayer`].
pub type CipherFileIo<F> = BlockFileIo<CipherLayer<F>>;

pub struct CipherLayer<F: FileIo> {
    base: F,
    cipher: Arc<dyn Cipher>,
    key: CipherKey,
    block_size: usize,
    have_header: bool,
    reverse: bool,
    allow_holes: bool,
    external_iv: u64,
    file_iv: u64,
    last_flags: OFlag,
}

impl<F: FileIo> CipherLayer<F> {
    pub fn new(base: F, cipher: Arc<dyn Cipher>, key: CipherKey, opts: &FsOptions) -> Self {
        assert_eq!(
            opts.block_size % cipher.cipher_block_size(),
            0,
            "fs block size must be a multiple of the cipher block size"
        );
        CipherLayer {
            base,
            cipher,
            key,
            block_size: opts.block_size,
            have_header: opts.unique_iv,
            reverse: opts.reverse_encryption,
            allow_holes: opts.allow_holes,
            external_iv: 0,
            file_iv: 0,
            last_flags: OFlag::O_RDONLY,
        }
    }

    /// Build the layer wrapped in its block engine.
    pub fn stacked(
        base: F,
        cipher: Arc<dyn Cipher>,
        key: CipherKey,
        opts: &FsOptions,
    ) -> CipherFileIo<F> {
        let block_size = opts.block_size;
        let layer = CipherLayer::new(base, cipher, key, opts);
        BlockFileIo::new(layer, block_size, opts.allow_holes, opts.cache_disabled())
    }

    pub fn file_iv(&self) -> u64 {
        self.file_iv
    }

    /// Load or create the 8-byte IV header. After success the file IV is
    /// guaranteed non-zero.
    fn init_header(&mut self) -> FsResult<()> {
        let raw_size = self.base.get_size()?;
        if raw_size >= HEADER_SIZE {
            debug!(raw_size, "reading existing IV header");

            let mut buf = [0u8; HEADER_SIZE as usize];
            let read = self.base.read(0, &mut buf)?;
            if read < buf.len() {
                return Err(FsError::BadMessage);
            }
            self.cipher
                .stream_decode(&mut buf, self.external_iv, &self.key)
                .map_err(|_| FsError::BadMessage)?;

            self.file_iv = u64::from_be_bytes(buf);
            if self.file_iv == 0 {
                return Err(FsError::BadMessage);
            }
        } else {
            debug!("creating new file IV header");

            let mut buf = [0u8; HEADER_SIZE as usize];
            loop {
                self.cipher.randomize(&mut buf)?;
                self.file_iv = u64::from_be_bytes(buf);
                if self.file_iv != 0 {
                    break;
                }
                warn!("randomize returned 8 null bytes, retrying");
            }

            if self.base.is_writable() {
                self.cipher
                    .stream_encode(&mut buf, self.external_iv, &self.key)
                    .map_err(|_| FsError::BadMessage)?;
                self.base.write(0, &buf)?;
            } else {
                debug!("base not writable, IV header not written");
            }
        }
        Ok(())
    }

    /// Re-encrypt the current file IV under the current external IV.
    fn write_header(&mut self) -> FsResult<()> {
        debug_assert_ne!(self.file_iv, 0, "file IV must be initialized first");

        let mut buf = self.file_iv.to_be_bytes();
        self.cipher
            .stream_encode(&mut buf, self.external_iv, &self.key)
            .map_err(|_| FsError::BadMessage)?;
        self.base.write(0, &buf)?;
        Ok(())
    }

    /// The reverse-mode header: SHA-1 of the backing inode, truncated,
    /// encrypted under the external IV. Deterministic so reverse output
    /// is stable across runs.
    fn reverse_header(&mut self) -> FsResult<[u8; HEADER_SIZE as usize]> {
        let st = self.base.get_attr()?;
        let ino = st.st_ino;
        debug_assert_ne!(ino, 0);

        let digest = Sha1::digest(ino.to_le_bytes());
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf.copy_from_slice(&digest[..HEADER_SIZE as usize]);

        self.file_iv = u64::from_be_bytes(buf);
        self.cipher
            .stream_encode(&mut buf, self.external_iv, &self.key)
            .map_err(|_| FsError::BadMessage)?;
        Ok(buf)
    }

    fn ensure_header(&mut self) -> FsResult<()> {
        if self.have_header && self.file_iv == 0 {
            if self.reverse {
                self.reverse_header()?;
            } else {
                self.init_header()?;
            }
        }
        Ok(())
    }

    fn block_read(&self, buf: &mut [u8], iv: u64) -> FsResult<()> {
        if self.reverse {
            return self
                .cipher
                .block_encode(buf, iv, &self.key)
                .map_err(|_| FsError::BadMessage);
        }
        if self.allow_holes && buf.iter().all(|&b| b == 0) {
            // an all-zero ciphertext block is a hole: it reads as zeros
            return Ok(());
        }
        self.cipher
            .block_decode(buf, iv, &self.key)
            .map_err(|_| FsError::BadMessage)
    }

    fn stream_read(&self, buf: &mut [u8], iv: u64) -> FsResult<()> {
        let res = if self.reverse {
            self.cipher.stream_encode(buf, iv, &self.key)
        } else {
            self.cipher.stream_decode(buf, iv, &self.key)
        };
        res.map_err(|_| FsError::BadMessage)
    }

    fn block_write(&self, buf: &mut [u8], iv: u64) -> FsResult<()> {
        let res = if self.reverse {
            self.cipher.block_decode(buf, iv, &self.key)
        } else {
            self.cipher.block_encode(buf, iv, &self.key)
        };
        res.map_err(|_| FsError::BadMessage)
    }

    fn stream_write(&self, buf: &mut [u8], iv: u64) -> FsResult<()> {
        let res = if self.reverse {
            self.cipher.stream_decode(buf, iv, &self.key)
        } else {
            self.cipher.stream_encode(buf, iv, &self.key)
        };
        res.map_err(|_| FsError::BadMessage)
    }
}

impl<F: FileIo> BlockLayer for CipherLayer<F> {
    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let bs = self.block_size;
        let block_num = offset / bs as u64;

        let backing_offset = if self.have_header && !self.reverse {
            offset + HEADER_SIZE
        } else {
            offset
        };

        let read = self.base.read(backing_offset, buf)?;
        if read == 0 {
            debug!(offset, "read size zero");
            return Ok(0);
        }

        self.ensure_header()?;
        let iv = block_num ^ self.file_iv;

        let result = if read != bs {
            debug!(read, "stream read of tail block");
            self.stream_read(&mut buf[..read], iv)
        } else {
            self.block_read(&mut buf[..read], iv)
        };
        if let Err(e) = result {
            debug!(block = block_num, size = read, "block decode failed");
            return Err(e);
        }

        Ok(read)
    }

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if self.have_header && self.reverse {
            debug!("writing to a reverse mount with per-file IVs is not implemented");
            return Err(FsError::NotPermitted(
                "write to reverse mount with per-file IVs",
            ));
        }

        let bs = self.block_size;
        let block_num = offset / bs as u64;

        if self.have_header && self.file_iv == 0 {
            self.init_header()?;
        }
        let iv = block_num ^ self.file_iv;

        let mut buf = pool::allocate(data.len());
        buf.copy_from_slice(data);

        let result = if data.len() != bs {
            self.stream_write(&mut buf, iv)
        } else {
            self.block_write(&mut buf, iv)
        };
        if let Err(e) = result {
            debug!(block = block_num, size = data.len(), "block encode failed");
            return Err(e);
        }

        let backing_offset = if self.have_header {
            offset + HEADER_SIZE
        } else {
            offset
        };
        self.base.write(backing_offset, &buf)
    }

    fn layer_size(&mut self) -> FsResult<u64> {
        let size = self.base.get_size()?;
        if self.have_header && !self.reverse && size > 0 {
            if size < HEADER_SIZE {
                return Err(FsError::BadMessage);
            }
            return Ok(size - HEADER_SIZE);
        }
        Ok(size)
    }

    fn reported_size(&mut self) -> FsResult<u64> {
        let size = self.layer_size()?;
        if self.have_header && self.reverse && size > 0 {
            return Ok(size + HEADER_SIZE);
        }
        Ok(size)
    }

    fn virtual_header(&mut self) -> FsResult<Option<[u8; HEADER_SIZE as usize]>> {
        if self.have_header && self.reverse {
            return Ok(Some(self.reverse_header()?));
        }
        Ok(None)
    }

    fn prepare_truncate(&mut self) -> FsResult<()> {
        if self.reverse {
            return Err(FsError::NotPermitted("truncate on a reverse mount"));
        }
        if self.have_header && self.file_iv == 0 {
            self.init_header()?;
        }
        Ok(())
    }

    fn truncate_direct(&self) -> bool {
        !self.have_header
    }

    fn truncate_backing(&mut self, size: u64) -> FsResult<()> {
        self.base.truncate(size)
    }

    fn finalize_truncate(&mut self, outer_size: u64) -> FsResult<()> {
        if self.have_header {
            return self.base.truncate(outer_size + HEADER_SIZE);
        }
        Ok(())
    }

    fn open(&mut self, flags: OFlag) -> FsResult<()> {
        self.base.open(flags)?;
        self.last_flags = flags;
        Ok(())
    }

    fn set_file_name(&mut self, name: &Path) {
        self.base.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.base.file_name()
    }

    fn get_attr(&self) -> FsResult<FileStat> {
        let mut st = self.base.get_attr()?;

        let is_reg = (st.st_mode & libc::S_IFMT) == libc::S_IFREG;
        if self.have_header && is_reg && st.st_size > 0 {
            if !self.reverse {
                if (st.st_size as u64) < HEADER_SIZE {
                    return Err(FsError::BadMessage);
                }
                st.st_size -= HEADER_SIZE as i64;
            } else {
                st.st_size += HEADER_SIZE as i64;
            }
        }
        Ok(st)
    }

    fn set_iv(&mut self, iv: u64) -> FsResult<()> {
        debug!(
            have_header = self.have_header,
            "installing external IV on cipher layer"
        );

        if self.external_iv == 0 {
            self.external_iv = iv;
            if self.file_iv != 0 {
                warn!("file IV initialized before external IV");
            }
        } else if self.have_header {
            let new_flags = self.last_flags | OFlag::O_RDWR;
            match self.base.open(new_flags) {
                Ok(()) => {}
                Err(e) if e.errno() == libc::EISDIR => {
                    self.external_iv = iv;
                    return self.base.set_iv(iv);
                }
                Err(e) => {
                    debug!("set_iv failed to re-open for write");
                    return Err(e);
                }
            }

            if self.file_iv == 0 {
                self.init_header()?;
            }

            let old_iv = self.external_iv;
            self.external_iv = iv;
            if let Err(e) = self.write_header() {
                self.external_iv = old_iv;
                return Err(e);
            }
        }
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
    use crate::raw::RawFileIo;
    use cloakfs_crypto::AesCipher;
    use std::fs;

    fn test_key() -> CipherKey {
        let mut bytes = [0u8; 48];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 3 + 1) as u8;
        }
        CipherKey::from_bytes(bytes)
    }

    fn stack(path: &std::path::Path, opts: &FsOptions) -> CipherFileIo<RawFileIo> {
        CipherLayer::stacked(
            RawFileIo::new(path),
            Arc::new(AesCipher::new()),
            test_key(),
            opts,
        )
    }

    fn create(path: &std::path::Path) {
        fs::File::create(path).unwrap();
    }

    #[test]
    fn header_takes_eight_bytes_of_backing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions::default();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, b"hello").unwrap();

        assert_eq!(io.get_size().unwrap(), 5);
        assert_eq!(fs::metadata(&path).unwrap().len(), 13);

        let mut back = [0u8; 5];
        assert_eq!(io.read(0, &mut back).unwrap(), 5);
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn file_iv_is_nonzero_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions::default();
        let first_iv;
        {
            let mut io = stack(&path, &opts);
            io.open(OFlag::O_RDWR).unwrap();
            io.write(0, b"data").unwrap();
            first_iv = io.layer().file_iv();
            assert_ne!(first_iv, 0);
        }

        // a fresh stack over the same backing file recovers the same IV
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDONLY).unwrap();
        let mut buf = [0u8; 4];
        io.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        assert_eq!(io.layer().file_iv(), first_iv);
    }

    #[test]
    fn without_unique_iv_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions {
            unique_iv: false,
            ..FsOptions::default()
        };
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &[0x42u8; 100]).unwrap();

        assert_eq!(io.get_size().unwrap(), 100);
        assert_eq!(fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn unaligned_rewrites_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions::default();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();

        let mut expect = vec![0u8; 3000];
        for (i, b) in expect.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        io.write(0, &expect).unwrap();

        // overwrite a span crossing two block boundaries
        let patch = [0xEEu8; 700];
        io.write(900, &patch).unwrap();
        expect[900..1600].copy_from_slice(&patch);

        let mut back = vec![0u8; 3000];
        assert_eq!(io.read(0, &mut back).unwrap(), 3000);
        assert_eq!(back, expect);

        // unaligned read of a middle slice
        let mut mid = vec![0u8; 1111];
        assert_eq!(io.read(777, &mut mid).unwrap(), 1111);
        assert_eq!(&mid[..], &expect[777..1888]);
    }

    #[test]
    fn write_past_eof_leaves_sparse_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions::default(); // allow_holes on
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();

        let payload = [0x7Au8; 100];
        io.write(5000, &payload).unwrap();
        assert_eq!(io.get_size().unwrap(), 5100);

        let mut head = vec![0xFFu8; 5000];
        assert_eq!(io.read(0, &mut head).unwrap(), 5000);
        assert!(head.iter().all(|&b| b == 0));

        let mut tail = [0u8; 100];
        assert_eq!(io.read(5000, &mut tail).unwrap(), 100);
        assert_eq!(tail, payload);
    }

    #[test]
    fn truncate_shrink_preserves_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions::default();
        let mut io = stack(&path, &opts);
        io.open(OFlag::O_RDWR).unwrap();

        let data: Vec<u8> = (0..3000).map(|i| (i % 253) as u8).collect();
        io.write(0, &data).unwrap();

        io.truncate(2048).unwrap();
        assert_eq!(io.get_size().unwrap(), 2048);
        assert_eq!(fs::metadata(&path).unwrap().len(), 2048 + 8);

        let mut back = vec![0u8; 2048];
        assert_eq!(io.read(0, &mut back).unwrap(), 2048);
        assert_eq!(&back[..], &data[..2048]);

        // shrink to an unaligned size too
        io.truncate(1500).unwrap();
        assert_eq!(io.get_size().unwrap(), 1500);
        let mut back = vec![0u8; 1500];
        assert_eq!(io.read(0, &mut back).unwrap(), 1500);
        assert_eq!(&back[..], &data[..1500]);
    }

    #[test]
    fn pad_to_same_size_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let mut io = stack(&path, &FsOptions::default());
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &[1u8; 500]).unwrap();

        let before = fs::read(&path).unwrap();
        io.pad_file(500, 500, false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn truncate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let mut io = stack(&path, &FsOptions::default());
        io.open(OFlag::O_RDWR).unwrap();
        io.write(0, &[9u8; 500]).unwrap();

        io.truncate(300).unwrap();
        let size_after_first = fs::metadata(&path).unwrap().len();
        io.truncate(300).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), size_after_first);
    }

    #[test]
    fn reverse_view_roundtrips_through_forward_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let plain_path = dir.path().join("plain");
        fs::write(&plain_path, b"reverse mode source data, long enough to matter").unwrap();
        let plain_len = fs::metadata(&plain_path).unwrap().len();

        let opts = FsOptions {
            reverse_encryption: true,
            ..FsOptions::default()
        };
        let mut rev = stack(&plain_path, &opts);
        rev.open(OFlag::O_RDONLY).unwrap();

        let view_len = rev.get_size().unwrap();
        assert_eq!(view_len, plain_len + 8);

        let mut ciphertext = vec![0u8; view_len as usize];
        assert_eq!(
            rev.read(0, &mut ciphertext).unwrap(),
            view_len as usize
        );

        // the reverse view, stored and mounted forward, decrypts to the
        // original plaintext
        let stored = dir.path().join("stored");
        fs::write(&stored, &ciphertext).unwrap();

        let mut fwd = stack(&stored, &FsOptions::default());
        fwd.open(OFlag::O_RDONLY).unwrap();
        assert_eq!(fwd.get_size().unwrap(), plain_len);

        let mut decrypted = vec![0u8; plain_len as usize];
        assert_eq!(fwd.read(0, &mut decrypted).unwrap(), plain_len as usize);
        assert_eq!(&decrypted[..], &b"reverse mode source data, long enough to matter"[..]);
    }

    #[test]
    fn reverse_views_are_stable_across_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let plain_path = dir.path().join("plain");
        fs::write(&plain_path, vec![0x31u8; 2000]).unwrap();

        let opts = FsOptions {
            reverse_encryption: true,
            ..FsOptions::default()
        };

        let mut first = vec![0u8; 2008];
        let mut second = vec![0u8; 2008];
        for buf in [&mut first, &mut second] {
            let mut rev = stack(&plain_path, &opts);
            rev.open(OFlag::O_RDONLY).unwrap();
            assert_eq!(rev.read(0, buf).unwrap(), 2008);
        }
        assert_eq!(first, second);
    }

    #[test]
    fn reverse_write_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let plain_path = dir.path().join("plain");
        fs::write(&plain_path, vec![1u8; 100]).unwrap();

        let opts = FsOptions {
            reverse_encryption: true,
            ..FsOptions::default()
        };
        let mut rev = stack(&plain_path, &opts);
        rev.open(OFlag::O_RDONLY).unwrap();

        let err = rev.write(8, &[0u8; 16]).unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[test]
    fn set_iv_rewrites_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        create(&path);

        let opts = FsOptions {
            external_iv_chaining: true,
            ..FsOptions::default()
        };

        let file_iv;
        {
            let mut io = stack(&path, &opts);
            io.set_iv(1111).unwrap();
            io.open(OFlag::O_RDWR).unwrap();
            io.write(0, b"content").unwrap();
            file_iv = io.layer().file_iv();
        }

        // reseat the header under a new external IV
        {
            let mut io = stack(&path, &opts);
            io.set_iv(1111).unwrap();
            io.open(OFlag::O_RDWR).unwrap();
            let mut probe = [0u8; 7];
            io.read(0, &mut probe).unwrap();
            io.set_iv(2222).unwrap();
            assert_eq!(io.layer().file_iv(), file_iv);
        }

        // the header now only decrypts under the new external IV
        let mut io = stack(&path, &opts);
        io.set_iv(2222).unwrap();
        io.open(OFlag::O_RDONLY).unwrap();
        let mut back = [0u8; 7];
        io.read(0, &mut back).unwrap();
        assert_eq!(&back, b"content");
        assert_eq!(io.layer().file_iv(), file_iv);
    }
}
