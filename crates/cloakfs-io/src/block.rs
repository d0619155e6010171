//! The block I/O engine: arbitrary (offset, length) requests over an
//! aligned single-block layer.
//!
//! Every call into the [`BlockLayer`] below uses `offset % block_size ==
//! 0` and `len <= block_size`. The engine stitches reads, merges
//! read-modify-writes, pads holes on extension, and keeps a one-block
//! cache that reverse mounts must disable (the backing plaintext can
//! change underneath the layer).

use std::path::Path;

use nix::fcntl::OFlag;
use tracing::debug;

use cloakfs_core::FsResult;

use crate::file_io::{FileIo, FileStat};
use crate::pool;

/// The 8-byte per-file IV header some layers maintain.
pub const HEADER_SIZE: u64 = 8;

/// One aligned block of work, implemented by the cipher and MAC layers.
///
/// `layer_size` is the size in the engine's block space; `reported_size`
/// is what callers see (a reverse-mode cipher layer adds its virtual
/// header). The truncate hooks let each layer translate outer sizes to
/// backing sizes its own way.
pub trait BlockLayer: Send {
    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> FsResult<usize>;

    fn layer_size(&mut self) -> FsResult<u64>;

    fn reported_size(&mut self) -> FsResult<u64> {
        self.layer_size()
    }

    /// An encrypted header served ahead of block space (reverse mode
    /// with per-file IVs).
    fn virtual_header(&mut self) -> FsResult<Option<[u8; HEADER_SIZE as usize]>> {
        Ok(None)
    }

    fn prepare_truncate(&mut self) -> FsResult<()> {
        Ok(())
    }

    /// Whether the engine may drive the backing truncate directly
    /// (offsets map 1:1) instead of through `finalize_truncate`.
    fn truncate_direct(&self) -> bool {
        false
    }

    fn truncate_backing(&mut self, size: u64) -> FsResult<()>;

    fn finalize_truncate(&mut self, _outer_size: u64) -> FsResult<()> {
        Ok(())
    }

    fn open(&mut self, flags: OFlag) -> FsResult<()>;
    fn set_file_name(&mut self, name: &Path);
    fn file_name(&self) -> &Path;
    fn get_attr(&self) -> FsResult<FileStat>;
    fn set_iv(&mut self, iv: u64) -> FsResult<()>;
    fn is_writable(&self) -> bool;
    fn sync(&mut self, datasync: bool) -> FsResult<()>;
}

struct BlockCache {
    offset: u64,
    len: usize,
    data: Vec<u8>,
}

impl BlockCache {
    fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.offset = 0;
    }
}

pub struct BlockFileIo<L: BlockLayer> {
    layer: L,
    block_size: usize,
    allow_holes: bool,
    no_cache: bool,
    cache: BlockCache,
}

impl<L: BlockLayer> BlockFileIo<L> {
    pub fn new(layer: L, block_size: usize, allow_holes: bool, no_cache: bool) -> Self {
        assert!(block_size > 1);
        BlockFileIo {
            layer,
            block_size,
            allow_holes,
            no_cache,
            cache: BlockCache {
                offset: 0,
                len: 0,
                data: vec![0u8; block_size],
            },
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }

    /// Serve a block-aligned read of at most one block, going through the
    /// cache. A miss always fetches a full block so a short request still
    /// caches the whole thing.
    fn cache_read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        debug_assert!(buf.len() <= self.block_size);
        debug_assert_eq!(offset % self.block_size as u64, 0);

        if !self.no_cache && offset == self.cache.offset && self.cache.len != 0 {
            let len = buf.len().min(self.cache.len);
            buf[..len].copy_from_slice(&self.cache.data[..len]);
            return Ok(len);
        }

        if self.cache.len > 0 {
            self.cache.clear();
        }

        let mut cache_buf = std::mem::take(&mut self.cache.data);
        let result = self.layer.read_one_block(offset, &mut cache_buf);
        self.cache.data = cache_buf;

        let read = result?;
        if read > 0 {
            self.cache.offset = offset;
            self.cache.len = read;
            let len = read.min(buf.len());
            buf[..len].copy_from_slice(&self.cache.data[..len]);
            return Ok(len);
        }
        Ok(read)
    }

    /// Write one aligned block and mirror it into the cache.
    fn cache_write_one_block(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        debug_assert!(data.len() <= self.block_size);
        debug_assert_eq!(offset % self.block_size as u64, 0);

        match self.layer.write_one_block(offset, data) {
            Ok(written) => {
                self.cache.offset = offset;
                self.cache.len = data.len();
                self.cache.data[..data.len()].copy_from_slice(data);
                self.cache.data[data.len()..].fill(0);
                Ok(written)
            }
            Err(e) => {
                self.cache.clear();
                Err(e)
            }
        }
    }

    fn read_blocks(&mut self, offset: u64, out: &mut [u8]) -> FsResult<usize> {
        let bs = self.block_size;
        let mut partial = (offset % bs as u64) as usize;
        let mut block_num = offset / bs as u64;

        if partial == 0 && out.len() <= bs {
            return self.cache_read_one_block(offset, out);
        }

        // larger or unaligned requests go block by block
        let mut scratch: Option<pool::PoolBuf> = None;
        let mut size = out.len();
        let mut pos = 0usize;
        let mut result = 0usize;

        while size > 0 {
            let block_off = block_num * bs as u64;
            let direct = partial == 0 && size >= bs;

            let read_size = if direct {
                // full block straight into the caller's buffer
                self.cache_read_one_block(block_off, &mut out[pos..pos + bs])?
            } else {
                let buf = scratch.get_or_insert_with(|| pool::allocate(bs));
                self.cache_read_one_block(block_off, buf)?
            };

            if read_size <= partial {
                break;
            }

            let copy = (read_size - partial).min(size);
            if !direct {
                let buf = scratch.as_ref().expect("scratch was just used");
                out[pos..pos + copy].copy_from_slice(&buf[partial..partial + copy]);
            }

            result += copy;
            size -= copy;
            pos += copy;
            block_num += 1;
            partial = 0;

            if read_size < bs {
                break;
            }
        }

        Ok(result)
    }

    fn write_blocks(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let bs = self.block_size;
        let file_size = self.layer.layer_size()?;

        let mut block_num = offset / bs as u64;
        let mut partial = (offset % bs as u64) as usize;

        let last_file_block = file_size / bs as u64;
        let last_block_size = (file_size % bs as u64) as usize;
        let last_non_empty_block: i64 = if last_block_size == 0 {
            last_file_block as i64 - 1
        } else {
            last_file_block as i64
        };

        if offset > file_size {
            // materialize the hole before writing past it
            self.pad_file(file_size, offset, false)?;
        }

        if partial == 0 && data.len() <= bs {
            if data.len() == bs {
                self.cache_write_one_block(offset, data)?;
                return Ok(data.len());
            }
            // a partial block that covers everything already there
            if block_num == last_file_block && data.len() >= last_block_size {
                self.cache_write_one_block(offset, data)?;
                return Ok(data.len());
            }
        }

        // merge with existing block content
        let mut scratch: Option<pool::PoolBuf> = None;
        let mut size = data.len();
        let mut pos = 0usize;

        while size > 0 {
            let block_off = block_num * bs as u64;
            let to_copy = (bs - partial).min(size);

            if to_copy == bs || (partial == 0 && block_off + to_copy as u64 >= file_size) {
                // full block, or a block-start write that extends past EOF
                self.cache_write_one_block(block_off, &data[pos..pos + to_copy])?;
            } else {
                let buf = scratch.get_or_insert_with(|| pool::allocate(bs));
                buf.fill(0);

                let data_len = if block_num as i64 > last_non_empty_block {
                    partial + to_copy
                } else {
                    let read = self.cache_read_one_block(block_off, buf)?;
                    read.max(partial + to_copy)
                };

                buf[partial..partial + to_copy].copy_from_slice(&data[pos..pos + to_copy]);
                let merged = &buf[..data_len];
                self.cache_write_one_block(block_off, merged)?;
            }

            size -= to_copy;
            pos += to_copy;
            block_num += 1;
            partial = 0;
        }

        Ok(data.len())
    }

    /// Extend the file from `old_size` to `new_size` with zeros: pad the
    /// last partial block to a full one, fill intermediate blocks unless
    /// holes are allowed, and optionally force the final partial block
    /// out.
    pub fn pad_file(&mut self, old_size: u64, new_size: u64, force_write: bool) -> FsResult<()> {
        let bs = self.block_size;
        let old_last_block = old_size / bs as u64;
        let new_last_block = new_size / bs as u64;
        let new_block_size = (new_size % bs as u64) as usize;

        if old_last_block == new_last_block {
            // the tail stays within one block
            if !force_write {
                debug!("not padding last block");
                return Ok(());
            }
            let out_size = new_block_size;
            if out_size != 0 {
                let old_partial = (old_size % bs as u64) as usize;
                let offset = old_last_block * bs as u64;
                let mut buf = pool::allocate(bs);
                buf.fill(0);
                self.cache_read_one_block(offset, &mut buf[..old_partial])?;
                self.cache_write_one_block(offset, &buf[..out_size])?;
            }
            return Ok(());
        }

        let mut buf = pool::allocate(bs);
        let mut old_last_block = old_last_block;

        // 1. grow the old partial block to a full one
        let old_partial = (old_size % bs as u64) as usize;
        if old_partial != 0 {
            debug!(block = old_last_block, "padding block");
            buf.fill(0);
            let offset = old_last_block * bs as u64;
            self.cache_read_one_block(offset, &mut buf[..old_partial])?;
            self.cache_write_one_block(offset, &buf[..bs])?;
            old_last_block += 1;
        }

        // 2. zero-fill the middle unless holes may stay sparse
        if !self.allow_holes {
            while old_last_block != new_last_block {
                debug!(block = old_last_block, "padding block");
                buf.fill(0);
                self.cache_write_one_block(old_last_block * bs as u64, &buf[..bs])?;
                old_last_block += 1;
            }
        }

        // 3. the new partial tail, only when the caller needs it on disk
        if force_write && new_block_size != 0 {
            buf.fill(0);
            self.cache_write_one_block(new_last_block * bs as u64, &buf[..new_block_size])?;
        }

        Ok(())
    }

    /// Shared truncate logic; `direct` lets the engine drive the backing
    /// truncate itself when layer and backing offsets coincide.
    fn truncate_base(&mut self, size: u64, direct: bool) -> FsResult<()> {
        let bs = self.block_size;
        let partial = (size % bs as u64) as usize;
        let old_size = self.layer.layer_size()?;

        if size > old_size {
            if direct {
                self.layer.truncate_backing(size)?;
            }
            self.pad_file(old_size, size, true)?;
        } else if size == old_size {
            // nothing to do
        } else if partial != 0 {
            self.cache.clear();
            let block_off = (size / bs as u64) * bs as u64;
            let mut buf = pool::allocate(bs);
            self.cache_read_one_block(block_off, &mut buf)?;
            if direct {
                self.layer.truncate_backing(size)?;
            }
            self.cache_write_one_block(block_off, &buf[..partial])?;
        } else {
            self.cache.clear();
            if direct {
                self.layer.truncate_backing(size)?;
            }
        }
        Ok(())
    }
}

impl<L: BlockLayer> FileIo for BlockFileIo<L> {
    fn open(&mut self, flags: OFlag) -> FsResult<()> {
        self.layer.open(flags)
    }

    fn set_file_name(&mut self, name: &Path) {
        self.layer.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.layer.file_name()
    }

    fn get_attr(&self) -> FsResult<FileStat> {
        self.layer.get_attr()
    }

    fn get_size(&mut self) -> FsResult<u64> {
        self.layer.reported_size()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(header) = self.layer.virtual_header()? {
            // the first 8 bytes of the file are synthesized, block space
            // starts behind them
            let mut served = 0usize;
            if offset < HEADER_SIZE {
                let start = offset as usize;
                served = (header.len() - start).min(buf.len());
                buf[..served].copy_from_slice(&header[start..start + served]);
                if served == buf.len() {
                    return Ok(served);
                }
            }
            let inner_offset = offset + served as u64 - HEADER_SIZE;
            let read = self.read_blocks(inner_offset, &mut buf[served..])?;
            return Ok(served + read);
        }

        self.read_blocks(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.write_blocks(offset, data)
    }

    fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.layer.prepare_truncate()?;
        let direct = self.layer.truncate_direct();
        self.truncate_base(size, direct)?;
        self.layer.finalize_truncate(size)
    }

    fn set_iv(&mut self, iv: u64) -> FsResult<()> {
        self.layer.set_iv(iv)
    }

    fn is_writable(&self) -> bool {
        self.layer.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> FsResult<()> {
        self.layer.sync(datasync)
    }
}
