//! A file node: one open file's composed I/O stack, lock and names.
//!
//! Nodes are shared through the registry; the canary lets a holder that
//! outlived `erase_node` notice its mistake before dereferencing state
//! that is logically gone.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use tracing::debug;
use zeroize::Zeroize;

use cloakfs_core::{FsError, FsResult};
use cloakfs_io::file_io::FileStat;
use cloakfs_io::{CipherLayer, FileIo, MacLayer, RawFileIo};

use crate::config::FsConfig;
use crate::cred::FsIdGuard;

pub const CANARY_OK: u32 = 0x6f6b_6f6b;
pub const CANARY_RELEASED: u32 = 0xdead_beef;
pub const CANARY_DESTROYED: u32 = 0xdead_dead;

struct NodeInner {
    plain_name: String,
    cipher_name: String,
    io: Box<dyn FileIo>,
}

pub struct FileNode {
    canary: AtomicU32,
    handle_id: u64,
    config: Arc<FsConfig>,
    inner: Mutex<NodeInner>,
}

fn build_stack(config: &FsConfig, cipher_name: &str) -> Box<dyn FileIo> {
    let raw = RawFileIo::new(cipher_name);
    let cipher_io = CipherLayer::stacked(
        raw,
        config.cipher.clone(),
        config.key.clone(),
        &config.options,
    );
    if config.options.mac_header_bytes() > 0 {
        Box::new(MacLayer::stacked(
            cipher_io,
            config.cipher.clone(),
            config.key.clone(),
            &config.options,
        ))
    } else {
        Box::new(cipher_io)
    }
}

/// Reseat the IV only on regular files (or ones that do not exist yet).
fn set_iv_checked(io: &mut Box<dyn FileIo>, iv: u64) -> FsResult<()> {
    match io.get_attr() {
        Ok(st) if (st.st_mode & libc::S_IFMT) != libc::S_IFREG => Ok(()),
        _ => io.set_iv(iv),
    }
}

impl FileNode {
    pub fn new(config: Arc<FsConfig>, plain_name: &str, cipher_name: &str, handle_id: u64) -> Self {
        let io = build_stack(&config, cipher_name);
        FileNode {
            canary: AtomicU32::new(CANARY_OK),
            handle_id,
            config,
            inner: Mutex::new(NodeInner {
                plain_name: plain_name.to_owned(),
                cipher_name: cipher_name.to_owned(),
                io,
            }),
        }
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn canary(&self) -> u32 {
        self.canary.load(Ordering::Acquire)
    }

    pub fn canary_ok(&self) -> bool {
        self.canary() == CANARY_OK
    }

    /// Marks the node released from the registry. Called by `erase_node`.
    pub(crate) fn mark_released(&self) {
        self.canary.store(CANARY_RELEASED, Ordering::Release);
    }

    pub fn plaintext_name(&self) -> String {
        self.inner.lock().plain_name.clone()
    }

    pub fn cipher_name(&self) -> String {
        self.inner.lock().cipher_name.clone()
    }

    pub fn plaintext_parent(&self) -> String {
        let name = self.plaintext_name();
        match name.rfind('/') {
            Some(0) => "/".to_owned(),
            Some(pos) => name[..pos].to_owned(),
            None => String::new(),
        }
    }

    /// Rename the node in place. With external IV chaining the header is
    /// reseated; ordering is caller-chosen so a forward rename reseats
    /// before the names change and an undo reseats after, with rollback
    /// of the names if the reseat fails.
    pub fn set_name(
        &self,
        plain_name: Option<&str>,
        cipher_name: Option<&str>,
        iv: u64,
        set_iv_first: bool,
    ) -> FsResult<()> {
        if let Some(c) = cipher_name {
            debug!(name = c, "setting IV on node");
        }
        let mut inner = self.inner.lock();

        if set_iv_first {
            if self.config.options.external_iv_chaining {
                set_iv_checked(&mut inner.io, iv)?;
            }
            if let Some(p) = plain_name {
                inner.plain_name = p.to_owned();
            }
            if let Some(c) = cipher_name {
                inner.cipher_name = c.to_owned();
                inner.io.set_file_name(Path::new(c));
            }
        } else {
            let old_plain = inner.plain_name.clone();
            let old_cipher = inner.cipher_name.clone();

            if let Some(p) = plain_name {
                inner.plain_name = p.to_owned();
            }
            if let Some(c) = cipher_name {
                inner.cipher_name = c.to_owned();
                inner.io.set_file_name(Path::new(c));
            }
            if self.config.options.external_iv_chaining {
                if let Err(e) = set_iv_checked(&mut inner.io, iv) {
                    inner.plain_name = old_plain;
                    inner.io.set_file_name(Path::new(&old_cipher));
                    inner.cipher_name = old_cipher;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Create the backing object with the caller's credentials.
    pub fn mknod(&self, mode: u32, rdev: u64, uid: u32, gid: u32) -> FsResult<()> {
        let inner = self.inner.lock();
        let path = Path::new(&inner.cipher_name);

        let _ids = FsIdGuard::new(uid, gid)?;

        let kind = mode & libc::S_IFMT;
        let perm = Mode::from_bits_truncate(mode & !libc::S_IFMT);
        let res = if kind == libc::S_IFREG || kind == 0 {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & !libc::S_IFMT)
                .open(path)
                .map(drop)
                .map_err(FsError::from)
        } else if kind == libc::S_IFIFO {
            nix::unistd::mkfifo(path, perm).map_err(FsError::from)
        } else {
            nix::sys::stat::mknod(
                path,
                nix::sys::stat::SFlag::from_bits_truncate(kind),
                perm,
                rdev as libc::dev_t,
            )
            .map_err(FsError::from)
        };

        res.map_err(|e| {
            debug!("mknod failed: {e}");
            e
        })
    }

    pub fn open(&self, flags: OFlag) -> FsResult<()> {
        self.inner.lock().io.open(flags)
    }

    pub fn get_attr(&self) -> FsResult<FileStat> {
        self.inner.lock().io.get_attr()
    }

    pub fn get_size(&self) -> FsResult<u64> {
        self.inner.lock().io.get_size()
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.inner.lock().io.read(offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        debug!(offset, size = data.len(), "node write");
        self.inner.lock().io.write(offset, data)
    }

    pub fn truncate(&self, size: u64) -> FsResult<()> {
        self.inner.lock().io.truncate(size)
    }

    pub fn sync(&self, datasync: bool) -> FsResult<()> {
        self.inner.lock().io.sync(datasync)
    }
}

impl Drop for FileNode {
    fn drop(&mut self) {
        self.canary.store(CANARY_DESTROYED, Ordering::Release);
        let inner = self.inner.get_mut();
        inner.plain_name.zeroize();
        inner.cipher_name.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakfs_core::FsOptions;
    use cloakfs_crypto::{AesCipher, CipherKey};
    use cloakfs_names::{NullNameCodec, PathCodec};
    use std::fs;

    fn test_config(opts: FsOptions) -> Arc<FsConfig> {
        FsConfig::new(
            opts,
            Arc::new(AesCipher::new()),
            CipherKey::random(),
            Arc::new(PathCodec::new(Arc::new(NullNameCodec::new()), false)),
        )
        .unwrap()
    }

    #[test]
    fn node_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        fs::File::create(&path).unwrap();

        let node = FileNode::new(
            test_config(FsOptions::default()),
            "/file",
            path.to_str().unwrap(),
            1,
        );
        node.open(OFlag::O_RDWR).unwrap();
        node.write(0, b"payload").unwrap();
        assert_eq!(node.get_size().unwrap(), 7);

        let mut buf = [0u8; 7];
        assert_eq!(node.read(0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn mknod_creates_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("created");

        let node = FileNode::new(
            test_config(FsOptions::default()),
            "/created",
            path.to_str().unwrap(),
            2,
        );
        node.mknod(libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        assert!(path.exists());

        // exclusive create: a second attempt fails
        let err = node.mknod(libc::S_IFREG | 0o644, 0, 0, 0).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn canary_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();

        let node = FileNode::new(
            test_config(FsOptions::default()),
            "/f",
            path.to_str().unwrap(),
            3,
        );
        assert!(node.canary_ok());
        node.mark_released();
        assert_eq!(node.canary(), CANARY_RELEASED);
    }

    #[test]
    fn plaintext_parent_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::File::create(&path).unwrap();
        let cfg = test_config(FsOptions::default());

        let node = FileNode::new(cfg.clone(), "/a/b/c", path.to_str().unwrap(), 4);
        assert_eq!(node.plaintext_parent(), "/a/b");

        let node = FileNode::new(cfg, "/top", path.to_str().unwrap(), 5);
        assert_eq!(node.plaintext_parent(), "/");
    }
}
