//! The directory node: path translation between the plaintext and
//! ciphertext trees, directory operations, and the recursive rename that
//! chained name IVs require.

use std::sync::{Arc, Weak};

use nix::sys::stat::Mode;
use nix::sys::time::TimeVal;
use parking_lot::Mutex;
use tracing::{debug, warn};

use cloakfs_core::{FsError, FsResult, CONFIG_FILE_NAME};
use cloakfs_names::PathCodec;

use crate::config::FsConfig;
use crate::context::FsContext;
use crate::cred::FsIdGuard;
use crate::node::FileNode;
use crate::rename::{RenameEl, RenameOp};

/// Copy atime/mtime from a stat result onto `path`, best effort.
pub(crate) fn preserve_times(path: &str, st: &libc::stat) {
    let atime = TimeVal::new(st.st_atime, st.st_atime_nsec / 1000);
    let mtime = TimeVal::new(st.st_mtime, st.st_mtime_nsec / 1000);
    if let Err(e) = nix::sys::stat::utimes(path, &atime, &mtime) {
        debug!(path, errno = ?e, "could not preserve times");
    }
}

fn is_directory(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// A walk over one ciphertext directory, decoding names as it goes.
pub struct DirTraverse {
    entries: std::fs::ReadDir,
    iv: u64,
    naming: Arc<PathCodec>,
    root: bool,
}

impl DirTraverse {
    fn new(entries: std::fs::ReadDir, iv: u64, naming: Arc<PathCodec>, root: bool) -> Self {
        DirTraverse {
            entries,
            iv,
            naming,
            root,
        }
    }

    /// The next decodable entry, as plaintext. Undecodable names and the
    /// root's reserved config file are skipped.
    pub fn next_plaintext_name(&mut self) -> Option<String> {
        loop {
            let entry = self.entries.next()?.ok()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.root && name == CONFIG_FILE_NAME {
                debug!(name = %name, "skipping reserved filename");
                continue;
            }
            let mut local_iv = self.iv;
            match self.naming.decode_name_iv(&name, &mut local_iv) {
                Ok(plain) => match String::from_utf8(plain) {
                    Ok(s) => return Some(s),
                    Err(_) => continue,
                },
                Err(_) => continue,
            }
        }
    }

    /// The next entry that does NOT decode, surfaced so tooling can
    /// report foreign files in the ciphertext tree.
    pub fn next_invalid(&mut self) -> Option<String> {
        loop {
            let entry = self.entries.next()?.ok()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.root && name == CONFIG_FILE_NAME {
                debug!(name = %name, "skipping reserved filename");
                continue;
            }
            let mut local_iv = self.iv;
            if self.naming.decode_name_iv(&name, &mut local_iv).is_err() {
                return Some(name);
            }
        }
    }
}

pub struct DirNode {
    ctx: Weak<FsContext>,
    root_dir: String,
    config: Arc<FsConfig>,
    naming: Arc<PathCodec>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for DirNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirNode")
            .field("root_dir", &self.root_dir)
            .finish_non_exhaustive()
    }
}

impl DirNode {
    pub fn new(ctx: &Arc<FsContext>, source_dir: &str, config: Arc<FsConfig>) -> Arc<Self> {
        let mut root_dir = source_dir.to_owned();
        if !root_dir.ends_with('/') {
            root_dir.push('/');
        }
        let naming = config.naming.clone();
        Arc::new(DirNode {
            ctx: Arc::downgrade(ctx),
            root_dir,
            config,
            naming,
            lock: Mutex::new(()),
        })
    }

    /// The ciphertext root, without the trailing separator.
    pub fn root_directory(&self) -> String {
        self.root_dir[..self.root_dir.len() - 1].to_owned()
    }

    /// Sibling encodings depend on ancestors, so directory renames must
    /// re-encode the whole subtree.
    pub fn has_directory_name_dependency(&self) -> bool {
        self.naming.chained()
    }

    /// Plaintext path to full backing path.
    pub fn cipher_path(&self, plaintext_path: &str) -> FsResult<String> {
        Ok(format!(
            "{}{}",
            self.root_dir,
            self.naming.encode_path(plaintext_path)?
        ))
    }

    /// Plaintext path to ciphertext path relative to the root.
    pub fn cipher_path_without_root(&self, plaintext_path: &str) -> FsResult<String> {
        Ok(self.naming.encode_path(plaintext_path)?)
    }

    /// Decode a ciphertext path back to plaintext. A leading `+` (or `/`
    /// in reverse mode) marks a single absolute name rather than a path;
    /// the sentinel swaps on decode.
    pub fn plain_path(&self, cipher_path: &str) -> FsResult<String> {
        let reverse = self.config.options.reverse_encryption;
        let (mark, prefix) = if reverse { ('/', "+") } else { ('+', "/") };

        let result = if let Some(rest) = cipher_path.strip_prefix(mark) {
            self.naming.decode_name(rest).and_then(|plain| {
                String::from_utf8(plain)
                    .map(|s| format!("{prefix}{s}"))
                    .map_err(|_| cloakfs_core::NameError::BadEncoding)
            })
        } else {
            self.naming.decode_path(cipher_path)
        };

        result.map_err(|e| {
            warn!(error = %e, "decode error");
            FsError::from(e)
        })
    }

    /// Encode a plaintext path relative to the root. A leading `/`
    /// encodes as a normal path; in reverse mode a leading `+` is the
    /// absolute-name sentinel and swaps to `/`.
    pub fn relative_cipher_path(&self, plaintext_path: &str) -> FsResult<String> {
        let reverse = self.config.options.reverse_encryption;

        let result = match plaintext_path.strip_prefix('+') {
            Some(rest) if reverse => self
                .naming
                .encode_name(rest.as_bytes())
                .map(|enc| format!("/{enc}")),
            _ => self.naming.encode_path(plaintext_path),
        };

        result.map_err(|e| {
            warn!(error = %e, "encode error");
            FsError::from(e)
        })
    }

    /// Open a ciphertext directory for plaintext listing.
    pub fn open_dir(&self, plaintext_path: &str) -> FsResult<DirTraverse> {
        let cipher = self.cipher_path(plaintext_path)?;
        let entries = std::fs::read_dir(&cipher).map_err(|e| {
            debug!(path = %cipher, error = %e, "opendir failed");
            FsError::from(e)
        })?;

        let mut iv = 0;
        if self.naming.chained() {
            if let Err(e) = self.naming.encode_path_iv(plaintext_path, &mut iv) {
                warn!(error = %e, "encode error while deriving directory IV");
            }
        }
        Ok(DirTraverse::new(
            entries,
            iv,
            self.naming.clone(),
            plaintext_path == "/",
        ))
    }

    pub fn mkdir(&self, plaintext_path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()> {
        let cipher = self.cipher_path(plaintext_path)?;
        debug!(path = %cipher, "mkdir");

        let _ids = FsIdGuard::new(uid, gid)?;
        nix::unistd::mkdir(cipher.as_str(), Mode::from_bits_truncate(mode)).map_err(|e| {
            warn!(path = %cipher, mode, errno = ?e, "mkdir error");
            FsError::from(e)
        })
    }

    /// Remove a plaintext file. Refused while the registry still holds a
    /// node for the path.
    pub fn unlink(&self, plaintext_path: &str) -> FsResult<()> {
        let cipher_rel = self.naming.encode_path(plaintext_path)?;
        debug!(name = %cipher_rel, "unlink");

        let _guard = self.lock.lock();

        if let Some(ctx) = self.ctx.upgrade() {
            if ctx.lookup_node(plaintext_path).is_some() {
                warn!(name = %cipher_rel, "refusing to unlink open file");
                return Err(FsError::Busy);
            }
        }

        let full = format!("{}{}", self.root_dir, cipher_rel);
        std::fs::remove_file(&full).map_err(|e| {
            debug!(path = %full, error = %e, "unlink error");
            FsError::from(e)
        })
    }

    /// Hard-link `from` to the existing `to`. Incompatible with external
    /// IV chaining (the header encryption differs per path).
    pub fn link(&self, to: &str, from: &str) -> FsResult<()> {
        let _guard = self.lock.lock();

        let to_cipher = self.cipher_path(to)?;
        let from_cipher = self.cipher_path(from)?;
        debug!(from = %from_cipher, to = %to_cipher, "link");

        if self.config.options.external_iv_chaining {
            debug!("hard links not supported with external IV chaining");
            return Err(FsError::NotPermitted(
                "hard links with external IV chaining",
            ));
        }

        std::fs::hard_link(&to_cipher, &from_cipher).map_err(FsError::from)
    }

    /// Get or build the node for a path. New nodes get the directory IV
    /// installed when external IV chaining is on; registration in the
    /// open-file registry is the caller's move (on successful open).
    fn find_or_create(&self, plaintext_path: &str) -> FsResult<Arc<FileNode>> {
        let ctx = self.ctx.upgrade().ok_or(FsError::Busy)?;

        if let Some(node) = ctx.lookup_node(plaintext_path) {
            return Ok(node);
        }

        let mut iv = 0;
        let cipher_rel = self.naming.encode_path_iv(plaintext_path, &mut iv)?;
        let handle_id = ctx.next_handle_id();
        let cipher_full = format!("{}{}", self.root_dir, cipher_rel);

        let node = Arc::new(FileNode::new(
            self.config.clone(),
            plaintext_path,
            &cipher_full,
            handle_id,
        ));
        if self.config.options.external_iv_chaining {
            node.set_name(None, None, iv, true)?;
        }
        debug!(cipher = %cipher_full, "created file node");
        Ok(node)
    }

    pub fn lookup_node(&self, plaintext_path: &str) -> FsResult<Arc<FileNode>> {
        let _guard = self.lock.lock();
        self.find_or_create(plaintext_path)
    }

    /// Look up and open in one step.
    pub fn open_node(
        &self,
        plaintext_path: &str,
        flags: nix::fcntl::OFlag,
    ) -> FsResult<Arc<FileNode>> {
        let _guard = self.lock.lock();
        let node = self.find_or_create(plaintext_path)?;
        node.open(flags)?;
        Ok(node)
    }

    pub(crate) fn rename_node(&self, from: &str, to: &str) -> FsResult<Arc<FileNode>> {
        self.rename_node_mode(from, to, true)
    }

    /// Rename the in-memory node: re-encode the name, reseat the IV
    /// (forward = reseat before the names change), update the registry.
    pub(crate) fn rename_node_mode(
        &self,
        from: &str,
        to: &str,
        forward: bool,
    ) -> FsResult<Arc<FileNode>> {
        let node = self.find_or_create(from)?;

        let mut iv = 0;
        let cipher_rel = self.naming.encode_path_iv(to, &mut iv)?;
        let cipher_full = format!("{}{}", self.root_dir, cipher_rel);
        debug!(to = %cipher_full, "renaming internal node");

        node.set_name(Some(to), Some(&cipher_full), iv, forward)
            .map_err(|e| {
                warn!(error = %e, "internal node name change failed");
                e
            })?;

        if let Some(ctx) = self.ctx.upgrade() {
            ctx.rename_node(from, to);
        }
        Ok(node)
    }

    /// Build the flat rename script for a subtree: decode every child
    /// under the source IV, re-encode under the destination IV, recurse
    /// into directories (children precede their parent in the list).
    fn gen_rename_list(
        &self,
        list: &mut Vec<RenameEl>,
        from: &str,
        to: &str,
    ) -> FsResult<()> {
        let mut from_iv = 0;
        let mut to_iv = 0;
        let from_rel = self.naming.encode_path_iv(from, &mut from_iv)?;
        self.naming.encode_path_iv(to, &mut to_iv)?;

        if from_iv == to_iv {
            // same chain value: nothing changes under this directory
            return Ok(());
        }

        let source_path = format!("{}{}", self.root_dir, from_rel);
        debug!(path = %source_path, "walking for rename");

        for entry in std::fs::read_dir(&source_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let mut local_iv = from_iv;
            let plain = match self.naming.decode_name_iv(&name, &mut local_iv) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };

            let mut local_iv = to_iv;
            let new_name = self
                .naming
                .encode_name_iv(plain.as_bytes(), &mut local_iv)
                .map_err(|e| {
                    warn!(file = %name, error = %e, "aborting rename: cannot re-encode");
                    FsError::from(e)
                })?;

            let el = RenameEl {
                old_cipher: format!("{source_path}/{name}"),
                new_cipher: format!("{source_path}/{new_name}"),
                old_plain: format!("{from}/{plain}"),
                new_plain: format!("{to}/{plain}"),
                is_dir: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
            };

            if el.is_dir {
                self.gen_rename_list(list, &el.old_plain, &el.new_plain)?;
            }

            debug!(file = %el.old_cipher, "adding file to rename list");
            list.push(el);
        }
        Ok(())
    }

    fn new_rename_op(&self, from: &str, to: &str) -> FsResult<RenameOp<'_>> {
        let mut list = Vec::new();
        self.gen_rename_list(&mut list, from, to)?;
        Ok(RenameOp::new(self, list))
    }

    /// Rename a plaintext path, recursively re-encoding the subtree when
    /// chained name IVs make descendant ciphertext names depend on it.
    pub fn rename(&self, from_plaintext: &str, to_plaintext: &str) -> FsResult<()> {
        let _guard = self.lock.lock();

        let from_cipher = self.cipher_path(from_plaintext)?;
        let to_cipher = self.cipher_path(to_plaintext)?;
        debug!(from = %from_cipher, to = %to_cipher, "rename");

        let mut rename_op = None;
        if self.has_directory_name_dependency() && is_directory(&from_cipher) {
            debug!("recursive rename begin");
            let mut op = match self.new_rename_op(from_plaintext, to_plaintext) {
                Ok(op) => op,
                Err(e) => {
                    warn!(error = %e, "error during generation of recursive rename list");
                    return Err(FsError::Access);
                }
            };
            if let Err(e) = op.apply() {
                op.undo();
                warn!(error = %e, "rename aborted");
                return Err(FsError::Access);
            }
            debug!("recursive rename end");
            rename_op = Some(op);
        }

        let times = nix::sys::stat::stat(from_cipher.as_str()).ok();

        self.rename_node(from_plaintext, to_plaintext)?;
        match std::fs::rename(&from_cipher, &to_cipher) {
            Ok(()) => {
                if let Some(st) = times {
                    preserve_times(&to_cipher, &st);
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.rename_node_mode(to_plaintext, from_plaintext, false);
                if let Some(op) = rename_op.as_mut() {
                    op.undo();
                }
                debug!(error = %e, "rename failed");
                Err(e.into())
            }
        }
    }
}
