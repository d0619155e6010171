//! The two-phase recursive rename: a forward script of per-entry
//! renames, undone in reverse order if anything fails.

use tracing::{debug, warn};
use zeroize::Zeroize;

use cloakfs_core::FsResult;

use crate::dir::{preserve_times, DirNode};

pub(crate) struct RenameEl {
    pub old_cipher: String,
    pub new_cipher: String,
    pub old_plain: String,
    pub new_plain: String,
    pub is_dir: bool,
}

pub(crate) struct RenameOp<'a> {
    dir: &'a DirNode,
    list: Vec<RenameEl>,
    applied: usize,
}

impl<'a> RenameOp<'a> {
    pub fn new(dir: &'a DirNode, list: Vec<RenameEl>) -> Self {
        RenameOp {
            dir,
            list,
            applied: 0,
        }
    }

    /// Run the script: registry reseat, backing rename, mtime preserve.
    /// Stops at the first failure with the registry entry rolled back;
    /// the caller decides whether to `undo` the applied prefix.
    pub fn apply(&mut self) -> FsResult<()> {
        while self.applied < self.list.len() {
            let el = &self.list[self.applied];
            debug!(from = %el.old_cipher, to = %el.new_cipher, "renaming");

            let times = nix::sys::stat::stat(el.old_cipher.as_str()).ok();

            self.dir
                .rename_node_mode(&el.old_plain, &el.new_plain, true)?;

            if let Err(e) = std::fs::rename(&el.old_cipher, &el.new_cipher) {
                warn!(path = %el.old_cipher, error = %e, "backing rename failed");
                let _ = self
                    .dir
                    .rename_node_mode(&el.new_plain, &el.old_plain, false);
                return Err(e.into());
            }
            if let Some(st) = times {
                preserve_times(&el.new_cipher, &st);
            }

            self.applied += 1;
        }
        Ok(())
    }

    /// Walk the applied prefix backwards, reversing the backing rename
    /// and the registry reseat. Does not restore mtimes.
    pub fn undo(&mut self) {
        if self.applied == 0 {
            debug!("nothing to undo");
            return;
        }

        let mut undo_count = 0usize;
        while self.applied > 0 {
            self.applied -= 1;
            let el = &self.list[self.applied];
            debug!(from = %el.new_cipher, to = %el.old_cipher, "undoing rename");

            let _ = std::fs::rename(&el.new_cipher, &el.old_cipher);
            if let Err(e) = self
                .dir
                .rename_node_mode(&el.new_plain, &el.old_plain, false)
            {
                warn!(error = %e, "registry undo failed");
            }
            undo_count += 1;
        }
        warn!(undo_count, "rename rolled back");
    }
}

impl Drop for RenameOp<'_> {
    fn drop(&mut self) {
        // plaintext names must not linger in freed memory
        for el in &mut self.list {
            el.old_plain.zeroize();
            el.new_plain.zeroize();
        }
    }
}
