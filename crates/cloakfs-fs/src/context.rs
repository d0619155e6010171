//! The mount context: open-file registry and unmount bookkeeping.
//!
//! Two indices cover the open files: plaintext path to the nodes open at
//! that path (front = most recent), and handle id to node. Handle ids
//! are monotonic and never reused within a mount. One mutex guards all
//! of it plus the unmount flag.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use cloakfs_core::{FsError, FsResult};

use crate::dir::DirNode;
use crate::node::FileNode;

struct ContextState {
    open_files: HashMap<String, Vec<Arc<FileNode>>>,
    handles: HashMap<u64, Arc<FileNode>>,
    usage_count: u64,
    idle_count: i64,
    is_unmounting: bool,
    next_handle: u64,
    root: Option<Arc<DirNode>>,
}

pub struct FsContext {
    state: Mutex<ContextState>,
    mount_on_demand: bool,
}

impl FsContext {
    pub fn new(mount_on_demand: bool) -> Arc<Self> {
        Arc::new(FsContext {
            state: Mutex::new(ContextState {
                open_files: HashMap::new(),
                handles: HashMap::new(),
                usage_count: 0,
                idle_count: -1,
                is_unmounting: false,
                next_handle: 1,
                root: None,
            }),
            mount_on_demand,
        })
    }

    pub fn set_root(&self, root: Arc<DirNode>) {
        self.state.lock().root = Some(root);
    }

    pub fn clear_root(&self) {
        self.state.lock().root = None;
    }

    /// The root directory node. Fails with `EBUSY` while an unmount is in
    /// progress; counts as usage for the idle tracker.
    pub fn get_root(&self) -> FsResult<Arc<DirNode>> {
        let mut state = self.state.lock();
        if state.is_unmounting {
            return Err(FsError::Busy);
        }
        state.usage_count += 1;
        state
            .root
            .clone()
            .ok_or_else(|| FsError::from_errno(libc::ENOENT))
    }

    pub fn is_unmounting(&self) -> bool {
        self.state.lock().is_unmounting
    }

    pub fn next_handle_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_handle;
        state.next_handle += 1;
        id
    }

    pub fn open_file_count(&self) -> usize {
        self.state.lock().open_files.len()
    }

    /// Most recently opened node at `path`, if any.
    pub fn lookup_node(&self, path: &str) -> Option<Arc<FileNode>> {
        let state = self.state.lock();
        state
            .open_files
            .get(path)
            .and_then(|list| list.first().cloned())
    }

    pub fn lookup_handle(&self, id: u64) -> Option<Arc<FileNode>> {
        self.state.lock().handles.get(&id).cloned()
    }

    pub fn put_node(&self, path: &str, node: Arc<FileNode>) {
        let mut state = self.state.lock();
        state.handles.insert(node.handle_id(), node.clone());
        state
            .open_files
            .entry(path.to_owned())
            .or_default()
            .insert(0, node);
    }

    /// Remove one reference to `node` at `path`. When the last entry for
    /// the node goes away it leaves the handle map and its canary flips
    /// to the released sentinel.
    pub fn erase_node(&self, path: &str, node: &Arc<FileNode>) {
        let mut state = self.state.lock();

        let Some(list) = state.open_files.get_mut(path) else {
            warn!(path, "no node to erase; the file was probably renamed");
            return;
        };

        let Some(pos) = list.iter().position(|n| Arc::ptr_eq(n, node)) else {
            warn!(path, "node not present in its path list");
            return;
        };
        list.remove(pos);

        let still_listed = list.iter().any(|n| Arc::ptr_eq(n, node));
        let emptied = list.is_empty();
        if !still_listed {
            state.handles.remove(&node.handle_id());
            node.mark_released();
        }
        if emptied {
            state.open_files.remove(path);
        }
    }

    /// Reseat a path's node list under a new plaintext path. An existing
    /// destination list is replaced; callers serialize renames.
    pub fn rename_node(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(list) = state.open_files.remove(from) {
            state.open_files.insert(to.to_owned(), list);
        }
    }

    /// One idle tick. When the mount has been idle for `timeout_cycles`
    /// ticks with no files open, flips the unmount flag (unless mounting
    /// on demand) and runs `unmount`. Returns whether unmount ran and
    /// succeeded.
    pub fn usage_and_unmount(&self, timeout_cycles: i64, unmount: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock();

        if state.root.is_none() {
            return false;
        }

        if state.usage_count == 0 {
            state.idle_count += 1;
        } else {
            state.idle_count = 0;
        }
        debug!(
            idle = state.idle_count,
            timeout = timeout_cycles,
            "idle cycle"
        );
        state.usage_count = 0;

        if state.idle_count < timeout_cycles {
            return false;
        }

        if !state.open_files.is_empty() {
            if state.idle_count % timeout_cycles == 0 {
                warn!(
                    open = state.open_files.len(),
                    "filesystem inactive, but files are still open"
                );
            }
            return false;
        }

        if !self.mount_on_demand {
            state.is_unmounting = true;
        }
        drop(state);
        unmount()
    }
}
