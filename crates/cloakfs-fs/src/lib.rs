//! cloakfs-fs: the mount-level pieces of CloakFS
//!
//! A mount owns one [`FsContext`] (the open-file registry and unmount
//! bookkeeping) and one root [`DirNode`] (path translation, directory
//! operations, the recursive rename planner). File I/O goes through
//! [`FileNode`]s, each composing raw → cipher → optional MAC from
//! `cloakfs-io` and carrying its own lock.

pub mod config;
mod cred;
pub mod context;
pub mod dir;
pub mod node;
mod rename;

pub use config::FsConfig;
pub use context::FsContext;
pub use dir::{DirNode, DirTraverse};
pub use node::FileNode;

use std::sync::Arc;

/// Wire up a mount: context plus root directory node over `source_dir`.
pub fn create_root(source_dir: &str, config: Arc<FsConfig>) -> (Arc<FsContext>, Arc<DirNode>) {
    let ctx = FsContext::new(config.options.mount_on_demand);
    let root = DirNode::new(&ctx, source_dir, config);
    ctx.set_root(root.clone());
    (ctx, root)
}
