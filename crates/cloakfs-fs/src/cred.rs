//! Filesystem-credential override for ownership-aware create operations.
//!
//! The override lives exactly as long as the guard; every exit path puts
//! the original fsuid/fsgid back.

use cloakfs_core::{FsError, FsResult};

#[cfg(target_os = "linux")]
pub struct FsIdGuard {
    old_uid: Option<libc::uid_t>,
    old_gid: Option<libc::gid_t>,
}

#[cfg(target_os = "linux")]
impl FsIdGuard {
    /// Switch fsgid then fsuid; 0 means "leave alone".
    pub fn new(uid: u32, gid: u32) -> FsResult<Self> {
        let mut guard = FsIdGuard {
            old_uid: None,
            old_gid: None,
        };

        if gid != 0 {
            let old = unsafe { libc::setfsgid(gid) };
            if old == -1 {
                tracing::debug!(gid, "setfsgid failed");
                return Err(FsError::NotPermitted("setfsgid"));
            }
            guard.old_gid = Some(old as libc::gid_t);
        }
        if uid != 0 {
            let old = unsafe { libc::setfsuid(uid) };
            if old == -1 {
                tracing::debug!(uid, "setfsuid failed");
                return Err(FsError::NotPermitted("setfsuid"));
            }
            guard.old_uid = Some(old as libc::uid_t);
        }
        Ok(guard)
    }
}

#[cfg(target_os = "linux")]
impl Drop for FsIdGuard {
    fn drop(&mut self) {
        if let Some(uid) = self.old_uid {
            if unsafe { libc::setfsuid(uid) } == -1 {
                tracing::debug!(uid, "could not restore fsuid");
            }
        }
        if let Some(gid) = self.old_gid {
            if unsafe { libc::setfsgid(gid) } == -1 {
                tracing::debug!(gid, "could not restore fsgid");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct FsIdGuard;

#[cfg(not(target_os = "linux"))]
impl FsIdGuard {
    pub fn new(_uid: u32, _gid: u32) -> FsResult<Self> {
        Ok(FsIdGuard)
    }
}
