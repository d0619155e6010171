//! Positional I/O over one backing file, with lazy reopen-for-write.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use tracing::{debug, warn};

use cloakfs_core::{FsError, FsResult};

use crate::file_io::{FileIo, FileStat};

pub struct RawFileIo {
    name: PathBuf,
    file: Option<File>,
    can_write: bool,
    known_size: Option<u64>,
}

impl RawFileIo {
    pub fn new(name: impl Into<PathBuf>) -> Self {
        RawFileIo {
            name: name.into(),
            file: None,
            can_write: false,
            known_size: None,
        }
    }

    fn handle(&self) -> FsResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| FsError::from_errno(libc::EBADF))
    }

    /// EACCES on open of a file we own but cannot write: grant ourselves
    /// owner write for the duration of the open, then put the mode back.
    fn open_readonly_workaround(path: &Path, write: bool) -> std::io::Result<File> {
        let orig_mode = std::fs::metadata(path)?.permissions().mode();
        let relaxed = std::fs::Permissions::from_mode(orig_mode | 0o600);
        std::fs::set_permissions(path, relaxed)?;

        let result = OpenOptions::new().read(true).write(write).open(path);
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(orig_mode)) {
            warn!(path = %path.display(), error = %e, "could not restore file mode");
        }
        result
    }
}

impl FileIo for RawFileIo {
    fn open(&mut self, flags: OFlag) -> FsResult<()> {
        let request_write =
            flags.contains(OFlag::O_RDWR) || flags.contains(OFlag::O_WRONLY);

        if self.file.is_some() && (self.can_write || !request_write) {
            debug!("using existing file handle");
            return Ok(());
        }

        let opened = OpenOptions::new()
            .read(true)
            .write(request_write)
            .open(&self.name);

        let file = match opened {
            Ok(f) => f,
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => {
                debug!(path = %self.name.display(), "using read-only workaround for open");
                Self::open_readonly_workaround(&self.name, request_write)?
            }
            Err(e) => {
                debug!(path = %self.name.display(), error = %e, "open failed");
                return Err(e.into());
            }
        };

        self.can_write = request_write;
        self.file = Some(file);
        Ok(())
    }

    fn set_file_name(&mut self, name: &Path) {
        self.name = name.to_path_buf();
    }

    fn file_name(&self) -> &Path {
        &self.name
    }

    fn get_attr(&self) -> FsResult<FileStat> {
        nix::sys::stat::lstat(&self.name).map_err(|e| {
            debug!(path = %self.name.display(), errno = ?e, "lstat failed");
            e.into()
        })
    }

    fn get_size(&mut self) -> FsResult<u64> {
        if let Some(size) = self.known_size {
            return Ok(size);
        }
        let st = self.get_attr()?;
        let size = st.st_size as u64;
        self.known_size = Some(size);
        Ok(size)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let file = self.handle()?;
        loop {
            match file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(offset, len = buf.len(), error = %e, "read failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if !self.can_write {
            return Err(FsError::from_errno(libc::EBADF));
        }
        let file = self.handle()?;

        let mut written = 0;
        while written < data.len() {
            match file.write_at(&data[written..], offset + written as u64) {
                Ok(0) => {
                    self.known_size = None;
                    return Err(FsError::from_errno(libc::EIO));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(offset, len = data.len(), error = %e, "write failed");
                    self.known_size = None;
                    return Err(e.into());
                }
            }
        }

        if let Some(size) = self.known_size {
            let end = offset + data.len() as u64;
            if end > size {
                self.known_size = Some(end);
            }
        }
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> FsResult<()> {
        let res = match (&self.file, self.can_write) {
            (Some(file), true) => {
                let r = file.set_len(size);
                if r.is_ok() {
                    let _ = file.sync_data();
                }
                r.map_err(FsError::from)
            }
            _ => nix::unistd::truncate(&self.name, size as libc::off_t).map_err(FsError::from),
        };

        match res {
            Ok(()) => {
                self.known_size = Some(size);
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.name.display(), size, "truncate failed");
                self.known_size = None;
                Err(e)
            }
        }
    }

    fn set_iv(&mut self, _iv: u64) -> FsResult<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.can_write
    }

    fn sync(&mut self, datasync: bool) -> FsResult<()> {
        self.open(OFlag::O_RDONLY)?;
        let file = self.handle()?;
        let res = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        res.map_err(FsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &[u8]) -> (tempfile::TempDir, RawFileIo) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, RawFileIo::new(path))
    }

    #[test]
    fn read_after_open() {
        let (_dir, mut raw) = fixture(b"hello world");
        raw.open(OFlag::O_RDONLY).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(raw.read(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn write_requires_writable_open() {
        let (_dir, mut raw) = fixture(b"data");
        raw.open(OFlag::O_RDONLY).unwrap();
        assert!(raw.write(0, b"x").is_err());

        raw.open(OFlag::O_RDWR).unwrap();
        assert_eq!(raw.write(4, b"more").unwrap(), 4);
        assert_eq!(raw.get_size().unwrap(), 8);
    }

    #[test]
    fn writable_handle_satisfies_readonly_reopen() {
        let (_dir, mut raw) = fixture(b"");
        raw.open(OFlag::O_RDWR).unwrap();
        raw.open(OFlag::O_RDONLY).unwrap();
        assert!(raw.is_writable());
    }

    #[test]
    fn size_tracks_writes_and_truncate() {
        let (_dir, mut raw) = fixture(b"0123456789");
        raw.open(OFlag::O_RDWR).unwrap();
        assert_eq!(raw.get_size().unwrap(), 10);

        raw.truncate(4).unwrap();
        assert_eq!(raw.get_size().unwrap(), 4);

        raw.write(4, b"xy").unwrap();
        assert_eq!(raw.get_size().unwrap(), 6);
    }

    #[test]
    fn truncate_by_path_without_open() {
        let (_dir, mut raw) = fixture(b"0123456789");
        raw.truncate(3).unwrap();
        assert_eq!(raw.get_size().unwrap(), 3);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let (_dir, mut raw) = fixture(b"abc");
        raw.open(OFlag::O_RDONLY).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(raw.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_file_reports_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawFileIo::new(dir.path().join("nope"));
        let err = raw.open(OFlag::O_RDONLY).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
