use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by the file I/O stack and the directory layer.
///
/// The host adapter reports errors numerically; `errno()` produces the
/// value to negate. Inner layers never retry: whatever the backing store
/// said is what the caller sees.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Integrity failure: MAC mismatch, zero file IV after decrypt,
    /// cipher rejection.
    #[error("integrity check failed")]
    BadMessage,

    /// The mount is shutting down; new root lookups are refused.
    #[error("filesystem is unmounting")]
    Busy,

    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// A recursive rename could not be completed and was rolled back.
    #[error("access denied")]
    Access,

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl FsError {
    /// The errno value for this error, for hosts that report `-errno`.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::BadMessage | FsError::Name(_) | FsError::Crypto(_) => libc::EBADMSG,
            FsError::Busy => libc::EBUSY,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::Access => libc::EACCES,
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        FsError::Io(std::io::Error::from_raw_os_error(errno))
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(e: nix::errno::Errno) -> Self {
        FsError::from_errno(e as i32)
    }
}

/// Filename decode/encode failures.
///
/// These are typed rather than numeric: the directory layer catches them
/// and decides whether to skip an entry, abort a rename, or report
/// `-EBADMSG`. A failed decode leaves no partial output.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("filename too small to decode")]
    TooSmall,

    #[error("invalid padding size")]
    BadPadding,

    #[error("checksum mismatch in filename decode")]
    ChecksumMismatch,

    #[error("block decode failed in filename decode")]
    BlockDecode,

    #[error("filename encode failed")]
    Encode,

    #[error("encoded filename contains invalid characters")]
    BadEncoding,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("randomness source failed")]
    Random,

    #[error("cipher rejected input of {0} bytes")]
    BadLength(usize),
}
