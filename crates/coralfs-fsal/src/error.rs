//! Error types for the CoralFS FSAL
//!
//! Store calls return zero on success or a negated POSIX errno on failure.
//! The server consumes a structured status: a major class picked by table
//! lookup plus the raw errno as the minor code.

use thiserror::Error;

/// Major error class of an FSAL status, as consumed by the NFS server.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorMajor {
    /// Operation not permitted.
    #[error("permission denied")]
    Perm,
    /// No such file or directory.
    #[error("not found")]
    NoEnt,
    /// I/O error, including lost store connections.
    #[error("I/O error")]
    Io,
    /// No such device or address.
    #[error("no such device")]
    NxIo,
    /// Object is not open for the attempted operation.
    #[error("not open")]
    NotOpened,
    /// Out of memory.
    #[error("out of memory")]
    NoMem,
    /// Access denied.
    #[error("access denied")]
    Access,
    /// Bad address.
    #[error("fault")]
    Fault,
    /// Object already exists.
    #[error("already exists")]
    Exist,
    /// Cross-device operation.
    #[error("cross-device operation")]
    XDev,
    /// Not a directory.
    #[error("not a directory")]
    NotDir,
    /// Is a directory.
    #[error("is a directory")]
    IsDir,
    /// Invalid argument.
    #[error("invalid argument")]
    Inval,
    /// File too large.
    #[error("file too large")]
    FBig,
    /// No space left on device.
    #[error("no space left")]
    NoSpc,
    /// Too many hard links.
    #[error("too many links")]
    MLink,
    /// Quota exceeded.
    #[error("quota exceeded")]
    DQuot,
    /// Name too long.
    #[error("name too long")]
    NameTooLong,
    /// Directory not empty.
    #[error("directory not empty")]
    NotEmpty,
    /// Stale file handle; the object behind a wire handle is gone.
    #[error("stale file handle")]
    Stale,
    /// Transient condition; the caller may retry.
    #[error("retry later")]
    Delay,
    /// Share reservation conflict. Raised by the arbiter, never the store.
    #[error("share reservation denied")]
    ShareDenied,
    /// Operation or variant not supported.
    #[error("not supported")]
    NotSupported,
    /// Caller-supplied buffer too small.
    #[error("buffer too small")]
    TooSmall,
    /// Anything the table does not recognize.
    #[error("server fault")]
    ServerFault,
}

/// Structured FSAL status: a major class plus the POSIX errno the store
/// reported (zero when the error did not originate in the store).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{major} (minor {minor})")]
pub struct FsalError {
    /// Major error class.
    pub major: ErrorMajor,
    /// POSIX errno reported by the store, or zero.
    pub minor: i32,
}

/// Result type alias using FsalError as the error type.
pub type Result<T> = std::result::Result<T, FsalError>;

impl FsalError {
    /// Builds a status from a major class and a minor errno.
    pub fn new(major: ErrorMajor, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Share reservation conflict.
    pub fn share_denied() -> Self {
        Self::new(ErrorMajor::ShareDenied, 0)
    }

    /// Invalid argument, no store involvement.
    pub fn inval() -> Self {
        Self::new(ErrorMajor::Inval, 0)
    }

    /// Stale wire handle.
    pub fn stale() -> Self {
        Self::new(ErrorMajor::Stale, 0)
    }

    /// Unsupported operation or variant.
    pub fn not_supported() -> Self {
        Self::new(ErrorMajor::NotSupported, 0)
    }

    /// Caller buffer too small.
    pub fn too_small() -> Self {
        Self::new(ErrorMajor::TooSmall, 0)
    }

    /// Generic server fault.
    pub fn server_fault() -> Self {
        Self::new(ErrorMajor::ServerFault, 0)
    }

    /// Maps a store failure code (a negated POSIX errno) to a structured
    /// error. The minor code is the absolute errno value; errnos outside
    /// the table map to `ServerFault`.
    pub fn from_store(code: i32) -> Self {
        let errno = code.checked_abs().unwrap_or(i32::MAX);
        let major = match errno {
            libc::EPERM => ErrorMajor::Perm,
            libc::ENOENT => ErrorMajor::NoEnt,
            libc::ECONNREFUSED
            | libc::ECONNABORTED
            | libc::ECONNRESET
            | libc::EIO
            | libc::ENFILE
            | libc::EMFILE
            | libc::EPIPE => ErrorMajor::Io,
            libc::ENODEV | libc::ENXIO => ErrorMajor::NxIo,
            // EBADF is also what the store returns for a write on a node
            // opened read-only; NotOpened is an imprecise fit for that
            // case but is kept.
            libc::EBADF => ErrorMajor::NotOpened,
            libc::ENOMEM => ErrorMajor::NoMem,
            libc::EACCES => ErrorMajor::Access,
            libc::EFAULT => ErrorMajor::Fault,
            libc::EEXIST => ErrorMajor::Exist,
            libc::EXDEV => ErrorMajor::XDev,
            libc::ENOTDIR => ErrorMajor::NotDir,
            libc::EISDIR => ErrorMajor::IsDir,
            libc::EINVAL => ErrorMajor::Inval,
            libc::EFBIG => ErrorMajor::FBig,
            libc::ENOSPC => ErrorMajor::NoSpc,
            libc::EMLINK => ErrorMajor::MLink,
            libc::EDQUOT => ErrorMajor::DQuot,
            libc::ENAMETOOLONG => ErrorMajor::NameTooLong,
            libc::ENOTEMPTY => ErrorMajor::NotEmpty,
            libc::ESTALE => ErrorMajor::Stale,
            libc::EAGAIN | libc::EBUSY => ErrorMajor::Delay,
            _ => ErrorMajor::ServerFault,
        };
        Self { major, minor: errno }
    }
}

/// Translates a raw store status code into an FSAL result: zero is
/// success, anything else goes through the mapping table.
pub fn store_status(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(FsalError::from_store(code))
    }
}
