//! Errors surfaced by the index engine.

use std::error;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by every fallible engine operation.
///
/// Low-level system errors are attributed to the operation that failed and
/// the file it failed on; the remaining variants describe conditions the
/// caller is expected to react to (rebuild, retry, fall back to memory).
#[derive(Debug)]
pub enum Error {
    /// The index (or one of its files) does not exist.
    NotFound(PathBuf),
    /// A structural check failed. The engine has already unlinked the file;
    /// the caller rebuilds from the mail storage.
    Corrupted(PathBuf, String),
    /// The lock could not be acquired within the configured window. The
    /// operation had no side effects and may be retried.
    LockTimeout(PathBuf),
    /// The filesystem is out of space. Callers may migrate the index to
    /// memory-only mode.
    NoDiskSpace(PathBuf),
    /// A file handle went stale under us (NFS). Where safe the engine
    /// re-opens transparently; this surfaces only when it cannot.
    StaleHandle(PathBuf),
    /// The open index refers to a mailbox that has been recreated. Views
    /// and all derived state must be discarded.
    IndexIdChanged,
    /// Anything else: the failing operation name, the file, and an
    /// explanation.
    Internal {
        op: &'static str,
        path: PathBuf,
        message: String,
    },
}

impl Error {
    /// Wraps an `io::Error` from `op` on `path`, translating the errno
    /// values the engine gives distinct meanings to.
    pub(crate) fn io(op: &'static str, path: &Path, err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOENT => Error::NotFound(path.to_owned()),
            Some(code) if code == libc::ENOSPC || code == libc::EDQUOT => {
                Error::NoDiskSpace(path.to_owned())
            }
            Some(code) if code == libc::ESTALE => Error::StaleHandle(path.to_owned()),
            _ => Error::Internal {
                op,
                path: path.to_owned(),
                message: err.to_string(),
            },
        }
    }

    pub(crate) fn nix(op: &'static str, path: &Path, errno: nix::errno::Errno) -> Error {
        Error::io(op, path, io::Error::from_raw_os_error(errno as i32))
    }

    pub(crate) fn corrupted(path: &Path, message: impl Into<String>) -> Error {
        Error::Corrupted(path.to_owned(), message.into())
    }

    /// True for errors the caller can make progress on by retrying after
    /// resetting derived state (as opposed to plain failures).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout(_) | Error::StaleHandle(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(path) => write!(f, "Index file {} does not exist", path.display()),
            Error::Corrupted(path, msg) => {
                write!(f, "Corrupted index file {}: {}", path.display(), msg)
            }
            Error::LockTimeout(path) => {
                write!(f, "Timeout while waiting for lock on {}", path.display())
            }
            Error::NoDiskSpace(path) => write!(f, "Out of disk space ({})", path.display()),
            Error::StaleHandle(path) => write!(f, "Stale file handle for {}", path.display()),
            Error::IndexIdChanged => write!(f, "Index was recreated, indexid changed"),
            Error::Internal { op, path, message } => {
                write!(f, "{}() failed with file {}: {}", op, path.display(), message)
            }
        }
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_translation() {
        let path = Path::new("/tmp/x.index");
        let err = Error::io("open", path, io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, Error::NotFound(_)));
        let err = Error::io("pwrite", path, io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(matches!(err, Error::NoDiskSpace(_)));
        let err = Error::io("read", path, io::Error::from_raw_os_error(libc::ESTALE));
        assert!(matches!(err, Error::StaleHandle(_)));
        let err = Error::io("mmap", path, io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(err, Error::Internal { op: "mmap", .. }));
    }

    #[test]
    fn display_attributes_op_and_path() {
        let err = Error::io(
            "pwrite",
            Path::new("/mail/mailbox.index"),
            io::Error::from_raw_os_error(libc::EIO),
        );
        let text = err.to_string();
        assert!(text.contains("pwrite()"));
        assert!(text.contains("/mail/mailbox.index"));
    }
}
