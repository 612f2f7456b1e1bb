//! Advisory file locking with timeouts.
//!
//! Each index selects one lock method. fcntl locks work on local
//! filesystems, flock covers BSD-style setups, and dotlocks (see the
//! `dotlock` module) are the only primitive that is reliable over NFS. The
//! selection is per-index because one host may mix storage backends.

use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::error::Error;
use crate::error::Result;

/// How a lock acquisition attempt polls: non-blocking tries separated by
/// this interval until the caller's timeout expires.
pub(crate) const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock method selector, one per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub enum LockMethod {
    /// POSIX advisory record locks (`fcntl(F_SETLK)`).
    Fcntl,
    /// BSD whole-file locks (`flock(2)`).
    Flock,
    /// Sidecar `<path>.lock` files, for NFS.
    Dotlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockType {
    Shared,
    Exclusive,
}

fn fcntl_try_lock(fd: RawFd, typ: Option<LockType>) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match typ {
        Some(LockType::Shared) => libc::F_RDLCK as libc::c_short,
        Some(LockType::Exclusive) => libc::F_WRLCK as libc::c_short,
        None => libc::F_UNLCK as libc::c_short,
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    let ret = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn flock_try_lock(fd: RawFd, typ: Option<LockType>) -> io::Result<()> {
    let op = match typ {
        Some(LockType::Shared) => libc::LOCK_SH | libc::LOCK_NB,
        Some(LockType::Exclusive) => libc::LOCK_EX | libc::LOCK_NB,
        None => libc::LOCK_UN,
    };
    let ret = unsafe { libc::flock(fd, op) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EACCES) | Some(libc::EWOULDBLOCK)
    )
}

/// Acquires `typ` on `fd`, polling until `timeout` expires.
///
/// Returns [`Error::LockTimeout`] if another holder kept the lock for the
/// whole window; nothing is held in that case. Dotlocks never go through
/// here, they lock a sidecar path instead of the fd.
pub(crate) fn acquire(
    fd: RawFd,
    path: &Path,
    method: LockMethod,
    typ: LockType,
    timeout: Duration,
) -> Result<()> {
    debug_assert!(method != LockMethod::Dotlock);

    let deadline = Instant::now() + timeout;
    loop {
        let ret = match method {
            LockMethod::Fcntl => fcntl_try_lock(fd, Some(typ)),
            LockMethod::Flock => flock_try_lock(fd, Some(typ)),
            LockMethod::Dotlock => unreachable!(),
        };
        match ret {
            Ok(()) => return Ok(()),
            Err(err) if would_block(&err) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::LockTimeout(path.to_owned()));
                }
                thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::io("fcntl", path, err)),
        }
    }
}

/// Drops whatever lock `fd` holds. Safe to call on an unlocked fd.
pub(crate) fn release(fd: RawFd, path: &Path, method: LockMethod) -> Result<()> {
    let ret = match method {
        LockMethod::Fcntl => fcntl_try_lock(fd, None),
        LockMethod::Flock => flock_try_lock(fd, None),
        LockMethod::Dotlock => unreachable!(),
    };
    ret.map_err(|err| Error::io("fcntl", path, err))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn lock_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"x").unwrap();
        (dir, file)
    }

    #[test]
    fn exclusive_then_release() {
        let (dir, file) = lock_file();
        let path = dir.path().join("locked");
        acquire(
            file.as_raw_fd(),
            &path,
            LockMethod::Flock,
            LockType::Exclusive,
            Duration::from_millis(100),
        )
        .unwrap();
        release(file.as_raw_fd(), &path, LockMethod::Flock).unwrap();
    }

    #[test]
    fn flock_conflict_times_out() {
        let (dir, file) = lock_file();
        let path = dir.path().join("locked");
        acquire(
            file.as_raw_fd(),
            &path,
            LockMethod::Flock,
            LockType::Exclusive,
            Duration::from_millis(100),
        )
        .unwrap();

        // A second descriptor from the same process conflicts under flock
        // semantics (locks are per open file description).
        let other = File::open(&path).unwrap();
        let start = Instant::now();
        let err = acquire(
            other.as_raw_fd(),
            &path,
            LockMethod::Flock,
            LockType::Exclusive,
            Duration::from_millis(150),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
