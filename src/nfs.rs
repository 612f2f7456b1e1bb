//! NFS staleness workarounds.
//!
//! A file opened before a remote rename can turn stale (`ESTALE`) at any
//! read. The policy is explicit rather than ad-hoc: operations that might
//! race a remote replacement run under [`with_stale_retry`], which retries
//! with fresh opens up to the configured count.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::warn;

use crate::error::Error;
use crate::error::Result;

/// Runs `op`, retrying up to `retries` times when it reports a stale
/// handle. `op` is expected to re-open its file on every call.
pub(crate) fn with_stale_retry<T>(retries: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(Error::StaleHandle(path)) if attempt < retries => {
                attempt += 1;
                warn!(
                    "{}: stale file handle, retry {attempt}/{retries}",
                    path.display()
                );
            }
            other => return other,
        }
    }
}

/// Whether `file` is still the file `path` names (same dev/ino). A
/// mismatch means the file was replaced remotely and must be re-opened.
pub(crate) fn is_same_file(file: &File, path: &Path) -> Result<bool> {
    let ours = match file.metadata() {
        Ok(meta) => meta,
        Err(err) if err.raw_os_error() == Some(libc::ESTALE) => return Ok(false),
        Err(err) => return Err(Error::io("fstat", path, err)),
    };
    match std::fs::metadata(path) {
        Ok(st) => Ok(st.ino() == ours.ino() && st.dev() == ours.dev()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) if err.raw_os_error() == Some(libc::ESTALE) => Ok(false),
        Err(err) => Err(Error::io("stat", path, err)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retries_are_bounded() {
        let mut calls = 0;
        let result: Result<()> = with_stale_retry(2, || {
            calls += 1;
            Err(Error::StaleHandle("/nfs/x".into()))
        });
        assert!(matches!(result, Err(Error::StaleHandle(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn success_passes_through() {
        let result = with_stale_retry(2, || Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn same_file_detects_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"a").unwrap();
        let file = File::open(&path).unwrap();
        assert!(is_same_file(&file, &path).unwrap());

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"b").unwrap();
        assert!(!is_same_file(&file, &path).unwrap());
    }
}
