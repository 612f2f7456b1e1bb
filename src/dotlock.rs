//! Dotlock files: the NFS-safe locking fallback.
//!
//! A dotlock is a sidecar `<path>.lock` created either with `O_EXCL`
//! (`use_excl`, safe on NFSv3+) or by linking a unique temp file into
//! place, which is atomic even on old NFS servers. Staleness is judged by
//! the lock file's age: beyond `immediate_stale_timeout` the lock is
//! clearly abandoned and overridden outright; beyond `stale_timeout` the
//! wait callback is consulted and may veto the override.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use log::warn;

use crate::error::Error;
use crate::error::Result;
use crate::lock::LOCK_POLL_INTERVAL;
use crate::ondisk::DOTLOCK_SUFFIX;

/// Progress callback invoked while waiting on a foreign dotlock. Receives
/// the elapsed wait time and whether the engine is about to override a
/// stale lock; returning `false` in the latter case vetoes the override.
pub type DotlockCallback = dyn FnMut(Duration, bool) -> bool + Send;

/// Dotlock tunables, one set per index (the cache carries its own).
pub struct DotlockSettings {
    /// Total time to wait for the lock before `LockTimeout`.
    pub timeout: Duration,
    /// Age after which a foreign lock is considered stale, pending callback
    /// approval.
    pub stale_timeout: Duration,
    /// Age after which a foreign lock is overridden without asking.
    pub immediate_stale_timeout: Duration,
    /// Create the lock file with `O_EXCL` instead of the temp-file/link
    /// dance.
    pub use_excl: bool,
    pub callback: Option<Box<DotlockCallback>>,
}

impl std::fmt::Debug for DotlockSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotlockSettings")
            .field("timeout", &self.timeout)
            .field("stale_timeout", &self.stale_timeout)
            .field("immediate_stale_timeout", &self.immediate_stale_timeout)
            .field("use_excl", &self.use_excl)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for DotlockSettings {
    fn default() -> DotlockSettings {
        DotlockSettings {
            timeout: Duration::from_secs(120),
            stale_timeout: Duration::from_secs(60),
            immediate_stale_timeout: Duration::from_secs(300),
            use_excl: false,
            callback: None,
        }
    }
}

/// A held dotlock. Deleting it releases the lock; dropping without
/// [`Dotlock::delete`] releases it too, swallowing errors.
#[derive(Debug)]
pub struct Dotlock {
    lock_path: PathBuf,
    released: bool,
}

fn lock_file_age(lock_path: &Path) -> io::Result<Duration> {
    let meta = fs::metadata(lock_path)?;
    let mtime = meta.modified()?;
    Ok(SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO))
}

fn try_create_excl(lock_path: &Path) -> io::Result<bool> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

fn try_create_link(lock_path: &Path) -> io::Result<bool> {
    // The temp name is unique per host+pid so concurrent creators never
    // collide; link(2) then either succeeds atomically or EEXISTs.
    let tmp_path = lock_path.with_extension(format!(
        "lock.tmp.{}.{}",
        nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string()),
        std::process::id()
    ));
    fs::write(&tmp_path, b"")?;
    let ret = match fs::hard_link(&tmp_path, lock_path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    };
    let _ = fs::remove_file(&tmp_path);
    ret
}

impl Dotlock {
    /// Creates `<path>.lock`, waiting out and possibly overriding a foreign
    /// holder per `settings`.
    pub fn create(path: &Path, settings: &mut DotlockSettings) -> Result<Dotlock> {
        let lock_path = {
            let mut os = path.as_os_str().to_owned();
            os.push(DOTLOCK_SUFFIX);
            PathBuf::from(os)
        };

        let start = Instant::now();
        let deadline = start + settings.timeout;
        loop {
            let created = if settings.use_excl {
                try_create_excl(&lock_path)
            } else {
                try_create_link(&lock_path)
            }
            .map_err(|err| Error::io("open", &lock_path, err))?;
            if created {
                return Ok(Dotlock {
                    lock_path,
                    released: false,
                });
            }

            // Lock held by someone else. Stale?
            match lock_file_age(&lock_path) {
                Ok(age) if age >= settings.immediate_stale_timeout => {
                    warn!(
                        "Overriding stale dotlock {} (age {}s)",
                        lock_path.display(),
                        age.as_secs()
                    );
                    let _ = fs::remove_file(&lock_path);
                    continue;
                }
                Ok(age) if age >= settings.stale_timeout => {
                    let allowed = match settings.callback.as_mut() {
                        Some(cb) => cb(start.elapsed(), true),
                        None => true,
                    };
                    if allowed {
                        warn!(
                            "Overriding stale dotlock {} (age {}s)",
                            lock_path.display(),
                            age.as_secs()
                        );
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                }
                Ok(_) => {}
                // Holder released between our create attempt and the stat.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::io("stat", &lock_path, err)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(path.to_owned()));
            }
            if let Some(cb) = settings.callback.as_mut() {
                cb(start.elapsed(), false);
            }
            thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Releases the lock by unlinking the sidecar file.
    pub fn delete(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Someone decided we were stale. Nothing left to release,
                // but the caller should know its writes were unprotected.
                warn!("Our dotlock {} was overridden", self.lock_path.display());
                Ok(())
            }
            Err(err) => Err(Error::io("unlink", &self.lock_path, err)),
        }
    }
}

impl Drop for Dotlock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings(timeout_ms: u64) -> DotlockSettings {
        DotlockSettings {
            timeout: Duration::from_millis(timeout_ms),
            ..DotlockSettings::default()
        }
    }

    #[test]
    fn create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbox.index");
        let lock = Dotlock::create(&path, &mut settings(100)).unwrap();
        assert!(dir.path().join("mbox.index.lock").exists());
        lock.delete().unwrap();
        assert!(!dir.path().join("mbox.index.lock").exists());
    }

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbox.index");
        let _held = Dotlock::create(&path, &mut settings(100)).unwrap();
        let err = Dotlock::create(&path, &mut settings(150)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[test]
    fn stale_lock_is_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbox.index");
        let lock_path = dir.path().join("mbox.index.lock");
        fs::write(&lock_path, b"").unwrap();
        // Zero stale timeouts make the existing lock immediately stale.
        let mut s = DotlockSettings {
            timeout: Duration::from_millis(500),
            stale_timeout: Duration::ZERO,
            immediate_stale_timeout: Duration::ZERO,
            use_excl: true,
            callback: None,
        };
        let lock = Dotlock::create(&path, &mut s).unwrap();
        lock.delete().unwrap();
    }

    #[test]
    fn callback_can_veto_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbox.index");
        fs::write(dir.path().join("mbox.index.lock"), b"").unwrap();
        let mut s = DotlockSettings {
            timeout: Duration::from_millis(150),
            stale_timeout: Duration::ZERO,
            immediate_stale_timeout: Duration::from_secs(3600),
            use_excl: true,
            callback: Some(Box::new(|_, overriding| !overriding)),
        };
        let err = Dotlock::create(&path, &mut s).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }
}
