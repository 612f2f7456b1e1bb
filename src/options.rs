//! Index open options and environment hooks.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;
use log::warn;

use crate::lock::LockMethod;
use crate::ondisk::SyncTypes;

bitflags! {
    /// Behavior flags accepted at index open time. The numeric values are
    /// stable because the `MAIL_INDEX_FLAGS` environment variable carries
    /// them as a bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Read files with pread() into heap buffers instead of mmap().
        const MMAP_DISABLE = 0x01;
        /// Aggressively revalidate attribute caches (NFS mounts).
        const NFS_FLUSH = 0x02;
        /// Create dotlocks with O_EXCL instead of the temp-link dance.
        const DOTLOCK_USE_EXCL = 0x04;
        /// Never fsync/fdatasync on commit.
        const FSYNC_DISABLE = 0x08;
        const READONLY = 0x10;
        /// Fail instead of falling back to an in-memory index when the
        /// disk is unusable.
        const NEVER_IN_MEMORY = 0x20;
        /// Keep a backup copy of the previous index checkpoint.
        const KEEP_BACKUPS = 0x40;
        /// Create the index files when they don't exist. Not settable from
        /// the environment.
        const CREATE = 0x100;
    }
}

/// Everything configurable about how an index is opened and synced.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Behavior flags, see [`OpenFlags`].
    pub flags: OpenFlags,
    /// How the index write lock is taken.
    pub lock_method: LockMethod,
    /// Window for acquiring the index lock before `LockTimeout`.
    pub lock_timeout: Duration,
    /// Which change categories force an fsync on commit. Empty means the
    /// log is written but never explicitly flushed.
    pub fsync_mask: SyncTypes,
    /// Mode bits for created files (masked to 0o666).
    pub mode: u32,
    /// Group to chown created files to.
    pub gid: Option<u32>,
    /// Dotlock staleness windows; the veto callback is supplied per call
    /// site, see [`crate::dotlock::DotlockSettings`].
    pub dotlock_timeout: Duration,
    pub dotlock_stale_timeout: Duration,
    pub dotlock_immediate_stale_timeout: Duration,
    /// How many times an ESTALE'd read is retried with a fresh open.
    pub nfs_retry_count: u32,
}

impl Default for IndexOptions {
    fn default() -> IndexOptions {
        IndexOptions {
            flags: OpenFlags::CREATE,
            lock_method: LockMethod::Fcntl,
            lock_timeout: Duration::from_secs(120),
            fsync_mask: SyncTypes::APPEND | SyncTypes::EXPUNGE,
            mode: 0o600,
            gid: None,
            dotlock_timeout: Duration::from_secs(120),
            dotlock_stale_timeout: Duration::from_secs(60),
            dotlock_immediate_stale_timeout: Duration::from_secs(300),
            nfs_retry_count: 2,
        }
    }
}

impl IndexOptions {
    /// Applies the `MAIL_INDEX_FLAGS` bitfield from the environment on top
    /// of `self`. Unknown bits are ignored with a warning.
    pub fn apply_env(mut self) -> IndexOptions {
        if let Ok(raw) = std::env::var("MAIL_INDEX_FLAGS") {
            match raw.trim().parse::<u32>() {
                Ok(bits) => {
                    let known = OpenFlags::from_bits_truncate(bits & !OpenFlags::CREATE.bits());
                    if known.bits() != bits {
                        warn!("MAIL_INDEX_FLAGS has unknown bits: {bits:#x}");
                    }
                    self.flags |= known;
                }
                Err(_) => warn!("MAIL_INDEX_FLAGS is not a number: {raw:?}"),
            }
        }
        self
    }

    pub(crate) fn dotlock_settings(&self) -> crate::dotlock::DotlockSettings {
        crate::dotlock::DotlockSettings {
            timeout: self.dotlock_timeout,
            stale_timeout: self.dotlock_stale_timeout,
            immediate_stale_timeout: self.dotlock_immediate_stale_timeout,
            use_excl: self.flags.contains(OpenFlags::DOTLOCK_USE_EXCL),
            callback: None,
        }
    }
}

/// The `INDEX` environment variable overrides where index files live;
/// storage backends consult this before choosing a directory.
pub fn env_index_dir() -> Option<PathBuf> {
    std::env::var_os("INDEX").map(PathBuf::from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_flag_bits_match_documented_values() {
        assert_eq!(OpenFlags::MMAP_DISABLE.bits(), 0x01);
        assert_eq!(OpenFlags::NFS_FLUSH.bits(), 0x02);
        assert_eq!(OpenFlags::DOTLOCK_USE_EXCL.bits(), 0x04);
        assert_eq!(OpenFlags::FSYNC_DISABLE.bits(), 0x08);
        assert_eq!(OpenFlags::READONLY.bits(), 0x10);
        assert_eq!(OpenFlags::NEVER_IN_MEMORY.bits(), 0x20);
        assert_eq!(OpenFlags::KEEP_BACKUPS.bits(), 0x40);
    }
}
