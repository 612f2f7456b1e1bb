//! The per-mailbox index.
//!
//! An [`Index`] is a cheap-to-clone handle; the shared state behind it owns
//! the head [`Map`], the transaction log and the lock bookkeeping. The
//! index file itself is only a checkpoint of the log, replaced atomically
//! (write to `.tmp`, rename) at commit, so published maps stay immutable
//! and readers never need a lock to look at their snapshot.
//!
//! Cross-process write exclusion locks the transaction log head file. The
//! head can be rotated away between open and lock, so acquisition rechecks
//! that the locked file is still the head and retries if not.

use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::error;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::apply::ApplyContext;
use crate::apply::apply_entry;
use crate::dotlock::Dotlock;
use crate::error::Error;
use crate::error::Result;
use crate::extension::Extensions;
use crate::extension::SyncHandlerKind;
use crate::keywords::Keywords;
use crate::lock;
use crate::lock::LockMethod;
use crate::lock::LockType;
use crate::map::Map;
use crate::mmap::FileMap;
use crate::ondisk::CACHE_SUFFIX;
use crate::ondisk::HeaderFlags;
use crate::ondisk::INDEX_SUFFIX;
use crate::ondisk::LOG_ROTATED_SUFFIX;
use crate::ondisk::LOG_SUFFIX;
use crate::ondisk::TMP_SUFFIX;
use crate::options::IndexOptions;
use crate::options::OpenFlags;
use crate::transaction::Transaction;
use crate::translog::LogPosition;
use crate::translog::TransactionLog;
use crate::view::View;

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Fresh indexid: wall-clock seconds, salted so two creations inside one
/// second in one process still differ.
fn new_indexid() -> u32 {
    static SALT: AtomicU32 = AtomicU32::new(0);
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1);
    secs.wrapping_add(SALT.fetch_add(1, Ordering::Relaxed)).max(1)
}

pub(crate) struct IndexState {
    pub(crate) opened: bool,
    pub(crate) options: IndexOptions,
    pub(crate) indexid: u32,
    pub(crate) map: Option<Arc<Map>>,
    /// (dev, ino) of the checkpoint file the current map came from.
    map_stat: Option<(u64, u64)>,
    pub(crate) log: Option<TransactionLog>,
    pub(crate) in_memory: bool,
    pub(crate) corrupted: bool,
    pub(crate) readonly: bool,
    pub(crate) nodiskspace: bool,
    pub(crate) last_error: Option<String>,
    lock_type: Option<LockType>,
    lock_count: u32,
    dotlock: Option<Dotlock>,
}

pub(crate) struct IndexInner {
    pub(crate) extensions: Arc<Extensions>,
    pub(crate) keywords: Keywords,
    pub(crate) base_path: PathBuf,
    pub(crate) index_path: PathBuf,
    pub(crate) state: Mutex<IndexState>,
}

/// Handle to one mailbox index. Clones share state.
#[derive(Clone)]
pub struct Index {
    pub(crate) inner: Arc<IndexInner>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("base_path", &self.inner.base_path)
            .finish()
    }
}

impl Index {
    pub(crate) fn alloc(extensions: Arc<Extensions>, dir: &Path, prefix: &str) -> Index {
        let base_path = dir.join(prefix);
        let index_path = suffixed(&base_path, INDEX_SUFFIX);
        Index {
            inner: Arc::new(IndexInner {
                extensions,
                keywords: Keywords::new(),
                base_path,
                index_path,
                state: Mutex::new(IndexState {
                    opened: false,
                    options: IndexOptions::default(),
                    indexid: 0,
                    map: None,
                    map_stat: None,
                    log: None,
                    in_memory: false,
                    corrupted: false,
                    readonly: false,
                    nodiskspace: false,
                    last_error: None,
                    lock_type: None,
                    lock_count: 0,
                    dotlock: None,
                }),
            }),
        }
    }

    /// The `<dir>/<prefix>` base every file name derives from.
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    /// Path of the primary index file.
    pub fn index_path(&self) -> &Path {
        &self.inner.index_path
    }

    pub(crate) fn cache_path(&self) -> PathBuf {
        suffixed(&self.inner.base_path, CACHE_SUFFIX)
    }

    /// The index's keyword registry.
    pub fn keywords(&self) -> &Keywords {
        &self.inner.keywords
    }

    /// The engine-wide extension registry.
    pub fn extensions(&self) -> &Extensions {
        &self.inner.extensions
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, IndexState> {
        self.inner.state.lock()
    }

    /// Whether [`Index::open`] has succeeded on this handle.
    pub fn is_open(&self) -> bool {
        self.state().opened
    }

    /// Whether the index lives in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.state().in_memory
    }

    /// The current mailbox incarnation id.
    pub fn indexid(&self) -> u32 {
        self.state().indexid
    }

    /// The last error message recorded for this index.
    pub fn last_error_message(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Clears the recorded error and the no-disk-space latch.
    pub fn reset_error(&self) {
        let mut state = self.state();
        state.last_error = None;
        state.nodiskspace = false;
    }

    pub(crate) fn set_error(&self, state: &mut IndexState, err: &Error) {
        if let Error::NoDiskSpace(_) = err {
            state.nodiskspace = true;
        }
        let message = err.to_string();
        error!("{message}");
        state.last_error = Some(message);
    }

    /// Opens (or creates, with [`OpenFlags::CREATE`]) the index files.
    pub fn open(&self, options: IndexOptions) -> Result<()> {
        let mut state = self.state();
        if state.opened {
            if !state.corrupted {
                return Ok(());
            }
            // Corrupted: drop everything and reopen from disk.
            Self::close_locked(&mut state);
        }
        state.options = options;
        state.readonly = state.options.flags.contains(OpenFlags::READONLY);
        match self.open_files_locked(&mut state) {
            Ok(()) => {
                state.opened = true;
                state.corrupted = false;
                Ok(())
            }
            Err(err) => {
                self.set_error(&mut state, &err);
                Self::close_locked(&mut state);
                Err(err)
            }
        }
    }

    fn open_files_locked(&self, state: &mut IndexState) -> Result<()> {
        let create = state.options.flags.contains(OpenFlags::CREATE);

        let mut log = match TransactionLog::open(&self.inner.base_path) {
            Ok(log) => log,
            Err(Error::Corrupted(path, msg)) => {
                warn!("{}: {msg}", path.display());
                if !create {
                    return Err(Error::Corrupted(path, msg));
                }
                None
            }
            Err(err) => return Err(err),
        };

        if log.is_none() {
            if !create {
                return Err(Error::NotFound(self.inner.index_path.clone()));
            }
            // Keep indexid and log sequence continuity with an existing
            // checkpoint if there is one.
            let existing = self.try_map_file_locked(state)?;
            let (indexid, file_seq) = match &existing {
                Some((map, _)) => (map.hdr.indexid, map.hdr.log_file_seq + 1),
                None => (new_indexid(), 1),
            };
            match TransactionLog::create(&self.inner.base_path, indexid, file_seq.max(1)) {
                Ok(created) => log = Some(created),
                Err(err @ Error::NoDiskSpace(_)) => {
                    return self.fallback_to_memory_locked(state, err);
                }
                Err(err) => return Err(err),
            }
            self.set_created_file_permissions(state, suffixed(&self.inner.base_path, LOG_SUFFIX).as_path());
            if let Some((map, stat)) = existing {
                state.map = Some(Arc::new(map));
                state.map_stat = Some(stat);
            }
        }
        let log = log.expect("log opened or created above");
        state.indexid = log.indexid();
        state.log = Some(log);

        self.load_map_locked(state)?;
        Ok(())
    }

    /// Maps the checkpoint file. `Ok(None)` when it doesn't exist or was
    /// corrupted (in which case it has been unlinked for rebuild).
    fn try_map_file_locked(
        &self,
        state: &mut IndexState,
    ) -> Result<Option<(Map, (u64, u64))>> {
        let path = &self.inner.index_path;
        let file = if state.readonly {
            File::open(path)
        } else {
            fs::OpenOptions::new().read(true).write(true).open(path)
        };
        let file = match file {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.raw_os_error() == Some(libc::EACCES) => {
                state.readonly = true;
                File::open(path).map_err(|err| Error::io("open", path, err))?
            }
            Err(err) => return Err(Error::io("open", path, err)),
        };
        let meta = file
            .metadata()
            .map_err(|err| Error::io("fstat", path, err))?;
        let buf = if state.options.flags.contains(OpenFlags::MMAP_DISABLE) {
            FileMap::read_file(&file, path)?
        } else {
            FileMap::map_file(&file, path)?
        };
        match Map::from_buffer(buf, path) {
            Ok(map) => Ok(Some((map, (meta.dev(), meta.ino())))),
            Err(err @ Error::Corrupted(..)) => {
                // Never ignored: unlink so the next open recreates, and
                // tell the caller so it can rebuild from the mail storage.
                self.set_error(state, &err);
                if let Err(err) = fs::remove_file(path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(Error::io("unlink", path, err));
                    }
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// (Re)loads the head map to match `state.indexid`, falling back to an
    /// empty map anchored at the log head. Also reconciles the checkpoint's
    /// log position with what the log still contains (the sync-lost check).
    fn load_map_locked(&self, state: &mut IndexState) -> Result<()> {
        if state.map.is_none() {
            if let Some((map, stat)) = self.try_map_file_locked(state)? {
                if map.hdr.indexid == state.indexid {
                    state.map = Some(Arc::new(map));
                    state.map_stat = Some(stat);
                } else {
                    // Checkpoint of an older incarnation of the mailbox.
                    warn!(
                        "{}: indexid {} != {}, discarding checkpoint",
                        self.inner.index_path.display(),
                        map.hdr.indexid,
                        state.indexid
                    );
                    let _ = fs::remove_file(&self.inner.index_path);
                }
            }
        }

        let log = state.log.as_ref().expect("log is open");
        let map = match state.map.take() {
            Some(map) => map,
            None => {
                // No usable checkpoint: replay whatever the log chain
                // still holds, from its earliest reachable position.
                let earliest = log.earliest_position();
                let mut map = Map::empty(state.indexid, state.indexid);
                map.hdr.log_file_seq = earliest.file_seq;
                map.hdr.log_file_int_offset = earliest.offset;
                map.hdr.log_file_ext_offset = earliest.offset;
                map.sync_header_block();
                state.map_stat = None;
                Arc::new(map)
            }
        };

        state.map = Some(map);
        self.catch_up_map_locked(state)
    }

    /// Advances the head map to the log head. The checkpoint can lag the
    /// log after a crash or when a writer fell back to memory-only mode
    /// without checkpointing.
    fn catch_up_map_locked(&self, state: &mut IndexState) -> Result<()> {
        let map = state.map.clone().expect("map is loaded");
        let pos = LogPosition {
            file_seq: map.hdr.log_file_seq,
            offset: map.hdr.log_file_int_offset,
        };
        let log = state.log.as_ref().expect("log is open");
        let head = log.head_position();
        if pos == head {
            self.seed_keywords(&map);
            return Ok(());
        }
        match log.view(pos, head)? {
            Some(mut replay) => {
                let ctx = ApplyContext {
                    extensions: &self.inner.extensions,
                    kind: SyncHandlerKind::Head,
                    run_expunge_handlers: false,
                };
                let mut caught_up = map.to_memory();
                while let Some(entry) = replay.next()? {
                    apply_entry(&mut caught_up, &entry, &ctx, &self.inner.index_path)?;
                }
                caught_up.hdr.log_file_seq = head.file_seq;
                caught_up.hdr.log_file_int_offset = head.offset;
                caught_up.sync_header_block();
                let caught_up = Arc::new(caught_up);
                self.seed_keywords(&caught_up);
                state.map = Some(caught_up);
            }
            None => {
                // The log no longer contains the map's position: derived
                // state everywhere is invalid.
                warn!(
                    "{}: log position {}/{} lost, syncs reset",
                    self.inner.index_path.display(),
                    pos.file_seq,
                    pos.offset
                );
                self.inner.extensions.call_sync_lost_all();
                let mut fixed = map.to_memory();
                fixed.hdr.log_file_seq = head.file_seq;
                fixed.hdr.log_file_int_offset = head.offset;
                fixed.hdr.log_file_ext_offset = head.offset;
                fixed.sync_header_block();
                state.map = Some(Arc::new(fixed));
                state.map_stat = None;
            }
        }
        Ok(())
    }

    /// Mirrors the map's keyword list into the index's registry, in bit
    /// order.
    pub(crate) fn seed_keywords(&self, map: &Map) {
        for name in &map.keywords {
            self.inner.keywords.lookup_or_create(name);
        }
    }

    fn fallback_to_memory_locked(&self, state: &mut IndexState, err: Error) -> Result<()> {
        if state.options.flags.contains(OpenFlags::NEVER_IN_MEMORY) {
            return Err(err);
        }
        self.set_error(state, &err);
        warn!(
            "{}: falling back to in-memory index",
            self.inner.index_path.display()
        );
        state.in_memory = true;
        let indexid = if state.indexid != 0 {
            state.indexid
        } else {
            new_indexid()
        };
        state.indexid = indexid;
        let log = TransactionLog::in_memory(indexid, 1);
        let head = log.head_position();
        let mut map = match state.map.take() {
            Some(map) => map.to_memory(),
            None => Map::empty(indexid, indexid),
        };
        map.hdr.log_file_seq = head.file_seq;
        map.hdr.log_file_int_offset = head.offset;
        map.hdr.log_file_ext_offset = head.offset;
        map.sync_header_block();
        state.map = Some(Arc::new(map));
        state.map_stat = None;
        state.log = Some(log);
        Ok(())
    }

    /// Moves a file-backed index fully into memory. Used when the disk
    /// becomes unusable mid-session.
    pub fn move_to_memory(&self) -> Result<()> {
        let mut state = self.state();
        if state.in_memory {
            return Ok(());
        }
        if state.options.flags.contains(OpenFlags::NEVER_IN_MEMORY) {
            return Err(Error::Internal {
                op: "move_to_memory",
                path: self.inner.index_path.clone(),
                message: "index is configured never-in-memory".to_string(),
            });
        }
        if let Some(map) = state.map.take() {
            state.map = Some(Arc::new(map.to_memory()));
        }
        if let Some(log) = state.log.as_mut() {
            log.move_to_memory()?;
        }
        state.map_stat = None;
        state.in_memory = true;
        Ok(())
    }

    fn close_locked(state: &mut IndexState) {
        state.map = None;
        state.map_stat = None;
        state.log = None;
        state.opened = false;
        state.indexid = 0;
        state.in_memory = false;
        state.lock_type = None;
        state.lock_count = 0;
        state.dotlock = None;
    }

    /// Closes all files; the handle can be re-opened later.
    pub fn close(&self) {
        let mut state = self.state();
        Self::close_locked(&mut state);
    }

    /// Removes every file belonging to the index. Reports the last error
    /// if several removals fail.
    pub fn unlink(&self) -> Result<()> {
        let state = self.state();
        if state.in_memory {
            return Ok(());
        }
        drop(state);
        let mut last_err = None;
        for path in [
            self.inner.index_path.clone(),
            suffixed(&self.inner.base_path, LOG_SUFFIX),
            suffixed(&self.inner.base_path, LOG_ROTATED_SUFFIX),
            self.cache_path(),
        ] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    last_err = Some(Error::io("unlink", &path, err));
                }
            }
        }
        match last_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Marks the index structurally broken: the checkpoint is unlinked so
    /// the next open rebuilds, and every open view turns inconsistent.
    pub fn mark_corrupted(&self) {
        let mut state = self.state();
        state.corrupted = true;
        state.indexid = 0;
        if !state.in_memory {
            if let Err(err) = fs::remove_file(&self.inner.index_path) {
                if err.kind() != io::ErrorKind::NotFound
                    && err.raw_os_error() != Some(libc::ESTALE)
                {
                    let err = Error::io("unlink", &self.inner.index_path, err);
                    self.set_error(&mut state, &err);
                }
            }
        }
    }

    /// Brings the head map up to date with the files on disk. Detects
    /// mailbox recreation (new indexid) and delivers sync-lost.
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.state();
        self.refresh_locked(&mut state)
    }

    pub(crate) fn refresh_locked(&self, state: &mut IndexState) -> Result<()> {
        if !state.opened {
            return Err(Error::Internal {
                op: "refresh",
                path: self.inner.index_path.clone(),
                message: "index is not open".to_string(),
            });
        }
        if state.in_memory {
            return Ok(());
        }
        let log = state.log.as_mut().expect("open index has a log");
        log.refresh()?;
        if log.indexid() != state.indexid {
            // The mailbox was deleted and recreated under us.
            warn!(
                "{}: indexid changed {} -> {}",
                self.inner.index_path.display(),
                state.indexid,
                log.indexid()
            );
            self.inner.extensions.call_sync_lost_all();
            state.indexid = log.indexid();
            state.map = None;
            state.map_stat = None;
            return self.load_map_locked(state);
        }

        // A commit replaces the checkpoint file; a changed inode is the
        // signal to remap.
        let changed = match fs::metadata(&self.inner.index_path) {
            Ok(meta) => state.map_stat != Some((meta.dev(), meta.ino())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => state.map_stat.is_some(),
            Err(err) if err.raw_os_error() == Some(libc::ESTALE) => true,
            Err(err) => return Err(Error::io("stat", &self.inner.index_path, err)),
        };
        if changed {
            state.map = None;
            state.map_stat = None;
            self.load_map_locked(state)?;
        } else {
            // Same checkpoint, but the log may have moved past it.
            self.catch_up_map_locked(state)?;
        }
        Ok(())
    }

    /// Writes `image` as the new checkpoint, atomically replacing the old
    /// file. With [`OpenFlags::KEEP_BACKUPS`] the previous checkpoint is
    /// preserved as `.backup` first.
    pub(crate) fn checkpoint_locked(&self, state: &mut IndexState, image: &[u8]) -> Result<()> {
        if state.in_memory || state.readonly {
            return Ok(());
        }
        let path = &self.inner.index_path;
        let tmp_path = suffixed(path, TMP_SUFFIX);
        let write = || -> io::Result<File> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            io::Write::write_all(&mut file, image)?;
            if !state.options.flags.contains(OpenFlags::FSYNC_DISABLE) {
                file.sync_data()?;
            }
            Ok(file)
        };
        match write() {
            Ok(_) => {}
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(Error::io("pwrite", &tmp_path, err));
            }
        }
        self.set_created_file_permissions(state, &tmp_path);
        if state.options.flags.contains(OpenFlags::KEEP_BACKUPS) {
            let backup = suffixed(path, ".backup");
            if let Err(err) = fs::copy(path, &backup) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("backup of {} failed: {err}", path.display());
                }
            }
        }
        fs::rename(&tmp_path, path).map_err(|err| Error::io("rename", &tmp_path, err))?;
        match fs::metadata(path) {
            Ok(meta) => state.map_stat = Some((meta.dev(), meta.ino())),
            Err(_) => state.map_stat = None,
        }
        Ok(())
    }

    /// fchown/fchmod dance for freshly created files, degrading group
    /// modes the way the permission matrix allows.
    fn set_created_file_permissions(&self, state: &IndexState, path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mode = state.options.mode & 0o666;
        let Some(gid) = state.options.gid else {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
            return;
        };
        let chown_ok = nix::unistd::chown(
            path,
            None,
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .is_ok();
        let mode = if chown_ok {
            mode
        } else if mode & 0o066 == 0 {
            // Group doesn't matter for this mode, ignore silently.
            mode
        } else if mode & 0o060 == 0 {
            // Everyone-but-group had access; don't expose the file to the
            // group we failed to switch to.
            warn!("chown({}) failed, restricting mode", path.display());
            mode & 0o600
        } else {
            warn!("chown({}) failed, giving group the world bits", path.display());
            (mode & 0o606) | ((mode & 0o6) << 3)
        };
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }

    // --- Locking -------------------------------------------------------

    fn lock_locked(&self, state: &mut IndexState, typ: LockType, timeout: Duration) -> Result<()> {
        if state.in_memory {
            state.lock_type.get_or_insert(typ);
            state.lock_count += 1;
            return Ok(());
        }
        match (state.lock_type, typ) {
            (Some(LockType::Shared), LockType::Exclusive) => {
                // Upgrading would deadlock against another upgrader.
                return Err(Error::Internal {
                    op: "lock",
                    path: self.inner.index_path.clone(),
                    message: "shared to exclusive lock upgrade is forbidden".to_string(),
                });
            }
            (Some(_), _) => {
                state.lock_count += 1;
                return Ok(());
            }
            (None, _) => {}
        }

        let method = state.options.lock_method;
        if method == LockMethod::Dotlock {
            let mut settings = state.options.dotlock_settings();
            settings.timeout = timeout;
            let dotlock = Dotlock::create(&self.inner.base_path, &mut settings)?;
            state.dotlock = Some(dotlock);
        } else {
            // The lock lives on the log head. Rotation can swap the head
            // between open and lock, so verify and retry.
            loop {
                let log = state.log.as_mut().expect("open index has a log");
                log.refresh()?;
                let Some(fd) = log.raw_fd() else { break };
                let path = log.path().to_owned();
                lock::acquire(fd, &path, method, typ, timeout)?;
                if !log.head_changed()? {
                    break;
                }
                lock::release(fd, &path, method)?;
            }
        }
        state.lock_type = Some(typ);
        state.lock_count = 1;
        Ok(())
    }

    fn unlock_locked(&self, state: &mut IndexState) -> Result<()> {
        assert!(state.lock_count > 0, "unlock without lock");
        state.lock_count -= 1;
        if state.lock_count > 0 {
            return Ok(());
        }
        state.lock_type = None;
        if state.in_memory {
            return Ok(());
        }
        if let Some(dotlock) = state.dotlock.take() {
            return dotlock.delete();
        }
        if let Some(log) = state.log.as_ref() {
            if let Some(fd) = log.raw_fd() {
                lock::release(fd, log.path(), state.options.lock_method)?;
            }
        }
        Ok(())
    }

    /// Takes the shared lock, nestable. Times out without side effects.
    pub fn lock_shared(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state();
        self.lock_locked(&mut state, LockType::Shared, timeout)
    }

    /// Takes the exclusive (writer) lock, nestable. Times out without side
    /// effects.
    pub fn lock_exclusive(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state();
        self.lock_locked(&mut state, LockType::Exclusive, timeout)
    }

    pub(crate) fn lock_exclusive_locked(
        &self,
        state: &mut IndexState,
        timeout: Duration,
    ) -> Result<()> {
        self.lock_locked(state, LockType::Exclusive, timeout)
    }

    /// Releases one level of lock nesting.
    pub fn unlock(&self) -> Result<()> {
        let mut state = self.state();
        self.unlock_locked(&mut state)
    }

    pub(crate) fn unlock_internal(&self, state: &mut IndexState) -> Result<()> {
        self.unlock_locked(state)
    }

    // --- Views and transactions ---------------------------------------

    /// Opens a reader snapshot at the current head.
    pub fn view(&self) -> Result<View> {
        let state = self.state();
        let map = state.map.clone().ok_or_else(|| Error::Internal {
            op: "view",
            path: self.inner.index_path.clone(),
            message: "index is not open".to_string(),
        })?;
        Ok(View::new(
            self.clone(),
            state.indexid,
            map.clone(),
            LogPosition {
                file_seq: map.hdr.log_file_seq,
                offset: map.hdr.log_file_int_offset,
            },
        ))
    }

    /// Starts an empty transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Commits a transaction; see `sync` for the write path.
    pub fn commit(&self, txn: Transaction) -> Result<crate::sync::CommitInfo> {
        crate::sync::commit(self, txn)
    }

    /// Whether the index header carries the corrupted flag or the handle
    /// was marked corrupted.
    pub fn is_corrupted(&self) -> bool {
        let state = self.state();
        if state.corrupted {
            return true;
        }
        state
            .map
            .as_ref()
            .is_some_and(|map| HeaderFlags::from_bits_truncate(map.hdr.flags)
                .contains(HeaderFlags::CORRUPTED))
    }
}
