//! The message content cache.
//!
//! `<prefix>.cache` stores variable-length cached fields per mail (message
//! size, dates, parsed header values). Records are append-only; a mail
//! gaining fields later grows a linked list of records, newest first, and
//! the offset of the newest record lives in the mail's cache-extension
//! slot in the index. The whole file is rewritten by compaction
//! (`compress.rs`), which bumps the cache extension's reset_id so stale
//! offsets everywhere turn into cache misses instead of wrong data.
//!
//! The cache carries its own lock, independent of the index lock, and is
//! strictly optional: every failure path degrades to "recompute on
//! demand".

mod compress;
pub(crate) mod fields;
mod lookup;

use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::dotlock::Dotlock;
use crate::error::Error;
use crate::error::Result;
use crate::extension::ExtId;
use crate::index::Index;
use crate::lock;
use crate::lock::LockMethod;
use crate::lock::LockType;
use crate::mmap::FileMap;
use crate::nfs;
use crate::ondisk::CACHE_FIELD_HEADER_SIZE;
use crate::ondisk::CACHE_HEADER_SIZE;
use crate::ondisk::CACHE_RECORD_HEADER_SIZE;
use crate::ondisk::CACHE_VERSION;
use crate::ondisk::COMPAT_SIZEOF_FILE_OFFSET;
use crate::ondisk::CacheFieldHeader;
use crate::ondisk::CacheFieldType;
use crate::ondisk::CacheHeader;
use crate::ondisk::CacheRecordHeader;
use crate::ondisk::TMP_SUFFIX;
use crate::ondisk::align4;
use crate::options::OpenFlags;
use crate::transaction::Transaction;
use crate::view::View;
pub use fields::CacheFieldId;

/// Compaction triggers: linked-list records or dead space reaching this
/// share of the file, once the file is big enough to matter.
const COMPRESS_CONTINUED_PERCENTAGE: u32 = 30;
const COMPRESS_DELETED_PERCENTAGE: u32 = 30;
const COMPRESS_MIN_SIZE: u32 = 32 * 1024;

const CACHE_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Hit/miss counters, retrievable through the admin API.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Total field lookups.
    pub lookups: u64,
    /// Lookups answered from the cache file.
    pub hits: u64,
    /// Lookups the caller had to recompute.
    pub misses: u64,
}

#[derive(Default)]
struct StatCounters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

pub(crate) struct CacheState {
    pub(crate) opened: bool,
    pub(crate) file: Option<File>,
    pub(crate) map: Option<FileMap>,
    pub(crate) hdr: Option<CacheHeader>,
    /// File field id (ordinal in the file's field block) → registered id.
    pub(crate) file_fields: Vec<Option<CacheFieldId>>,
    locked: bool,
    dotlock: Option<Dotlock>,
    pub(crate) need_compress_file_seq: u32,
}

impl CacheState {
    fn close_file(&mut self) {
        self.file = None;
        self.map = None;
        self.hdr = None;
        self.file_fields.clear();
    }
}

pub(crate) struct CacheInner {
    pub(crate) index: Index,
    pub(crate) path: PathBuf,
    pub(crate) ext_id: ExtId,
    pub(crate) fields: RwLock<fields::FieldRegistry>,
    pub(crate) state: Mutex<CacheState>,
    stats: StatCounters,
    /// Offsets of cache chains whose mails were expunged; folded into
    /// `deleted_space` at the next locked write.
    pending_drops: Arc<Mutex<Vec<u32>>>,
}

/// Handle to one index's message cache. Clones share state.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("path", &self.inner.path).finish()
    }
}

impl Cache {
    /// Sets up the cache for `index`: registers the cache extension and
    /// its handlers. No file I/O happens until the first lookup or add.
    pub fn open(index: &Index) -> Cache {
        let ext_id = index.extensions().register("cache", 0, 4, 4);
        let pending_drops = Arc::new(Mutex::new(Vec::new()));
        let cache = Cache {
            inner: Arc::new(CacheInner {
                index: index.clone(),
                path: index.cache_path(),
                ext_id,
                fields: RwLock::new(fields::FieldRegistry::default()),
                state: Mutex::new(CacheState {
                    opened: false,
                    file: None,
                    map: None,
                    hdr: None,
                    file_fields: Vec::new(),
                    locked: false,
                    dotlock: None,
                    need_compress_file_seq: 0,
                }),
                stats: StatCounters::default(),
                pending_drops: pending_drops.clone(),
            }),
        };

        // When a mail goes away its cache chain becomes dead space.
        {
            let pending = pending_drops.clone();
            index.extensions().set_expunge_handler(
                ext_id,
                Box::new(move |_uid, data| {
                    if let Ok(offset) = u32::read_from_bytes(data) {
                        if offset != 0 {
                            pending.lock().push(offset);
                        }
                    }
                }),
            );
        }
        // Replay from an unexpected log position invalidates everything we
        // have mapped.
        {
            let weak = Arc::downgrade(&cache.inner);
            index.extensions().set_sync_lost_handler(
                ext_id,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().close_file();
                    }
                }),
            );
        }
        cache
    }

    /// Registers a cached field by name. Idempotent.
    pub fn register_field(&self, name: &str, typ: CacheFieldType, size: u32) -> CacheFieldId {
        self.inner.fields.write().register(name, typ, size)
    }

    /// The id of an already-registered field.
    pub fn lookup_field(&self, name: &str) -> Option<CacheFieldId> {
        self.inner.fields.read().lookup(name)
    }

    pub(crate) fn ext_id(&self) -> ExtId {
        self.inner.ext_id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock()
    }

    // --- Stats and admin ----------------------------------------------

    pub(crate) fn count_lookup(&self, hit: bool) {
        self.inner.stats.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.inner.stats.lookups.load(Ordering::Relaxed),
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
        }
    }

    /// Logs the hit rate. Admin operation, replaces the old SIGUSR2 hook.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let rate = if stats.lookups == 0 {
            0.0
        } else {
            stats.hits as f64 * 100.0 / stats.lookups as f64
        };
        info!(
            "{}: {} lookups, {:.1}% hits",
            self.inner.path.display(),
            stats.lookups,
            rate
        );
    }

    /// Drops all mapped cache state; the next lookup re-opens from disk.
    /// Admin operation, replaces the old SIGHUP hook.
    pub fn drop_caches(&self) {
        self.state().close_file();
    }

    // --- File state ----------------------------------------------------

    fn verify_header(&self, bytes: &[u8]) -> Result<Option<CacheHeader>> {
        let path = &self.inner.path;
        if bytes.len() < CACHE_HEADER_SIZE {
            return Err(Error::corrupted(path, "file too small"));
        }
        let (hdr, _) = CacheHeader::read_from_prefix(bytes).expect("length checked");
        if hdr.version != CACHE_VERSION {
            // Version change: upgrade silently by rebuilding later.
            return Ok(None);
        }
        if hdr.compat_sizeof_file_offset != COMPAT_SIZEOF_FILE_OFFSET {
            return Ok(None);
        }
        if hdr.indexid != self.inner.index.indexid() {
            // Cache of another mailbox incarnation.
            return Ok(None);
        }
        if hdr.file_seq == 0 {
            return Err(Error::corrupted(path, "file_seq is 0"));
        }
        if (hdr.used_file_size as usize) < CACHE_HEADER_SIZE {
            return Err(Error::corrupted(path, "used_file_size too small"));
        }
        if hdr.used_file_size % 4 != 0 {
            return Err(Error::corrupted(path, "used_file_size not aligned"));
        }
        Ok(Some(hdr))
    }

    /// Marks the cache unusable and unlinks it so the next writer starts
    /// fresh.
    pub(crate) fn set_corrupted(&self, state: &mut CacheState, why: &str) {
        warn!("Corrupted cache file {}: {why}", self.inner.path.display());
        let _ = fs::remove_file(&self.inner.path);
        state.close_file();
    }

    /// Opens and verifies the cache file, if it exists. Leaves the state
    /// unusable (all lookups miss) on any soft failure.
    pub(crate) fn try_open(&self, state: &mut CacheState) -> Result<()> {
        state.opened = true;
        if self.inner.index.is_in_memory() {
            return Ok(());
        }
        let retries = {
            let index_state = self.inner.index.state();
            index_state.options.nfs_retry_count
        };
        let mmap_disable = {
            let index_state = self.inner.index.state();
            index_state.options.flags.contains(OpenFlags::MMAP_DISABLE)
        };
        let path = &self.inner.path;
        let opened = nfs::with_stale_retry(retries, || {
            let file = match fs::OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(Error::io("open", path, err)),
            };
            let map = if mmap_disable {
                FileMap::read_file(&file, path)?
            } else {
                FileMap::map_file(&file, path)?
            };
            Ok(Some((file, map)))
        })?;
        let Some((file, map)) = opened else {
            state.need_compress_file_seq = 0;
            return Ok(());
        };
        match self.verify_header(map.as_slice()) {
            Ok(Some(hdr)) => {
                state.file_fields = self.read_field_block(&map, &hdr)?;
                state.file = Some(file);
                state.map = Some(map);
                state.hdr = Some(hdr);
            }
            Ok(None) => {
                debug!("{}: cache not usable, ignoring", path.display());
                state.close_file();
            }
            Err(Error::Corrupted(_, why)) => self.set_corrupted(state, &why),
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Re-opens when the file at the path is no longer the one we mapped
    /// (compaction renamed a new one into place).
    pub(crate) fn reopen_if_changed(&self, state: &mut CacheState) -> Result<()> {
        if !state.opened {
            return self.try_open(state);
        }
        let stale = match &state.file {
            Some(file) => !nfs::is_same_file(file, &self.inner.path)?,
            None => true,
        };
        if stale {
            state.close_file();
            self.try_open(state)?;
        } else if let (Some(file), Some(map)) = (&state.file, &mut state.map) {
            // Same file, maybe grown.
            map.refresh(file, &self.inner.path)?;
            if let Ok(Some(hdr)) = self.verify_header(map.as_slice()) {
                state.hdr = Some(hdr);
            }
        }
        Ok(())
    }

    // --- Field block ---------------------------------------------------

    pub(crate) fn build_field_block(&self) -> Vec<u8> {
        let registry = self.inner.fields.read();
        let mut block = Vec::new();
        block.extend_from_slice(&0u32.to_le_bytes()); // size, patched below
        block.extend_from_slice(&(registry.count() as u32).to_le_bytes());
        for (_, field) in registry.iter() {
            let hdr = CacheFieldHeader {
                typ: field.typ.into(),
                unused: [0; 3],
                field_size: field.size,
                name_size: field.name.len() as u32,
            };
            block.extend_from_slice(hdr.as_bytes());
            block.extend_from_slice(field.name.as_bytes());
            block.resize(align4(block.len()), 0);
        }
        let size = (block.len() as u32).to_le_bytes();
        block[..4].copy_from_slice(&size);
        block
    }

    /// Parses the file's field block, registering unknown names so the
    /// file stays fully readable.
    fn read_field_block(&self, map: &FileMap, hdr: &CacheHeader) -> Result<Vec<Option<CacheFieldId>>> {
        let path = &self.inner.path;
        let bytes = map.as_slice();
        let start = hdr.field_header_offset as usize;
        if start == 0 {
            return Ok(Vec::new());
        }
        if start + 8 > bytes.len() {
            return Err(Error::corrupted(path, "field block offset out of bounds"));
        }
        let block_size = u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(bytes[start + 4..start + 8].try_into().unwrap()) as usize;
        let end = start + block_size;
        if end > bytes.len() || block_size < 8 {
            return Err(Error::corrupted(path, "field block size out of bounds"));
        }
        let mut file_fields = Vec::with_capacity(count);
        let mut pos = start + 8;
        let mut registry = self.inner.fields.write();
        for _ in 0..count {
            if pos + CACHE_FIELD_HEADER_SIZE > end {
                return Err(Error::corrupted(path, "field block truncated"));
            }
            let (field_hdr, _) =
                CacheFieldHeader::read_from_prefix(&bytes[pos..]).expect("length checked");
            let name_start = pos + CACHE_FIELD_HEADER_SIZE;
            let name_end = name_start + field_hdr.name_size as usize;
            if name_end > end {
                return Err(Error::corrupted(path, "field name out of bounds"));
            }
            let entry = match (
                std::str::from_utf8(&bytes[name_start..name_end]),
                CacheFieldType::try_from(field_hdr.typ),
            ) {
                (Ok(name), Ok(typ)) => {
                    Some(registry.register(name, typ, field_hdr.field_size))
                }
                _ => None, // unreadable field: values skipped at decode
            };
            file_fields.push(entry);
            pos = align4(name_end);
        }
        Ok(file_fields)
    }

    /// The file-local id of a registered field, if the current file knows
    /// it.
    pub(crate) fn file_field_id(&self, state: &CacheState, id: CacheFieldId) -> Option<u32> {
        state
            .file_fields
            .iter()
            .position(|entry| *entry == Some(id))
            .map(|idx| idx as u32)
    }

    // --- Locking -------------------------------------------------------

    pub(crate) fn lock_file(&self, state: &mut CacheState) -> Result<()> {
        assert!(!state.locked);
        let (method, use_dotlock) = {
            let index_state = self.inner.index.state();
            let method = index_state.options.lock_method;
            (method, method == LockMethod::Dotlock)
        };
        if use_dotlock {
            let mut settings = {
                let index_state = self.inner.index.state();
                index_state.options.dotlock_settings()
            };
            settings.timeout = CACHE_LOCK_TIMEOUT;
            state.dotlock = Some(Dotlock::create(&self.inner.path, &mut settings)?);
        } else {
            let Some(file) = &state.file else {
                return Err(Error::NotFound(self.inner.path.clone()));
            };
            use std::os::unix::io::AsRawFd;
            lock::acquire(
                file.as_raw_fd(),
                &self.inner.path,
                method,
                LockType::Exclusive,
                CACHE_LOCK_TIMEOUT,
            )?;
        }
        state.locked = true;
        Ok(())
    }

    pub(crate) fn unlock_file(&self, state: &mut CacheState) -> Result<()> {
        assert!(state.locked);
        state.locked = false;
        if let Some(dotlock) = state.dotlock.take() {
            return dotlock.delete();
        }
        if let Some(file) = &state.file {
            use std::os::unix::io::AsRawFd;
            let method = self.inner.index.state().options.lock_method;
            lock::release(file.as_raw_fd(), &self.inner.path, method)?;
        }
        Ok(())
    }

    // --- Write path ----------------------------------------------------

    /// Creates a fresh cache file with the given file_seq, atomically
    /// replacing whatever is there.
    pub(crate) fn create_file(&self, state: &mut CacheState, file_seq: u32) -> Result<()> {
        let path = &self.inner.path;
        let field_block = self.build_field_block();
        let hdr = CacheHeader {
            version: CACHE_VERSION,
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            unused: [0; 2],
            indexid: self.inner.index.indexid(),
            file_seq,
            continued_record_count: 0,
            used_file_size: (CACHE_HEADER_SIZE + field_block.len()) as u32,
            deleted_space: 0,
            field_header_offset: CACHE_HEADER_SIZE as u32,
        };
        let tmp_path = {
            let mut os = path.as_os_str().to_owned();
            os.push(TMP_SUFFIX);
            PathBuf::from(os)
        };
        let mut image = hdr.as_bytes().to_vec();
        image.extend_from_slice(&field_block);
        fs::write(&tmp_path, &image).map_err(|err| Error::io("pwrite", &tmp_path, err))?;
        fs::rename(&tmp_path, path).map_err(|err| Error::io("rename", &tmp_path, err))?;
        state.close_file();
        self.try_open(state)?;
        if state.hdr.is_none() {
            return Err(Error::corrupted(path, "freshly created cache unusable"));
        }
        Ok(())
    }

    pub(crate) fn write_header(&self, state: &mut CacheState) -> Result<()> {
        let Some(hdr) = state.hdr else { return Ok(()) };
        let Some(file) = &state.file else { return Ok(()) };
        file.write_all_at(hdr.as_bytes(), 0)
            .map_err(|err| Error::io("pwrite", &self.inner.path, err))
    }

    /// Folds expunged mails' chains into `deleted_space`.
    fn account_pending_drops(&self, state: &mut CacheState) {
        let drops: Vec<u32> = std::mem::take(&mut *self.inner.pending_drops.lock());
        if drops.is_empty() {
            return;
        }
        let Some(hdr) = state.hdr.as_mut() else { return };
        let Some(map) = &state.map else { return };
        let bytes = map.as_slice();
        for mut offset in drops {
            // Walk the chain, strictly descending offsets as a loop guard.
            let mut steps = 0;
            while offset != 0 && steps < 1000 {
                let pos = offset as usize;
                if pos + CACHE_RECORD_HEADER_SIZE > bytes.len() {
                    break;
                }
                let (rec, _) =
                    CacheRecordHeader::read_from_prefix(&bytes[pos..]).expect("length checked");
                hdr.deleted_space = hdr.deleted_space.saturating_add(rec.size);
                if rec.prev_offset >= offset {
                    break;
                }
                offset = rec.prev_offset;
                steps += 1;
            }
        }
    }

    fn update_need_compress(&self, state: &mut CacheState, records_count: u32) {
        let Some(hdr) = &state.hdr else { return };
        if hdr.used_file_size < COMPRESS_MIN_SIZE {
            return;
        }
        let cont_pct = hdr.continued_record_count * 100 / records_count.max(1);
        let deleted_pct = (hdr.deleted_space as u64 * 100 / hdr.used_file_size.max(1) as u64) as u32;
        if cont_pct >= COMPRESS_CONTINUED_PERCENTAGE || deleted_pct >= COMPRESS_DELETED_PERCENTAGE {
            state.need_compress_file_seq = hdr.file_seq;
        }
    }

    /// Whether the thresholds have asked for a compaction.
    pub fn needs_compress(&self) -> bool {
        self.state().need_compress_file_seq != 0
    }

    /// Appends cached field values for the mail at `seq` in `view` and
    /// queues the index-side offset update into `txn`. The data becomes
    /// visible to readers once `txn` commits.
    pub fn add(
        &self,
        txn: &mut Transaction,
        view: &View,
        seq: u32,
        field: CacheFieldId,
        data: &[u8],
    ) -> Result<()> {
        if self.inner.index.is_in_memory() {
            return Ok(());
        }
        let uid = view.lookup_uid(seq);
        let mut state = self.state();
        self.reopen_if_changed(&mut state)?;

        // The reset_id the index currently carries for the cache ext; the
        // cache file must agree or be replaced.
        let index_reset_id = view
            .ext_header(self.inner.ext_id)
            .map(|(_, reset_id)| reset_id)
            .unwrap_or(0);
        let file_seq_wanted = match &state.hdr {
            Some(hdr) if hdr.file_seq == index_reset_id || index_reset_id == 0 => hdr.file_seq,
            Some(hdr) => {
                // Disagreement: adopt a fresh sequence past both.
                hdr.file_seq.max(index_reset_id) + 1
            }
            None => index_reset_id.max(1),
        };
        let recreate = match &state.hdr {
            Some(hdr) => hdr.file_seq != file_seq_wanted,
            None => true,
        };
        if recreate {
            self.create_file(&mut state, file_seq_wanted)?;
        } else if self.file_field_id(&state, field).is_none() {
            // The on-file field block predates this field; rebuilding the
            // file is the simplest way to extend it. Offsets this
            // transaction already queued would survive into the wrong file
            // generation, so they must be committed first.
            if txn.has_ext_rec_updates(self.inner.ext_id) {
                return Err(Error::Internal {
                    op: "cache_add",
                    path: self.inner.path.clone(),
                    message: "new cache field with uncommitted cache updates".to_string(),
                });
            }
            drop(state);
            self.compress(view)?;
            state = self.state();
            self.reopen_if_changed(&mut state)?;
            if state.hdr.is_none() {
                return Err(Error::corrupted(&self.inner.path, "cache unusable after rewrite"));
            }
        }

        self.lock_file(&mut state)?;
        let result = self.add_locked(txn, view, seq, uid, field, data, &mut state);
        let unlock = self.unlock_file(&mut state);
        result?;
        unlock
    }

    fn add_locked(
        &self,
        txn: &mut Transaction,
        view: &View,
        seq: u32,
        uid: u32,
        field: CacheFieldId,
        data: &[u8],
        state: &mut CacheState,
    ) -> Result<()> {
        // Someone may have compacted between our open and the lock.
        self.reopen_if_changed(state)?;
        let Some(file_field) = self.file_field_id(state, field) else {
            return Err(Error::corrupted(&self.inner.path, "field missing after rewrite"));
        };
        // Chain onto the mail's newest record: one this transaction wrote
        // but hasn't committed, or the committed one the head map knows.
        let pending = txn
            .pending_ext_record(self.inner.ext_id, uid)
            .and_then(|bytes| u32::read_from_bytes(bytes).ok());
        let prev_offset = match pending {
            Some(offset) => offset,
            None => view
                .lookup_ext_latest(seq, self.inner.ext_id)
                .and_then(|(bytes, reset_id)| {
                    let hdr = state.hdr.as_ref()?;
                    // Offsets from another file generation are dead.
                    if reset_id != hdr.file_seq {
                        return None;
                    }
                    u32::read_from_bytes(&bytes).ok()
                })
                .unwrap_or(0),
        };

        let mut payload = Vec::new();
        {
            let registry = self.inner.fields.read();
            fields::pack_u32(&mut payload, file_field);
            fields::encode_value(&mut payload, registry.get(field), data);
        }
        let rec_hdr = CacheRecordHeader {
            prev_offset,
            size: (CACHE_RECORD_HEADER_SIZE + payload.len()) as u32,
        };
        let mut frame = rec_hdr.as_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame.resize(align4(frame.len()), 0);

        let hdr = state.hdr.as_mut().expect("locked cache has a header");
        let offset = hdr.used_file_size;
        hdr.used_file_size += frame.len() as u32;
        if prev_offset != 0 {
            hdr.continued_record_count += 1;
        }
        let file = state.file.as_ref().expect("locked cache has a file");
        file.write_all_at(&frame, offset as u64)
            .map_err(|err| Error::io("pwrite", &self.inner.path, err))?;

        self.account_pending_drops(state);
        let records_count = view.messages_count();
        self.update_need_compress(state, records_count);
        self.write_header(state)?;

        // Index side: point the mail's cache slot at the new record. The
        // reset record aligns the extension with our file_seq when they
        // disagree (first write into a fresh file).
        let file_seq = state.hdr.as_ref().expect("header written above").file_seq;
        let index_reset_id = view
            .ext_header(self.inner.ext_id)
            .map(|(_, reset_id)| reset_id)
            .unwrap_or(0);
        if index_reset_id != file_seq && !txn.has_ext_reset(self.inner.ext_id) {
            txn.reset_ext(self.inner.ext_id, file_seq);
        }
        txn.update_ext_record(self.inner.ext_id, uid, &offset.to_ne_bytes());
        Ok(())
    }
}
