//! Engine-scoped extension registry.
//!
//! Extensions let higher layers (cache, storage backends) attach typed
//! per-record and per-index data without changing the core format. They are
//! registered once per engine by name; the returned [`ExtId`] is an index
//! into this registry and stays valid for the engine's lifetime. Whether a
//! given [`Map`](crate::map::Map) actually carries an extension is a
//! per-map question answered by name matching, see `Map::ext_slot`.

use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::ondisk::UidRange;

/// Stable handle to a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtId(pub(crate) u32);

bitflags::bitflags! {
    /// Which map a sync handler maintains: the index file itself during
    /// write-sync setup, a view's private sync map, or the head map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncHandlerTypes: u8 {
        const FILE = 0x01;
        const VIEW = 0x02;
        const HEAD = 0x04;
    }
}

/// The map kind a sync handler is currently invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHandlerKind {
    File,
    View,
    Head,
}

impl SyncHandlerKind {
    pub(crate) fn as_type(self) -> SyncHandlerTypes {
        match self {
            SyncHandlerKind::File => SyncHandlerTypes::FILE,
            SyncHandlerKind::View => SyncHandlerTypes::VIEW,
            SyncHandlerKind::Head => SyncHandlerTypes::HEAD,
        }
    }
}

/// Called with a mail's UID and its extension slot bytes just before the
/// mail is logically expunged.
pub type ExpungeHandler = dyn FnMut(u32, &[u8]) + Send;
/// Called for each replayed log record that touches the extension.
pub type SyncHandler = dyn FnMut(SyncHandlerKind, UidRange) + Send;
/// Called once when replay from the expected log position is impossible
/// and derived state must be invalidated.
pub type SyncLostHandler = dyn FnMut() + Send;

#[derive(Default)]
pub(crate) struct ExtHandlers {
    pub(crate) expunge: Option<Box<ExpungeHandler>>,
    pub(crate) sync: Option<(SyncHandlerTypes, Box<SyncHandler>)>,
    pub(crate) sync_lost: Option<Box<SyncLostHandler>>,
}

pub(crate) struct RegisteredExt {
    pub(crate) name: String,
    pub(crate) hdr_size: u32,
    pub(crate) record_size: u16,
    pub(crate) record_align: u16,
    pub(crate) handlers: Mutex<ExtHandlers>,
}

impl std::fmt::Debug for RegisteredExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredExt")
            .field("name", &self.name)
            .field("hdr_size", &self.hdr_size)
            .field("record_size", &self.record_size)
            .field("record_align", &self.record_align)
            .finish()
    }
}

/// The registry itself. Read-mostly: registration normally happens once at
/// engine construction.
#[derive(Debug, Default)]
pub struct Extensions {
    inner: RwLock<Vec<Arc<RegisteredExt>>>,
}

impl Extensions {
    pub(crate) fn new() -> Extensions {
        Extensions::default()
    }

    /// Registers `name`, returning its id. Re-registering an existing name
    /// returns the original id; the sizes of the first registration win.
    pub fn register(
        &self,
        name: &str,
        default_hdr_size: u32,
        default_record_size: u16,
        default_record_align: u16,
    ) -> ExtId {
        assert!(
            !name.is_empty() && name.bytes().all(|b| (0x20..0x7f).contains(&b)),
            "invalid extension name {name:?}"
        );
        assert!(
            default_record_size == 0 || default_record_align != 0,
            "extension {name}: record_size without alignment"
        );

        if let Some(id) = self.lookup(name) {
            return id;
        }
        let mut inner = self.inner.write();
        // Raced with another registration between lookup and write lock.
        if let Some(idx) = inner.iter().position(|ext| ext.name == name) {
            return ExtId(idx as u32);
        }
        inner.push(Arc::new(RegisteredExt {
            name: name.to_string(),
            hdr_size: default_hdr_size,
            record_size: default_record_size,
            record_align: default_record_align,
            handlers: Mutex::new(ExtHandlers::default()),
        }));
        ExtId(inner.len() as u32 - 1)
    }

    /// The id of an already-registered extension.
    pub fn lookup(&self, name: &str) -> Option<ExtId> {
        self.inner
            .read()
            .iter()
            .position(|ext| ext.name == name)
            .map(|idx| ExtId(idx as u32))
    }

    pub(crate) fn get(&self, ext_id: ExtId) -> Arc<RegisteredExt> {
        self.inner.read()[ext_id.0 as usize].clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.read().len()
    }

    pub(crate) fn ids(&self) -> Vec<ExtId> {
        (0..self.count() as u32).map(ExtId).collect()
    }

    /// Installs the expunge handler for `ext_id`, replacing any previous
    /// one.
    pub fn set_expunge_handler(&self, ext_id: ExtId, handler: Box<ExpungeHandler>) {
        self.get(ext_id).handlers.lock().expunge = Some(handler);
    }

    /// Removes the expunge handler.
    pub fn unset_expunge_handler(&self, ext_id: ExtId) {
        self.get(ext_id).handlers.lock().expunge = None;
    }

    /// Installs the sync handler for `ext_id`, invoked for the map kinds in
    /// `types`.
    pub fn set_sync_handler(&self, ext_id: ExtId, types: SyncHandlerTypes, handler: Box<SyncHandler>) {
        self.get(ext_id).handlers.lock().sync = Some((types, handler));
    }

    /// Removes the sync handler.
    pub fn unset_sync_handler(&self, ext_id: ExtId) {
        self.get(ext_id).handlers.lock().sync = None;
    }

    /// Installs the sync-lost handler for `ext_id`.
    pub fn set_sync_lost_handler(&self, ext_id: ExtId, handler: Box<SyncLostHandler>) {
        self.get(ext_id).handlers.lock().sync_lost = Some(handler);
    }

    /// Removes the sync-lost handler.
    pub fn unset_sync_lost_handler(&self, ext_id: ExtId) {
        self.get(ext_id).handlers.lock().sync_lost = None;
    }

    pub(crate) fn call_expunge(&self, ext_id: ExtId, uid: u32, data: &[u8]) {
        if let Some(handler) = self.get(ext_id).handlers.lock().expunge.as_mut() {
            handler(uid, data);
        }
    }

    pub(crate) fn call_sync(&self, ext_id: ExtId, kind: SyncHandlerKind, range: UidRange) {
        if let Some((types, handler)) = self.get(ext_id).handlers.lock().sync.as_mut() {
            if types.contains(kind.as_type()) {
                handler(kind, range);
            }
        }
    }

    /// Delivers the sync-lost event to every extension that registered for
    /// it.
    pub(crate) fn call_sync_lost_all(&self) {
        for ext_id in self.ids() {
            if let Some(handler) = self.get(ext_id).handlers.lock().sync_lost.as_mut() {
                handler();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[test]
    fn register_is_idempotent_by_name() {
        let exts = Extensions::new();
        let a = exts.register("cache", 0, 4, 4);
        let b = exts.register("cache", 16, 8, 8);
        assert_eq!(a, b);
        assert_eq!(exts.get(a).record_size, 4);
        let c = exts.register("keywords", 128, 2, 1);
        assert_ne!(a, c);
        assert_eq!(exts.lookup("keywords"), Some(c));
        assert_eq!(exts.lookup("unknown"), None);
    }

    #[test]
    #[should_panic(expected = "record_size without alignment")]
    fn register_rejects_zero_alignment() {
        Extensions::new().register("bad", 0, 4, 0);
    }

    #[test]
    fn sync_handler_respects_type_mask() {
        let exts = Extensions::new();
        let ext_id = exts.register("cache", 0, 4, 4);
        static CALLS: AtomicU32 = AtomicU32::new(0);
        exts.set_sync_handler(
            ext_id,
            SyncHandlerTypes::HEAD,
            Box::new(|_, _| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        );
        exts.call_sync(ext_id, SyncHandlerKind::View, UidRange { uid1: 1, uid2: 1 });
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        exts.call_sync(ext_id, SyncHandlerKind::Head, UidRange { uid1: 1, uid2: 1 });
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
