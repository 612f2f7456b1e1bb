//! Reader views: a snapshot of the index plus a log position.
//!
//! A view never observes changes it hasn't synced past: the map it points
//! at is immutable and the checkpoint file is replaced, not rewritten, so
//! even mmap-backed snapshots stay frozen. Catching up is explicit, see
//! `view_sync`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;
use crate::extension::ExtId;
use crate::index::Index;
use crate::map::Map;
use crate::ondisk::IndexHeader;
use crate::ondisk::MailFlags;
use crate::ondisk::Record;
use crate::sync::CommitInfo;
use crate::translog::LogPosition;

/// A reader's handle onto one index snapshot.
pub struct View {
    pub(crate) index: Index,
    pub(crate) indexid: u32,
    pub(crate) map: Arc<Map>,
    pub(crate) pos: LogPosition,
    pub(crate) inconsistent: bool,
    /// Log positions of transactions this view's owner committed itself;
    /// their flag/keyword changes are not reported back as notifications.
    pub(crate) synced: HashSet<LogPosition>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("indexid", &self.indexid)
            .field("pos", &self.pos)
            .field("messages", &self.map.messages_count())
            .finish()
    }
}

impl Clone for View {
    fn clone(&self) -> View {
        View {
            index: self.index.clone(),
            indexid: self.indexid,
            map: self.map.clone(),
            pos: self.pos,
            inconsistent: self.inconsistent,
            synced: self.synced.clone(),
        }
    }
}

impl View {
    pub(crate) fn new(index: Index, indexid: u32, map: Arc<Map>, pos: LogPosition) -> View {
        View {
            index,
            indexid,
            map,
            pos,
            inconsistent: false,
            synced: HashSet::new(),
        }
    }

    /// The index was recreated or the view failed a sync; all data from
    /// this view must be discarded.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent || self.index.indexid() != self.indexid
    }

    /// Number of mails in this snapshot.
    pub fn messages_count(&self) -> u32 {
        self.map.messages_count()
    }

    /// Copy of the snapshot's index header.
    pub fn header(&self) -> IndexHeader {
        self.map.hdr
    }

    fn check_seq(&self, seq: u32) {
        assert!(
            seq > 0 && seq <= self.map.messages_count(),
            "sequence {seq} out of range 1..={}",
            self.map.messages_count()
        );
    }

    /// The record at `seq` as of this snapshot.
    pub fn lookup(&self, seq: u32) -> Record {
        self.check_seq(seq);
        self.map.record(seq).base()
    }

    /// UID of the mail at `seq`.
    pub fn lookup_uid(&self, seq: u32) -> u32 {
        self.lookup(seq).uid
    }

    /// Decoded flags of the mail at `seq`.
    pub fn flags(&self, seq: u32) -> MailFlags {
        MailFlags::from_bits_truncate(self.lookup(seq).flags)
    }

    /// Sequences covered by the inclusive UID range, (0, 0) when empty.
    pub fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> (u32, u32) {
        self.map.uid_range_to_seqs(uid1, uid2)
    }

    /// First sequence whose flags match `flags` under `mask`, using the
    /// header lowwater hints to skip the head of the mailbox.
    pub fn lookup_first(&self, mask: MailFlags, flags: MailFlags) -> Option<u32> {
        let hdr = &self.map.hdr;
        let mut low_uid = 1u32;
        let mut raise = |uid: u32| {
            if uid > low_uid {
                low_uid = uid;
            }
        };
        if mask.contains(MailFlags::RECENT) && flags.contains(MailFlags::RECENT) {
            raise(hdr.first_recent_uid_lowwater);
        }
        if mask.contains(MailFlags::SEEN) && !flags.contains(MailFlags::SEEN) {
            raise(hdr.first_unseen_uid_lowwater);
        }
        if mask.contains(MailFlags::DELETED) && flags.contains(MailFlags::DELETED) {
            raise(hdr.first_deleted_uid_lowwater);
        }

        let start_seq = if low_uid <= 1 {
            1
        } else {
            match self.map.uid_range_to_seqs(low_uid, low_uid.max(hdr.next_uid - 1)) {
                (0, _) => return None,
                (seq, _) => seq,
            }
        };
        for seq in start_seq..=self.map.messages_count() {
            let rec_flags = self.map.record(seq).base().flags;
            if rec_flags & mask.bits() == flags.bits() {
                return Some(seq);
            }
        }
        None
    }

    /// Keyword names set on the record, in no particular order.
    pub fn lookup_keywords(&self, seq: u32) -> Vec<String> {
        self.check_seq(seq);
        let bitmap = self.map.record(seq).keywords();
        let mut names = Vec::new();
        for (byte_idx, byte) in bitmap.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let idx = byte_idx * 8 + bit;
                // Bits beyond the name list shouldn't happen; ignore.
                if let Some(name) = self.map.keywords.get(idx) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Read-latest lookup: when the head map still has a record with this
    /// snapshot's UID, return the head version (second element true).
    /// Otherwise the snapshot's own record is returned.
    pub fn lookup_full(&self, seq: u32) -> (Record, bool) {
        self.check_seq(seq);
        let rec = self.map.record(seq).base();
        let Some(head) = self.head_map() else {
            return (rec, true);
        };
        match head.seq_of_uid(rec.uid) {
            Some(head_seq) => (head.record(head_seq).base(), true),
            None => (rec, false),
        }
    }

    fn head_map(&self) -> Option<Arc<Map>> {
        let state = self.index.state();
        let head = state.map.clone()?;
        if Arc::ptr_eq(&head, &self.map) {
            return None;
        }
        Some(head)
    }

    /// Extension slot bytes at this snapshot. `None` when the extension
    /// isn't mapped here or has no record slot.
    pub fn lookup_ext(&self, seq: u32, ext_id: ExtId) -> Option<Vec<u8>> {
        self.check_seq(seq);
        let name = self.index.extensions().get(ext_id).name.clone();
        let slot = self.map.ext_slot(&name)?;
        self.map.ext_record_bytes(seq, slot).map(|bytes| bytes.to_vec())
    }

    /// Read-latest extension lookup: the slot bytes and the reset_id of
    /// the map they came from, preferring the head map when it still knows
    /// this UID.
    pub fn lookup_ext_latest(&self, seq: u32, ext_id: ExtId) -> Option<(Vec<u8>, u32)> {
        self.check_seq(seq);
        let name = self.index.extensions().get(ext_id).name.clone();
        let uid = self.map.record(seq).uid();
        if let Some(head) = self.head_map() {
            if let (Some(slot), Some(head_seq)) =
                (head.ext_slot(&name), head.seq_of_uid(uid))
            {
                let reset_id = head.ext(slot).reset_id;
                return head
                    .ext_record_bytes(head_seq, slot)
                    .map(|bytes| (bytes.to_vec(), reset_id));
            }
        }
        let slot = self.map.ext_slot(&name)?;
        let reset_id = self.map.ext(slot).reset_id;
        self.map
            .ext_record_bytes(seq, slot)
            .map(|bytes| (bytes.to_vec(), reset_id))
    }

    /// The extension's header data and reset_id in this snapshot.
    pub fn ext_header(&self, ext_id: ExtId) -> Option<(Vec<u8>, u32)> {
        let name = self.index.extensions().get(ext_id).name.clone();
        let slot = self.map.ext_slot(&name)?;
        Some((
            self.map.ext_header_bytes(slot).to_vec(),
            self.map.ext(slot).reset_id,
        ))
    }

    /// Remembers a transaction this view's owner committed, so the next
    /// sync doesn't report its flag/keyword changes back as foreign.
    pub fn add_synced_transaction(&mut self, info: &CommitInfo) {
        for pos in &info.own_positions {
            self.synced.insert(*pos);
        }
    }

    pub(crate) fn require_consistent(&mut self) -> Result<()> {
        if self.is_inconsistent() {
            self.inconsistent = true;
            return Err(Error::IndexIdChanged);
        }
        Ok(())
    }
}
