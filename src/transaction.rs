//! Pending-change transactions.
//!
//! A transaction accumulates changes in memory; nothing touches the log or
//! the index until commit. Commit serializes the changes into log records
//! (see `translog`), appends them under the exclusive lock and replays them
//! onto the head map. Rollback is simply dropping the transaction.
//!
//! UIDs for appended mails are assigned at commit time from the header's
//! `next_uid`, so concurrent writers can build transactions without
//! coordinating.

use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::extension::ExtId;
use crate::extension::Extensions;
use crate::map::Map;
use crate::ondisk::EXT_SLOT_BY_NAME;
use crate::ondisk::KEYWORD_MODIFY_ADD;
use crate::ondisk::KEYWORD_MODIFY_REMOVE;
use crate::ondisk::KEYWORDS_BYTE_COUNT;
use crate::ondisk::LogExtHdrUpdate;
use crate::ondisk::LogExtIntro;
use crate::ondisk::LogExtReset;
use crate::ondisk::LogFlagUpdate;
use crate::ondisk::LogHeaderUpdate;
use crate::ondisk::LogKeywordUpdate;
use crate::ondisk::LogRecordType;
use crate::ondisk::MailFlags;
use crate::ondisk::Record;
use crate::ondisk::UidRange;
use crate::ondisk::align4;

type Ranges = SmallVec<[UidRange; 4]>;

#[derive(Debug, Clone)]
struct PendingKeywordUpdate {
    name: String,
    add: bool,
    ranges: Ranges,
}

#[derive(Debug, Clone)]
struct PendingExtRecUpdate {
    ext_id: ExtId,
    uid: u32,
    data: Vec<u8>,
}

/// A batch of changes committed atomically through the log.
#[derive(Debug, Default)]
pub struct Transaction {
    appends: Vec<Record>,
    expunges: Ranges,
    flag_updates: Vec<LogFlagUpdate>,
    keyword_updates: Vec<PendingKeywordUpdate>,
    header_updates: Vec<(u16, Vec<u8>)>,
    ext_resets: Vec<(ExtId, u32)>,
    ext_hdr_updates: Vec<(ExtId, u16, Vec<u8>)>,
    ext_rec_updates: Vec<PendingExtRecUpdate>,
}

impl Transaction {
    pub(crate) fn new() -> Transaction {
        Transaction::default()
    }

    pub fn is_empty(&self) -> bool {
        self.appends.is_empty()
            && self.expunges.is_empty()
            && self.flag_updates.is_empty()
            && self.keyword_updates.is_empty()
            && self.header_updates.is_empty()
            && self.ext_resets.is_empty()
            && self.ext_hdr_updates.is_empty()
            && self.ext_rec_updates.is_empty()
    }

    /// Appends a new mail. Its UID is assigned at commit; the return value
    /// is the 0-based position among this transaction's appends.
    pub fn append(&mut self, flags: MailFlags) -> usize {
        self.appends.push(Record {
            uid: 0,
            flags: flags.bits(),
            keywords: [0; KEYWORDS_BYTE_COUNT],
        });
        self.appends.len() - 1
    }

    /// Expunges an inclusive UID range.
    pub fn expunge_range(&mut self, uid1: u32, uid2: u32) {
        assert!(uid1 > 0 && uid1 <= uid2);
        self.expunges.push(UidRange { uid1, uid2 });
    }

    pub fn expunge(&mut self, uid: u32) {
        self.expunge_range(uid, uid);
    }

    /// Set-wise flag edit over a UID range; applying it twice equals
    /// applying it once.
    pub fn update_flags(&mut self, uid1: u32, uid2: u32, add: MailFlags, remove: MailFlags) {
        assert!(uid1 > 0 && uid1 <= uid2);
        self.flag_updates.push(LogFlagUpdate {
            uid1,
            uid2,
            add_flags: add.bits(),
            remove_flags: remove.bits(),
            unused: [0; 2],
        });
    }

    /// Adds or removes one keyword over UID ranges.
    pub fn update_keyword(&mut self, name: &str, add: bool, ranges: &[(u32, u32)]) {
        assert!(!name.is_empty());
        self.keyword_updates.push(PendingKeywordUpdate {
            name: name.to_string(),
            add,
            ranges: ranges
                .iter()
                .map(|&(uid1, uid2)| UidRange { uid1, uid2 })
                .collect(),
        });
    }

    /// Partial write into the base header (e.g. `uid_validity`).
    pub fn update_header(&mut self, offset: u16, data: &[u8]) {
        self.header_updates.push((offset, data.to_vec()));
    }

    /// Invalidates derived state of an extension by bumping its reset_id.
    pub fn reset_ext(&mut self, ext_id: ExtId, new_reset_id: u32) {
        self.ext_resets.push((ext_id, new_reset_id));
    }

    /// Partial write into an extension's header area.
    pub fn update_ext_header(&mut self, ext_id: ExtId, offset: u16, data: &[u8]) {
        self.ext_hdr_updates.push((ext_id, offset, data.to_vec()));
    }

    /// Writes a mail's extension record slot.
    pub fn update_ext_record(&mut self, ext_id: ExtId, uid: u32, data: &[u8]) {
        self.ext_rec_updates.push(PendingExtRecUpdate {
            ext_id,
            uid,
            data: data.to_vec(),
        });
    }

    pub(crate) fn append_count(&self) -> u32 {
        self.appends.len() as u32
    }

    pub(crate) fn has_ext_reset(&self, ext_id: ExtId) -> bool {
        self.ext_resets.iter().any(|&(id, _)| id == ext_id)
    }

    pub(crate) fn has_ext_rec_updates(&self, ext_id: ExtId) -> bool {
        self.ext_rec_updates
            .iter()
            .any(|update| update.ext_id == ext_id)
    }

    /// The newest pending slot value for `uid`, if this transaction
    /// already wrote one. Lets the cache chain records it appended before
    /// the commit made them visible.
    pub(crate) fn pending_ext_record(&self, ext_id: ExtId, uid: u32) -> Option<&[u8]> {
        self.ext_rec_updates
            .iter()
            .rev()
            .find(|update| update.ext_id == ext_id && update.uid == uid)
            .map(|update| update.data.as_slice())
    }

    /// Whether the transaction only contains changes the author's own view
    /// should not observe as notifications (flag and keyword edits).
    pub(crate) fn is_flag_only(&self) -> bool {
        !self.is_empty()
            && self.appends.is_empty()
            && self.expunges.is_empty()
            && self.header_updates.is_empty()
            && self.ext_resets.is_empty()
            && self.ext_hdr_updates.is_empty()
            && self.ext_rec_updates.is_empty()
    }

    /// Serializes into framed-record payloads, in apply order. `first_uid`
    /// is the committing header's `next_uid`; `head_map` decides which
    /// extensions need an intro record first.
    pub(crate) fn build(
        mut self,
        first_uid: u32,
        head_map: &Map,
        extensions: &Extensions,
    ) -> Vec<(LogRecordType, Vec<u8>)> {
        let mut records = Vec::new();

        // Extensions referenced by this transaction that the map doesn't
        // carry yet get introduced first; their slot indices are assigned
        // in intro order after the map's existing slots.
        let mut intro_slots: Vec<(ExtId, u32)> = Vec::new();
        let mut next_slot = head_map.extensions.len() as u32;
        let referenced: Vec<ExtId> = self
            .ext_resets
            .iter()
            .map(|&(id, _)| id)
            .chain(self.ext_hdr_updates.iter().map(|&(id, _, _)| id))
            .chain(self.ext_rec_updates.iter().map(|u| u.ext_id))
            .collect();
        for ext_id in referenced {
            if intro_slots.iter().any(|&(id, _)| id == ext_id) {
                continue;
            }
            let rext = extensions.get(ext_id);
            match head_map.ext_slot(&rext.name) {
                Some(slot) => intro_slots.push((ext_id, slot as u32)),
                None => {
                    let intro = LogExtIntro {
                        ext_slot: EXT_SLOT_BY_NAME,
                        reset_id: 0,
                        hdr_size: rext.hdr_size,
                        record_size: rext.record_size,
                        record_align: rext.record_align,
                        name_size: rext.name.len() as u16,
                        unused: 0,
                    };
                    let mut payload = intro.as_bytes().to_vec();
                    payload.extend_from_slice(rext.name.as_bytes());
                    payload.resize(align4(payload.len()), 0);
                    records.push((LogRecordType::ExtIntro, payload));
                    intro_slots.push((ext_id, next_slot));
                    next_slot += 1;
                }
            }
        }
        let slot_of = |ext_id: ExtId| -> u32 {
            intro_slots
                .iter()
                .find(|&&(id, _)| id == ext_id)
                .map(|&(_, slot)| slot)
                .expect("extension referenced without slot")
        };

        if !self.appends.is_empty() {
            let mut payload = Vec::with_capacity(self.appends.len() * size_of::<Record>());
            for (i, rec) in self.appends.iter_mut().enumerate() {
                rec.uid = first_uid + i as u32;
                payload.extend_from_slice(rec.as_bytes());
            }
            records.push((LogRecordType::Append, payload));
        }

        if !self.expunges.is_empty() {
            let mut payload = Vec::new();
            for range in &self.expunges {
                payload.extend_from_slice(range.as_bytes());
            }
            records.push((LogRecordType::Expunge, payload));
        }

        if !self.flag_updates.is_empty() {
            let mut payload = Vec::new();
            for update in &self.flag_updates {
                payload.extend_from_slice(update.as_bytes());
            }
            records.push((LogRecordType::FlagUpdate, payload));
        }

        for update in &self.keyword_updates {
            let hdr = LogKeywordUpdate {
                modify: if update.add {
                    KEYWORD_MODIFY_ADD
                } else {
                    KEYWORD_MODIFY_REMOVE
                },
                unused: 0,
                name_size: update.name.len() as u16,
            };
            let mut payload = hdr.as_bytes().to_vec();
            payload.extend_from_slice(update.name.as_bytes());
            payload.resize(align4(payload.len()), 0);
            for range in &update.ranges {
                payload.extend_from_slice(range.as_bytes());
            }
            records.push((LogRecordType::KeywordUpdate, payload));
        }

        for (offset, data) in &self.header_updates {
            let hdr = LogHeaderUpdate {
                offset: *offset,
                size: data.len() as u16,
            };
            let mut payload = hdr.as_bytes().to_vec();
            payload.extend_from_slice(data);
            records.push((LogRecordType::HeaderUpdate, payload));
        }

        for (ext_id, new_reset_id) in &self.ext_resets {
            let reset = LogExtReset {
                ext_slot: slot_of(*ext_id),
                new_reset_id: *new_reset_id,
            };
            records.push((LogRecordType::ExtReset, reset.as_bytes().to_vec()));
        }

        for (ext_id, offset, data) in &self.ext_hdr_updates {
            let hdr = LogExtHdrUpdate {
                ext_slot: slot_of(*ext_id),
                offset: *offset,
                size: data.len() as u16,
            };
            let mut payload = hdr.as_bytes().to_vec();
            payload.extend_from_slice(data);
            records.push((LogRecordType::ExtHdrUpdate, payload));
        }

        // Record updates are grouped per extension; each entry is the uid
        // followed by the slot bytes, padded to 4.
        let mut rec_update_ids: Vec<ExtId> = Vec::new();
        for update in &self.ext_rec_updates {
            if !rec_update_ids.contains(&update.ext_id) {
                rec_update_ids.push(update.ext_id);
            }
        }
        for ext_id in rec_update_ids {
            let rext = extensions.get(ext_id);
            let stride = align4(4 + rext.record_size as usize);
            let mut payload = crate::ondisk::LogExtRecUpdate {
                ext_slot: slot_of(ext_id),
            }
            .as_bytes()
            .to_vec();
            for update in self.ext_rec_updates.iter().filter(|u| u.ext_id == ext_id) {
                debug_assert_eq!(update.data.len(), rext.record_size as usize);
                let entry_start = payload.len();
                payload.extend_from_slice(&update.uid.to_ne_bytes());
                payload.extend_from_slice(&update.data);
                payload.resize(entry_start + stride, 0);
            }
            records.push((LogRecordType::ExtRecUpdate, payload));
        }

        records
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn empty_transaction_builds_nothing() {
        let txn = Transaction::new();
        assert!(txn.is_empty());
        let map = Map::empty(1, 1);
        let exts = Extensions::new();
        assert!(txn.build(1, &map, &exts).is_empty());
    }

    #[test]
    fn appends_get_sequential_uids() {
        let mut txn = Transaction::new();
        txn.append(MailFlags::SEEN);
        txn.append(MailFlags::empty());
        let map = Map::empty(1, 1);
        let exts = Extensions::new();
        let records = txn.build(7, &map, &exts);
        assert_eq!(records.len(), 1);
        let (typ, payload) = &records[0];
        assert_eq!(*typ, LogRecordType::Append);
        let recs: Vec<Record> = payload
            .chunks_exact(size_of::<Record>())
            .map(|chunk| Record::read_from_bytes(chunk).unwrap())
            .collect();
        assert_eq!(recs[0].uid, 7);
        assert_eq!(recs[1].uid, 8);
        assert_eq!(recs[0].flags, MailFlags::SEEN.bits());
    }

    #[test]
    fn unmapped_extension_gets_introduced_first() {
        let exts = Extensions::new();
        let ext_id = exts.register("cache", 0, 4, 4);
        let mut txn = Transaction::new();
        txn.update_ext_record(ext_id, 3, &42u32.to_ne_bytes());
        let map = Map::empty(1, 1);
        let records = txn.build(1, &map, &exts);
        assert_eq!(records[0].0, LogRecordType::ExtIntro);
        assert_eq!(records[1].0, LogRecordType::ExtRecUpdate);
    }

    #[test]
    fn flag_only_detection() {
        let mut txn = Transaction::new();
        txn.update_flags(1, 1, MailFlags::SEEN, MailFlags::empty());
        assert!(txn.is_flag_only());
        txn.append(MailFlags::empty());
        assert!(!txn.is_flag_only());
    }
}
