//! Applying transaction log records to a heap map.
//!
//! Both sides of the synchronization protocol funnel through here: the
//! writer replays freshly appended records onto its private copy of the
//! head map, and a reader's view sync replays everything between its
//! remembered log position and the head. Keeping one implementation is
//! what makes replay deterministic: two readers that sync past the same
//! offset end up with record-for-record equal maps.

use std::path::Path;

use zerocopy::FromBytes;

use crate::error::Error;
use crate::error::Result;
use crate::extension::Extensions;
use crate::extension::SyncHandlerKind;
use crate::map::Map;
use crate::ondisk::EXT_SLOT_BY_NAME;
use crate::ondisk::KEYWORD_MODIFY_ADD;
use crate::ondisk::LogExtHdrUpdate;
use crate::ondisk::LogExtIntro;
use crate::ondisk::LogExtRecUpdate;
use crate::ondisk::LogExtReset;
use crate::ondisk::LogFlagUpdate;
use crate::ondisk::LogHeaderUpdate;
use crate::ondisk::LogKeywordUpdate;
use crate::ondisk::LogRecordType;
use crate::ondisk::Record;
use crate::ondisk::UidRange;
use crate::ondisk::align4;
use crate::translog::LogEntry;

/// What a replayed record did, as reported to view-sync callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncChangeKind {
    /// New mails appended at the end of the mailbox.
    Append,
    /// Mails removed; later sequences shifted down.
    Expunge,
    /// Flag bits changed.
    Flags,
    /// A keyword bit changed.
    Keywords,
    /// A partial base-header write.
    Header,
    /// Extension state changed (intro, reset, header or record write).
    Ext,
}

/// One change notification: the kind and the UID range it covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncChange {
    /// What happened.
    pub kind: SyncChangeKind,
    /// The UID range it covered; 0/0 for header and extension changes
    /// without a per-mail scope.
    pub uids: UidRange,
}

pub(crate) struct ApplyContext<'a> {
    pub extensions: &'a Extensions,
    pub kind: SyncHandlerKind,
    /// Expunge handlers run only when mails are really going away (the
    /// write path), not when a reader catches up its private map.
    pub run_expunge_handlers: bool,
}

fn corrupted(path: &Path, what: &str) -> Error {
    Error::corrupted(path, format!("log record broken: {what}"))
}

/// Reads `T`-sized strides out of an unaligned payload buffer.
fn payload_iter<T: FromBytes>(data: &[u8]) -> impl Iterator<Item = T> + '_ {
    data.chunks_exact(size_of::<T>())
        .map(|chunk| T::read_from_bytes(chunk).expect("chunk is exactly one T"))
}

fn apply_append(map: &mut Map, data: &[u8], changes: &mut Vec<SyncChange>) {
    let mut applied: Option<(u32, u32)> = None;
    for rec in payload_iter::<Record>(data) {
        // Appends behind the map's head (already checkpointed) are noise.
        if rec.uid < map.hdr.next_uid {
            continue;
        }
        map.append_record(&rec);
        applied = Some(match applied {
            None => (rec.uid, rec.uid),
            Some((first, _)) => (first, rec.uid),
        });
    }
    if let Some((uid1, uid2)) = applied {
        changes.push(SyncChange {
            kind: SyncChangeKind::Append,
            uids: UidRange { uid1, uid2 },
        });
    }
}

fn apply_expunge(
    map: &mut Map,
    data: &[u8],
    ctx: &ApplyContext<'_>,
    changes: &mut Vec<SyncChange>,
) {
    for range in payload_iter::<UidRange>(data) {
        let (seq1, seq2) = match map.uid_range_to_seqs(range.uid1, range.uid2) {
            (0, _) => continue,
            seqs => seqs,
        };
        if ctx.run_expunge_handlers {
            for seq in seq1..=seq2 {
                let uid = map.record(seq).uid();
                for ext_id in ctx.extensions.ids() {
                    let rext = ctx.extensions.get(ext_id);
                    let Some(slot) = map.ext_slot(&rext.name) else {
                        continue;
                    };
                    if let Some(bytes) = map.ext_record_bytes(seq, slot) {
                        let bytes = bytes.to_vec();
                        ctx.extensions.call_expunge(ext_id, uid, &bytes);
                    }
                }
            }
        }
        map.expunge_seqs(seq1, seq2);
        changes.push(SyncChange {
            kind: SyncChangeKind::Expunge,
            uids: range,
        });
    }
}

fn apply_flag_update(map: &mut Map, data: &[u8], changes: &mut Vec<SyncChange>) {
    let stride = size_of::<LogFlagUpdate>();
    let mut pos = 0;
    while pos + stride <= data.len() {
        let (update, _) = LogFlagUpdate::read_from_prefix(&data[pos..]).expect("bounds checked");
        pos += stride;
        let (seq1, seq2) = match map.uid_range_to_seqs(update.uid1, update.uid2) {
            (0, _) => continue,
            seqs => seqs,
        };
        for seq in seq1..=seq2 {
            let old_flags = map.record(seq).base().flags;
            let new_flags = (old_flags & !update.remove_flags) | update.add_flags;
            map.record_mut(seq)[4] = new_flags;
            map.header_update_counts(old_flags, new_flags);
            let rec = map.record(seq).base();
            map.header_update_lowwaters(&rec);
        }
        changes.push(SyncChange {
            kind: SyncChangeKind::Flags,
            uids: UidRange {
                uid1: update.uid1,
                uid2: update.uid2,
            },
        });
    }
}

fn apply_keyword_update(
    map: &mut Map,
    data: &[u8],
    path: &Path,
    changes: &mut Vec<SyncChange>,
) -> Result<()> {
    let (hdr, rest) =
        LogKeywordUpdate::read_from_prefix(data).map_err(|_| corrupted(path, "keyword header"))?;
    if hdr.name_size as usize > rest.len() {
        return Err(corrupted(path, "keyword name size"));
    }
    let name = std::str::from_utf8(&rest[..hdr.name_size as usize])
        .map_err(|_| corrupted(path, "keyword name not UTF-8"))?
        .to_string();
    let ranges_start = align4(size_of::<LogKeywordUpdate>() + hdr.name_size as usize);
    let ranges: Vec<UidRange> =
        payload_iter::<UidRange>(&data[ranges_start.min(data.len())..]).collect();

    let add = hdr.modify == KEYWORD_MODIFY_ADD;
    let bit = if add {
        match map.add_keyword(&name) {
            Some(bit) => bit,
            // Bitmap exhausted: the keyword cannot be represented, skip.
            None => return Ok(()),
        }
    } else {
        match map.keyword_bit(&name) {
            Some(bit) => bit,
            None => return Ok(()),
        }
    };
    let byte = bit / 8;
    let mask = 1u8 << (bit % 8);

    for range in ranges {
        let (seq1, seq2) = match map.uid_range_to_seqs(range.uid1, range.uid2) {
            (0, _) => continue,
            seqs => seqs,
        };
        for seq in seq1..=seq2 {
            let rec = map.record_mut(seq);
            if add {
                rec[5 + byte] |= mask;
            } else {
                rec[5 + byte] &= !mask;
            }
        }
        changes.push(SyncChange {
            kind: SyncChangeKind::Keywords,
            uids: range,
        });
    }
    Ok(())
}

fn call_ext_sync(map: &Map, slot: usize, ctx: &ApplyContext<'_>, range: UidRange) {
    if let Some(ext_id) = ctx.extensions.lookup(&map.ext(slot).name) {
        ctx.extensions.call_sync(ext_id, ctx.kind, range);
    }
}

fn apply_ext_intro(
    map: &mut Map,
    data: &[u8],
    path: &Path,
    ctx: &ApplyContext<'_>,
    changes: &mut Vec<SyncChange>,
) -> Result<()> {
    let (intro, rest) =
        LogExtIntro::read_from_prefix(data).map_err(|_| corrupted(path, "ext intro"))?;
    if intro.name_size as usize > rest.len() {
        return Err(corrupted(path, "ext intro name size"));
    }
    let name = std::str::from_utf8(&rest[..intro.name_size as usize])
        .map_err(|_| corrupted(path, "ext name not UTF-8"))?
        .to_string();
    let slot = map.add_or_rebind_ext(
        &name,
        intro.hdr_size,
        intro.record_size,
        intro.record_align,
        intro.reset_id,
    );
    if intro.ext_slot != EXT_SLOT_BY_NAME && intro.ext_slot as usize != slot {
        return Err(corrupted(path, "ext intro slot mismatch"));
    }
    call_ext_sync(map, slot, ctx, UidRange { uid1: 0, uid2: 0 });
    changes.push(SyncChange {
        kind: SyncChangeKind::Ext,
        uids: UidRange { uid1: 0, uid2: 0 },
    });
    Ok(())
}

fn apply_ext_reset(
    map: &mut Map,
    data: &[u8],
    path: &Path,
    ctx: &ApplyContext<'_>,
    changes: &mut Vec<SyncChange>,
) -> Result<()> {
    let (reset, _) =
        LogExtReset::read_from_prefix(data).map_err(|_| corrupted(path, "ext reset"))?;
    let slot = reset.ext_slot as usize;
    if slot >= map.extensions.len() {
        return Err(corrupted(path, "ext reset slot out of range"));
    }
    map.set_ext_reset_id(slot, reset.new_reset_id);
    // A reset makes all per-record data of the extension meaningless.
    let ext = map.ext(slot).clone();
    if ext.record_size > 0 {
        for seq in 1..=map.hdr.messages_count {
            let start = ext.record_offset as usize;
            map.record_mut(seq)[start..start + ext.record_size as usize].fill(0);
        }
    }
    call_ext_sync(map, slot, ctx, UidRange { uid1: 0, uid2: 0 });
    changes.push(SyncChange {
        kind: SyncChangeKind::Ext,
        uids: UidRange { uid1: 0, uid2: 0 },
    });
    Ok(())
}

fn apply_ext_hdr_update(map: &mut Map, data: &[u8], path: &Path) -> Result<()> {
    let (update, rest) =
        LogExtHdrUpdate::read_from_prefix(data).map_err(|_| corrupted(path, "ext hdr update"))?;
    let slot = update.ext_slot as usize;
    if slot >= map.extensions.len() {
        return Err(corrupted(path, "ext hdr update slot out of range"));
    }
    if update.size as usize > rest.len() {
        return Err(corrupted(path, "ext hdr update size"));
    }
    map.write_ext_header(slot, update.offset, &rest[..update.size as usize]);
    Ok(())
}

fn apply_ext_rec_update(
    map: &mut Map,
    data: &[u8],
    path: &Path,
    ctx: &ApplyContext<'_>,
    changes: &mut Vec<SyncChange>,
) -> Result<()> {
    let (update, rest) =
        LogExtRecUpdate::read_from_prefix(data).map_err(|_| corrupted(path, "ext rec update"))?;
    let slot = update.ext_slot as usize;
    if slot >= map.extensions.len() {
        return Err(corrupted(path, "ext rec update slot out of range"));
    }
    let ext = map.ext(slot).clone();
    if ext.record_size == 0 {
        return Err(corrupted(path, "ext rec update on slotless extension"));
    }
    let stride = align4(4 + ext.record_size as usize);
    let mut pos = 0;
    while pos + stride <= rest.len() {
        let uid = u32::read_from_prefix(&rest[pos..]).expect("bounds checked").0;
        let value = &rest[pos + 4..pos + 4 + ext.record_size as usize];
        pos += stride;
        let (seq, _) = match map.uid_range_to_seqs(uid, uid) {
            (0, _) => continue,
            seqs => seqs,
        };
        let start = ext.record_offset as usize;
        let value = value.to_vec();
        map.record_mut(seq)[start..start + ext.record_size as usize].copy_from_slice(&value);
        call_ext_sync(map, slot, ctx, UidRange { uid1: uid, uid2: uid });
        changes.push(SyncChange {
            kind: SyncChangeKind::Ext,
            uids: UidRange { uid1: uid, uid2: uid },
        });
    }
    Ok(())
}

/// Replays one log record onto `map`, returning the change notifications
/// it produced.
pub(crate) fn apply_entry(
    map: &mut Map,
    entry: &LogEntry,
    ctx: &ApplyContext<'_>,
    path: &Path,
) -> Result<Vec<SyncChange>> {
    let mut changes = Vec::new();
    match entry.typ {
        LogRecordType::Append => apply_append(map, &entry.data, &mut changes),
        LogRecordType::Expunge => apply_expunge(map, &entry.data, ctx, &mut changes),
        LogRecordType::FlagUpdate => apply_flag_update(map, &entry.data, &mut changes),
        LogRecordType::KeywordUpdate => {
            apply_keyword_update(map, &entry.data, path, &mut changes)?
        }
        LogRecordType::HeaderUpdate => {
            let (update, rest) = LogHeaderUpdate::read_from_prefix(&entry.data)
                .map_err(|_| corrupted(path, "header update"))?;
            if update.size as usize > rest.len() {
                return Err(corrupted(path, "header update size"));
            }
            map.write_base_header(update.offset, &rest[..update.size as usize]);
            changes.push(SyncChange {
                kind: SyncChangeKind::Header,
                uids: UidRange { uid1: 0, uid2: 0 },
            });
        }
        LogRecordType::ExtIntro => apply_ext_intro(map, &entry.data, path, ctx, &mut changes)?,
        LogRecordType::ExtReset => apply_ext_reset(map, &entry.data, path, ctx, &mut changes)?,
        LogRecordType::ExtHdrUpdate => apply_ext_hdr_update(map, &entry.data, path)?,
        LogRecordType::ExtRecUpdate => {
            apply_ext_rec_update(map, &entry.data, path, ctx, &mut changes)?
        }
    }
    map.sync_header_block();
    Ok(changes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ondisk::MailFlags;
    use crate::translog::LogPosition;
    use zerocopy::IntoBytes;

    fn ctx(extensions: &Extensions) -> ApplyContext<'_> {
        ApplyContext {
            extensions,
            kind: SyncHandlerKind::Head,
            run_expunge_handlers: false,
        }
    }

    fn entry(typ: LogRecordType, data: Vec<u8>) -> LogEntry {
        LogEntry {
            typ,
            position: LogPosition {
                file_seq: 1,
                offset: 0,
            },
            data,
        }
    }

    fn apply(map: &mut Map, exts: &Extensions, typ: LogRecordType, data: Vec<u8>) -> Vec<SyncChange> {
        apply_entry(map, &entry(typ, data), &ctx(exts), Path::new("test.index")).unwrap()
    }

    #[test]
    fn append_then_expunge() {
        let exts = Extensions::new();
        let mut map = Map::empty(1, 1);
        let mut payload = Vec::new();
        for uid in [1u32, 2, 3] {
            payload.extend_from_slice(
                Record {
                    uid,
                    flags: 0,
                    keywords: [0; 3],
                }
                .as_bytes(),
            );
        }
        let changes = apply(&mut map, &exts, LogRecordType::Append, payload);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].uids, UidRange { uid1: 1, uid2: 3 });
        assert_eq!(map.messages_count(), 3);
        assert_eq!(map.hdr.next_uid, 4);

        let changes = apply(
            &mut map,
            &exts,
            LogRecordType::Expunge,
            UidRange { uid1: 2, uid2: 2 }.as_bytes().to_vec(),
        );
        assert_eq!(changes[0].kind, SyncChangeKind::Expunge);
        assert_eq!(map.messages_count(), 2);
        assert_eq!(map.record(2).uid(), 3);
    }

    #[test]
    fn flag_update_is_idempotent() {
        let exts = Extensions::new();
        let mut map = Map::empty(1, 1);
        apply(
            &mut map,
            &exts,
            LogRecordType::Append,
            Record {
                uid: 1,
                flags: 0,
                keywords: [0; 3],
            }
            .as_bytes()
            .to_vec(),
        );
        let update = LogFlagUpdate {
            uid1: 1,
            uid2: 1,
            add_flags: MailFlags::SEEN.bits(),
            remove_flags: 0,
            unused: [0; 2],
        };
        apply(&mut map, &exts, LogRecordType::FlagUpdate, update.as_bytes().to_vec());
        let once = (map.record(1).base().flags, map.hdr.seen_messages_count);
        apply(&mut map, &exts, LogRecordType::FlagUpdate, update.as_bytes().to_vec());
        let twice = (map.record(1).base().flags, map.hdr.seen_messages_count);
        assert_eq!(once, twice);
        assert_eq!(once.1, 1);
    }

    #[test]
    fn keyword_update_assigns_stable_bits() {
        let exts = Extensions::new();
        let mut map = Map::empty(1, 1);
        apply(
            &mut map,
            &exts,
            LogRecordType::Append,
            Record {
                uid: 1,
                flags: 0,
                keywords: [0; 3],
            }
            .as_bytes()
            .to_vec(),
        );
        let mut payload = LogKeywordUpdate {
            modify: KEYWORD_MODIFY_ADD,
            unused: 0,
            name_size: 7,
        }
        .as_bytes()
        .to_vec();
        payload.extend_from_slice(b"NonJunk");
        payload.resize(align4(payload.len()), 0);
        payload.extend_from_slice(UidRange { uid1: 1, uid2: 1 }.as_bytes());
        apply(&mut map, &exts, LogRecordType::KeywordUpdate, payload);

        assert_eq!(map.keywords, vec!["NonJunk".to_string()]);
        assert_eq!(map.record(1).keywords()[0] & 1, 1);

        // The keyword list survives the map's own serialization.
        let reparsed = map.to_memory();
        assert_eq!(reparsed.keywords, vec!["NonJunk".to_string()]);
    }

    #[test]
    fn ext_intro_grows_records() {
        let exts = Extensions::new();
        let mut map = Map::empty(1, 1);
        apply(
            &mut map,
            &exts,
            LogRecordType::Append,
            Record {
                uid: 1,
                flags: 0,
                keywords: [0; 3],
            }
            .as_bytes()
            .to_vec(),
        );
        let old_size = map.record_size();
        let mut payload = LogExtIntro {
            ext_slot: EXT_SLOT_BY_NAME,
            reset_id: 0,
            hdr_size: 0,
            record_size: 4,
            record_align: 4,
            name_size: 5,
            unused: 0,
        }
        .as_bytes()
        .to_vec();
        payload.extend_from_slice(b"cache");
        payload.resize(align4(payload.len()), 0);
        apply(&mut map, &exts, LogRecordType::ExtIntro, payload);

        assert!(map.record_size() > old_size);
        let slot = map.ext_slot("cache").unwrap();
        assert_eq!(map.ext(slot).record_size, 4);
        assert_eq!(map.ext_record_bytes(1, slot).unwrap(), [0u8; 4]);

        // Writing through the slot and resetting clears it again.
        let mut rec_payload = LogExtRecUpdate { ext_slot: slot as u32 }.as_bytes().to_vec();
        rec_payload.extend_from_slice(&1u32.to_ne_bytes());
        rec_payload.extend_from_slice(&0xdeadbeefu32.to_ne_bytes());
        apply(&mut map, &exts, LogRecordType::ExtRecUpdate, rec_payload);
        assert_eq!(
            map.ext_record_bytes(1, slot).unwrap(),
            0xdeadbeefu32.to_ne_bytes()
        );
        let reset = LogExtReset {
            ext_slot: slot as u32,
            new_reset_id: 2,
        };
        apply(&mut map, &exts, LogRecordType::ExtReset, reset.as_bytes().to_vec());
        assert_eq!(map.ext_record_bytes(1, slot).unwrap(), [0u8; 4]);
        assert_eq!(map.ext(slot).reset_id, 2);
    }
}
