//! The single-writer commit path.
//!
//! Commit sequence: take the exclusive lock, catch the head map up with
//! whatever other writers appended, serialize the transaction into log
//! records, append them, replay them onto the head, advance the header's
//! log offsets (external only when fsynced), write the checkpoint and
//! rotate the log if it outgrew the soft limit. Any failure after the
//! append is rolled back by truncating the log to its pre-commit size.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::apply::ApplyContext;
use crate::apply::apply_entry;
use crate::error::Error;
use crate::error::Result;
use crate::extension::SyncHandlerKind;
use crate::index::Index;
use crate::index::IndexState;
use crate::ondisk::LogRecordType;
use crate::ondisk::SyncTypes;
use crate::ondisk::UidRange;
use crate::options::OpenFlags;
use crate::transaction::Transaction;
use crate::translog::LogEntry;
use crate::translog::LogPosition;

/// What a commit did: the UID range assigned to appended mails (0/0 when
/// nothing was appended) and where the transaction landed in the log.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// UID assigned to the first appended mail, 0 if none.
    pub first_uid: u32,
    /// UID assigned to the last appended mail, 0 if none.
    pub last_uid: u32,
    /// Log position just past the transaction's records.
    pub position: LogPosition,
    /// Positions of the flag/keyword records, for views that don't want to
    /// observe their own writes.
    pub(crate) own_positions: SmallVec<[LogPosition; 4]>,
}

pub(crate) fn commit(index: &Index, txn: Transaction) -> Result<CommitInfo> {
    let mut state = index.state();
    if !state.opened {
        return Err(Error::Internal {
            op: "commit",
            path: index.index_path().to_owned(),
            message: "index is not open".to_string(),
        });
    }
    if state.readonly {
        return Err(Error::Internal {
            op: "commit",
            path: index.index_path().to_owned(),
            message: "index is read-only".to_string(),
        });
    }

    let timeout = state.options.lock_timeout;
    index.lock_exclusive_locked(&mut state, timeout)?;
    let result = commit_locked(index, &mut state, txn);
    let unlocked = index.unlock_internal(&mut state);
    let info = result?;
    unlocked?;
    Ok(info)
}

fn commit_locked(
    index: &Index,
    state: &mut IndexState,
    txn: Transaction,
) -> Result<CommitInfo> {
    let index_path = index.index_path().to_owned();
    let extensions = index.extensions();

    // Catch up with other processes first; a recreated mailbox means the
    // transaction was built against a dead incarnation.
    let prev_indexid = state.indexid;
    index.refresh_locked(state)?;
    if state.indexid != prev_indexid {
        return Err(Error::IndexIdChanged);
    }

    let head_map = state.map.clone().expect("open index has a map");
    let mut head = head_map.to_memory();
    let map_pos = LogPosition {
        file_seq: head.hdr.log_file_seq,
        offset: head.hdr.log_file_int_offset,
    };
    let log = state.log.as_mut().expect("open index has a log");
    if log.indexid() != state.indexid {
        return Err(Error::corrupted(log.path(), "log indexid mismatch"));
    }
    let log_head = log.head_position();
    if map_pos != log_head {
        let catch_up = ApplyContext {
            extensions,
            kind: SyncHandlerKind::Head,
            run_expunge_handlers: true,
        };
        match log.view(map_pos, log_head)? {
            Some(mut replay) => {
                while let Some(entry) = replay.next()? {
                    apply_entry(&mut head, &entry, &catch_up, &index_path)?;
                }
            }
            None => {
                // Our checkpoint position fell out of the log.
                extensions.call_sync_lost_all();
            }
        }
        head.hdr.log_file_seq = log_head.file_seq;
        head.hdr.log_file_int_offset = log_head.offset;
        head.sync_header_block();
    }

    // Setup phase for extensions that maintain file-level state.
    for ext_id in extensions.ids() {
        extensions.call_sync(ext_id, SyncHandlerKind::File, UidRange { uid1: 0, uid2: 0 });
    }

    let append_count = txn.append_count();
    let first_uid = head.hdr.next_uid;
    let records = txn.build(first_uid, &head, extensions);
    let (first_uid, last_uid) = if append_count > 0 {
        (first_uid, first_uid + append_count - 1)
    } else {
        (0, 0)
    };
    if records.is_empty() {
        return Ok(CommitInfo {
            first_uid,
            last_uid,
            position: log_head,
            own_positions: SmallVec::new(),
        });
    }

    // Append, tracking positions for rollback and self-sync skipping.
    let log = state.log.as_mut().expect("open index has a log");
    let rollback_offset = log.head_position().offset;
    let file_seq = log.head_position().file_seq;
    let mut own_positions = SmallVec::new();
    let mut entries = Vec::with_capacity(records.len());
    let mut types_mask = SyncTypes::empty();
    for (typ, payload) in records {
        types_mask |= typ.sync_type();
        let offset = match log.append(typ, &payload) {
            Ok(offset) => offset,
            Err(err) => {
                let _ = log.truncate_to(rollback_offset);
                return Err(err);
            }
        };
        let position = LogPosition { file_seq, offset };
        if matches!(typ, LogRecordType::FlagUpdate | LogRecordType::KeywordUpdate) {
            own_positions.push(position);
        }
        entries.push(LogEntry {
            typ,
            position,
            data: payload,
        });
    }

    let fsync_wanted = !state.options.flags.contains(OpenFlags::FSYNC_DISABLE)
        && state.options.fsync_mask.intersects(types_mask);
    let log = state.log.as_mut().expect("open index has a log");
    if fsync_wanted {
        if let Err(err) = log.fsync() {
            let _ = log.truncate_to(rollback_offset);
            return Err(err);
        }
    }

    // Replay our own records onto the head copy. A failure here means the
    // in-memory map can no longer be trusted.
    let ctx = ApplyContext {
        extensions,
        kind: SyncHandlerKind::Head,
        run_expunge_handlers: true,
    };
    for entry in &entries {
        if let Err(err) = apply_entry(&mut head, entry, &ctx, &index_path) {
            state.corrupted = true;
            let log = state.log.as_mut().expect("open index has a log");
            let _ = log.truncate_to(rollback_offset);
            return Err(err);
        }
    }

    let end = state
        .log
        .as_ref()
        .expect("open index has a log")
        .head_position();
    head.hdr.log_file_seq = end.file_seq;
    head.hdr.log_file_int_offset = end.offset;
    if fsync_wanted {
        // External durability: crash recovery may rely on this offset.
        head.hdr.log_file_ext_offset = end.offset;
    }
    head.sync_header_block();

    let image = head.to_file_image();
    match index.checkpoint_locked(state, &image) {
        Ok(()) => {}
        Err(err @ Error::NoDiskSpace(_)) => {
            index.set_error(state, &err);
            if state.options.flags.contains(OpenFlags::NEVER_IN_MEMORY) {
                return Err(err);
            }
            // The log append already happened; keep the commit and move
            // the index to memory-only mode.
            state.in_memory = true;
            state.log.as_mut().expect("open index has a log").move_to_memory()?;
        }
        Err(err) => return Err(err),
    }

    let head = Arc::new(head);
    index.seed_keywords(&head);
    state.map = Some(head);

    let log = state.log.as_mut().expect("open index has a log");
    log.rotate_if_needed()?;

    Ok(CommitInfo {
        first_uid,
        last_uid,
        position: end,
        own_positions,
    })
}
