//! Advancing a view to the log head.
//!
//! Sync replays every log record between the view's remembered position
//! and the current head into a private heap copy of the view's map, then
//! swaps the copy in. The caller gets one notification per change; flag
//! and keyword changes the view's owner committed itself (registered via
//! [`View::add_synced_transaction`]) are applied but not reported.
//!
//! If the mailbox was recreated (indexid changed) or the view's position
//! fell off the log, sync delivers the sync-lost event and returns
//! [`Error::IndexIdChanged`]; changes already applied stay visible in the
//! view, which is permanently inconsistent from then on.

use std::sync::Arc;

use crate::apply::ApplyContext;
use crate::apply::SyncChange;
use crate::apply::apply_entry;
use crate::error::Error;
use crate::error::Result;
use crate::extension::SyncHandlerKind;
use crate::ondisk::LogRecordType;
use crate::translog::LogPosition;
use crate::view::View;

impl View {
    /// Replays the log up to the head, returning the changes a reader
    /// should react to, in log order.
    pub fn sync(&mut self) -> Result<Vec<SyncChange>> {
        self.require_consistent()?;
        self.index.refresh()?;

        let state = self.index.state();
        if state.indexid != self.indexid {
            drop(state);
            self.inconsistent = true;
            return Err(Error::IndexIdChanged);
        }
        let Some(head_map) = state.map.clone() else {
            drop(state);
            return Err(Error::Internal {
                op: "sync",
                path: self.index.index_path().to_owned(),
                message: "index is not open".to_string(),
            });
        };
        let end = LogPosition {
            file_seq: head_map.hdr.log_file_seq,
            offset: head_map.hdr.log_file_int_offset,
        };
        if end == self.pos {
            return Ok(Vec::new());
        }
        let log_view = state
            .log
            .as_ref()
            .expect("open index has a log")
            .view(self.pos, end)?;
        drop(state);

        let Some(mut log_view) = log_view else {
            // Our position is no longer in the log: replay is impossible.
            self.index.extensions().call_sync_lost_all();
            self.inconsistent = true;
            return Err(Error::IndexIdChanged);
        };

        let mut map = self.map.to_memory();
        let mut changes = Vec::new();
        let ctx = ApplyContext {
            extensions: self.index.extensions(),
            kind: SyncHandlerKind::View,
            run_expunge_handlers: false,
        };
        let index_path = self.index.index_path().to_owned();
        loop {
            let entry = match log_view.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    // Keep what was already replayed; the view is
                    // inconsistent either way.
                    self.commit_partial(map, log_view.tell());
                    return Err(err);
                }
            };
            let own = matches!(
                entry.typ,
                LogRecordType::FlagUpdate | LogRecordType::KeywordUpdate
            ) && self.synced.contains(&entry.position);
            match apply_entry(&mut map, &entry, &ctx, &index_path) {
                Ok(mut entry_changes) => {
                    if !own {
                        changes.append(&mut entry_changes);
                    }
                }
                Err(err) => {
                    self.commit_partial(map, Some(entry.position));
                    return Err(err);
                }
            }
        }

        map.hdr.log_file_seq = end.file_seq;
        map.hdr.log_file_int_offset = end.offset;
        map.sync_header_block();
        self.map = Arc::new(map);
        self.pos = end;
        self.synced.clear();
        Ok(changes)
    }

    fn commit_partial(&mut self, map: crate::map::Map, pos: Option<LogPosition>) {
        self.map = Arc::new(map);
        if let Some(pos) = pos {
            self.pos = pos;
        }
        self.inconsistent = true;
    }
}
