//! Mail index storage engine.
//!
//! Crash-safe, multi-reader/single-writer access to per-mailbox metadata:
//! flags, keywords, UIDs and cached header/body fields. The engine owns
//! four files per mailbox — the mmap'ed primary index (a checkpoint), a
//! rotating pair of append-only transaction logs (the authority), and a
//! separately versioned message cache — and is linked into each protocol
//! server and administrative tool; there is no CLI surface here.
//!
//! The shape of a session:
//!
//! ```no_run
//! use mail_index::{Engine, IndexOptions, MailFlags};
//!
//! # fn main() -> mail_index::Result<()> {
//! let engine = Engine::new();
//! let index = engine.alloc_index("/var/mail/.imap/INBOX", "mailbox");
//! index.open(IndexOptions::default())?;
//!
//! let mut view = index.view()?;
//! let mut txn = index.transaction();
//! txn.append(MailFlags::RECENT);
//! let info = index.commit(txn)?;
//! view.add_synced_transaction(&info);
//!
//! for change in view.sync()? {
//!     // react to appends/expunges/flag changes from other writers
//!     let _ = change;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Readers hold a [`View`] — an immutable snapshot plus a transaction log
//! position — and converge on the head by replaying log records
//! ([`View::sync`]). A single writer per index commits [`Transaction`]s
//! under the exclusive lock. Storage backends attach their own per-record
//! data through the extension registry ([`Extensions`]) without changing
//! the core record format.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![allow(clippy::too_many_arguments)]

use std::path::Path;
use std::sync::Arc;

pub use crate::apply::SyncChange;
pub use crate::apply::SyncChangeKind;
pub use crate::cache::Cache;
pub use crate::cache::CacheFieldId;
pub use crate::cache::CacheStats;
pub use crate::dotlock::Dotlock;
pub use crate::dotlock::DotlockCallback;
pub use crate::dotlock::DotlockSettings;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::extension::ExpungeHandler;
pub use crate::extension::ExtId;
pub use crate::extension::Extensions;
pub use crate::extension::SyncHandler;
pub use crate::extension::SyncHandlerKind;
pub use crate::extension::SyncHandlerTypes;
pub use crate::extension::SyncLostHandler;
pub use crate::index::Index;
pub use crate::keywords::Keywords;
pub use crate::lock::LockMethod;
pub use crate::map::Map;
pub use crate::map::MapExt;
pub use crate::map::RecordView;
pub use crate::ondisk::CacheFieldType;
pub use crate::ondisk::IndexHeader;
pub use crate::ondisk::MailFlags;
pub use crate::ondisk::Record;
pub use crate::ondisk::SyncTypes;
pub use crate::options::IndexOptions;
pub use crate::options::OpenFlags;
pub use crate::options::env_index_dir;
pub use crate::sync::CommitInfo;
pub use crate::transaction::Transaction;
pub use crate::translog::LogPosition;
pub use crate::view::View;

mod apply;
mod cache;
mod dotlock;
mod error;
mod extension;
mod index;
mod keywords;
mod lock;
mod map;
mod mmap;
mod nfs;
pub mod ondisk;
mod options;
mod sync;
mod transaction;
mod translog;
mod view;
mod view_sync;

/// The engine instance a process constructs once and threads through its
/// mail storage backends. Owns the extension registry, which earlier
/// designs kept in process-global state.
#[derive(Debug)]
pub struct Engine {
    extensions: Arc<Extensions>,
}

impl Engine {
    /// Creates an engine with an empty extension registry.
    pub fn new() -> Engine {
        Engine {
            extensions: Arc::new(Extensions::new()),
        }
    }

    /// The process-wide extension registry.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Allocates a handle for the index at `<dir>/<prefix>.index` (plus
    /// its log and cache siblings). No file is touched until
    /// [`Index::open`].
    pub fn alloc_index(&self, dir: impl AsRef<Path>, prefix: &str) -> Index {
        Index::alloc(self.extensions.clone(), dir.as_ref(), prefix)
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}
