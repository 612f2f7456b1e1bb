use std::mem::offset_of;
use std::time::Duration;
use std::time::Instant;

use mail_index::Engine;
use mail_index::Error;
use mail_index::Index;
use mail_index::IndexOptions;
use mail_index::LockMethod;
use mail_index::MailFlags;
use mail_index::OpenFlags;
use mail_index::SyncChangeKind;
use mail_index::ondisk::IndexHeader;
use tempfile::TempDir;

fn options() -> IndexOptions {
    IndexOptions {
        flags: OpenFlags::CREATE | OpenFlags::FSYNC_DISABLE,
        ..IndexOptions::default()
    }
}

fn open_index(dir: &TempDir) -> (Engine, Index) {
    let engine = Engine::new();
    let index = engine.alloc_index(dir.path(), "testbox");
    index.open(options()).unwrap();
    (engine, index)
}

#[test]
fn empty_mailbox_append() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let mut txn = index.transaction();
        txn.append(MailFlags::empty());
        txn.append(MailFlags::empty());
        let info = index.commit(txn).unwrap();
        assert_eq!((info.first_uid, info.last_uid), (1, 2));
    }

    // A fresh process sees the committed state.
    let (_engine, index) = open_index(&dir);
    let view = index.view().unwrap();
    assert_eq!(view.messages_count(), 2);
    assert_eq!(view.lookup_uid(1), 1);
    assert_eq!(view.lookup_uid(2), 2);
    assert_eq!(view.header().next_uid, 3);
}

#[test]
fn flag_updates_cross_log_rotation() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let mut txn = index.transaction();
        for _ in 0..5 {
            txn.append(MailFlags::empty());
        }
        index.commit(txn).unwrap();

        for i in 0..1000 {
            let mut txn = index.transaction();
            if i % 2 == 0 {
                txn.update_flags(3, 3, MailFlags::SEEN, MailFlags::empty());
            } else {
                txn.update_flags(3, 3, MailFlags::empty(), MailFlags::SEEN);
            }
            index.commit(txn).unwrap();
        }
    }

    // 1000 transactions overflow the soft log size at least once.
    assert!(dir.path().join("testbox.log.2").exists());

    let (_engine, index) = open_index(&dir);
    let view = index.view().unwrap();
    let (seq, _) = view.lookup_uid_range(3, 3);
    assert_ne!(seq, 0);
    // The 1000th update (i = 999) removed the flag.
    assert!(!view.flags(seq).contains(MailFlags::SEEN));
}

#[test]
fn expunge_and_resync() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    for _ in 0..10 {
        txn.append(MailFlags::empty());
    }
    index.commit(txn).unwrap();

    let mut reader = index.view().unwrap();

    let mut txn = index.transaction();
    txn.expunge(3);
    txn.expunge(7);
    index.commit(txn).unwrap();

    let changes = reader.sync().unwrap();
    let expunges: Vec<_> = changes
        .iter()
        .filter(|change| change.kind == SyncChangeKind::Expunge)
        .collect();
    assert_eq!(expunges.len(), 2);
    assert_eq!((expunges[0].uids.uid1, expunges[0].uids.uid2), (3, 3));
    assert_eq!((expunges[1].uids.uid1, expunges[1].uids.uid2), (7, 7));

    assert_eq!(reader.messages_count(), 8);
    assert_eq!(reader.lookup_uid(3), 4);
}

#[test]
fn indexid_change_invalidates_views() {
    let dir = tempfile::tempdir().unwrap();
    let (_writer_engine, writer) = open_index(&dir);
    let mut txn = writer.transaction();
    txn.append(MailFlags::empty());
    writer.commit(txn).unwrap();

    let (_reader_engine, reader_index) = open_index(&dir);
    let mut reader = reader_index.view().unwrap();
    assert_eq!(reader.messages_count(), 1);

    // The mailbox goes away and comes back as a new incarnation.
    writer.unlink().unwrap();
    writer.close();
    writer.open(options()).unwrap();

    let err = reader.sync().unwrap_err();
    assert!(matches!(err, Error::IndexIdChanged));
    assert!(reader.is_inconsistent());

    // Discarding the view and opening a fresh one works again.
    drop(reader);
    let reader = reader_index.view().unwrap();
    assert_eq!(reader.messages_count(), 0);
}

#[test]
fn lock_timeout_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    // flock conflicts between two descriptors even in one process, which
    // is what lets this test stand in for two processes.
    let flock_options = IndexOptions {
        lock_method: LockMethod::Flock,
        ..options()
    };
    let engine_a = Engine::new();
    let index_a = engine_a.alloc_index(dir.path(), "testbox");
    index_a.open(flock_options.clone()).unwrap();
    let engine_b = Engine::new();
    let index_b = engine_b.alloc_index(dir.path(), "testbox");
    index_b.open(flock_options).unwrap();

    index_a.lock_exclusive(Duration::from_millis(100)).unwrap();

    let start = Instant::now();
    let err = index_b
        .lock_exclusive(Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Nothing changed and the retry succeeds once A releases.
    index_a.unlock().unwrap();
    index_b.lock_exclusive(Duration::from_millis(100)).unwrap();
    index_b.unlock().unwrap();
}

#[test]
fn uid_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    for batch in 0..10 {
        let mut txn = index.transaction();
        for _ in 0..5 {
            txn.append(MailFlags::empty());
        }
        index.commit(txn).unwrap();
        if batch % 3 == 0 {
            let mut txn = index.transaction();
            txn.expunge_range(batch * 4 + 1, batch * 4 + 2);
            index.commit(txn).unwrap();
        }
    }
    let view = index.view().unwrap();
    let mut last_uid = 0;
    for seq in 1..=view.messages_count() {
        let uid = view.lookup_uid(seq);
        assert!(uid > last_uid, "uid {uid} at seq {seq} after {last_uid}");
        last_uid = uid;
    }
    assert!(view.header().next_uid > last_uid);
}

#[test]
fn two_readers_converge_identically() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    for _ in 0..6 {
        txn.append(MailFlags::empty());
    }
    index.commit(txn).unwrap();

    let (_engine_a, index_a) = open_index(&dir);
    let (_engine_b, index_b) = open_index(&dir);
    let mut reader_a = index_a.view().unwrap();
    let mut reader_b = index_b.view().unwrap();

    let mut txn = index.transaction();
    txn.update_flags(2, 4, MailFlags::SEEN, MailFlags::empty());
    txn.expunge(5);
    txn.update_keyword("NonJunk", true, &[(1, 2)]);
    index.commit(txn).unwrap();

    reader_a.sync().unwrap();
    reader_b.sync().unwrap();

    assert_eq!(reader_a.messages_count(), reader_b.messages_count());
    for seq in 1..=reader_a.messages_count() {
        assert_eq!(reader_a.lookup(seq), reader_b.lookup(seq));
        assert_eq!(reader_a.lookup_keywords(seq), reader_b.lookup_keywords(seq));
    }
}

#[test]
fn snapshot_isolation_until_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();

    let mut snapshot = index.view().unwrap();
    assert_eq!(snapshot.messages_count(), 1);

    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    txn.update_flags(1, 1, MailFlags::FLAGGED, MailFlags::empty());
    index.commit(txn).unwrap();

    // The unsynced view still shows creation-time data.
    assert_eq!(snapshot.messages_count(), 1);
    assert!(!snapshot.flags(1).contains(MailFlags::FLAGGED));

    snapshot.sync().unwrap();
    assert_eq!(snapshot.messages_count(), 2);
    assert!(snapshot.flags(1).contains(MailFlags::FLAGGED));
}

#[test]
fn own_flag_updates_are_not_notified() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();

    let mut view = index.view().unwrap();
    let mut txn = index.transaction();
    txn.update_flags(1, 1, MailFlags::SEEN, MailFlags::empty());
    let info = index.commit(txn).unwrap();
    view.add_synced_transaction(&info);

    let changes = view.sync().unwrap();
    assert!(changes.is_empty(), "own flag change reported: {changes:?}");
    // The change itself is applied all the same.
    assert!(view.flags(1).contains(MailFlags::SEEN));

    // A foreign-looking update (not registered) is reported.
    let mut txn = index.transaction();
    txn.update_flags(1, 1, MailFlags::DRAFT, MailFlags::empty());
    index.commit(txn).unwrap();
    let changes = view.sync().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, SyncChangeKind::Flags);
}

#[test]
fn keywords_roundtrip_through_log_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let mut txn = index.transaction();
        txn.append(MailFlags::empty());
        txn.append(MailFlags::empty());
        index.commit(txn).unwrap();

        let mut txn = index.transaction();
        txn.update_keyword("NonJunk", true, &[(1, 1)]);
        txn.update_keyword("$Forwarded", true, &[(1, 2)]);
        index.commit(txn).unwrap();

        let mut txn = index.transaction();
        txn.update_keyword("NonJunk", false, &[(1, 1)]);
        index.commit(txn).unwrap();
    }

    let (_engine, index) = open_index(&dir);
    let view = index.view().unwrap();
    assert_eq!(view.lookup_keywords(1), vec!["$Forwarded".to_string()]);
    assert_eq!(view.lookup_keywords(2), vec!["$Forwarded".to_string()]);
}

#[test]
fn header_updates_apply_partially() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let mut txn = index.transaction();
        txn.update_header(
            offset_of!(IndexHeader, uid_validity) as u16,
            &123456789u32.to_ne_bytes(),
        );
        index.commit(txn).unwrap();
    }
    let (_engine, index) = open_index(&dir);
    assert_eq!(index.view().unwrap().header().uid_validity, 123456789);
}

#[test]
fn lookup_first_uses_lowwater_hints() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    for _ in 0..8 {
        txn.append(MailFlags::empty());
    }
    index.commit(txn).unwrap();
    let mut txn = index.transaction();
    txn.update_flags(1, 5, MailFlags::SEEN, MailFlags::empty());
    index.commit(txn).unwrap();

    let view = index.view().unwrap();
    assert_eq!(view.lookup_first(MailFlags::SEEN, MailFlags::empty()), Some(6));
    assert_eq!(view.lookup_first(MailFlags::SEEN, MailFlags::SEEN), Some(1));
    assert_eq!(
        view.lookup_first(MailFlags::DELETED, MailFlags::DELETED),
        None
    );
}

#[test]
fn read_latest_promotes_to_head() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();

    let snapshot = index.view().unwrap();
    let mut txn = index.transaction();
    txn.update_flags(1, 1, MailFlags::ANSWERED, MailFlags::empty());
    index.commit(txn).unwrap();

    // Plain lookup honors the snapshot, lookup_full reads the head.
    assert!(!snapshot.flags(1).contains(MailFlags::ANSWERED));
    let (latest, from_head) = snapshot.lookup_full(1);
    assert!(from_head);
    assert!(MailFlags::from_bits_truncate(latest.flags).contains(MailFlags::ANSWERED));
}

#[test]
fn in_memory_fallback_keeps_working() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();

    index.move_to_memory().unwrap();
    assert!(index.is_in_memory());

    let mut txn = index.transaction();
    txn.append(MailFlags::SEEN);
    let info = index.commit(txn).unwrap();
    assert_eq!(info.first_uid, 2);
    let view = index.view().unwrap();
    assert_eq!(view.messages_count(), 2);
    assert!(view.flags(2).contains(MailFlags::SEEN));
}

#[test]
fn corrupted_checkpoint_is_unlinked_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let mut txn = index.transaction();
        txn.append(MailFlags::empty());
        index.commit(txn).unwrap();
    }
    // Truncate the checkpoint mid-header.
    let index_path = dir.path().join("testbox.index");
    let data = std::fs::read(&index_path).unwrap();
    std::fs::write(&index_path, &data[..16]).unwrap();

    let (_engine, index) = open_index(&dir);
    // Open succeeds; the broken checkpoint was discarded and the log
    // replay restores the mail.
    let mut view = index.view().unwrap();
    view.sync().unwrap();
    assert_eq!(view.messages_count(), 1);
    assert!(index.last_error_message().is_some());
}
