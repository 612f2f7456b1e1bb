use mail_index::Cache;
use mail_index::CacheFieldType;
use mail_index::Engine;
use mail_index::Index;
use mail_index::IndexOptions;
use mail_index::MailFlags;
use mail_index::OpenFlags;
use tempfile::TempDir;

fn open_index(dir: &TempDir) -> (Engine, Index) {
    let engine = Engine::new();
    let index = engine.alloc_index(dir.path(), "testbox");
    index
        .open(IndexOptions {
            flags: OpenFlags::CREATE | OpenFlags::FSYNC_DISABLE,
            ..IndexOptions::default()
        })
        .unwrap();
    (engine, index)
}

#[test]
fn cached_fields_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let cache = Cache::open(&index);
    let size_field = cache.register_field("size", CacheFieldType::Fixed, 4);
    let subject_field = cache.register_field("hdr.subject", CacheFieldType::String, 0);
    let date_field = cache.register_field("received.date", CacheFieldType::Date, 0);

    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();
    let view = index.view().unwrap();

    let mut txn = index.transaction();
    cache
        .add(&mut txn, &view, 1, size_field, &4096u32.to_le_bytes())
        .unwrap();
    cache
        .add(&mut txn, &view, 1, subject_field, b"Re: lunch?")
        .unwrap();
    cache
        .add(&mut txn, &view, 1, date_field, &1_600_000_000u32.to_le_bytes())
        .unwrap();
    index.commit(txn).unwrap();

    let view = index.view().unwrap();
    assert_eq!(
        cache.lookup(&view, 1, size_field).unwrap(),
        Some(4096u32.to_le_bytes().to_vec())
    );
    assert_eq!(
        cache.lookup(&view, 1, subject_field).unwrap(),
        Some(b"Re: lunch?".to_vec())
    );
    assert_eq!(
        cache.lookup(&view, 1, date_field).unwrap(),
        Some(1_600_000_000u32.to_le_bytes().to_vec())
    );

    let stats = cache.stats();
    assert_eq!(stats.lookups, 3);
    assert_eq!(stats.hits, 3);

    // Dropping mapped state only costs a reopen.
    cache.drop_caches();
    assert_eq!(
        cache.lookup(&view, 1, size_field).unwrap(),
        Some(4096u32.to_le_bytes().to_vec())
    );
}

#[test]
fn later_fields_chain_records() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let cache = Cache::open(&index);
    let size_field = cache.register_field("size", CacheFieldType::Fixed, 4);
    let flags_field = cache.register_field("imap.flags", CacheFieldType::Variable, 0);

    let mut txn = index.transaction();
    txn.append(MailFlags::empty());
    index.commit(txn).unwrap();

    // Two separate commits: the second record links back to the first.
    let view = index.view().unwrap();
    let mut txn = index.transaction();
    cache
        .add(&mut txn, &view, 1, size_field, &77u32.to_le_bytes())
        .unwrap();
    index.commit(txn).unwrap();

    let view = index.view().unwrap();
    let mut txn = index.transaction();
    cache
        .add(&mut txn, &view, 1, flags_field, b"\\Seen \\Answered")
        .unwrap();
    index.commit(txn).unwrap();

    let view = index.view().unwrap();
    assert_eq!(
        cache.lookup(&view, 1, size_field).unwrap(),
        Some(77u32.to_le_bytes().to_vec())
    );
    assert_eq!(
        cache.lookup(&view, 1, flags_field).unwrap(),
        Some(b"\\Seen \\Answered".to_vec())
    );
}

#[test]
fn cache_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_engine, index) = open_index(&dir);
        let cache = Cache::open(&index);
        let size_field = cache.register_field("size", CacheFieldType::Fixed, 4);
        let mut txn = index.transaction();
        txn.append(MailFlags::empty());
        index.commit(txn).unwrap();
        let view = index.view().unwrap();
        let mut txn = index.transaction();
        cache
            .add(&mut txn, &view, 1, size_field, &11u32.to_le_bytes())
            .unwrap();
        index.commit(txn).unwrap();
    }

    // A fresh engine resolves the field by name via the file's field
    // block.
    let (_engine, index) = open_index(&dir);
    let cache = Cache::open(&index);
    let size_field = cache.register_field("size", CacheFieldType::Fixed, 4);
    let view = index.view().unwrap();
    assert_eq!(
        cache.lookup(&view, 1, size_field).unwrap(),
        Some(11u32.to_le_bytes().to_vec())
    );
}

#[test]
fn compaction_resets_old_readers() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, index) = open_index(&dir);
    let cache = Cache::open(&index);
    let size_field = cache.register_field("size", CacheFieldType::Fixed, 4);

    let mut txn = index.transaction();
    for _ in 0..1000 {
        txn.append(MailFlags::empty());
    }
    index.commit(txn).unwrap();

    let view = index.view().unwrap();
    let mut txn = index.transaction();
    for seq in 1..=1000u32 {
        let uid = view.lookup_uid(seq);
        cache
            .add(&mut txn, &view, seq, size_field, &(uid * 100).to_le_bytes())
            .unwrap();
    }
    index.commit(txn).unwrap();

    // The reader that will be left behind by the compaction.
    let mut old_reader = index.view().unwrap();
    assert_eq!(
        cache.lookup(&old_reader, 2, size_field).unwrap(),
        Some(200u32.to_le_bytes().to_vec())
    );

    // Expunge every second mail, then compact.
    let mut txn = index.transaction();
    for uid in (2..=1000u32).step_by(2) {
        txn.expunge(uid);
    }
    index.commit(txn).unwrap();
    let writer_view = index.view().unwrap();
    cache.compress(&writer_view).unwrap();

    // Every pre-compaction offset is now a miss for the old reader.
    assert_eq!(cache.lookup(&old_reader, 1, size_field).unwrap(), None);
    assert_eq!(cache.lookup(&old_reader, 2, size_field).unwrap(), None);

    // After syncing past the reset the surviving mails hit again, with
    // the same values as before.
    old_reader.sync().unwrap();
    assert_eq!(old_reader.messages_count(), 500);
    for seq in [1u32, 250, 500] {
        let uid = old_reader.lookup_uid(seq);
        assert_eq!(uid % 2, 1, "only odd uids survive");
        assert_eq!(
            cache.lookup(&old_reader, seq, size_field).unwrap(),
            Some((uid * 100).to_le_bytes().to_vec()),
        );
    }
}
