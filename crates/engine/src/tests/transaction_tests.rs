use super::helpers::quiet_config;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn engine_with(keys: &[&[u8]]) -> Result<(tempfile::TempDir, KeyValueEngine)> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    let mut tx = engine.begin_write();
    for k in keys {
        tx.create_or_update(k, b"value of some length")?;
    }
    tx.commit()?;
    Ok((dir, engine))
}

// -------------------- Cursor basics --------------------

#[test]
fn empty_store_has_no_keys() -> Result<()> {
    let (_dir, engine) = engine_with(&[])?;
    let mut tx = engine.begin_read();
    assert_eq!(tx.key_count(), 0);
    assert!(!tx.find_first_key());
    assert!(!tx.find_last_key());
    assert_eq!(tx.find_key(b"x"), FindResult::NotFound);
    assert!(tx.key().is_none());
    assert!(tx.value().is_err());
    Ok(())
}

#[test]
fn create_or_update_reports_creation_and_positions_cursor() -> Result<()> {
    let (_dir, engine) = engine_with(&[])?;
    let mut tx = engine.begin_write();
    assert!(tx.create_or_update(b"k", b"one")?);
    assert_eq!(tx.key(), Some(&b"k"[..]));
    assert!(!tx.create_or_update(b"k", b"two")?);
    assert_eq!(tx.value()?, b"two");
    assert_eq!(tx.key_count(), 1);
    Ok(())
}

#[test]
fn find_key_reports_neighbours() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"b", b"d"])?;
    let mut tx = engine.begin_read();

    assert_eq!(tx.find_key(b"b"), FindResult::Exact);
    assert_eq!(tx.key(), Some(&b"b"[..]));

    assert_eq!(tx.find_key(b"c"), FindResult::Previous);
    assert_eq!(tx.key(), Some(&b"b"[..]));

    assert_eq!(tx.find_key(b"a"), FindResult::Next);
    assert_eq!(tx.key(), Some(&b"b"[..]));

    assert_eq!(tx.find_key(b"z"), FindResult::Previous);
    assert_eq!(tx.key(), Some(&b"d"[..]));
    Ok(())
}

#[test]
fn next_and_previous_walk_and_stop_at_the_ends() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a", b"b", b"c"])?;
    let mut tx = engine.begin_read();

    // no current key: next starts at the first one
    assert!(tx.find_next_key());
    assert_eq!(tx.key(), Some(&b"a"[..]));
    assert!(tx.find_next_key());
    assert!(tx.find_next_key());
    assert_eq!(tx.key(), Some(&b"c"[..]));
    assert!(!tx.find_next_key());
    assert_eq!(tx.key(), Some(&b"c"[..]));

    assert!(tx.find_previous_key());
    assert_eq!(tx.key(), Some(&b"b"[..]));
    assert!(tx.find_previous_key());
    assert!(!tx.find_previous_key());
    assert_eq!(tx.key_index(), Some(0));
    Ok(())
}

#[test]
fn previous_without_cursor_starts_at_last() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a", b"b"])?;
    let mut tx = engine.begin_read();
    assert!(tx.find_previous_key());
    assert_eq!(tx.key(), Some(&b"b"[..]));
    Ok(())
}

#[test]
fn key_index_roundtrip() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a", b"b", b"c"])?;
    let mut tx = engine.begin_read();
    assert!(tx.set_key_index(2));
    assert_eq!(tx.key(), Some(&b"c"[..]));
    assert_eq!(tx.key_index(), Some(2));
    assert!(!tx.set_key_index(3));
    assert!(tx.key().is_none());
    Ok(())
}

// -------------------- Key prefix --------------------

#[test]
fn prefix_scopes_cursor_and_ordinals() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a/1", b"a/2", b"b/1"])?;
    let mut tx = engine.begin_read();
    tx.set_key_prefix(b"a/");
    assert_eq!(tx.key_prefix(), b"a/");
    assert_eq!(tx.key_count(), 2);

    assert!(tx.find_first_key());
    assert_eq!(tx.key(), Some(&b"1"[..]));
    assert!(tx.find_next_key());
    assert_eq!(tx.key(), Some(&b"2"[..]));
    assert!(!tx.find_next_key());

    assert!(tx.set_key_index(1));
    assert_eq!(tx.key(), Some(&b"2"[..]));
    assert!(!tx.set_key_index(2));
    Ok(())
}

#[test]
fn prefix_find_key_stays_inside_prefix() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a/1", b"a/2", b"b/1"])?;
    let mut tx = engine.begin_read();

    tx.set_key_prefix(b"a/");
    assert_eq!(tx.find_key(b"0"), FindResult::Next);
    assert_eq!(tx.key(), Some(&b"1"[..]));

    tx.set_key_prefix(b"b/");
    assert_eq!(tx.find_key(b"9"), FindResult::Previous);
    assert_eq!(tx.key(), Some(&b"1"[..]));

    tx.set_key_prefix(b"c/");
    assert_eq!(tx.key_count(), 0);
    assert_eq!(tx.find_key(b"1"), FindResult::NotFound);
    Ok(())
}

#[test]
fn setting_prefix_invalidates_cursor() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a/1"])?;
    let mut tx = engine.begin_read();
    assert!(tx.find_first_key());
    tx.set_key_prefix(b"a/");
    assert!(tx.key().is_none());
    Ok(())
}

#[test]
fn all_ff_prefix_reaches_end_of_keyspace() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a", &[0xff, 0xff, 1], &[0xff, 0xff, 2]])?;
    let mut tx = engine.begin_read();
    tx.set_key_prefix(&[0xff, 0xff]);
    assert_eq!(tx.key_count(), 2);
    Ok(())
}

// -------------------- Erase --------------------

#[test]
fn erase_range_is_clamped_to_prefix() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a/1", b"a/2", b"a/3", b"b/1"])?;
    let mut tx = engine.begin_write();
    tx.set_key_prefix(b"a/");
    tx.erase_range(1, 100)?;
    assert_eq!(tx.key_count(), 1);
    tx.commit()?;

    let keys: Vec<_> = engine.scan(b"")?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a/1".to_vec(), b"b/1".to_vec()]);
    Ok(())
}

#[test]
fn erase_range_with_inverted_bounds_is_noop() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a", b"b"])?;
    let mut tx = engine.begin_write();
    tx.erase_range(1, 0)?;
    tx.erase_range(5, 9)?;
    assert_eq!(tx.key_count(), 2);
    Ok(())
}

#[test]
fn erase_all_under_prefix() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a/1", b"a/2", b"b/1"])?;
    let mut tx = engine.begin_write();
    tx.set_key_prefix(b"a/");
    tx.erase_all()?;
    tx.commit()?;
    assert_eq!(engine.key_count(), 1);
    assert!(engine.get(b"b/1")?.is_some());
    Ok(())
}

#[test]
fn erase_current_requires_cursor() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a"])?;
    let mut tx = engine.begin_write();
    let err = tx.erase_current().unwrap_err();
    assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::NotFound));

    assert_eq!(tx.find_key(b"a"), FindResult::Exact);
    tx.erase_current()?;
    assert!(tx.key().is_none());
    assert_eq!(tx.key_count(), 0);
    Ok(())
}

// -------------------- Read-only and limits --------------------

#[test]
fn read_transaction_rejects_mutations() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a"])?;
    let mut tx = engine.begin_read();
    assert!(!tx.is_writable());
    let err = tx.create_or_update(b"b", b"v").unwrap_err();
    assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::ReadOnly));
    assert!(tx.erase_all().is_err());
    assert!(tx.find_first_key());
    assert!(tx.erase_current().is_err());
    Ok(())
}

#[test]
fn oversized_key_and_value_rejected() -> Result<()> {
    let (_dir, engine) = engine_with(&[])?;
    let mut tx = engine.begin_write();
    let err = tx
        .create_or_update(&vec![0u8; MAX_KEY_SIZE + 1], b"v")
        .unwrap_err();
    assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::KeyTooLarge));

    let err = tx
        .create_or_update(b"k", &vec![0u8; MAX_VALUE_SIZE + 1])
        .unwrap_err();
    assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::ValueTooLarge));
    assert_eq!(tx.key_count(), 0);
    Ok(())
}

#[test]
fn prefix_counts_towards_key_size() -> Result<()> {
    let (_dir, engine) = engine_with(&[])?;
    let mut tx = engine.begin_write();
    tx.set_key_prefix(b"p");
    assert!(tx.create_or_update(&vec![0u8; MAX_KEY_SIZE], b"v").is_err());
    Ok(())
}

// -------------------- Isolation --------------------

#[test]
fn uncommitted_changes_are_private() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a"])?;
    let mut writer = engine.begin_write();
    writer.create_or_update(b"b", b"new")?;
    assert_eq!(writer.key_count(), 2);
    assert!(engine.get(b"b")?.is_none());

    writer.commit()?;
    assert_eq!(engine.get(b"b")?, Some(b"new".to_vec()));
    Ok(())
}

#[test]
fn reader_keeps_its_snapshot() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a"])?;
    let mut reader = engine.begin_read();
    engine.set(b"a", b"changed value")?;
    engine.set(b"b", b"added")?;

    assert_eq!(reader.key_count(), 1);
    assert_eq!(reader.find_key(b"a"), FindResult::Exact);
    assert_eq!(reader.value()?, b"value of some length");
    Ok(())
}

#[test]
fn dropped_writer_publishes_nothing() -> Result<()> {
    let (_dir, engine) = engine_with(&[])?;
    let before = engine.last_committed().transaction_id();
    {
        let mut tx = engine.begin_write();
        tx.create_or_update(b"k", b"v")?;
    }
    assert_eq!(engine.last_committed().transaction_id(), before);
    assert!(engine.get(b"k")?.is_none());
    assert_eq!(engine.open_transactions(), 0);
    Ok(())
}

#[test]
fn empty_commit_keeps_transaction_id() -> Result<()> {
    let (_dir, engine) = engine_with(&[b"a"])?;
    let before = engine.last_committed().transaction_id();
    engine.begin_write().commit()?;
    engine.begin_read().commit()?;
    assert_eq!(engine.last_committed().transaction_id(), before);
    Ok(())
}
