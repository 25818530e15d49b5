use super::helpers::{all_pairs, count_files, key, quiet_config, small_log_config, value};
use crate::*;
use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Simulates a crash: nothing of the orderly shutdown runs.
fn crash(engine: KeyValueEngine) {
    std::mem::forget(engine);
}

fn flip_byte(path: &Path, at: u64) -> Result<()> {
    let mut bytes = fs::read(path)?;
    bytes[at as usize] ^= 0xff;
    fs::write(path, bytes)?;
    Ok(())
}

fn files_with_ext(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some(ext))
        .collect();
    paths.sort();
    paths
}

// --------------------- Clean reopen ---------------------

#[test]
fn reopen_preserves_all_kinds_of_changes() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"inline", b"abc")?;
        engine.set(b"stored", &value(1, 500))?;
        engine.set(b"deleted", b"x")?;
        engine.delete(b"deleted")?;
        for i in 0..10 {
            engine.set(&key(i), &value(i, 20))?;
        }
        let mut tx = engine.begin_write();
        tx.set_key_prefix(b"k");
        tx.erase_range(2, 5)?;
        tx.commit()?;
    }
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.get(b"inline")?, Some(b"abc".to_vec()));
    assert_eq!(engine.get(b"stored")?, Some(value(1, 500)));
    assert!(engine.get(b"deleted")?.is_none());
    let ks: Vec<Vec<u8>> = engine.scan(b"k")?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(ks, vec![key(0), key(1), key(6), key(7), key(8), key(9)]);
    Ok(())
}

#[test]
fn transaction_id_continues_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let before = {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        for i in 0..7 {
            engine.set(&key(i), b"v")?;
        }
        engine.last_committed().transaction_id()
    };
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.last_committed().transaction_id(), before);
    engine.set(b"next", b"v")?;
    assert_eq!(engine.last_committed().transaction_id(), before + 1);
    Ok(())
}

#[test]
fn clean_close_writes_a_key_index() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"k", b"v")?;
    }
    assert_eq!(count_files(dir.path(), "kvi"), 1);
    let first = files_with_ext(dir.path(), "kvi");

    // nothing committed: the existing index stays the newest
    drop(KeyValueEngine::open(dir.path(), quiet_config())?);
    assert_eq!(files_with_ext(dir.path(), "kvi"), first);
    Ok(())
}

#[test]
fn empty_store_reopens_empty() -> Result<()> {
    let dir = tempdir()?;
    drop(KeyValueEngine::open(dir.path(), quiet_config())?);
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.key_count(), 0);
    assert_eq!(count_files(dir.path(), "trl"), 0);
    Ok(())
}

// --------------------- Crash recovery ---------------------

#[test]
fn replays_logs_without_an_index() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), small_log_config())?;
    for i in 0..120 {
        engine.set(&key(i), &value(i, 1024))?;
    }
    crash(engine);
    assert_eq!(count_files(dir.path(), "kvi"), 0);

    let engine = KeyValueEngine::open(dir.path(), small_log_config())?;
    assert_eq!(engine.key_count(), 120);
    for i in 0..120 {
        assert_eq!(engine.get(&key(i))?, Some(value(i, 1024)));
    }
    Ok(())
}

#[test]
fn replays_only_what_follows_the_index() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"a", &value(1, 100))?;
    }
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"b", &value(2, 100))?;
    engine.delete(b"a")?;
    crash(engine);

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert!(engine.get(b"a")?.is_none());
    assert_eq!(engine.get(b"b")?, Some(value(2, 100)));
    Ok(())
}

#[test]
fn torn_tail_of_newest_log_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"a", b"1")?;
    engine.set(b"b", &value(2, 64))?;
    crash(engine);

    let log = files_with_ext(dir.path(), "trl").pop().unwrap();
    OpenOptions::new()
        .append(true)
        .open(&log)?
        .write_all(&[0x20, 1, 2, 3])?;

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b")?, Some(value(2, 64)));
    Ok(())
}

#[test]
fn truncated_last_commit_is_lost_earlier_ones_survive() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"a", &value(1, 64))?;
    engine.set(b"b", &value(2, 64))?;
    crash(engine);

    let log = files_with_ext(dir.path(), "trl").pop().unwrap();
    let len = fs::metadata(&log)?.len();
    OpenOptions::new().write(true).open(&log)?.set_len(len - 5)?;

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.get(b"a")?, Some(value(1, 64)));
    assert!(engine.get(b"b")?.is_none());
    Ok(())
}

#[test]
fn corrupt_frame_in_newest_log_stops_replay() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"a", &value(1, 64))?;
    engine.set(b"b", &value(2, 64))?;
    let r = *engine.last_committed().find(b"b").unwrap().value.stored().unwrap();
    crash(engine);

    let log = files_with_ext(dir.path(), "trl").pop().unwrap();
    flip_byte(&log, u64::from(r.offset) + 3)?;

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.get(b"a")?, Some(value(1, 64)));
    assert!(engine.get(b"b")?.is_none());
    Ok(())
}

#[test]
fn corrupt_frame_in_older_log_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), small_log_config())?;
    for i in 0..120 {
        engine.set(&key(i), &value(i, 1024))?;
    }
    let r = *engine.last_committed().find(&key(0)).unwrap().value.stored().unwrap();
    let first_log = engine.inner.files.file(r.file_id)?.path().to_path_buf();
    assert_ne!(r.file_id, engine.last_committed().tr_log_file_id());
    crash(engine);

    flip_byte(&first_log, u64::from(r.offset) + 10)?;
    let err = KeyValueEngine::open(dir.path(), small_log_config()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn damaged_index_falls_back_to_full_replay() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        for i in 0..10 {
            engine.set(&key(i), &value(i, 40))?;
        }
    }
    let index = files_with_ext(dir.path(), "kvi").pop().unwrap();
    let len = fs::metadata(&index)?.len();
    flip_byte(&index, len / 2)?;

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert!(!index.exists());
    assert_eq!(engine.key_count(), 10);
    for i in 0..10 {
        assert_eq!(engine.get(&key(i))?, Some(value(i, 40)));
    }
    Ok(())
}

/// k001..k100 with 1 KiB values, k001..k050 erased, then one compaction pass.
fn compacted_store(dir: &Path) -> Result<()> {
    let engine = KeyValueEngine::open(dir, small_log_config())?;
    for i in 1..=100 {
        engine.set(&key(i), &value(i, 1024))?;
    }
    let mut tx = engine.begin_write();
    tx.set_key_prefix(b"k0");
    tx.erase_range(0, 49)?;
    tx.commit()?;
    assert!(engine.compact(&CancellationToken::new())?);
    crash(engine);
    Ok(())
}

fn assert_corruption(err: anyhow::Error) {
    assert!(
        matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Corruption(_))
        ),
        "expected corruption, got {err:#}"
    );
}

#[test]
fn damaged_index_after_compaction_fails_open() -> Result<()> {
    let dir = tempdir()?;
    compacted_store(dir.path())?;
    let index = files_with_ext(dir.path(), "kvi").pop().unwrap();
    let len = fs::metadata(&index)?.len();
    flip_byte(&index, len / 2)?;
    let before = files_with_ext(dir.path(), "pvl");

    let err = KeyValueEngine::open(dir.path(), small_log_config()).unwrap_err();
    assert_corruption(err);
    // nothing was cleaned up or rewritten
    assert!(index.exists());
    assert_eq!(files_with_ext(dir.path(), "pvl"), before);
    Ok(())
}

#[test]
fn missing_index_after_compaction_fails_open() -> Result<()> {
    let dir = tempdir()?;
    compacted_store(dir.path())?;
    for index in files_with_ext(dir.path(), "kvi") {
        fs::remove_file(index)?;
    }
    let err = KeyValueEngine::open(dir.path(), small_log_config()).unwrap_err();
    assert_corruption(err);
    Ok(())
}

#[test]
fn pure_values_without_logs_or_index_fail_open() -> Result<()> {
    let dir = tempdir()?;
    compacted_store(dir.path())?;
    for path in files_with_ext(dir.path(), "kvi")
        .into_iter()
        .chain(files_with_ext(dir.path(), "trl"))
    {
        fs::remove_file(path)?;
    }
    let err = KeyValueEngine::open(dir.path(), small_log_config()).unwrap_err();
    assert_corruption(err);
    Ok(())
}

#[test]
fn unreadable_files_are_removed_on_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"k", b"v")?;
    }
    let junk = dir.path().join("00000099.trl");
    fs::write(&junk, b"definitely not a header")?;

    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert!(!junk.exists());
    assert_eq!(engine.get(b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn reopened_store_keeps_appending_to_a_new_log() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"a", &value(1, 32))?;
    }
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        engine.set(b"b", &value(2, 32))?;
    }
    assert_eq!(count_files(dir.path(), "trl"), 2);
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(
        all_pairs(&engine),
        vec![(b"a".to_vec(), value(1, 32)), (b"b".to_vec(), value(2, 32))]
    );
    Ok(())
}

// --------------------- Key index checkpoints ---------------------

#[test]
fn new_index_retires_the_previous_one() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"a", b"1")?;
    let first = engine.create_index_file(&CancellationToken::new())?;
    engine.set(b"b", b"2")?;
    let second = engine.create_index_file(&CancellationToken::new())?;
    assert!(second > first);
    assert_eq!(count_files(dir.path(), "kvi"), 1);
    assert_eq!(engine.get_generation(first), None);
    Ok(())
}

#[test]
fn cancelled_index_leaves_no_file() -> Result<()> {
    let dir = tempdir()?;
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    engine.set(b"a", b"1")?;
    let token = CancellationToken::new();
    token.cancel();
    let err = engine.create_index_file(&token).unwrap_err();
    assert!(is_cancelled(&err));
    assert_eq!(count_files(dir.path(), "kvi"), 0);
    Ok(())
}

#[test]
fn index_alone_restores_state_when_logs_are_gone() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
        for i in 0..30 {
            engine.set(&key(i), &value(i, 5))?;
        }
    }
    for log in files_with_ext(dir.path(), "trl") {
        fs::remove_file(log)?;
    }
    let engine = KeyValueEngine::open(dir.path(), quiet_config())?;
    assert_eq!(engine.key_count(), 30);
    assert_eq!(engine.get(&key(29))?, Some(value(29, 5)));
    Ok(())
}
