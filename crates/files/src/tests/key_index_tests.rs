use crate::*;
use anyhow::Result;
use btree::{BTreeRoot, MemberValue, ValueRef};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

fn sample_root(n: u32) -> BTreeRoot {
    let mut root = BTreeRoot::new(4, 1234);
    for i in 0..n {
        let key = format!("key{:05}", i).into_bytes();
        let value = if i % 3 == 0 {
            MemberValue::Inline(vec![i as u8; (i % 7) as usize])
        } else {
            MemberValue::Stored(ValueRef {
                file_id: 4,
                offset: 100 + i * 20,
                size: if i % 2 == 0 { -20 } else { 20 },
            })
        };
        root.create_or_update(key, value);
    }
    root.set_transaction_id(99);
    root
}

// -------------------- Write & load --------------------

#[test]
fn key_index_roundtrip_preserves_members_and_position() -> Result<()> {
    let dir = tempdir()?;
    let fc = FileCollection::open(dir.path())?;
    let root = sample_root(500);

    let (file, out) = fc.create_file(FileKind::KeyIndex, 1)?;
    let info = write_key_index(out, &root)?;
    assert_eq!(info.key_count, 500);

    let (loaded_info, loaded) = read_key_index(&file)?;
    assert_eq!(loaded_info, info);
    assert_eq!(loaded_info.transaction_id, 99);
    assert_eq!(loaded.transaction_id(), 99);
    assert_eq!(loaded.tr_log_file_id(), 4);
    assert_eq!(loaded.tr_log_offset(), 1234);
    assert!(root.iter().eq(loaded.iter()));
    Ok(())
}

#[test]
fn empty_tree_key_index() -> Result<()> {
    let dir = tempdir()?;
    let fc = FileCollection::open(dir.path())?;
    let root = BTreeRoot::new(1, HEADER_LEN);

    let (file, out) = fc.create_file(FileKind::KeyIndex, 1)?;
    write_key_index(out, &root)?;
    let (info, loaded) = read_key_index(&file)?;
    assert_eq!(info.key_count, 0);
    assert!(loaded.is_empty());
    Ok(())
}

#[test]
fn key_index_survives_reopen_of_collection() -> Result<()> {
    let dir = tempdir()?;
    let root = sample_root(40);
    {
        let fc = FileCollection::open(dir.path())?;
        let (_, out) = fc.create_file(FileKind::KeyIndex, 3)?;
        write_key_index(out, &root)?;
    }
    let fc = FileCollection::open(dir.path())?;
    let file = fc.file(1)?;
    assert_eq!(file.generation(), Some(3));
    let (_, loaded) = read_key_index(&file)?;
    assert_eq!(loaded.len(), 40);
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn flipped_byte_fails_checksum() -> Result<()> {
    let dir = tempdir()?;
    let root = sample_root(10);
    let path = {
        let fc = FileCollection::open(dir.path())?;
        let (file, out) = fc.create_file(FileKind::KeyIndex, 1)?;
        write_key_index(out, &root)?;
        file.path().to_path_buf()
    };

    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::Start(HEADER_LEN + 30))?;
    f.write_all(&[0xAA])?;
    drop(f);

    let fc = FileCollection::open(dir.path())?;
    let err = read_key_index(&*fc.file(1)?).unwrap_err();
    assert!(matches!(err, FileError::Corrupt { file_id: 1, .. }));
    Ok(())
}

#[test]
fn truncated_key_index_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let root = sample_root(10);
    let path = {
        let fc = FileCollection::open(dir.path())?;
        let (file, out) = fc.create_file(FileKind::KeyIndex, 1)?;
        write_key_index(out, &root)?;
        file.path().to_path_buf()
    };

    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 9])?;

    let fc = FileCollection::open(dir.path())?;
    assert!(read_key_index(&*fc.file(1)?).is_err());
    Ok(())
}

#[test]
fn wrong_kind_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let fc = FileCollection::open(dir.path())?;
    let (file, mut out) = fc.create_file(FileKind::TransactionLog, 1)?;
    out.write_block(&[0u8; 40])?;
    out.flush()?;
    assert!(matches!(read_key_index(&file), Err(FileError::Corrupt { .. })));
    Ok(())
}

#[test]
fn writer_rejects_wrong_member_count() -> Result<()> {
    let dir = tempdir()?;
    let fc = FileCollection::open(dir.path())?;
    let (_, out) = fc.create_file(FileKind::KeyIndex, 1)?;
    let info = KeyIndexInfo {
        key_count: 2,
        ..KeyIndexInfo::default()
    };
    let mut w = KeyIndexWriter::new(out, info)?;
    w.add(&btree::LeafMember {
        key: b"a".to_vec(),
        value: MemberValue::Inline(b"1".to_vec()),
    })?;
    assert!(w.finish().is_err());
    Ok(())
}
