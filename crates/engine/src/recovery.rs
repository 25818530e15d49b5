/// Cold-start path: load the newest key index, replay the transaction logs
/// that follow it, and clean up files that are no longer needed.
use anyhow::{Context, Result};
use btree::{BTreeRoot, MemberValue, ValueRef};
use files::{read_key_index, DataFile, FileCollection, FileKind, HEADER_LEN};
use std::sync::Arc;
use tracing::{debug, info, warn};
use trlog::{LoggedValue, TrLogError, TrLogReader, TrLogRecord};

use crate::EngineError;

/// What recovery hands to the engine.
pub(crate) struct Recovered {
    pub(crate) root: BTreeRoot,
    pub(crate) next_generation: u64,
    /// Transaction id of the key index that was loaded (0 without one).
    pub(crate) indexed_transaction_id: u64,
}

pub(crate) fn recover(files: &FileCollection) -> Result<Recovered> {
    let all = files.enumerate();
    let next_generation = all
        .iter()
        .filter_map(|f| f.generation())
        .max()
        .map_or(1, |g| g + 1);

    let mut indexes: Vec<&Arc<DataFile>> = all
        .iter()
        .filter(|f| f.kind() == Some(FileKind::KeyIndex))
        .collect();
    indexes.sort_by_key(|f| std::cmp::Reverse((f.generation(), f.id())));

    let mut loaded = None;
    for file in indexes {
        match read_key_index(file) {
            Ok((info, root)) => {
                info!(
                    file_id = file.id(),
                    transaction_id = info.transaction_id,
                    keys = info.key_count,
                    "loaded key index"
                );
                loaded = Some((file.id(), info, root));
                break;
            }
            Err(e) => warn!(file_id = file.id(), error = %e, "skipping unusable key index"),
        }
    }

    let (index_id, start, mut root) = match loaded {
        Some((id, info, root)) => (
            Some(id),
            Some((info.tr_log_file_id, info.tr_log_offset)),
            root,
        ),
        None => (None, None, BTreeRoot::new(0, 0)),
    };
    let indexed_transaction_id = index_id.map_or(0, |_| root.transaction_id());

    let start_generation = start.and_then(|(log_id, _)| {
        files.get_file(log_id).and_then(|f| f.generation())
    });
    let mut logs: Vec<&Arc<DataFile>> = all
        .iter()
        .filter(|f| f.kind() == Some(FileKind::TransactionLog))
        .filter(|f| match (start, start_generation) {
            (None, _) => true,
            (Some(_), Some(generation)) => f.generation() >= Some(generation),
            (Some((log_id, _)), None) => f.id() > log_id,
        })
        .collect();
    logs.sort_by_key(|f| (f.generation(), f.id()));

    let log_count = logs.len();
    let mut first_commit = None;
    for (n, log) in logs.into_iter().enumerate() {
        let from = match start {
            Some((log_id, offset)) if log_id == log.id() => offset,
            _ => HEADER_LEN,
        };
        replay_log(log, from, &mut root, n + 1 == log_count, &mut first_commit)?;
    }

    // Without an index the logs must reach back to the first transaction.
    // Logs retired by compaction and relocated values are covered only by an index.
    if index_id.is_none() {
        let has_pure_values = all
            .iter()
            .any(|f| f.kind() == Some(FileKind::PureValues));
        match first_commit {
            Some(first) if first != 1 => {
                return Err(EngineError::Corruption(format!(
                    "no usable key index and the transaction logs start at transaction {first}"
                ))
                .into());
            }
            None if has_pure_values => {
                return Err(EngineError::Corruption(
                    "no usable key index for the existing pure-values files".to_string(),
                )
                .into());
            }
            _ => {}
        }
    }

    for file in &all {
        let obsolete = match file.kind() {
            None => true,
            Some(FileKind::KeyIndex) => Some(file.id()) != index_id,
            Some(_) => false,
        };
        if obsolete {
            files
                .delete_file(file.id())
                .with_context(|| format!("failed to delete obsolete file {}", file.id()))?;
            info!(file_id = file.id(), "deleted obsolete file during recovery");
        }
    }

    Ok(Recovered {
        root,
        next_generation,
        indexed_transaction_id,
    })
}

/// Applies every committed transaction of one log, starting at `from`.
///
/// `first_commit` receives the id of the first commit seen across all logs.
fn replay_log(
    log: &DataFile,
    from: u64,
    root: &mut BTreeRoot,
    is_newest: bool,
    first_commit: &mut Option<u64>,
) -> Result<()> {
    let file_id = log.id();
    let mut reader = TrLogReader::open(log)
        .with_context(|| format!("failed to open transaction log {file_id}"))?;
    if from > HEADER_LEN && !reader.skip_to(from)? {
        return Err(EngineError::Corruption(format!(
            "transaction log {file_id} ends before the key index position {from}"
        ))
        .into());
    }

    let mut pending: Option<BTreeRoot> = None;
    let mut commits = 0u64;
    let result = reader.replay(|entry| match entry.record {
        TrLogRecord::Commit { transaction_id } => {
            let mut next = pending
                .take()
                .unwrap_or_else(|| root.new_transaction_root());
            next.set_transaction_id(transaction_id);
            first_commit.get_or_insert(transaction_id);
            next.set_tr_log_position(file_id, entry.end_offset);
            *root = next;
            commits += 1;
        }
        op => {
            let working = pending.get_or_insert_with(|| root.new_transaction_root());
            apply_op(working, op, file_id, entry.value_offset);
        }
    });

    match result {
        Ok(end) => {
            debug!(file_id, commits, end, "replayed transaction log");
            if pending.is_some() {
                warn!(file_id, "discarded uncommitted tail of transaction log");
            }
            Ok(())
        }
        Err(TrLogError::Corrupt(offset)) if is_newest => {
            warn!(file_id, offset, commits, "corrupt frame at end of newest log; stopping replay");
            Ok(())
        }
        Err(TrLogError::Corrupt(offset)) => Err(EngineError::Corruption(format!(
            "transaction log {file_id} is corrupt at offset {offset}"
        ))
        .into()),
        Err(e) => Err(e).with_context(|| format!("failed to replay transaction log {file_id}")),
    }
}

fn apply_op(root: &mut BTreeRoot, record: TrLogRecord, file_id: u32, value_offset: Option<u32>) {
    match record {
        TrLogRecord::CreateOrUpdate {
            key,
            value: LoggedValue::Inline(bytes),
        } => {
            root.create_or_update(key, MemberValue::Inline(bytes));
        }
        TrLogRecord::CreateOrUpdate {
            key,
            value: LoggedValue::Stored { size, .. },
        } => {
            if let Some(offset) = value_offset {
                root.create_or_update(
                    key,
                    MemberValue::Stored(ValueRef {
                        file_id,
                        offset,
                        size,
                    }),
                );
            }
        }
        TrLogRecord::Erase { key } => {
            if let Ok(index) = root.search(&key) {
                root.erase_range(index, index);
            }
        }
        TrLogRecord::EraseRange {
            first_key,
            last_key,
        } => {
            let first = match root.search(&first_key) {
                Ok(i) | Err(i) => i,
            };
            let end = match root.search(&last_key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            if end > first {
                root.erase_range(first, end - 1);
            }
        }
        TrLogRecord::Commit { .. } => {}
    }
}
