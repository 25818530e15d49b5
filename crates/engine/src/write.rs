/// Commit path and everything that changes what is published or on disk:
/// transaction-log management, unlogged tree changes, file retirement, and
/// the auto-commit convenience writes.
use anyhow::{Context, Result};
use btree::{BTreeRoot, MemberValue, ValueRef};
use files::FileKind;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use trlog::{LoggedValue, TrLogRecord, TrLogWriter};

use crate::{is_conflict, EngineError, EngineInner, KeyValueEngine, Transaction, MAX_INLINE_VALUE};

/// Attempts made by the auto-commit helpers before a conflict is returned.
const MAX_CONFLICT_RETRIES: usize = 16;

/// One mutation of a write transaction, in the order it was made.
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Erase { key: Vec<u8> },
    EraseRange { first_key: Vec<u8>, last_key: Vec<u8> },
}

/// State guarded by the commit lock.
#[derive(Default)]
pub(crate) struct LogState {
    /// Active log. `None` before the first commit after open, after a switch,
    /// and after a failed append (the partial file is never appended to again).
    writer: Option<TrLogWriter>,
}

impl LogState {
    pub(crate) fn active_file_id(&self) -> Option<u32> {
        self.writer.as_ref().map(TrLogWriter::file_id)
    }
}

impl EngineInner {
    fn start_tr_log(&self) -> Result<TrLogWriter> {
        let generation = self.allocate_generation();
        let (file, out) = self
            .files
            .create_file(FileKind::TransactionLog, generation)
            .context("failed to create transaction log")?;
        info!(file_id = file.id(), generation, "started transaction log");
        Ok(TrLogWriter::new(out))
    }

    fn encode_stored(&self, value: Vec<u8>) -> Result<LoggedValue> {
        let threshold = self.config.compression_threshold;
        if threshold > 0 && value.len() >= threshold {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&value)
                .context("failed to compress value")?;
            if compressed.len() < value.len() {
                return Ok(LoggedValue::Stored {
                    size: -(compressed.len() as i32),
                    bytes: compressed,
                });
            }
        }
        Ok(LoggedValue::Stored {
            size: value.len() as i32,
            bytes: value,
        })
    }

    /// Logs `ops` and publishes `root` if `base` is still the last committed
    /// transaction id. Returns the committed transaction id.
    pub(crate) fn commit_transaction(
        &self,
        base: u64,
        mut root: BTreeRoot,
        ops: Vec<PendingOp>,
    ) -> Result<u64> {
        if ops.is_empty() {
            return Ok(base);
        }
        let mut state = self.log.lock();
        let current = self.last_committed.read().transaction_id();
        if current != base {
            debug!(base, current, "commit conflict");
            return Err(EngineError::Conflict { base, current }.into());
        }

        // logs are created lazily on the first commit that needs one
        let writer = match state.writer.take() {
            Some(w) => w,
            None => self.start_tr_log()?,
        };
        let writer = state.writer.insert(writer);
        let file_id = writer.file_id();
        let transaction_id = root.transaction_id();

        let refs = match self.append_transaction(writer, ops, transaction_id) {
            Ok(refs) => refs,
            Err(e) => {
                warn!(file_id, error = %e, "transaction log append failed; abandoning log file");
                // the file may end in a partial frame; the next commit starts a new one
                state.writer = None;
                return Err(e);
            }
        };

        // stored values now have a place in the log
        for (key, r) in refs {
            if let Ok(index) = root.search(&key) {
                root.set_value(index, MemberValue::Stored(r));
            }
        }
        let position = writer.position();
        root.set_tr_log_position(file_id, position);
        *self.last_committed.write() = Arc::new(root);
        debug!(transaction_id, file_id, position, "committed");

        if position > self.config.max_tr_log_file_size {
            info!(file_id, position, "transaction log full; switching");
            state.writer = None;
            drop(state);
            self.request_compaction();
        }
        Ok(transaction_id)
    }

    /// Appends the operations and the commit record and flushes them.
    /// Returns where the stored values of the surviving keys were written.
    fn append_transaction(
        &self,
        writer: &mut TrLogWriter,
        ops: Vec<PendingOp>,
        transaction_id: u64,
    ) -> Result<BTreeMap<Vec<u8>, ValueRef>> {
        let file_id = writer.file_id();
        let mut refs = BTreeMap::new();
        for op in ops {
            match op {
                PendingOp::Set { key, value } if value.len() <= MAX_INLINE_VALUE => {
                    refs.remove(&key);
                    writer.append(&TrLogRecord::CreateOrUpdate {
                        key,
                        value: LoggedValue::Inline(value),
                    })?;
                }
                PendingOp::Set { key, value } => {
                    let value = self.encode_stored(value)?;
                    let size = match &value {
                        LoggedValue::Stored { size, .. } => *size,
                        LoggedValue::Inline(_) => 0,
                    };
                    let record = TrLogRecord::CreateOrUpdate {
                        key: key.clone(),
                        value,
                    };
                    let offset = writer.append(&record)?.ok_or_else(|| {
                        EngineError::Corruption("stored value written without an offset".into())
                    })?;
                    refs.insert(
                        key,
                        ValueRef {
                            file_id,
                            offset,
                            size,
                        },
                    );
                }
                PendingOp::Erase { key } => {
                    refs.remove(&key);
                    writer.append(&TrLogRecord::Erase { key })?;
                }
                PendingOp::EraseRange {
                    first_key,
                    last_key,
                } => {
                    refs.retain(|k, _| *k < first_key || *k > last_key);
                    writer.append(&TrLogRecord::EraseRange {
                        first_key,
                        last_key,
                    })?;
                }
            }
        }
        writer.append(&TrLogRecord::Commit { transaction_id })?;
        if writer.position() > u64::from(u32::MAX) {
            return Err(EngineError::ResourceExhausted(format!(
                "transaction log {file_id} exceeds the addressable size"
            ))
            .into());
        }
        if self.config.sync_on_commit {
            writer.hard_flush()?;
        } else {
            writer.flush()?;
        }
        Ok(refs)
    }

    /// Makes everything appended to the active log durable.
    pub(crate) fn sync_log(&self) -> Result<()> {
        if let Some(writer) = self.log.lock().writer.as_mut() {
            writer.hard_flush()?;
        }
        Ok(())
    }

    /// Runs `mutator` on a copy of the current root and publishes the result
    /// as a new version. Nothing is logged: callers must only make changes
    /// that a later key index can capture, such as value relocations.
    pub(crate) fn atomically_change_btree<F>(&self, mutator: F) -> Result<u64>
    where
        F: FnOnce(&mut BTreeRoot) -> Result<()>,
    {
        let _state = self.log.lock();
        let current = self.last_committed();
        let mut root = current.new_transaction_root();
        mutator(&mut root)?;
        let transaction_id = root.transaction_id();
        *self.last_committed.write() = Arc::new(root);
        debug!(transaction_id, "published unlogged tree change");
        Ok(transaction_id)
    }

    pub(crate) fn mark_as_unknown(&self, file_ids: &[u32], safe_from_transaction_id: u64) {
        let mut unknown = self.unknown.lock();
        for &id in file_ids {
            unknown.insert(id, safe_from_transaction_id);
        }
    }

    /// Deletes marked files after re-checking that no open transaction
    /// predates the mark, that the last committed root holds no value in
    /// them, and that they are not the log in use.
    pub(crate) fn delete_all_unknown_files(&self) -> Result<usize> {
        let candidates: Vec<(u32, u64)> = self
            .unknown
            .lock()
            .iter()
            .map(|(&id, &safe)| (id, safe))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        // Marked files never gain references; any root newer than the marks will do.
        let referenced: HashSet<u32> = self
            .last_committed()
            .iter()
            .filter_map(|m| m.value.stored().map(|r| r.file_id))
            .collect();

        let mut deleted = 0;
        for (id, safe_from) in candidates {
            if referenced.contains(&id) {
                warn!(file_id = id, "file marked for deletion is still referenced; keeping it");
                self.unknown.lock().remove(&id);
                continue;
            }

            let state = self.log.lock();
            if Some(id) == state.active_file_id() || id == self.last_committed().tr_log_file_id() {
                continue;
            }
            if self
                .readers
                .oldest()
                .is_some_and(|oldest| oldest < safe_from)
            {
                debug!(file_id = id, "file still visible to an open transaction");
                continue;
            }
            match self.files.delete_file(id) {
                Ok(()) | Err(files::FileError::UnknownFile(_)) => {}
                Err(e) => return Err(e).with_context(|| format!("failed to delete file {id}")),
            }
            drop(state);
            self.unknown.lock().remove(&id);
            info!(file_id = id, "deleted retired file");
            deleted += 1;
        }
        Ok(deleted)
    }
}

impl KeyValueEngine {
    /// Runs `body` in a fresh write transaction and commits it, restarting on
    /// commit conflicts.
    fn auto_commit<T, F>(&self, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.begin_write();
            let out = body(&mut tx)?;
            match tx.commit() {
                Ok(()) => return Ok(out),
                Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(attempt, "retrying conflicting auto-commit");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stores `value` under `key` in its own transaction.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.auto_commit(|tx| tx.create_or_update(key, value).map(|_| ()))
    }

    /// Removes `key` in its own transaction. Returns whether it existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.auto_commit(|tx| {
            if tx.find_key(key) == crate::FindResult::Exact {
                tx.erase_current()?;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }
}
