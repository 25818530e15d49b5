/// Key-index checkpoints.
///
/// A checkpoint captures the last committed root together with its position
/// in the transaction log. Recovery loads the newest one and replays only the
/// log that follows it. It is also the only durable record of compactor
/// remaps, which are never logged.
use anyhow::{Context, Result};
use btree::BTreeRoot;
use files::{AppendWriter, FileKind, KeyIndexInfo, KeyIndexWriter};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use crate::{CancellationToken, EngineInner};

/// Members written between two cancellation checks.
const CHECK_EVERY: usize = 4096;

impl EngineInner {
    pub(crate) fn create_index_file(&self, token: &CancellationToken) -> Result<u32> {
        let _guard = self.index_lock.lock();
        token.check()?;
        let root = self.last_committed();
        let generation = self.allocate_generation();
        let (file, out) = self
            .files
            .create_file(FileKind::KeyIndex, generation)
            .context("failed to create key index file")?;
        let id = file.id();
        drop(file);

        if let Err(e) = write_index(out, &root, token) {
            if let Err(del) = self.files.delete_file(id) {
                warn!(file_id = id, error = %del, "failed to remove incomplete key index");
            }
            return Err(e);
        }
        self.last_indexed
            .store(root.transaction_id(), Ordering::SeqCst);
        info!(
            file_id = id,
            transaction_id = root.transaction_id(),
            keys = root.len(),
            "wrote key index"
        );

        for older in self.files.enumerate() {
            if older.id() != id && older.kind() == Some(FileKind::KeyIndex) {
                match self.files.delete_file(older.id()) {
                    Ok(()) => info!(file_id = older.id(), "retired key index"),
                    Err(e) => warn!(file_id = older.id(), error = %e, "failed to retire key index"),
                }
            }
        }
        Ok(id)
    }
}

fn write_index(out: AppendWriter, root: &BTreeRoot, token: &CancellationToken) -> Result<()> {
    let info = KeyIndexInfo {
        transaction_id: root.transaction_id(),
        tr_log_file_id: root.tr_log_file_id(),
        tr_log_offset: root.tr_log_offset(),
        key_count: root.len(),
    };
    let mut writer = KeyIndexWriter::new(out, info)?;
    for (i, member) in root.iter().enumerate() {
        if i % CHECK_EVERY == 0 {
            token.check()?;
        }
        writer.add(member)?;
    }
    writer.finish()?;
    Ok(())
}
