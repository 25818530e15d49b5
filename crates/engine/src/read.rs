/// Value loading and the auto-commit read helpers.
use anyhow::{Context, Result};
use btree::ValueRef;

use crate::{EngineError, EngineInner, FindResult, KeyValueEngine};

impl EngineInner {
    /// Reads (and, if needed, decompresses) the bytes `r` points at.
    ///
    /// # Errors
    ///
    /// [`EngineError::Corruption`] when the file is gone or the bytes cannot
    /// be decompressed; I/O errors (including reads past the end of the
    /// file) are propagated with context.
    pub(crate) fn read_value(&self, r: &ValueRef) -> Result<Vec<u8>> {
        let file = self.files.get_file(r.file_id).ok_or_else(|| {
            EngineError::Corruption(format!("value references missing file {}", r.file_id))
        })?;
        let mut buf = vec![0u8; r.stored_len() as usize];
        file.random_read(&mut buf, u64::from(r.offset))
            .with_context(|| {
                format!(
                    "failed to read {} bytes at {} of file {}",
                    buf.len(),
                    r.offset,
                    r.file_id
                )
            })?;
        if !r.is_compressed() {
            return Ok(buf);
        }
        snap::raw::Decoder::new().decompress_vec(&buf).map_err(|e| {
            EngineError::Corruption(format!(
                "undecodable compressed value at {} of file {}: {e}",
                r.offset, r.file_id
            ))
            .into()
        })
    }
}

impl KeyValueEngine {
    /// Looks up `key` in the last committed version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut tx = self.begin_read();
        if tx.find_key(key) != FindResult::Exact {
            return Ok(None);
        }
        tx.value().map(Some)
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut tx = self.begin_read();
        tx.set_key_prefix(prefix);
        let mut out = Vec::with_capacity(tx.key_count() as usize);
        let mut more = tx.find_first_key();
        while more {
            let mut key = prefix.to_vec();
            key.extend_from_slice(tx.key().ok_or(EngineError::NotFound)?);
            out.push((key, tx.value()?));
            more = tx.find_next_key();
        }
        Ok(out)
    }
}
