//! # Engine - ArborKV Storage Engine
//!
//! Ties the [`btree`], [`files`] and [`trlog`] crates into a transactional
//! key-value store with online space reclamation.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────┐
//! │                  KeyValueEngine                      │
//! │                                                      │
//! │ begin_read() ──> snapshot of last committed root     │
//! │ begin_write() ─> private copy-on-write working root  │
//! │                    |                                 │
//! │ commit() ────> trlog append + fsync                  │
//! │                    |  base id still current?         │
//! │                    v                                 │
//! │            swap last committed (RwLock<Arc<Root>>)   │
//! │                    |  log grew past the limit?       │
//! │                    v                                 │
//! │            new log file, nudge compactor             │
//! │                                                      │
//! │ compactor ──> copy live values of wasteful files     │
//! │               into a pure-values file, remap leaves, │
//! │               checkpoint, drain old readers, delete  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                               |
//! |-----------------|-------------------------------------------------------|
//! | [`lib.rs`]      | `KeyValueEngine`, shared state, open, accessors, `Drop` |
//! | [`transaction`] | `Transaction` cursor API over one root                |
//! | [`write`]       | commit path, log switching, atomic tree changes, file retirement |
//! | [`read`]        | value loading, `get()`, `scan()`                      |
//! | [`recovery`]    | key-index load and transaction-log replay             |
//! | [`index`]       | key-index checkpoints                                 |
//! | [`compaction`]  | the compactor pass                                    |
//! | [`background`]  | background compaction thread                          |
//!
//! ## Crash Safety
//!
//! A commit is visible only after its records and the `Commit` frame reached
//! the log (fsynced when `sync_on_commit` is set). The compactor flushes its
//! target file before the remapped tree is published, writes a key index
//! before deleting anything, and only deletes files no reader can still reach.

mod background;
mod cancel;
mod compaction;
mod error;
mod index;
mod read;
mod readers;
mod recovery;
mod transaction;
mod write;

use anyhow::{Context, Result};
use btree::BTreeRoot;
use files::{AppendWriter, FileCollection, FileKind};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use background::{BackgroundWorker, CompactionSignal};
use readers::ReaderRegistry;
use write::LogState;

pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{is_cancelled, is_conflict, EngineError};
pub use transaction::{FindResult, Transaction};

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
/// Values up to this many bytes are kept inside the tree leaves.
pub const MAX_INLINE_VALUE: usize = 7;

/// State shared by the engine handle, its transactions and the background
/// compactor.
pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) files: FileCollection,
    /// The only mutable shared pointer; replaced while `log` is held.
    pub(crate) last_committed: RwLock<Arc<BTreeRoot>>,
    /// The commit lock. Guards the active transaction-log writer.
    pub(crate) log: Mutex<LogState>,
    pub(crate) readers: ReaderRegistry,
    /// Files marked for retirement -> transaction id from which on no new
    /// root references them.
    pub(crate) unknown: Mutex<BTreeMap<u32, u64>>,
    pub(crate) next_generation: AtomicU64,
    /// Transaction id captured by the newest key index.
    pub(crate) last_indexed: AtomicU64,
    pub(crate) compaction_lock: Mutex<()>,
    pub(crate) index_lock: Mutex<()>,
    pub(crate) compaction_signal: CompactionSignal,
}

impl EngineInner {
    pub(crate) fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn last_committed(&self) -> Arc<BTreeRoot> {
        self.last_committed.read().clone()
    }

    pub(crate) fn get_generation(&self, file_id: u32) -> Option<u64> {
        self.files.get_file(file_id).and_then(|f| f.generation())
    }

    /// True for value-bearing files created strictly before `dont_touch`
    /// that are not already awaiting deletion.
    pub(crate) fn contains_values_and_does_not_touch_generation(
        &self,
        file_id: u32,
        dont_touch: u64,
    ) -> bool {
        let Some(file) = self.files.get_file(file_id) else {
            return false;
        };
        let Some(header) = file.header() else {
            return false;
        };
        header.kind.contains_values()
            && header.generation < dont_touch
            && !self.unknown.lock().contains_key(&file_id)
    }

    pub(crate) fn start_pure_values_file(&self) -> Result<(AppendWriter, u32)> {
        let generation = self.allocate_generation();
        let (file, writer) = self
            .files
            .create_file(FileKind::PureValues, generation)
            .context("failed to create pure values file")?;
        Ok((writer, file.id()))
    }

    pub(crate) fn request_compaction(&self) {
        self.compaction_signal.request();
    }
}

/// An embedded key-value store over one directory.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
///
/// # Write Path
///
/// 1. [`begin_write`](Self::begin_write) copies the last committed root.
/// 2. Mutations change only the private copy (values held inline).
/// 3. [`Transaction::commit`] logs the operations, checks that no other commit
///    happened since the copy was taken, and publishes the new root.
///
/// # Read Path
///
/// [`begin_read`](Self::begin_read) registers the caller on the last committed
/// root. That root, and every file its values live in, stays intact until the
/// transaction is dropped.
pub struct KeyValueEngine {
    inner: Arc<EngineInner>,
    worker: Option<BackgroundWorker>,
}

impl std::fmt::Debug for KeyValueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = self.inner.last_committed();
        f.debug_struct("KeyValueEngine")
            .field("dir", &self.inner.files.dir())
            .field("transaction_id", &root.transaction_id())
            .field("key_count", &root.len())
            .field("tr_log_file_id", &root.tr_log_file_id())
            .field("file_count", &self.inner.files.count())
            .field("open_transactions", &self.inner.readers.open_count())
            .field("max_tr_log_file_size", &self.inner.config.max_tr_log_file_size)
            .field("background_compaction", &self.worker.is_some())
            .finish()
    }
}

impl KeyValueEngine {
    /// Opens the store in `dir`, creating the directory if needed.
    ///
    /// # Recovery Steps
    ///
    /// 1. Index every data file by its header.
    /// 2. Load the newest key index that validates.
    /// 3. Replay committed transactions from the logs that follow it.
    /// 4. Delete superseded key indexes and files with unreadable headers.
    /// 5. Start the background compactor (if enabled).
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self> {
        config.validate()?;
        let files = FileCollection::open(dir.as_ref()).with_context(|| {
            format!("failed to open data directory {}", dir.as_ref().display())
        })?;
        let recovered = recovery::recover(&files)?;

        info!(
            dir = %dir.as_ref().display(),
            transaction_id = recovered.root.transaction_id(),
            keys = recovered.root.len(),
            files = files.count(),
            "opened key-value engine"
        );

        let inner = Arc::new(EngineInner {
            last_committed: RwLock::new(Arc::new(recovered.root)),
            log: Mutex::new(LogState::default()),
            readers: ReaderRegistry::default(),
            unknown: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(recovered.next_generation),
            last_indexed: AtomicU64::new(recovered.indexed_transaction_id),
            compaction_lock: Mutex::new(()),
            index_lock: Mutex::new(()),
            compaction_signal: CompactionSignal::default(),
            files,
            config,
        });

        let worker = if inner.config.background_compaction {
            Some(BackgroundWorker::spawn(Arc::clone(&inner))?)
        } else {
            None
        };

        Ok(Self { inner, worker })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.inner.files.dir()
    }

    /// The newest published version.
    #[must_use]
    pub fn last_committed(&self) -> Arc<BTreeRoot> {
        self.inner.last_committed()
    }

    /// Starts a read-only transaction on the last committed root.
    #[must_use]
    pub fn begin_read(&self) -> Transaction {
        Transaction::read(Arc::clone(&self.inner))
    }

    /// Starts a write transaction on a private copy of the last committed root.
    #[must_use]
    pub fn begin_write(&self) -> Transaction {
        Transaction::write(Arc::clone(&self.inner))
    }

    /// Generation assigned to `file_id` when it was created.
    #[must_use]
    pub fn get_generation(&self, file_id: u32) -> Option<u64> {
        self.inner.get_generation(file_id)
    }

    #[must_use]
    pub fn contains_values_and_does_not_touch_generation(
        &self,
        file_id: u32,
        dont_touch_generation: u64,
    ) -> bool {
        self.inner
            .contains_values_and_does_not_touch_generation(file_id, dont_touch_generation)
    }

    /// Allocates a fresh pure-values file; the writer is positioned just past
    /// its header.
    pub fn start_pure_values_file(&self) -> Result<(AppendWriter, u32)> {
        self.inner.start_pure_values_file()
    }

    /// Publishes `mutator`'s change of the current root as a new version
    /// without logging it. Returns the new transaction id.
    pub fn atomically_change_btree<F>(&self, mutator: F) -> Result<u64>
    where
        F: FnOnce(&mut BTreeRoot) -> Result<()>,
    {
        self.inner.atomically_change_btree(mutator)
    }

    /// Blocks until no open transaction reads a root older than
    /// `transaction_id`.
    pub fn wait_for_finishing_transactions_before(
        &self,
        transaction_id: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        self.inner
            .readers
            .wait_until_none_before(transaction_id, token)?;
        Ok(())
    }

    /// Marks files for deletion. They are deleted by
    /// [`delete_all_unknown_files`](Self::delete_all_unknown_files) once no
    /// transaction older than `safe_from_transaction_id` is open.
    pub fn mark_as_unknown(&self, file_ids: &[u32], safe_from_transaction_id: u64) {
        self.inner.mark_as_unknown(file_ids, safe_from_transaction_id);
    }

    /// Deletes every marked file that is provably unreachable. Returns the
    /// number of deleted files.
    pub fn delete_all_unknown_files(&self) -> Result<usize> {
        self.inner.delete_all_unknown_files()
    }

    /// Writes a key-index checkpoint of the last committed root and retires
    /// older ones. Returns the new file id.
    pub fn create_index_file(&self, token: &CancellationToken) -> Result<u32> {
        self.inner.create_index_file(token)
    }

    /// Runs one compaction pass. Returns `true` when files were rewritten and
    /// `false` when the pass was skipped or cancelled.
    pub fn compact(&self, token: &CancellationToken) -> Result<bool> {
        self.inner.compact(token)
    }

    /// Asks the background worker for a compaction pass.
    pub fn request_compaction(&self) {
        self.inner.request_compaction();
    }

    /// Number of keys in the last committed root.
    #[must_use]
    pub fn key_count(&self) -> u64 {
        self.inner.last_committed().len()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.inner.files.count()
    }

    /// Bytes used by all data files.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.inner.files.total_size()?)
    }

    /// Number of transactions that are currently open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.inner.readers.open_count()
    }
}

/// Orderly shutdown.
///
/// Stops the background compactor, makes the log durable and, when commits
/// happened since the newest key index, writes a fresh one so the next open
/// replays less. Errors are logged and otherwise ignored: the logs still
/// hold every commit.
impl Drop for KeyValueEngine {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if let Err(e) = self.inner.sync_log() {
            warn!(error = %e, "failed to sync transaction log on close");
        }
        let root = self.inner.last_committed();
        if root.transaction_id() != self.inner.last_indexed.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.create_index_file(&CancellationToken::new()) {
                warn!(error = %e, "failed to write key index on close");
            }
        }
    }
}

#[cfg(test)]
mod tests;
