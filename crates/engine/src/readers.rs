//! Registry of open transactions, keyed by the transaction id of the root
//! each one reads from.
//!
//! The compactor uses it to learn when no transaction can still dereference
//! value locations that a remap made obsolete.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use btree::BTreeRoot;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{CancellationToken, EngineError};

/// Upper bound on one condition-variable sleep; cancellation is re-checked
/// at least this often.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
pub(crate) struct ReaderRegistry {
    /// root transaction id -> number of open transactions on it
    open: Mutex<BTreeMap<u64, usize>>,
    released: Condvar,
}

impl ReaderRegistry {
    /// Snapshots `last_committed` and registers the caller on it in one step,
    /// so a waiter never misses a transaction that already holds the root.
    pub(crate) fn snapshot(&self, last_committed: &RwLock<Arc<BTreeRoot>>) -> Arc<BTreeRoot> {
        let mut open = self.open.lock();
        let root: Arc<BTreeRoot> = last_committed.read().clone();
        *open.entry(root.transaction_id()).or_insert(0) += 1;
        root
    }

    /// Drops one registration made by [`snapshot`](Self::snapshot).
    pub(crate) fn release(&self, transaction_id: u64) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(&transaction_id) {
            *count -= 1;
            if *count == 0 {
                open.remove(&transaction_id);
            }
        }
        drop(open);
        self.released.notify_all();
    }

    /// Root transaction id of the oldest open transaction.
    pub(crate) fn oldest(&self) -> Option<u64> {
        self.open.lock().keys().next().copied()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.lock().values().sum()
    }

    /// Blocks until no open transaction reads a root older than
    /// `transaction_id`, or until `token` is cancelled.
    pub(crate) fn wait_until_none_before(
        &self,
        transaction_id: u64,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut open = self.open.lock();
        loop {
            match open.keys().next() {
                Some(&oldest) if oldest < transaction_id => {}
                _ => return Ok(()),
            }
            token.check()?;
            self.released.wait_for(&mut open, WAIT_SLICE);
        }
    }
}
