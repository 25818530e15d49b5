//! Transactions: a cursor over one tree version, optionally writable.

use anyhow::Result;
use btree::{BTreeRoot, MemberValue};
use std::sync::Arc;

use crate::write::PendingOp;
use crate::{EngineError, EngineInner, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Outcome of [`Transaction::find_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    /// The cursor is on the key.
    Exact,
    /// The key is absent; the cursor is on the closest smaller key.
    Previous,
    /// The key is absent and nothing smaller exists; the cursor is on the
    /// closest larger key.
    Next,
    /// No key with the current prefix exists.
    NotFound,
}

/// One transaction of a [`KeyValueEngine`](crate::KeyValueEngine).
///
/// All keys passed in and returned are relative to the key prefix set with
/// [`set_key_prefix`](Self::set_key_prefix) (empty by default); the cursor
/// and the ordinal operations only see keys under that prefix.
///
/// A read transaction sees the root that was last committed when it began
/// for its whole life. A write transaction additionally sees its own
/// changes, which become visible to others only through
/// [`commit`](Self::commit).
pub struct Transaction {
    inner: Arc<EngineInner>,
    /// Registered snapshot; for writers, the base of the working root.
    snapshot: Arc<BTreeRoot>,
    working: Option<BTreeRoot>,
    ops: Vec<PendingOp>,
    prefix: Vec<u8>,
    /// Absolute ordinal of the current key.
    cursor: Option<u64>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("base_transaction_id", &self.snapshot.transaction_id())
            .field("writable", &self.working.is_some())
            .field("pending_ops", &self.ops.len())
            .field("prefix", &self.prefix)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn read(inner: Arc<EngineInner>) -> Self {
        let snapshot = inner.readers.snapshot(&inner.last_committed);
        Self {
            inner,
            snapshot,
            working: None,
            ops: Vec::new(),
            prefix: Vec::new(),
            cursor: None,
        }
    }

    pub(crate) fn write(inner: Arc<EngineInner>) -> Self {
        let mut tx = Self::read(inner);
        tx.working = Some(tx.snapshot.new_transaction_root());
        tx
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.working.is_some()
    }

    /// Transaction id of the root this transaction started from.
    #[must_use]
    pub fn base_transaction_id(&self) -> u64 {
        self.snapshot.transaction_id()
    }

    fn view(&self) -> &BTreeRoot {
        self.working.as_ref().unwrap_or(&self.snapshot)
    }

    fn working_mut(&mut self) -> Result<&mut BTreeRoot, EngineError> {
        self.working.as_mut().ok_or(EngineError::ReadOnly)
    }

    /// Ordinals `[start, end)` of the keys under the prefix.
    fn prefix_range(&self) -> (u64, u64) {
        let view = self.view();
        if self.prefix.is_empty() {
            return (0, view.len());
        }
        let start = ordinal(view.search(&self.prefix));
        let end = match prefix_successor(&self.prefix) {
            Some(upper) => ordinal(view.search(&upper)),
            None => view.len(),
        };
        (start, end)
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }

    /// Scopes the cursor and every ordinal to keys starting with `prefix`.
    /// Invalidates the cursor.
    pub fn set_key_prefix(&mut self, prefix: &[u8]) {
        self.prefix = prefix.to_vec();
        self.cursor = None;
    }

    #[must_use]
    pub fn key_prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Positions the cursor on `key`, or on a neighbour when it is absent.
    pub fn find_key(&mut self, key: &[u8]) -> FindResult {
        let full = self.full_key(key);
        let (start, end) = self.prefix_range();
        match self.view().search(&full) {
            Ok(i) => {
                self.cursor = Some(i);
                FindResult::Exact
            }
            Err(i) if i > start && i - 1 < end => {
                self.cursor = Some(i - 1);
                FindResult::Previous
            }
            Err(i) if i >= start && i < end => {
                self.cursor = Some(i);
                FindResult::Next
            }
            Err(_) => {
                self.cursor = None;
                FindResult::NotFound
            }
        }
    }

    /// Inserts `key` or replaces its value and moves the cursor onto it.
    /// Returns `true` if the key did not exist before.
    pub fn create_or_update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let full = self.full_key(key);
        if full.len() > MAX_KEY_SIZE {
            return Err(EngineError::KeyTooLarge.into());
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(EngineError::ValueTooLarge.into());
        }
        let working = self.working_mut()?;
        let (created, index) =
            working.create_or_update(full.clone(), MemberValue::Inline(value.to_vec()));
        self.cursor = Some(index);
        self.ops.push(PendingOp::Set {
            key: full,
            value: value.to_vec(),
        });
        Ok(created)
    }

    /// Removes the key under the cursor. The cursor becomes invalid.
    pub fn erase_current(&mut self) -> Result<()> {
        let index = self.current_index()?;
        let key = self
            .view()
            .get(index)
            .map(|m| m.key.clone())
            .ok_or(EngineError::NotFound)?;
        self.working_mut()?.erase_range(index, index);
        self.cursor = None;
        self.ops.push(PendingOp::Erase { key });
        Ok(())
    }

    /// Removes every key under the prefix.
    pub fn erase_all(&mut self) -> Result<()> {
        let count = self.key_count();
        if count == 0 {
            self.working_mut()?;
            return Ok(());
        }
        self.erase_range(0, count - 1)
    }

    /// Removes the keys with prefix-relative ordinals
    /// `first_key_index..=last_key_index`. Out-of-range parts are ignored.
    pub fn erase_range(&mut self, first_key_index: u64, last_key_index: u64) -> Result<()> {
        self.working_mut()?;
        let (start, end) = self.prefix_range();
        let first = start.saturating_add(first_key_index);
        let last = start.saturating_add(last_key_index).min(end.saturating_sub(1));
        if first_key_index > last_key_index || first >= end || first > last {
            return Ok(());
        }
        let view = self.view();
        let (Some(first_key), Some(last_key)) = (
            view.get(first).map(|m| m.key.clone()),
            view.get(last).map(|m| m.key.clone()),
        ) else {
            return Ok(());
        };
        self.working_mut()?.erase_range(first, last);
        self.cursor = None;
        self.ops.push(PendingOp::EraseRange {
            first_key,
            last_key,
        });
        Ok(())
    }

    fn current_index(&self) -> Result<u64, EngineError> {
        let (start, end) = self.prefix_range();
        match self.cursor {
            Some(i) if i >= start && i < end => Ok(i),
            _ => Err(EngineError::NotFound),
        }
    }

    /// Key under the cursor, without the prefix.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        let index = self.current_index().ok()?;
        self.view()
            .get(index)
            .map(|m| &m.key[self.prefix.len()..])
    }

    /// Value under the cursor, loaded from its data file when needed.
    pub fn value(&self) -> Result<Vec<u8>> {
        let index = self.current_index()?;
        let member = self.view().get(index).ok_or(EngineError::NotFound)?;
        match &member.value {
            MemberValue::Inline(bytes) => Ok(bytes.clone()),
            MemberValue::Stored(r) => self.inner.read_value(r),
        }
    }

    pub fn find_first_key(&mut self) -> bool {
        let (start, end) = self.prefix_range();
        self.cursor = (start < end).then_some(start);
        self.cursor.is_some()
    }

    pub fn find_last_key(&mut self) -> bool {
        let (start, end) = self.prefix_range();
        self.cursor = (start < end).then(|| end - 1);
        self.cursor.is_some()
    }

    /// Moves to the next key. Without a current key this is
    /// [`find_first_key`](Self::find_first_key). Returns `false` (leaving the
    /// cursor in place) at the last key.
    pub fn find_next_key(&mut self) -> bool {
        let Ok(index) = self.current_index() else {
            return self.find_first_key();
        };
        let (_, end) = self.prefix_range();
        if index + 1 < end {
            self.cursor = Some(index + 1);
            true
        } else {
            false
        }
    }

    /// Moves to the previous key. Without a current key this is
    /// [`find_last_key`](Self::find_last_key).
    pub fn find_previous_key(&mut self) -> bool {
        let Ok(index) = self.current_index() else {
            return self.find_last_key();
        };
        let (start, _) = self.prefix_range();
        if index > start {
            self.cursor = Some(index - 1);
            true
        } else {
            false
        }
    }

    /// Number of keys under the prefix.
    #[must_use]
    pub fn key_count(&self) -> u64 {
        let (start, end) = self.prefix_range();
        end - start
    }

    /// Prefix-relative ordinal of the current key.
    #[must_use]
    pub fn key_index(&self) -> Option<u64> {
        let (start, _) = self.prefix_range();
        self.current_index().ok().map(|i| i - start)
    }

    /// Moves the cursor to prefix-relative ordinal `index`.
    pub fn set_key_index(&mut self, index: u64) -> bool {
        let (start, end) = self.prefix_range();
        match start.checked_add(index) {
            Some(i) if i < end => {
                self.cursor = Some(i);
                true
            }
            _ => {
                self.cursor = None;
                false
            }
        }
    }

    /// Makes the changes durable and visible.
    ///
    /// A no-op for read transactions and for write transactions without
    /// changes. Fails with [`EngineError::Conflict`] when another commit was
    /// published after this transaction began; nothing is published then.
    pub fn commit(mut self) -> Result<()> {
        let Some(working) = self.working.take() else {
            return Ok(());
        };
        let ops = std::mem::take(&mut self.ops);
        self.inner
            .commit_transaction(self.snapshot.transaction_id(), working, ops)?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.inner.readers.release(self.snapshot.transaction_id());
    }
}

fn ordinal(search: Result<u64, u64>) -> u64 {
    match search {
        Ok(i) | Err(i) => i,
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` when no such string exists (all bytes `0xff`).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
