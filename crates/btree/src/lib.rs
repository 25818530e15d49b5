//! # BTree - Immutable Versioned Index
//!
//! The in-memory index of the ArborKV storage engine: a B-tree whose nodes are
//! never modified once another version can see them.
//!
//! A [`BTreeRoot`] is one named version of the whole key-value mapping. Writers
//! obtain a private working copy with [`BTreeRoot::new_transaction_root`], which
//! shares every node with its parent version. Mutations clone only the nodes on
//! the path from the root to the touched leaf (copy-on-write), so the previous
//! version stays valid and iterable for as long as someone holds it.
//!
//! ```text
//!        v1 root            v2 root  (v1 + one update)
//!         /    \             /    \
//!      [A]      [B] <-------'      [B'] (copied)
//!        ^                          |
//!        '--------- shared ---------'
//! ```
//!
//! Leaves store [`LeafMember`]s: a key plus either the value bytes (small values)
//! or a [`ValueRef`] pointing into one of the engine's append-only files.
//! Interior nodes keep per-child member counts, which gives ordinal addressing
//! (`get(index)`, [`erase_range`](BTreeRoot::erase_range)) in O(log n).
//!
//! This crate performs no I/O; the engine decides where values live.

mod iter;
mod node;

use std::sync::Arc;

pub use iter::Iter;
use node::Node;

/// Location of a value stored outside the tree.
///
/// `abs(size)` is the stored byte length; a negative `size` marks a compressed
/// value. References are never mutated in place: an update allocates a new one
/// and only the compactor moves existing bytes (through
/// [`BTreeRoot::remapping_iterate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef {
    pub file_id: u32,
    pub offset: u32,
    pub size: i32,
}

impl ValueRef {
    /// Number of bytes the value occupies in its file.
    #[must_use]
    pub fn stored_len(&self) -> u32 {
        self.size.unsigned_abs()
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.size < 0
    }

    /// `(file_id, offset)` packed into one integer, used as a map key.
    #[must_use]
    pub fn location(&self) -> u64 {
        (u64::from(self.file_id) << 32) | u64::from(self.offset)
    }
}

/// The value half of a leaf member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberValue {
    /// Value bytes kept directly in the leaf.
    Inline(Vec<u8>),
    /// Value bytes kept in a data file.
    Stored(ValueRef),
}

impl MemberValue {
    /// Returns the file reference, if the value lives in a file.
    #[must_use]
    pub fn stored(&self) -> Option<&ValueRef> {
        match self {
            MemberValue::Stored(r) => Some(r),
            MemberValue::Inline(_) => None,
        }
    }
}

/// One leaf entry: key bytes and the value (or a reference to it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafMember {
    pub key: Vec<u8>,
    pub value: MemberValue,
}

/// A named, immutable-once-published version of the key-value mapping.
///
/// Cloning a root is O(1): only the top `Arc` is cloned.
#[derive(Debug, Clone, Default)]
pub struct BTreeRoot {
    node: Option<Arc<Node>>,
    /// Incremented once per commit (and per compactor remap).
    transaction_id: u64,
    /// Transaction log that was current when this version was created.
    tr_log_file_id: u32,
    /// Position in `tr_log_file_id` just past the last commit applied here.
    tr_log_offset: u64,
}

impl BTreeRoot {
    /// Creates an empty tree at transaction 0.
    #[must_use]
    pub fn new(tr_log_file_id: u32, tr_log_offset: u64) -> Self {
        Self {
            node: None,
            transaction_id: 0,
            tr_log_file_id,
            tr_log_offset,
        }
    }

    /// Bulk-builds a tree from members in strictly ascending key order.
    ///
    /// Used when loading a key-index checkpoint. The caller is responsible for
    /// the ordering; it is only checked in debug builds.
    #[must_use]
    pub fn from_sorted(
        members: Vec<LeafMember>,
        transaction_id: u64,
        tr_log_file_id: u32,
        tr_log_offset: u64,
    ) -> Self {
        debug_assert!(members.windows(2).all(|w| w[0].key < w[1].key));
        Self {
            node: node::build(members),
            transaction_id,
            tr_log_file_id,
            tr_log_offset,
        }
    }

    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Overrides the transaction id. Recovery uses this to adopt the ids
    /// recorded in the transaction log.
    pub fn set_transaction_id(&mut self, transaction_id: u64) {
        self.transaction_id = transaction_id;
    }

    #[must_use]
    pub fn tr_log_file_id(&self) -> u32 {
        self.tr_log_file_id
    }

    #[must_use]
    pub fn tr_log_offset(&self) -> u64 {
        self.tr_log_offset
    }

    pub fn set_tr_log_position(&mut self, file_id: u32, offset: u64) {
        self.tr_log_file_id = file_id;
        self.tr_log_offset = offset;
    }

    /// Returns a working copy for a write transaction: all structure shared,
    /// transaction id advanced by one.
    #[must_use]
    pub fn new_transaction_root(&self) -> BTreeRoot {
        BTreeRoot {
            node: self.node.clone(),
            transaction_id: self.transaction_id + 1,
            tr_log_file_id: self.tr_log_file_id,
            tr_log_offset: self.tr_log_offset,
        }
    }

    /// Number of keys in this version.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.node.as_ref().map_or(0, |n| n.count())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Ok(ordinal)` of `key`, or `Err(ordinal)` of where it would be inserted.
    pub fn search(&self, key: &[u8]) -> Result<u64, u64> {
        match &self.node {
            Some(node) => node::search(node, key),
            None => Err(0),
        }
    }

    /// Member at ordinal `index`.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<&LeafMember> {
        self.node.as_deref().and_then(|n| node::get(n, index))
    }

    /// Member with exactly `key`.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&LeafMember> {
        self.search(key).ok().and_then(|i| self.get(i))
    }

    /// Inserts `key` or replaces its value. Returns `(created, ordinal)`.
    pub fn create_or_update(&mut self, key: Vec<u8>, value: MemberValue) -> (bool, u64) {
        let member = LeafMember { key, value };
        let root = self
            .node
            .get_or_insert_with(|| Arc::new(Node::Leaf(node::Leaf::default())));
        let (upserted, split) = node::upsert(root, member);
        if let Some(right) = split {
            if let Some(left) = self.node.take() {
                self.node = Some(Arc::new(Node::Interior(node::Interior::from_children(
                    vec![left, right],
                ))));
            }
        }
        (upserted.created, upserted.index)
    }

    /// Replaces the value of the member at `index`. Returns `false` when the
    /// index is out of range.
    pub fn set_value(&mut self, index: u64, value: MemberValue) -> bool {
        if index >= self.len() {
            return false;
        }
        match self.node.as_mut() {
            Some(root) => node::set_value(root, index, value),
            None => false,
        }
    }

    /// Removes the keys with ordinals `first_key_index..=last_key_index`.
    ///
    /// The range is clamped to the tree; an empty range is a no-op. Only the
    /// paths covering the range are rebuilt.
    pub fn erase_range(&mut self, first_key_index: u64, last_key_index: u64) {
        let len = self.len();
        if len == 0 || first_key_index > last_key_index || first_key_index >= len {
            return;
        }
        let last = last_key_index.min(len - 1);
        if first_key_index == 0 && last == len - 1 {
            self.node = None;
            return;
        }
        if let Some(root) = self.node.as_mut() {
            node::erase(root, first_key_index, last);
        }
        self.collapse();
    }

    fn collapse(&mut self) {
        loop {
            let next = match self.node.as_deref() {
                Some(Node::Interior(interior)) if interior.children.len() == 1 => {
                    Some(Some(interior.children[0].clone()))
                }
                Some(Node::Interior(interior)) if interior.children.is_empty() => Some(None),
                Some(Node::Leaf(leaf)) if leaf.members.is_empty() => Some(None),
                _ => None,
            };
            match next {
                Some(node) => self.node = node,
                None => break,
            }
        }
    }

    /// Lazy traversal of all members in key order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self.node.as_deref(), 0)
    }

    /// Lazy traversal starting at ordinal `index`.
    #[must_use]
    pub fn iter_from(&self, index: u64) -> Iter<'_> {
        Iter::new(self.node.as_deref(), index)
    }

    /// Calls `visitor` for every member in key order, stopping at the first
    /// error.
    pub fn iterate<E, F>(&self, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(&LeafMember) -> Result<(), E>,
    {
        self.iter().try_for_each(|member| visitor(member))
    }

    /// Walks every member and moves the ones `remap` asks for.
    ///
    /// `remap` returns `Some((file_id, offset))` to point a stored value at a
    /// new location (its size is kept) or `None` to leave it alone. Leaves
    /// without a replacement, and every subtree above them, remain physically
    /// shared with the versions this root was derived from. An error from
    /// `remap` aborts the walk and leaves `self` unchanged.
    ///
    /// Returns the number of members that were remapped.
    pub fn remapping_iterate<E, F>(&mut self, mut remap: F) -> Result<usize, E>
    where
        F: FnMut(&LeafMember) -> Result<Option<(u32, u32)>, E>,
    {
        let Some(root) = &self.node else {
            return Ok(0);
        };
        let mut remapped = 0;
        if let Some(new_root) = node::remap_node(root, &mut remap, &mut remapped)? {
            self.node = Some(new_root);
        }
        Ok(remapped)
    }

    /// Returns `true` when both versions have the very same root node.
    #[must_use]
    pub fn shares_root_with(&self, other: &BTreeRoot) -> bool {
        match (&self.node, &other.node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}
