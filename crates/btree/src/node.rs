//! Node layout and the recursive copy-on-write primitives behind [`BTreeRoot`].
//!
//! Every mutating helper takes `&mut Arc<Node>` and goes through
//! [`Arc::make_mut`]: a node that is still referenced by another tree version is
//! cloned before it is touched, a node owned only by the tree being built is
//! modified in place. Cloning a node is shallow, children stay shared.
//!
//! [`BTreeRoot`]: crate::BTreeRoot

use std::sync::Arc;

use crate::{LeafMember, MemberValue, ValueRef};

/// Maximum number of members stored in one leaf.
pub(crate) const LEAF_CAPACITY: usize = 32;
/// Maximum number of children of one interior node.
pub(crate) const INTERIOR_CAPACITY: usize = 32;
/// Fill factor used when bulk-building a tree from sorted members.
pub(crate) const BULK_FILL: usize = 24;

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(Leaf),
    Interior(Interior),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Leaf {
    pub(crate) members: Vec<LeafMember>,
}

/// `keys[i]` is the first key below `children[i]`, `counts[i]` the number of
/// leaf members below it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interior {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) children: Vec<Arc<Node>>,
    pub(crate) counts: Vec<u64>,
}

/// Outcome of [`upsert`] relative to the node it was called on.
pub(crate) struct Upserted {
    pub(crate) created: bool,
    pub(crate) index: u64,
}

impl Node {
    pub(crate) fn count(&self) -> u64 {
        match self {
            Node::Leaf(leaf) => leaf.members.len() as u64,
            Node::Interior(interior) => interior.counts.iter().sum(),
        }
    }

    pub(crate) fn first_key(&self) -> &[u8] {
        match self {
            Node::Leaf(leaf) => leaf.members.first().map_or(&[], |m| m.key.as_slice()),
            Node::Interior(interior) => interior.keys.first().map_or(&[], Vec::as_slice),
        }
    }

    fn width(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.members.len(),
            Node::Interior(interior) => interior.children.len(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Node::Leaf(_) => LEAF_CAPACITY,
            Node::Interior(_) => INTERIOR_CAPACITY,
        }
    }

    /// Concatenates two siblings of the same depth.
    fn merged(&self, right: &Node) -> Option<Node> {
        match (self, right) {
            (Node::Leaf(a), Node::Leaf(b)) => {
                let mut members = Vec::with_capacity(a.members.len() + b.members.len());
                members.extend_from_slice(&a.members);
                members.extend_from_slice(&b.members);
                Some(Node::Leaf(Leaf { members }))
            }
            (Node::Interior(a), Node::Interior(b)) => {
                let mut merged = a.clone();
                merged.keys.extend_from_slice(&b.keys);
                merged.children.extend_from_slice(&b.children);
                merged.counts.extend_from_slice(&b.counts);
                Some(Node::Interior(merged))
            }
            _ => None,
        }
    }
}

impl Interior {
    pub(crate) fn from_children(children: Vec<Arc<Node>>) -> Self {
        Self {
            keys: children.iter().map(|c| c.first_key().to_vec()).collect(),
            counts: children.iter().map(|c| c.count()).collect(),
            children,
        }
    }

    /// Index of the child whose key range contains `key`.
    fn child_for(&self, key: &[u8]) -> usize {
        self.keys
            .partition_point(|k| k.as_slice() <= key)
            .saturating_sub(1)
    }

    /// Maps an ordinal below this node to `(child, ordinal within child)`.
    pub(crate) fn locate(&self, mut index: u64) -> Option<(usize, u64)> {
        for (child, &count) in self.counts.iter().enumerate() {
            if index < count {
                return Some((child, index));
            }
            index -= count;
        }
        None
    }

    fn refresh(&mut self, idx: usize) {
        self.keys[idx] = self.children[idx].first_key().to_vec();
        self.counts[idx] = self.children[idx].count();
    }

    fn insert_child(&mut self, idx: usize, child: Arc<Node>) {
        self.keys.insert(idx, child.first_key().to_vec());
        self.counts.insert(idx, child.count());
        self.children.insert(idx, child);
    }

    fn remove_child(&mut self, idx: usize) {
        self.keys.remove(idx);
        self.counts.remove(idx);
        self.children.remove(idx);
    }

    fn split_off_half(&mut self) -> Interior {
        let mid = self.children.len() / 2;
        Interior {
            keys: self.keys.split_off(mid),
            children: self.children.split_off(mid),
            counts: self.counts.split_off(mid),
        }
    }

    fn merge_underfull(&mut self) {
        let mut idx = 0;
        while idx + 1 < self.children.len() {
            let (left, right) = (&self.children[idx], &self.children[idx + 1]);
            let capacity = left.capacity();
            let underfull = left.width() < capacity / 2 || right.width() < capacity / 2;
            let merged = if underfull && left.width() + right.width() <= capacity {
                left.merged(right)
            } else {
                None
            };
            match merged {
                Some(node) => {
                    self.children[idx] = Arc::new(node);
                    self.remove_child(idx + 1);
                    self.refresh(idx);
                }
                None => idx += 1,
            }
        }
    }
}

/// Ordinal of `key` (`Ok`) or of the position it would be inserted at (`Err`).
pub(crate) fn search(mut node: &Node, key: &[u8]) -> Result<u64, u64> {
    let mut base = 0u64;
    loop {
        match node {
            Node::Leaf(leaf) => {
                return match leaf.members.binary_search_by(|m| m.key.as_slice().cmp(key)) {
                    Ok(i) => Ok(base + i as u64),
                    Err(i) => Err(base + i as u64),
                };
            }
            Node::Interior(interior) => {
                let idx = interior.child_for(key);
                base += interior.counts[..idx].iter().sum::<u64>();
                node = &interior.children[idx];
            }
        }
    }
}

pub(crate) fn get(mut node: &Node, mut index: u64) -> Option<&LeafMember> {
    loop {
        match node {
            Node::Leaf(leaf) => return usize::try_from(index).ok().and_then(|i| leaf.members.get(i)),
            Node::Interior(interior) => {
                let (child, rest) = interior.locate(index)?;
                index = rest;
                node = &interior.children[child];
            }
        }
    }
}

/// Inserts or replaces `member`. Returns the split-off right sibling when the
/// node overflowed.
pub(crate) fn upsert(node: &mut Arc<Node>, member: LeafMember) -> (Upserted, Option<Arc<Node>>) {
    match Arc::make_mut(node) {
        Node::Leaf(leaf) => {
            let (created, at) =
                match leaf.members.binary_search_by(|m| m.key.as_slice().cmp(&member.key)) {
                    Ok(i) => {
                        leaf.members[i].value = member.value;
                        (false, i)
                    }
                    Err(i) => {
                        leaf.members.insert(i, member);
                        (true, i)
                    }
                };
            let split = (leaf.members.len() > LEAF_CAPACITY).then(|| {
                let right = leaf.members.split_off(leaf.members.len() / 2);
                Arc::new(Node::Leaf(Leaf { members: right }))
            });
            (
                Upserted {
                    created,
                    index: at as u64,
                },
                split,
            )
        }
        Node::Interior(interior) => {
            let idx = interior.child_for(&member.key);
            let before: u64 = interior.counts[..idx].iter().sum();
            let (upserted, split) = upsert(&mut interior.children[idx], member);
            interior.refresh(idx);
            if let Some(right) = split {
                interior.insert_child(idx + 1, right);
            }
            let split = (interior.children.len() > INTERIOR_CAPACITY)
                .then(|| Arc::new(Node::Interior(interior.split_off_half())));
            (
                Upserted {
                    created: upserted.created,
                    index: before + upserted.index,
                },
                split,
            )
        }
    }
}

/// Replaces the value of the member at `index`. The caller checks bounds.
pub(crate) fn set_value(node: &mut Arc<Node>, index: u64, value: MemberValue) -> bool {
    match Arc::make_mut(node) {
        Node::Leaf(leaf) => match usize::try_from(index).ok().and_then(|i| leaf.members.get_mut(i)) {
            Some(member) => {
                member.value = value;
                true
            }
            None => false,
        },
        Node::Interior(interior) => match interior.locate(index) {
            Some((child, rest)) => set_value(&mut interior.children[child], rest, value),
            None => false,
        },
    }
}

/// Removes members `first..=last`, both relative to `node` and within bounds.
pub(crate) fn erase(node: &mut Arc<Node>, first: u64, last: u64) {
    match Arc::make_mut(node) {
        Node::Leaf(leaf) => {
            leaf.members.drain(first as usize..=last as usize);
        }
        Node::Interior(interior) => {
            let mut offset = 0u64;
            let mut idx = 0;
            while idx < interior.children.len() {
                let count = interior.counts[idx];
                let start = offset;
                offset += count;
                if count == 0 {
                    interior.remove_child(idx);
                    continue;
                }
                let end = start + count - 1;
                if end < first || start > last {
                    idx += 1;
                    continue;
                }
                let lo = first.max(start) - start;
                let hi = last.min(end) - start;
                if lo == 0 && hi + 1 == count {
                    interior.remove_child(idx);
                    continue;
                }
                erase(&mut interior.children[idx], lo, hi);
                interior.refresh(idx);
                idx += 1;
            }
            interior.merge_underfull();
        }
    }
}

/// Rewrites the value references `remap` asks for. Returns the replacement
/// node, or `None` when nothing below `node` changed and it can stay shared.
pub(crate) fn remap_node<E, F>(
    node: &Arc<Node>,
    remap: &mut F,
    remapped: &mut usize,
) -> Result<Option<Arc<Node>>, E>
where
    F: FnMut(&LeafMember) -> Result<Option<(u32, u32)>, E>,
{
    match node.as_ref() {
        Node::Leaf(leaf) => {
            let mut replaced: Option<Vec<LeafMember>> = None;
            for (i, member) in leaf.members.iter().enumerate() {
                let Some((file_id, offset)) = remap(member)? else {
                    continue;
                };
                let MemberValue::Stored(old) = &member.value else {
                    continue;
                };
                let members = replaced.get_or_insert_with(|| leaf.members.clone());
                members[i].value = MemberValue::Stored(ValueRef {
                    file_id,
                    offset,
                    size: old.size,
                });
                *remapped += 1;
            }
            Ok(replaced.map(|members| Arc::new(Node::Leaf(Leaf { members }))))
        }
        Node::Interior(interior) => {
            let mut replaced: Option<Interior> = None;
            for (i, child) in interior.children.iter().enumerate() {
                if let Some(new_child) = remap_node(child, remap, remapped)? {
                    replaced.get_or_insert_with(|| interior.clone()).children[i] = new_child;
                }
            }
            Ok(replaced.map(|interior| Arc::new(Node::Interior(interior))))
        }
    }
}

/// Builds a balanced tree from members already in strictly ascending key order.
pub(crate) fn build(members: Vec<LeafMember>) -> Option<Arc<Node>> {
    let mut level: Vec<Arc<Node>> = Vec::new();
    let mut members = members.into_iter().peekable();
    while members.peek().is_some() {
        let chunk: Vec<LeafMember> = members.by_ref().take(BULK_FILL).collect();
        level.push(Arc::new(Node::Leaf(Leaf { members: chunk })));
    }
    while level.len() > 1 {
        level = level
            .chunks(BULK_FILL)
            .map(|chunk| Arc::new(Node::Interior(Interior::from_children(chunk.to_vec()))))
            .collect();
    }
    level.pop()
}

/// Checks ordering, counts and uniform leaf depth. Returns the tree height.
#[cfg(test)]
pub(crate) fn validate(node: &Node) -> usize {
    match node {
        Node::Leaf(leaf) => {
            assert!(leaf.members.len() <= LEAF_CAPACITY, "leaf overflow");
            for pair in leaf.members.windows(2) {
                assert!(pair[0].key < pair[1].key, "leaf keys out of order");
            }
            1
        }
        Node::Interior(interior) => {
            assert!(!interior.children.is_empty(), "empty interior node");
            assert!(interior.children.len() <= INTERIOR_CAPACITY, "interior overflow");
            let mut depth = None;
            for (i, child) in interior.children.iter().enumerate() {
                assert_eq!(interior.keys[i].as_slice(), child.first_key(), "stale separator");
                assert_eq!(interior.counts[i], child.count(), "stale count");
                let d = validate(child);
                assert_eq!(*depth.get_or_insert(d), d, "unbalanced tree");
            }
            for pair in interior.keys.windows(2) {
                assert!(pair[0] < pair[1], "separators out of order");
            }
            depth.unwrap_or(0) + 1
        }
    }
}
