use crate::node::{Interior, Node};
use crate::LeafMember;

/// Lazy in-key-order iterator over the leaf members of one tree version.
///
/// Holds only shared borrows into immutable nodes, so any number of iterators
/// can walk the same or different versions concurrently.
pub struct Iter<'a> {
    /// Interior nodes on the path to the current leaf, with the index of the
    /// next child to visit.
    stack: Vec<(&'a Interior, usize)>,
    leaf: &'a [LeafMember],
    pos: usize,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(root: Option<&'a Node>, start: u64) -> Self {
        let mut iter = Iter {
            stack: Vec::new(),
            leaf: &[],
            pos: 0,
        };
        let Some(mut node) = root else {
            return iter;
        };
        let mut index = start;
        loop {
            match node {
                Node::Leaf(leaf) => {
                    iter.leaf = &leaf.members;
                    iter.pos = usize::try_from(index).unwrap_or(usize::MAX);
                    return iter;
                }
                Node::Interior(interior) => match interior.locate(index) {
                    Some((child, rest)) => {
                        iter.stack.push((interior, child + 1));
                        node = &interior.children[child];
                        index = rest;
                    }
                    None => {
                        iter.stack.clear();
                        return iter;
                    }
                },
            }
        }
    }

    fn descend_leftmost(&mut self, mut node: &'a Node) {
        loop {
            match node {
                Node::Leaf(leaf) => {
                    self.leaf = &leaf.members;
                    self.pos = 0;
                    return;
                }
                Node::Interior(interior) => {
                    let Some(first) = interior.children.first() else {
                        return;
                    };
                    self.stack.push((interior, 1));
                    node = first;
                }
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a LeafMember;

    fn next(&mut self) -> Option<&'a LeafMember> {
        loop {
            if let Some(member) = self.leaf.get(self.pos) {
                self.pos += 1;
                return Some(member);
            }
            let (interior, next) = self.stack.pop()?;
            if let Some(child) = interior.children.get(next) {
                self.stack.push((interior, next + 1));
                self.leaf = &[];
                self.descend_leftmost(child);
            }
        }
    }
}
