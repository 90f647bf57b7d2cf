use std::array;
use std::sync::atomic::AtomicBool;

use bitvec::prelude::*;

/// A block of eight sibling nodes at depth 0. Pure payload plus the
/// per-slot modified bits.
#[derive(Debug)]
pub(crate) struct LeafBlock<V> {
    pub values: [V; 8],
    pub modified: u8,
}

impl<V: Default> LeafBlock<V> {
    pub fn new() -> Self {
        Self {
            values: array::from_fn(|_| V::default()),
            modified: 0,
        }
    }
}

impl<V> LeafBlock<V> {
    #[inline]
    pub fn is_modified(&self, slot: usize) -> bool {
        self.modified.view_bits::<Lsb0>()[slot]
    }

    #[inline]
    pub fn set_modified(&mut self, slot: usize, value: bool) {
        self.modified.view_bits_mut::<Lsb0>().set(slot, value);
    }

    /// Reset for reuse out of the pool.
    pub fn recycle(&mut self) {
        self.modified = 0;
    }
}

/// Owning pointer to the children of one inner slot. Blocks below
/// depth 1 hold further inner blocks; depth-1 slots point at leaf
/// blocks.
#[derive(Debug)]
pub(crate) enum Child<V> {
    Inner(Box<InnerBlock<V>>),
    Leaf(Box<LeafBlock<V>>),
}

/// A block of eight sibling inner nodes.
///
/// Each slot carries its payload, an optional owning pointer to its
/// child block, and one bit each in the `leaf` and `modified`
/// bitfields. Invariants: the leaf bit for slot `i` is set iff
/// `children[i]` is `None`, and a cleared modified bit means no
/// descendant of the slot carries pending writes.
#[derive(Debug)]
pub(crate) struct InnerBlock<V> {
    pub values: [V; 8],
    pub children: [Option<Child<V>>; 8],
    pub leaf: u8,
    pub modified: u8,
    /// Per-slot creation locks, used only in `LockMode::Node`.
    pub locks: [AtomicBool; 8],
}

impl<V: Default> InnerBlock<V> {
    pub fn new() -> Self {
        Self {
            values: array::from_fn(|_| V::default()),
            children: array::from_fn(|_| None),
            leaf: 0xFF,
            modified: 0,
            locks: array::from_fn(|_| AtomicBool::new(false)),
        }
    }
}

impl<V> InnerBlock<V> {
    #[inline]
    pub fn is_leaf(&self, slot: usize) -> bool {
        self.leaf.view_bits::<Lsb0>()[slot]
    }

    #[inline]
    pub fn set_leaf(&mut self, slot: usize, value: bool) {
        self.leaf.view_bits_mut::<Lsb0>().set(slot, value);
    }

    #[inline]
    pub fn is_modified(&self, slot: usize) -> bool {
        self.modified.view_bits::<Lsb0>()[slot]
    }

    #[inline]
    pub fn set_modified(&mut self, slot: usize, value: bool) {
        self.modified.view_bits_mut::<Lsb0>().set(slot, value);
    }

    /// Every slot of this block is a leaf.
    #[inline]
    pub fn all_leaves(&self) -> bool {
        self.leaf == 0xFF
    }

    /// Reset for reuse out of the pool. Children must already have been
    /// detached.
    pub fn recycle(&mut self) {
        debug_assert!(self.children.iter().all(Option::is_none));
        self.leaf = 0xFF;
        self.modified = 0;
    }

    /// The inner block below slot `idx`. The slot must be a non-leaf at
    /// depth 2 or above.
    pub fn inner_child_mut(&mut self, idx: usize) -> &mut InnerBlock<V> {
        match self.children[idx].as_mut() {
            Some(Child::Inner(block)) => block,
            _ => unreachable!("slot does not hold an inner child block"),
        }
    }

    /// The leaf block below slot `idx`. The slot must be a non-leaf at
    /// depth 1.
    pub fn leaf_child_mut(&mut self, idx: usize) -> &mut LeafBlock<V> {
        match self.children[idx].as_mut() {
            Some(Child::Leaf(block)) => block,
            _ => unreachable!("slot does not hold a leaf child block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfields() {
        let mut block: InnerBlock<f32> = InnerBlock::new();
        assert!(block.all_leaves());
        assert_eq!(block.modified, 0);

        block.set_leaf(3, false);
        assert!(!block.is_leaf(3));
        assert!(!block.all_leaves());
        assert_eq!(block.leaf, 0xFF & !(1 << 3));

        block.set_modified(3, true);
        block.set_modified(7, true);
        assert!(block.is_modified(3));
        assert_eq!(block.modified, (1 << 3) | (1 << 7));

        block.set_leaf(3, true);
        block.modified = 0;
        block.recycle();
        assert!(block.all_leaves());
    }
}
