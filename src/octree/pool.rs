use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::octree::node::{InnerBlock, LeafBlock};
use crate::Error;

/// Allocates and recycles the 8-slot sibling blocks.
///
/// Two free stacks, one per block flavour, each behind its own
/// word-sized lock so the release path stays thread-safe independently
/// of the tree locks. With `reuse` off, released blocks are dropped
/// instead of pooled.
///
/// The six counters track (inner, inner-leaf, leaf) nodes, used and
/// allocated. They are informational; nothing in the tree depends on
/// their exact values.
#[derive(Debug)]
pub(crate) struct BlockPool<V> {
    inner_free: Mutex<Vec<Box<InnerBlock<V>>>>,
    leaf_free: Mutex<Vec<Box<LeafBlock<V>>>>,
    reuse: bool,
    count: bool,

    num_inner: AtomicUsize,
    num_inner_leaf: AtomicUsize,
    num_leaf: AtomicUsize,
    num_alloc_inner: AtomicUsize,
    num_alloc_inner_leaf: AtomicUsize,
    num_alloc_leaf: AtomicUsize,
}

impl<V: Default> BlockPool<V> {
    pub fn new(reuse: bool, count: bool) -> Self {
        Self {
            inner_free: Mutex::new(Vec::new()),
            leaf_free: Mutex::new(Vec::new()),
            reuse,
            count,
            num_inner: AtomicUsize::new(0),
            // The root node is an inner node without children.
            num_inner_leaf: AtomicUsize::new(1),
            num_leaf: AtomicUsize::new(0),
            num_alloc_inner: AtomicUsize::new(0),
            num_alloc_inner_leaf: AtomicUsize::new(1),
            num_alloc_leaf: AtomicUsize::new(0),
        }
    }

    /// Pre-grow both free stacks. The only place allocation failure is
    /// reported instead of aborting.
    pub fn reserve(&self, inner_blocks: usize, leaf_blocks: usize) -> Result<(), Error> {
        let mut inner = self.inner_free.lock();
        inner
            .try_reserve(inner_blocks)
            .map_err(|_| Error::Allocation)?;
        for _ in 0..inner_blocks {
            inner.push(Box::new(InnerBlock::new()));
        }
        drop(inner);
        if self.count {
            self.num_alloc_inner_leaf
                .fetch_add(8 * inner_blocks, Ordering::Relaxed);
        }

        let mut leaf = self.leaf_free.lock();
        leaf.try_reserve(leaf_blocks).map_err(|_| Error::Allocation)?;
        for _ in 0..leaf_blocks {
            leaf.push(Box::new(LeafBlock::new()));
        }
        drop(leaf);
        if self.count {
            self.num_alloc_leaf
                .fetch_add(8 * leaf_blocks, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn alloc_inner(&self) -> Box<InnerBlock<V>> {
        match self.inner_free.lock().pop() {
            Some(block) => block,
            None => {
                if self.count {
                    // Eight fresh inner nodes, all childless.
                    self.num_alloc_inner_leaf.fetch_add(8, Ordering::Relaxed);
                }
                Box::new(InnerBlock::new())
            }
        }
    }

    pub fn alloc_leaf(&self) -> Box<LeafBlock<V>> {
        match self.leaf_free.lock().pop() {
            Some(block) => block,
            None => {
                if self.count {
                    self.num_alloc_leaf.fetch_add(8, Ordering::Relaxed);
                }
                Box::new(LeafBlock::new())
            }
        }
    }

    pub fn release_inner(&self, mut block: Box<InnerBlock<V>>) {
        if self.reuse {
            block.recycle();
            self.inner_free.lock().push(block);
        } else {
            if self.count {
                self.num_alloc_inner_leaf.fetch_sub(8, Ordering::Relaxed);
            }
            drop(block);
        }
    }

    pub fn release_leaf(&self, mut block: Box<LeafBlock<V>>) {
        if self.reuse {
            block.recycle();
            self.leaf_free.lock().push(block);
        } else {
            if self.count {
                self.num_alloc_leaf.fetch_sub(8, Ordering::Relaxed);
            }
            drop(block);
        }
    }

    /// Drop everything the pools still hold.
    pub fn drain(&self) {
        let inner = std::mem::take(&mut *self.inner_free.lock());
        if self.count {
            self.num_alloc_inner_leaf
                .fetch_sub(8 * inner.len(), Ordering::Relaxed);
        }
        drop(inner);

        let leaf = std::mem::take(&mut *self.leaf_free.lock());
        if self.count {
            self.num_alloc_leaf
                .fetch_sub(8 * leaf.len(), Ordering::Relaxed);
        }
        drop(leaf);
    }

    /// An inner slot gained eight inner children.
    pub fn note_split_inner(&self) {
        if self.count {
            // Eight new childless inner nodes; the parent stops being one.
            self.num_inner_leaf.fetch_add(7, Ordering::Relaxed);
            self.num_inner.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// An inner slot gained eight leaf children.
    pub fn note_split_leaf(&self) {
        if self.count {
            self.num_leaf.fetch_add(8, Ordering::Relaxed);
            self.num_inner_leaf.fetch_sub(1, Ordering::Relaxed);
            self.num_inner.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Inverse of [`note_split_inner`].
    pub fn note_merge_inner(&self) {
        if self.count {
            self.num_inner_leaf.fetch_sub(7, Ordering::Relaxed);
            self.num_inner.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Inverse of [`note_split_leaf`].
    pub fn note_merge_leaf(&self) {
        if self.count {
            self.num_leaf.fetch_sub(8, Ordering::Relaxed);
            self.num_inner_leaf.fetch_add(1, Ordering::Relaxed);
            self.num_inner.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn reset_counts(&self) {
        self.num_inner.store(0, Ordering::Relaxed);
        self.num_inner_leaf.store(1, Ordering::Relaxed);
        self.num_leaf.store(0, Ordering::Relaxed);
    }

    pub fn num_inner(&self) -> usize {
        self.num_inner.load(Ordering::Relaxed)
    }

    pub fn num_inner_leaf(&self) -> usize {
        self.num_inner_leaf.load(Ordering::Relaxed)
    }

    pub fn num_leaf(&self) -> usize {
        self.num_leaf.load(Ordering::Relaxed)
    }

    pub fn num_alloc_inner(&self) -> usize {
        self.num_alloc_inner.load(Ordering::Relaxed)
            + self.num_alloc_inner_leaf.load(Ordering::Relaxed)
    }

    pub fn num_alloc_leaf(&self) -> usize {
        self.num_alloc_leaf.load(Ordering::Relaxed)
    }
}
