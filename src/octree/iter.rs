use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use crate::geometry::{Aabb, Distance};
use crate::octree::{Child, InnerBlock, LeafBlock, NodeRef, OctreeCore};
use crate::predicate::Predicate;
use crate::{Code, Payload};

/// Borrowed child block of a node the traversal decided to descend.
enum BlockRef<'a, V> {
    Inner(&'a InnerBlock<V>),
    Leaf(&'a LeafBlock<V>),
}

/// One expandable node: its own code and volume, plus the block of its
/// eight children.
struct Entry<'a, V> {
    block: BlockRef<'a, V>,
    code: Code,
    aabb: Aabb,
}

impl<'a, V> Entry<'a, V> {
    fn of_node(node: &NodeRef<'a, V>, children: &'a Option<Child<V>>) -> Self {
        let block = match children.as_ref().expect("non-leaf slot without children") {
            Child::Inner(inner) => BlockRef::Inner(inner),
            Child::Leaf(leaf) => BlockRef::Leaf(leaf),
        };
        Entry {
            block,
            code: node.code,
            aabb: node.aabb,
        }
    }

    fn child_node(&self, slot: usize) -> NodeRef<'a, V> {
        let code = self.code.child(slot).expect("expandable node at depth 0");
        let aabb = self.aabb.octant(slot);
        match self.block {
            BlockRef::Inner(inner) => NodeRef {
                value: &inner.values[slot],
                code,
                aabb,
                is_leaf: inner.is_leaf(slot),
                modified: inner.is_modified(slot),
            },
            BlockRef::Leaf(leaf) => NodeRef {
                value: &leaf.values[slot],
                code,
                aabb,
                is_leaf: true,
                modified: leaf.is_modified(slot),
            },
        }
    }

    /// The expandable entry for child `slot`, which must be a non-leaf.
    fn child_entry(&self, slot: usize, node: &NodeRef<'a, V>) -> Entry<'a, V> {
        match self.block {
            BlockRef::Inner(inner) => Entry::of_node(node, &inner.children[slot]),
            BlockRef::Leaf(_) => unreachable!("leaf-block slots have no children"),
        }
    }
}

/// Gate for descending into a node: leaves and depth-0 nodes have no
/// descendants, whatever the predicate claims.
fn expandable<V, Pred: Predicate<V>>(pred: &Pred, node: &NodeRef<'_, V>) -> bool {
    !node.is_leaf && node.depth() > 0 && pred.inner_check(node)
}

/// Lazy pre-order depth-first traversal of the nodes satisfying a
/// predicate. Subtrees failing the predicate's inner check are pruned
/// wholesale. Holds a borrow of the map for its lifetime.
pub struct Query<'a, P: Payload, Pred> {
    tree: &'a OctreeCore<P>,
    pred: Pred,
    early_stopping: bool,
    started: bool,
    stack: Vec<Entry<'a, P::Value>>,
    pending: VecDeque<NodeRef<'a, P::Value>>,
}

impl<'a, P: Payload, Pred: Predicate<P::Value>> Query<'a, P, Pred> {
    pub(crate) fn new(tree: &'a OctreeCore<P>, pred: Pred, early_stopping: bool) -> Self {
        Self {
            tree,
            pred,
            early_stopping,
            started: false,
            stack: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn start(&mut self) {
        self.started = true;
        let root = self.tree.root();
        let returned = self.pred.value_check(&root);
        if returned {
            self.pending.push_back(root);
        }
        if (!returned || !self.early_stopping) && expandable(&self.pred, &root) {
            self.stack
                .push(Entry::of_node(&root, &self.tree.root_block().children[0]));
        }
    }
}

impl<'a, P: Payload, Pred: Predicate<P::Value>> Iterator for Query<'a, P, Pred> {
    type Item = NodeRef<'a, P::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.start();
        }
        loop {
            if let Some(node) = self.pending.pop_front() {
                return Some(node);
            }
            let entry = self.stack.pop()?;
            for slot in 0..8 {
                let child = entry.child_node(slot);
                let returned = self.pred.value_check(&child);
                if returned {
                    self.pending.push_back(child);
                }
                if (!returned || !self.early_stopping) && expandable(&self.pred, &child) {
                    self.stack.push(entry.child_entry(slot, &child));
                }
            }
        }
    }
}

/// Heap key: squared distance first, Morton code as the deterministic
/// tie-break. Distances are finite, so the order is total.
#[derive(Clone, Copy, PartialEq)]
struct DistKey {
    dist: f64,
    code: Code,
}

impl Eq for DistKey {}

impl PartialOrd for DistKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .expect("NaN distance")
            .then_with(|| self.code.cmp(&other.code))
    }
}

/// `BinaryHeap` is a max-heap; reverse the key to pop the closest.
struct ByDistance<T> {
    key: DistKey,
    item: T,
}

impl<T> PartialEq for ByDistance<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for ByDistance<T> {}

impl<T> PartialOrd for ByDistance<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ByDistance<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

/// A node yielded by the best-first traversal, paired with its squared
/// distance to the query geometry.
#[derive(Clone, Copy, Debug)]
pub struct NearestNode<'a, V> {
    pub node: NodeRef<'a, V>,
    pub squared_distance: f64,
}

/// Best-first traversal: nodes come out ordered by the distance between
/// their bounding volume and the query geometry. `epsilon` is added to
/// every inner-node key, allowing approximate ordering that expands
/// fewer subtrees.
pub struct QueryNearest<'a, P: Payload, G, Pred> {
    tree: &'a OctreeCore<P>,
    geometry: G,
    pred: Pred,
    epsilon: f64,
    started: bool,
    inner: BinaryHeap<ByDistance<Entry<'a, P::Value>>>,
    ready: BinaryHeap<ByDistance<NodeRef<'a, P::Value>>>,
}

impl<'a, P, G, Pred> QueryNearest<'a, P, G, Pred>
where
    P: Payload,
    G: Distance,
    Pred: Predicate<P::Value>,
{
    pub(crate) fn new(tree: &'a OctreeCore<P>, geometry: G, pred: Pred, epsilon: f64) -> Self {
        Self {
            tree,
            geometry,
            pred,
            epsilon,
            started: false,
            inner: BinaryHeap::new(),
            ready: BinaryHeap::new(),
        }
    }

    fn push_node(&mut self, node: NodeRef<'a, P::Value>) {
        let dist = self.geometry.squared_distance(&node.aabb);
        self.ready.push(ByDistance {
            key: DistKey {
                dist,
                code: node.code,
            },
            item: node,
        });
    }

    fn push_entry(&mut self, entry: Entry<'a, P::Value>) {
        let dist = self.geometry.squared_distance(&entry.aabb) + self.epsilon;
        self.inner.push(ByDistance {
            key: DistKey {
                dist,
                code: entry.code,
            },
            item: entry,
        });
    }

    fn start(&mut self) {
        self.started = true;
        let root = self.tree.root();
        if self.pred.value_check(&root) {
            self.push_node(root);
        }
        if expandable(&self.pred, &root) {
            let entry = Entry::of_node(&root, &self.tree.root_block().children[0]);
            self.push_entry(entry);
        }
    }
}

impl<'a, P, G, Pred> Iterator for QueryNearest<'a, P, G, Pred>
where
    P: Payload,
    G: Distance,
    Pred: Predicate<P::Value>,
{
    type Item = NearestNode<'a, P::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.start();
        }

        // Expand inner nodes until none of them could beat the best
        // ready node.
        while let Some(top) = self.inner.peek() {
            if let Some(best) = self.ready.peek() {
                if best.key <= top.key {
                    break;
                }
            }
            let entry = self.inner.pop().unwrap().item;
            for slot in 0..8 {
                let child = entry.child_node(slot);
                if self.pred.value_check(&child) {
                    self.push_node(child);
                }
                if expandable(&self.pred, &child) {
                    let child_entry = entry.child_entry(slot, &child);
                    self.push_entry(child_entry);
                }
            }
        }

        self.ready.pop().map(|best| NearestNode {
            node: best.item,
            squared_distance: best.key.dist,
        })
    }
}
