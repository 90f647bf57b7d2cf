mod node;
pub(crate) use node::{Child, InnerBlock, LeafBlock};

mod pool;
use pool::BlockPool;

mod iter;
pub use iter::{NearestNode, Query, QueryNearest};

mod io;
pub use io::Codec;

use std::sync::atomic::{AtomicBool, Ordering};

use glam::DVec3;

use crate::geometry::{Aabb, Distance};
use crate::predicate::Predicate;
use crate::{Code, Error, Key, Payload};

/// Fewest depth levels a map can have.
pub const MIN_DEPTH_LEVELS: u8 = 3;
/// Most depth levels a map can have.
pub const MAX_DEPTH_LEVELS: u8 = 22;

/// How structural mutation is guarded, fixed for the map's lifetime.
///
/// `None` is the zero-overhead single-writer default. `Depth` takes one
/// test-and-set flag per depth level before a block at that depth is
/// split or pruned; `Node` takes a flag per inner-block slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    None,
    Depth,
    Node,
}

/// Construction-time configuration of the spatial index.
#[derive(Clone, Copy, Debug)]
pub struct OctreeOptions {
    /// Edge length of a depth-0 voxel. Must be positive.
    pub leaf_size: f64,
    /// Number of depth levels, within `[MIN_DEPTH_LEVELS, MAX_DEPTH_LEVELS]`.
    pub depth_levels: u8,
    /// Collapse homogeneous blocks during propagation. When off, only an
    /// explicit [`OctreeCore::prune`] collapses them.
    pub automatic_prune: bool,
    pub lock_mode: LockMode,
    /// Return pruned blocks to the pool instead of freeing them.
    pub reuse_nodes: bool,
    /// Reserved: node handles are borrows and always valid for their
    /// lifetime, so nothing consumes this yet.
    pub track_nodes: bool,
    /// Maintain the informational node counters.
    pub count_nodes: bool,
}

impl Default for OctreeOptions {
    fn default() -> Self {
        Self {
            leaf_size: 0.1,
            depth_levels: 16,
            automatic_prune: true,
            lock_mode: LockMode::None,
            reuse_nodes: false,
            track_nodes: false,
            count_nodes: true,
        }
    }
}

/// A borrowed view of one node: its payload, code, cached bounding
/// volume, and the leaf/modified indicator bits. Valid until the next
/// structural mutation of the map.
#[derive(Debug)]
pub struct NodeRef<'a, V> {
    pub(crate) value: &'a V,
    pub(crate) code: Code,
    pub(crate) aabb: Aabb,
    pub(crate) is_leaf: bool,
    pub(crate) modified: bool,
}

impl<'a, V> Clone for NodeRef<'a, V> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, V> Copy for NodeRef<'a, V> {}

impl<'a, V> NodeRef<'a, V> {
    #[inline]
    pub fn value(&self) -> &'a V {
        self.value
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.code.depth()
    }

    /// The node's bounding volume, cached by the traversal.
    #[inline]
    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    /// No children are materialised below this node.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

/// The sparse octree: Morton-addressed blocks of eight siblings with
/// lazy modified/propagate bookkeeping, parameterised over the payload
/// model that owns the per-node data.
pub struct OctreeCore<P: Payload> {
    payload: P,
    root: InnerBlock<P::Value>,
    pool: BlockPool<P::Value>,

    leaf_size: f64,
    depth_levels: u8,
    /// Half-width of the map in key units, `2^(depth_levels - 2)`.
    max_value: u32,
    /// Node edge length per depth.
    node_sizes: Vec<f64>,
    /// Reciprocals of `node_sizes`.
    node_size_inv: Vec<f64>,

    automatic_prune: bool,
    lock_mode: LockMode,
    depth_locks: Vec<AtomicBool>,
    track_nodes: bool,
}

/// The slice of map state the recursive walkers need, split off so the
/// blocks can be borrowed mutably alongside it.
struct Ctx<'a, P: Payload> {
    payload: &'a P,
    pool: &'a BlockPool<P::Value>,
    lock_mode: LockMode,
    depth_locks: &'a [AtomicBool],
    automatic_prune: bool,
}

macro_rules! ctx {
    ($map:expr) => {
        Ctx {
            payload: &$map.payload,
            pool: &$map.pool,
            lock_mode: $map.lock_mode,
            depth_locks: &$map.depth_locks,
            automatic_prune: $map.automatic_prune,
        }
    };
}

impl<P: Payload> OctreeCore<P> {
    pub fn new(payload: P, options: OctreeOptions) -> Result<Self, Error> {
        if !(MIN_DEPTH_LEVELS..=MAX_DEPTH_LEVELS).contains(&options.depth_levels) {
            return Err(Error::InvalidDepth(options.depth_levels));
        }
        if !(options.leaf_size > 0.0) {
            return Err(Error::InvalidArgument("leaf_size must be positive"));
        }

        let (node_sizes, node_size_inv) =
            precompute_sizes(options.leaf_size, options.depth_levels);

        let mut root = InnerBlock::new();
        root.values[0] = payload.root_value();

        Ok(Self {
            root,
            pool: BlockPool::new(options.reuse_nodes, options.count_nodes),
            leaf_size: options.leaf_size,
            depth_levels: options.depth_levels,
            max_value: 1 << (options.depth_levels - 2),
            node_sizes,
            node_size_inv,
            automatic_prune: options.automatic_prune,
            lock_mode: options.lock_mode,
            depth_locks: (0..options.depth_levels)
                .map(|_| AtomicBool::new(false))
                .collect(),
            track_nodes: options.track_nodes,
            payload,
        })
    }

    /// Reset to a root-only tree, possibly with a new geometry. With
    /// `prune` the free pools are drained too; otherwise released
    /// blocks stay pooled for reuse.
    pub fn clear(&mut self, leaf_size: f64, depth_levels: u8, prune: bool) -> Result<(), Error> {
        if !(MIN_DEPTH_LEVELS..=MAX_DEPTH_LEVELS).contains(&depth_levels) {
            return Err(Error::InvalidDepth(depth_levels));
        }
        if !(leaf_size > 0.0) {
            return Err(Error::InvalidArgument("leaf_size must be positive"));
        }

        let root_depth = self.root_depth();
        delete_children_of(&self.pool, &mut self.root, 0, root_depth);
        if prune {
            self.pool.drain();
        }
        self.pool.reset_counts();

        self.leaf_size = leaf_size;
        self.depth_levels = depth_levels;
        self.max_value = 1 << (depth_levels - 2);
        let (sizes, inv) = precompute_sizes(leaf_size, depth_levels);
        self.node_sizes = sizes;
        self.node_size_inv = inv;
        self.depth_locks = (0..depth_levels).map(|_| AtomicBool::new(false)).collect();

        self.root = InnerBlock::new();
        self.root.values[0] = self.payload.root_value();
        Ok(())
    }

    //
    // Geometry of the map
    //

    #[inline]
    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    #[inline]
    pub fn depth_levels(&self) -> u8 {
        self.depth_levels
    }

    /// Depth of the root node, `depth_levels - 1`.
    #[inline]
    pub fn root_depth(&self) -> u8 {
        self.depth_levels - 1
    }

    /// Edge length of a node at `depth`.
    #[inline]
    pub fn node_size(&self, depth: u8) -> f64 {
        self.node_sizes[depth as usize]
    }

    pub fn bounding_volume(&self) -> Aabb {
        Aabb::from_center_half_size(DVec3::ZERO, self.node_size(self.root_depth()) / 2.0)
    }

    pub fn is_inside(&self, coord: DVec3) -> bool {
        self.bounding_volume().contains_point(coord)
    }

    #[inline]
    pub fn automatic_prune(&self) -> bool {
        self.automatic_prune
    }

    pub fn set_automatic_prune(&mut self, enable: bool) {
        self.automatic_prune = enable;
    }

    #[inline]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    #[inline]
    pub fn track_nodes(&self) -> bool {
        self.track_nodes
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    //
    // Conversions
    //

    /// One coordinate component to its key component at `depth`.
    fn coord_to_key_component(&self, coord: f64, depth: u8) -> Result<u32, Error> {
        let raw = (self.node_size_inv[0] * coord).floor() as i64 + self.max_value as i64;
        let span = 1i64 << (self.depth_levels - 1);
        if !(0..span).contains(&raw) {
            return Err(Error::OutOfBounds);
        }
        Ok(((raw as u32) >> depth) << depth)
    }

    pub fn to_key(&self, coord: DVec3, depth: u8) -> Result<Key, Error> {
        if depth > self.root_depth() {
            return Err(Error::InvalidArgument("depth above the root"));
        }
        Ok(Key::new(
            self.coord_to_key_component(coord.x, depth)?,
            self.coord_to_key_component(coord.y, depth)?,
            self.coord_to_key_component(coord.z, depth)?,
            depth,
        ))
    }

    pub fn to_key_checked(&self, coord: DVec3, depth: u8) -> Option<Key> {
        self.to_key(coord, depth).ok()
    }

    pub fn to_code(&self, coord: DVec3, depth: u8) -> Result<Code, Error> {
        Ok(Code::from_key(self.to_key(coord, depth)?))
    }

    pub fn to_code_checked(&self, coord: DVec3, depth: u8) -> Option<Code> {
        self.to_code(coord, depth).ok()
    }

    /// Center coordinate of the node a key names. The root collapses to
    /// the origin.
    pub fn to_coord(&self, key: Key) -> DVec3 {
        let depth = key.depth();
        if depth == self.root_depth() {
            return DVec3::ZERO;
        }
        let size = self.node_size(depth);
        let scale = (1u64 << depth) as f64;
        let component = |c: u32| {
            (((c as i64 - self.max_value as i64) as f64 / scale).floor() + 0.5) * size
        };
        DVec3::new(
            component(key.component(0)),
            component(key.component(1)),
            component(key.component(2)),
        )
    }

    pub fn coord(&self, code: Code) -> DVec3 {
        self.to_coord(code.to_key())
    }

    /// The node's bounding volume derived from its code alone.
    pub fn code_aabb(&self, code: Code) -> Aabb {
        let half = self.node_size(code.depth()) / 2.0;
        Aabb::from_center_half_size(self.coord(code), half)
    }

    //
    // Lookup
    //

    pub fn root_code(&self) -> Code {
        Code::new(0, self.root_depth())
    }

    pub fn root(&self) -> NodeRef<'_, P::Value> {
        NodeRef {
            value: &self.root.values[0],
            code: self.root_code(),
            aabb: self.bounding_volume(),
            is_leaf: self.root.is_leaf(0),
            modified: self.root.is_modified(0),
        }
    }

    /// Descend towards `code`, stopping at its depth or at the first
    /// leaf on the way. The returned node's code records the stopping
    /// depth, which is never deeper than requested.
    pub fn find(&self, code: Code) -> Result<NodeRef<'_, P::Value>, Error> {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds);
        }

        let mut block = &self.root;
        let mut idx = 0usize;
        let mut depth = self.root_depth();
        let mut aabb = self.bounding_volume();

        loop {
            if depth == code.depth() || block.is_leaf(idx) {
                return Ok(NodeRef {
                    value: &block.values[idx],
                    code: code.to_depth(depth),
                    aabb,
                    is_leaf: block.is_leaf(idx),
                    modified: block.is_modified(idx),
                });
            }
            match block.children[idx].as_ref().expect("non-leaf slot without children") {
                Child::Leaf(leaf) => {
                    let slot = code.index(0);
                    return Ok(NodeRef {
                        value: &leaf.values[slot],
                        code: code.to_depth(0),
                        aabb: aabb.octant(slot),
                        is_leaf: true,
                        modified: leaf.is_modified(slot),
                    });
                }
                Child::Inner(inner) => {
                    let slot = code.index(depth - 1);
                    aabb = aabb.octant(slot);
                    block = inner;
                    idx = slot;
                    depth -= 1;
                }
            }
        }
    }

    /// A node exists iff the tree is materialised down to its depth.
    pub fn exists(&self, code: Code) -> bool {
        self.find(code)
            .map(|node| node.depth() == code.depth())
            .unwrap_or(false)
    }

    /// Whether the subtree at `code` is fully collapsed, i.e. the node
    /// found there (or its enclosing ancestor) has no children.
    pub fn is_leaf(&self, code: Code) -> Result<bool, Error> {
        Ok(self.find(code)?.is_leaf())
    }

    pub fn is_modified(&self, code: Code) -> Result<bool, Error> {
        let node = self.find(code)?;
        // A shallow stop means the requested node does not exist, so it
        // cannot carry pending writes of its own.
        Ok(node.depth() == code.depth() && node.is_modified())
    }

    /// Materialise the node at `code`, splitting on the way down.
    pub fn create_node(&mut self, code: Code) -> Result<(), Error> {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds);
        }
        let root_depth = self.root_depth();
        let ctx = ctx!(self);
        create_recurs(&ctx, &mut self.root, 0, root_depth, code);
        Ok(())
    }

    //
    // Modification
    //

    /// Phase A of the write model: descend to `code`, splitting as
    /// needed, and run `f` over every targeted slot. Sub-blocks whose
    /// slots are all leaves take the bulk path through `f_block`
    /// instead. Touched slots and the ancestor chain up to the root are
    /// marked modified; aggregates are stale until
    /// [`propagate_modified`](Self::propagate_modified).
    pub fn apply<F, G>(&mut self, code: Code, mut f: F, mut f_block: G) -> Result<(), Error>
    where
        F: FnMut(&mut P::Value),
        G: FnMut(&mut [P::Value; 8]),
    {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds);
        }
        let root_depth = self.root_depth();
        let ctx = ctx!(self);
        apply_recurs(&ctx, &mut self.root, 0, root_depth, code, &mut f, &mut f_block);
        Ok(())
    }

    /// Phase B: walk the modified subset bottom-up, recompute
    /// aggregates, and (with automatic pruning) collapse homogeneous
    /// blocks. Modified bits of nodes at `depth <= max_depth` are
    /// cleared unless `keep_modified`.
    pub fn propagate_modified(&mut self, keep_modified: bool, max_depth: u8) {
        if !self.root.is_modified(0) {
            return;
        }
        let root_depth = self.root_depth();
        let ctx = ctx!(self);
        propagate_recurs(
            &ctx,
            &mut self.root,
            0,
            root_depth,
            keep_modified,
            max_depth,
        );
    }

    /// Propagate everything and clear all modified bits.
    pub fn propagate(&mut self) {
        self.propagate_modified(false, self.root_depth());
    }

    /// Mark the subtree at `code` modified down to `min_depth`, forcing
    /// the next propagation to recompute it. The ancestor chain is
    /// marked as well.
    pub fn set_modified(&mut self, code: Code, min_depth: u8) -> Result<(), Error> {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds);
        }
        let root_depth = self.root_depth();
        mark_path_recurs(&mut self.root, 0, root_depth, code, min_depth);
        Ok(())
    }

    /// Clear modified bits in the subtree at `code` for nodes at
    /// `depth <= max_depth` without propagating. Mixing this with
    /// queries that rely on aggregates is unsafe: the skipped
    /// aggregates are silently stale.
    pub fn reset_modified(&mut self, code: Code, max_depth: u8) -> Result<(), Error> {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds);
        }
        let root_depth = self.root_depth();
        reset_path_recurs(&mut self.root, 0, root_depth, code, max_depth);
        Ok(())
    }

    /// Collapse every homogeneous subtree, regardless of modified bits.
    pub fn prune(&mut self) {
        let root_depth = self.root_depth();
        let ctx = ctx!(self);
        prune_recurs(&ctx, &mut self.root, 0, root_depth);
    }

    /// Pre-grow the block pool. The one operation that reports
    /// allocation failure instead of aborting.
    pub fn reserve(&self, inner_blocks: usize, leaf_blocks: usize) -> Result<(), Error> {
        self.pool.reserve(inner_blocks, leaf_blocks)
    }

    //
    // Queries
    //

    /// Lazy pre-order traversal of the nodes satisfying `predicate`.
    pub fn query<Pred>(&self, predicate: Pred) -> Query<'_, P, Pred>
    where
        Pred: Predicate<P::Value>,
    {
        Query::new(self, predicate, false)
    }

    /// Like [`query`](Self::query), but a yielded node's subtree is not
    /// descended, so pruned regions are summarised by their ancestor.
    pub fn query_early_stopping<Pred>(&self, predicate: Pred) -> Query<'_, P, Pred>
    where
        Pred: Predicate<P::Value>,
    {
        Query::new(self, predicate, true)
    }

    /// Best-first traversal by distance to `geometry`, closest node
    /// first. `epsilon` inflates inner-node keys, trading exactness for
    /// fewer expansions; ties break on the Morton code.
    pub fn query_nearest<G, Pred>(
        &self,
        geometry: G,
        predicate: Pred,
        epsilon: f64,
    ) -> QueryNearest<'_, P, G, Pred>
    where
        G: Distance,
        Pred: Predicate<P::Value>,
    {
        QueryNearest::new(self, geometry, predicate, epsilon)
    }

    //
    // Statistics
    //

    pub fn num_inner_nodes(&self) -> usize {
        self.pool.num_inner()
    }

    pub fn num_inner_leaf_nodes(&self) -> usize {
        self.pool.num_inner_leaf()
    }

    pub fn num_leaf_nodes(&self) -> usize {
        self.pool.num_leaf()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_inner_nodes() + self.num_inner_leaf_nodes() + self.num_leaf_nodes()
    }

    pub fn num_allocated_inner_nodes(&self) -> usize {
        self.pool.num_alloc_inner()
    }

    pub fn num_allocated_leaf_nodes(&self) -> usize {
        self.pool.num_alloc_leaf()
    }

    /// Lower-bound memory usage of the nodes in the tree.
    pub fn memory_usage(&self) -> usize {
        let inner_node = std::mem::size_of::<InnerBlock<P::Value>>() / 8;
        let leaf_node = std::mem::size_of::<LeafBlock<P::Value>>() / 8;
        (self.num_inner_nodes() + self.num_inner_leaf_nodes()) * inner_node
            + self.num_leaf_nodes() * leaf_node
    }

    /// Lower-bound memory usage including pooled blocks.
    pub fn memory_usage_allocated(&self) -> usize {
        let inner_node = std::mem::size_of::<InnerBlock<P::Value>>() / 8;
        let leaf_node = std::mem::size_of::<LeafBlock<P::Value>>() / 8;
        self.num_allocated_inner_nodes() * inner_node
            + self.num_allocated_leaf_nodes() * leaf_node
    }

    /// Shared access for the traversal machinery.
    pub(crate) fn root_block(&self) -> &InnerBlock<P::Value> {
        &self.root
    }
}

fn precompute_sizes(leaf_size: f64, depth_levels: u8) -> (Vec<f64>, Vec<f64>) {
    let mut sizes = Vec::with_capacity(depth_levels as usize);
    let mut size = leaf_size;
    for _ in 0..depth_levels {
        sizes.push(size);
        size *= 2.0;
    }
    let inv = sizes.iter().map(|s| 1.0 / s).collect();
    (sizes, inv)
}

//
// Locking protocol
//

fn lock_children<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
) {
    match ctx.lock_mode {
        LockMode::None => {}
        LockMode::Depth => {
            while ctx.depth_locks[depth as usize].swap(true, Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
        LockMode::Node => {
            while block.locks[idx].swap(true, Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }
}

fn unlock_children<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
) {
    match ctx.lock_mode {
        LockMode::None => {}
        LockMode::Depth => ctx.depth_locks[depth as usize].store(false, Ordering::Release),
        LockMode::Node => block.locks[idx].store(false, Ordering::Release),
    }
}

//
// Structural mutation
//

/// Split slot `idx` of `block` (a node at `depth >= 2`) into eight
/// inner children seeded from the parent payload. Racers re-checking
/// the leaf bit after the lock become no-ops.
fn create_inner_children<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
) {
    if !block.is_leaf(idx) {
        return;
    }
    lock_children(ctx, block, idx, depth);
    if !block.is_leaf(idx) {
        unlock_children(ctx, block, idx, depth);
        return;
    }

    let mut child = ctx.pool.alloc_inner();
    for value in child.values.iter_mut() {
        *value = ctx.payload.fill(&block.values[idx]);
    }
    block.children[idx] = Some(Child::Inner(child));
    block.set_leaf(idx, false);
    ctx.pool.note_split_inner();

    unlock_children(ctx, block, idx, depth);
}

/// Split slot `idx` of `block` (a node at depth 1) into eight leaf
/// children.
fn create_leaf_children<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
) {
    if !block.is_leaf(idx) {
        return;
    }
    lock_children(ctx, block, idx, depth);
    if !block.is_leaf(idx) {
        unlock_children(ctx, block, idx, depth);
        return;
    }

    let mut child = ctx.pool.alloc_leaf();
    for value in child.values.iter_mut() {
        *value = ctx.payload.fill(&block.values[idx]);
    }
    block.children[idx] = Some(Child::Leaf(child));
    block.set_leaf(idx, false);
    ctx.pool.note_split_leaf();

    unlock_children(ctx, block, idx, depth);
}

/// Detach and release the whole subtree below slot `idx`, re-raising
/// its leaf bit. `depth` is the depth of the node owning the subtree.
fn delete_children_of<V: Default>(
    pool: &BlockPool<V>,
    block: &mut InnerBlock<V>,
    idx: usize,
    depth: u8,
) {
    if block.is_leaf(idx) {
        return;
    }
    let child = block.children[idx].take().expect("non-leaf slot without children");
    block.set_leaf(idx, true);
    match child {
        Child::Leaf(leaf) => {
            pool.note_merge_leaf();
            pool.release_leaf(leaf);
        }
        Child::Inner(mut inner) => {
            for slot in 0..8 {
                delete_children_of(pool, &mut inner, slot, depth - 1);
            }
            pool.note_merge_inner();
            pool.release_inner(inner);
        }
    }
}

fn create_recurs<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
    code: Code,
) {
    if depth == code.depth() {
        return;
    }
    if depth == 1 {
        create_leaf_children(ctx, block, idx, depth);
    } else {
        create_inner_children(ctx, block, idx, depth);
        create_recurs(
            ctx,
            block.inner_child_mut(idx),
            code.index(depth - 1),
            depth - 1,
            code,
        );
    }
}

//
// Apply (Phase A)
//

fn apply_recurs<P: Payload, F, G>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
    code: Code,
    f: &mut F,
    f_block: &mut G,
) where
    F: FnMut(&mut P::Value),
    G: FnMut(&mut [P::Value; 8]),
{
    if code.depth() == depth {
        if block.is_leaf(idx) {
            f(&mut block.values[idx]);
        } else {
            apply_all_recurs(block, idx, f, f_block);
        }
    } else if depth == 1 {
        create_leaf_children(ctx, block, idx, depth);
        let slot = code.index(0);
        let leaf = block.leaf_child_mut(idx);
        f(&mut leaf.values[slot]);
        leaf.set_modified(slot, true);
    } else {
        create_inner_children(ctx, block, idx, depth);
        let child_idx = code.index(depth - 1);
        apply_recurs(
            ctx,
            block.inner_child_mut(idx),
            child_idx,
            depth - 1,
            code,
            f,
            f_block,
        );
    }
    block.set_modified(idx, true);
}

/// Run the mutator over every materialised descendant of slot `idx`,
/// which must have children. Fully-collapsed sub-blocks take the bulk
/// path.
fn apply_all_recurs<V, F, G>(block: &mut InnerBlock<V>, idx: usize, f: &mut F, f_block: &mut G)
where
    F: FnMut(&mut V),
    G: FnMut(&mut [V; 8]),
{
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => {
            f_block(&mut leaf.values);
            leaf.modified = 0xFF;
        }
        Child::Inner(inner) => {
            if inner.all_leaves() {
                f_block(&mut inner.values);
                inner.modified = 0xFF;
            } else {
                for slot in 0..8 {
                    if inner.is_leaf(slot) {
                        f(&mut inner.values[slot]);
                    } else {
                        apply_all_recurs(inner, slot, f, f_block);
                    }
                    inner.set_modified(slot, true);
                }
            }
        }
    }
}

//
// Propagation (Phase B)
//

fn propagate_recurs<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
    keep: bool,
    max_depth: u8,
) {
    if block.is_leaf(idx) {
        if depth <= max_depth {
            ctx.payload.refresh(&mut block.values[idx]);
            if !keep {
                block.set_modified(idx, false);
            }
        }
        return;
    }

    // Children first, so the aggregate below sees settled values.
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => {
            for slot in 0..8 {
                if leaf.is_modified(slot) {
                    ctx.payload.refresh(&mut leaf.values[slot]);
                    if !keep {
                        leaf.set_modified(slot, false);
                    }
                }
            }
        }
        Child::Inner(inner) => {
            for slot in 0..8 {
                if inner.is_modified(slot) {
                    propagate_recurs(ctx, inner, slot, depth - 1, keep, max_depth);
                }
            }
        }
    }

    if depth <= max_depth {
        let collapsible = {
            let (values, children) = (&mut block.values, &block.children);
            let (child_values, all_leaves) =
                match children[idx].as_ref().expect("children vanished") {
                    Child::Leaf(leaf) => (&leaf.values, true),
                    Child::Inner(inner) => (&inner.values, inner.all_leaves()),
                };
            ctx.payload.aggregate(&mut values[idx], child_values);
            ctx.automatic_prune && all_leaves && ctx.payload.is_collapsible(child_values)
        };
        if collapsible {
            delete_children_of(ctx.pool, block, idx, depth);
        }
        if !keep {
            block.set_modified(idx, false);
        }
    }
}

//
// Modified bookkeeping
//

/// Walk the path from the current node down to `code`, marking every
/// slot on the way, then flood the target's subtree down to
/// `min_depth`.
fn mark_path_recurs<V>(
    block: &mut InnerBlock<V>,
    idx: usize,
    depth: u8,
    code: Code,
    min_depth: u8,
) {
    if depth == code.depth() {
        mark_subtree_recurs(block, idx, depth, min_depth);
        return;
    }
    block.set_modified(idx, true);
    if block.is_leaf(idx) {
        return;
    }
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => {
            if min_depth == 0 {
                leaf.set_modified(code.index(0), true);
            }
        }
        Child::Inner(inner) => {
            mark_path_recurs(inner, code.index(depth - 1), depth - 1, code, min_depth);
        }
    }
}

fn mark_subtree_recurs<V>(block: &mut InnerBlock<V>, idx: usize, depth: u8, min_depth: u8) {
    if depth < min_depth {
        return;
    }
    block.set_modified(idx, true);
    if depth == min_depth || block.is_leaf(idx) {
        return;
    }
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => leaf.modified = 0xFF,
        Child::Inner(inner) => {
            for slot in 0..8 {
                mark_subtree_recurs(inner, slot, depth - 1, min_depth);
            }
        }
    }
}

/// Walk to `code` without touching the path, then clear the target's
/// subtree for nodes at `depth <= max_depth`.
fn reset_path_recurs<V>(
    block: &mut InnerBlock<V>,
    idx: usize,
    depth: u8,
    code: Code,
    max_depth: u8,
) {
    if depth == code.depth() {
        clear_subtree_recurs(block, idx, depth, max_depth);
        return;
    }
    if block.is_leaf(idx) {
        return;
    }
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => leaf.set_modified(code.index(0), false),
        Child::Inner(inner) => {
            reset_path_recurs(inner, code.index(depth - 1), depth - 1, code, max_depth);
        }
    }
}

fn clear_subtree_recurs<V>(block: &mut InnerBlock<V>, idx: usize, depth: u8, max_depth: u8) {
    if !block.is_modified(idx) {
        return;
    }
    if depth <= max_depth {
        block.set_modified(idx, false);
    }
    if block.is_leaf(idx) {
        return;
    }
    match block.children[idx].as_mut().expect("non-leaf slot without children") {
        Child::Leaf(leaf) => leaf.modified = 0,
        Child::Inner(inner) => {
            for slot in 0..8 {
                clear_subtree_recurs(inner, slot, depth - 1, max_depth);
            }
        }
    }
}

//
// Pruning
//

/// Bottom-up collapse pass. Returns whether slot `idx` is a leaf once
/// the pass is done with it.
fn prune_recurs<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
) -> bool {
    if block.is_leaf(idx) {
        return true;
    }

    let all_leaves = match block.children[idx].as_mut().expect("non-leaf slot without children")
    {
        Child::Leaf(_) => true,
        Child::Inner(inner) => {
            let mut all = true;
            for slot in 0..8 {
                all &= prune_recurs(ctx, inner, slot, depth - 1);
            }
            all
        }
    };
    if !all_leaves {
        return false;
    }

    let collapsible;
    {
        let (values, children) = (&mut block.values, &block.children);
        let child_values = match children[idx].as_ref().expect("children vanished") {
            Child::Leaf(leaf) => &leaf.values,
            Child::Inner(inner) => &inner.values,
        };
        collapsible = ctx.payload.is_collapsible(child_values);
        if collapsible {
            // The parent takes over the shared payload.
            ctx.payload.aggregate(&mut values[idx], child_values);
        }
    }
    if collapsible {
        delete_children_of(ctx.pool, block, idx, depth);
    }
    collapsible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Modified;

    /// Minimal payload for exercising the tree machinery: an f32 whose
    /// aggregate is the maximum over the children.
    struct MaxModel;

    impl Payload for MaxModel {
        type Value = f32;

        fn aggregate(&self, parent: &mut f32, children: &[f32; 8]) {
            *parent = children.iter().copied().fold(f32::MIN, f32::max);
        }

        fn is_collapsible(&self, children: &[f32; 8]) -> bool {
            children.iter().all(|c| *c == children[0])
        }

        fn serialized_size(&self) -> usize {
            4
        }

        fn write_value(&self, value: &f32, out: &mut Vec<u8>) {
            out.extend_from_slice(&value.to_le_bytes());
        }

        fn read_value(&self, input: &mut dyn std::io::Read) -> Result<f32, Error> {
            let mut bytes = [0u8; 4];
            input.read_exact(&mut bytes)?;
            Ok(f32::from_le_bytes(bytes))
        }
    }

    fn tree(leaf_size: f64, depth_levels: u8) -> OctreeCore<MaxModel> {
        OctreeCore::new(
            MaxModel,
            OctreeOptions {
                leaf_size,
                depth_levels,
                ..OctreeOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn construct_root_only() {
        let tree = tree(0.1, 16);
        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.num_inner_leaf_nodes(), 1);
        assert_eq!(tree.num_leaf_nodes(), 0);
        assert!((tree.node_size(0) - 0.1).abs() < 1e-12);
        let half = tree.bounding_volume().half_size();
        assert!((half.x - 1638.4).abs() < 1e-9);
        assert_eq!(tree.root_depth(), 15);
        assert!(tree.root().is_leaf());
    }

    #[test]
    fn depth_levels_bounds() {
        assert!(matches!(
            OctreeCore::new(MaxModel, OctreeOptions { depth_levels: 2, ..Default::default() }),
            Err(Error::InvalidDepth(2))
        ));
        assert!(matches!(
            OctreeCore::new(MaxModel, OctreeOptions { depth_levels: 23, ..Default::default() }),
            Err(Error::InvalidDepth(23))
        ));
        assert!(
            OctreeCore::new(MaxModel, OctreeOptions { depth_levels: 3, ..Default::default() })
                .is_ok()
        );
        assert!(
            OctreeCore::new(MaxModel, OctreeOptions { depth_levels: 22, ..Default::default() })
                .is_ok()
        );
    }

    #[test]
    fn insertion_at_extreme_depth_levels() {
        for depth_levels in [MIN_DEPTH_LEVELS, MAX_DEPTH_LEVELS] {
            let mut tree = tree(0.25, depth_levels);
            let code = tree.to_code(glam::DVec3::new(0.3, -0.3, 0.3), 0).unwrap();
            tree.apply(code, |v| *v = 1.0, |b| b.fill(1.0)).unwrap();
            tree.propagate();
            assert_eq!(tree.find(code).unwrap().value(), &1.0);
        }
    }

    #[test]
    fn conversions_round_trip() {
        use rand::{Rng, SeedableRng};
        let tree = tree(0.1, 16);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let coord = glam::DVec3::new(
                rng.gen_range(-1638.0..1638.0),
                rng.gen_range(-1638.0..1638.0),
                rng.gen_range(-1638.0..1638.0),
            );
            for depth in [0u8, 3, 9] {
                let code = tree.to_code(coord, depth).unwrap();
                assert_eq!(code.depth(), depth);
                let center = tree.coord(code);
                assert!(tree.is_inside(center));
                // The center maps back to the same node.
                assert_eq!(tree.to_code(center, depth).unwrap(), code);
            }
        }
    }

    #[test]
    fn conversions_out_of_bounds() {
        let tree = tree(0.1, 16);
        let outside = glam::DVec3::new(2000.0, 0.0, 0.0);
        assert!(matches!(tree.to_key(outside, 0), Err(Error::OutOfBounds)));
        assert!(tree.to_key_checked(outside, 0).is_none());
        assert!(tree.to_code_checked(outside, 0).is_none());
        assert!(tree.to_key(glam::DVec3::ZERO, 16).is_err());
    }

    #[test]
    fn find_is_monotone_in_depth() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 0).unwrap();

        // Nothing materialised: find stops at the root.
        let node = tree.find(code).unwrap();
        assert_eq!(node.depth(), tree.root_depth());
        assert!(node.is_leaf());

        tree.apply(code, |v| *v = 1.0, |b| b.fill(1.0)).unwrap();
        let node = tree.find(code).unwrap();
        assert_eq!(node.depth(), 0);
        assert_eq!(node.value(), &1.0);

        // Asking for an intermediate depth lands exactly there.
        let node = tree.find(code.to_depth(5)).unwrap();
        assert_eq!(node.depth(), 5);

        assert!(tree.find(Code::new(0, tree.root_depth())).is_ok());
    }

    #[test]
    fn apply_materialises_one_spine() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();

        assert_eq!(tree.num_leaf_nodes(), 8);
        assert_eq!(tree.num_inner_nodes(), 15);
        assert_eq!(tree.num_inner_leaf_nodes(), 98);
        assert!(tree.exists(code));
    }

    #[test]
    fn modified_set_is_exactly_the_ancestor_chain() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();

        for depth in 0..=tree.root_depth() {
            assert!(tree.is_modified(code.to_depth(depth)).unwrap());
        }

        // A sibling voxel in the same leaf block is untouched.
        let sibling = code.sibling(code.index(0) ^ 1).unwrap();
        assert!(!tree.is_modified(sibling).unwrap());

        // A distant subtree does not even exist.
        let far = tree.to_code(glam::DVec3::new(-5.0, -5.0, -5.0), 0).unwrap();
        assert!(!tree.is_modified(far).unwrap());
        assert!(!tree.exists(far));

        // Everything is clean after a full propagation.
        tree.propagate();
        for depth in 0..=tree.root_depth() {
            assert!(!tree.is_modified(code.to_depth(depth)).unwrap());
        }
    }

    #[test]
    fn propagate_aggregates_upward() {
        let mut tree = tree(0.1, 16);
        let a = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 0).unwrap();
        let b = tree.to_code(glam::DVec3::new(-4.0, 2.0, 0.5), 0).unwrap();
        tree.apply(a, |v| *v = 3.0, |blk| blk.fill(3.0)).unwrap();
        tree.apply(b, |v| *v = 5.0, |blk| blk.fill(5.0)).unwrap();
        tree.propagate();

        assert_eq!(tree.root().value(), &5.0);
        assert_eq!(tree.find(a.to_depth(4)).unwrap().value(), &3.0);
    }

    #[test]
    fn homogeneous_children_prune_to_parent() {
        let mut tree = tree(0.1, 16);
        let parent = tree
            .to_code(glam::DVec3::new(1.0, 1.0, 1.0), 1)
            .unwrap();
        for slot in 0..8 {
            let child = parent.child(slot).unwrap();
            tree.apply(child, |v| *v = 4.0, |b| b.fill(4.0)).unwrap();
        }
        assert_eq!(tree.num_leaf_nodes(), 8);

        tree.propagate();
        assert_eq!(tree.num_leaf_nodes(), 0);
        let node = tree.find(parent).unwrap();
        assert_eq!(node.depth(), 1);
        assert!(node.is_leaf());
        assert_eq!(node.value(), &4.0);
    }

    #[test]
    fn reinsertion_after_prune_reallocates_only_the_spine() {
        let mut tree = tree(0.1, 16);
        let parent = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 1).unwrap();
        for slot in 0..8 {
            tree.apply(parent.child(slot).unwrap(), |v| *v = 4.0, |b| b.fill(4.0))
                .unwrap();
        }
        tree.propagate();
        assert_eq!(tree.num_leaf_nodes(), 0);
        let inner_before = tree.num_inner_nodes();

        // One differing leaf re-splits just that block.
        tree.apply(parent.child(3).unwrap(), |v| *v = 9.0, |b| b.fill(9.0))
            .unwrap();
        assert_eq!(tree.num_leaf_nodes(), 8);
        assert_eq!(tree.num_inner_nodes(), inner_before + 1);
        tree.propagate();
        // Differing values keep the block alive.
        assert_eq!(tree.num_leaf_nodes(), 8);
    }

    #[test]
    fn automatic_prune_off_keeps_blocks_until_explicit_prune() {
        let mut tree = OctreeCore::new(
            MaxModel,
            OctreeOptions {
                leaf_size: 0.1,
                depth_levels: 16,
                automatic_prune: false,
                ..OctreeOptions::default()
            },
        )
        .unwrap();
        let parent = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 1).unwrap();
        for slot in 0..8 {
            tree.apply(parent.child(slot).unwrap(), |v| *v = 4.0, |b| b.fill(4.0))
                .unwrap();
        }
        tree.propagate();
        assert_eq!(tree.num_leaf_nodes(), 8);

        tree.prune();
        assert_eq!(tree.num_leaf_nodes(), 0);
        assert_eq!(tree.find(parent).unwrap().value(), &4.0);
    }

    #[test]
    fn noop_apply_then_propagate_changes_nothing() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();
        tree.propagate();
        let root_before = *tree.root().value();
        let leaf_before = *tree.find(code).unwrap().value();

        tree.apply(code.to_depth(3), |_| {}, |_| {}).unwrap();
        assert!(tree.is_modified(code.to_depth(3)).unwrap());
        tree.propagate();

        assert_eq!(*tree.root().value(), root_before);
        assert_eq!(*tree.find(code).unwrap().value(), leaf_before);
    }

    #[test]
    fn set_modified_forces_repropagation() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();
        tree.propagate();
        assert!(!tree.root().is_modified());

        tree.set_modified(tree.root_code(), 0).unwrap();
        assert!(tree.root().is_modified());
        assert!(tree.is_modified(code).unwrap());

        tree.propagate();
        assert!(!tree.root().is_modified());
    }

    #[test]
    fn reset_modified_leaves_aggregates_stale() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 7.0, |b| b.fill(7.0)).unwrap();

        tree.reset_modified(tree.root_code(), tree.root_depth()).unwrap();
        assert!(!tree.root().is_modified());
        assert!(!tree.is_modified(code).unwrap());

        // Propagation now skips the subtree: the root aggregate was
        // never recomputed.
        tree.propagate();
        assert_eq!(*tree.root().value(), 0.0);
        assert_eq!(*tree.find(code).unwrap().value(), 7.0);
    }

    #[test]
    fn keep_modified_propagates_but_keeps_bits() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.5, |b| b.fill(2.5)).unwrap();

        tree.propagate_modified(true, tree.root_depth());
        assert_eq!(*tree.root().value(), 2.5);
        assert!(tree.root().is_modified());

        tree.propagate();
        assert!(!tree.root().is_modified());
    }

    #[test]
    fn bulk_path_touches_whole_subtree() {
        let mut tree = tree(0.1, 16);
        let region = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 2).unwrap();
        // Materialise one leaf below the region first, then write the
        // whole region through the block path.
        tree.apply(region.child(0).unwrap().child(0).unwrap(), |v| *v = 1.0, |b| {
            b.fill(1.0)
        })
        .unwrap();
        tree.apply(region, |v| *v = 6.0, |b| b.fill(6.0)).unwrap();
        tree.propagate();

        assert_eq!(*tree.find(region).unwrap().value(), 6.0);
        // The region collapsed back to a single homogeneous node.
        assert!(tree.find(region).unwrap().is_leaf());
    }

    #[test]
    fn clear_returns_to_root_only() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();
        tree.propagate();
        assert!(tree.num_nodes() > 1);

        tree.clear(0.2, 12, true).unwrap();
        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.depth_levels(), 12);
        assert!((tree.leaf_size() - 0.2).abs() < 1e-12);
        assert!(!tree.exists(Code::new(0, 0)));
        assert!(matches!(tree.clear(0.1, 40, true), Err(Error::InvalidDepth(40))));
    }

    #[test]
    fn out_of_depth_operations_fail() {
        let mut tree = tree(0.1, 16);
        let too_deep = Code::new(0, 20);
        assert!(matches!(tree.find(too_deep), Err(Error::OutOfBounds)));
        assert!(matches!(
            tree.apply(too_deep, |_| {}, |_| {}),
            Err(Error::OutOfBounds)
        ));
        assert!(matches!(tree.set_modified(too_deep, 0), Err(Error::OutOfBounds)));
    }

    #[test]
    fn lock_modes_behave_identically_single_writer() {
        for lock_mode in [LockMode::None, LockMode::Depth, LockMode::Node] {
            let mut tree = OctreeCore::new(
                MaxModel,
                OctreeOptions {
                    leaf_size: 0.1,
                    depth_levels: 10,
                    lock_mode,
                    ..OctreeOptions::default()
                },
            )
            .unwrap();
            let code = tree.to_code(glam::DVec3::new(0.5, 0.5, 0.5), 0).unwrap();
            tree.apply(code, |v| *v = 1.5, |b| b.fill(1.5)).unwrap();
            tree.propagate();
            assert_eq!(*tree.find(code).unwrap().value(), 1.5);
        }
    }

    #[test]
    fn node_reuse_pool_round_trip() {
        let mut tree = OctreeCore::new(
            MaxModel,
            OctreeOptions {
                leaf_size: 0.1,
                depth_levels: 16,
                reuse_nodes: true,
                ..OctreeOptions::default()
            },
        )
        .unwrap();
        tree.reserve(4, 4).unwrap();
        let parent = tree.to_code(glam::DVec3::new(1.0, 1.0, 1.0), 1).unwrap();
        for slot in 0..8 {
            tree.apply(parent.child(slot).unwrap(), |v| *v = 4.0, |b| b.fill(4.0))
                .unwrap();
        }
        let allocated = tree.num_allocated_leaf_nodes();
        tree.propagate();
        // Pruned, but the block stayed allocated in the pool.
        assert_eq!(tree.num_leaf_nodes(), 0);
        assert_eq!(tree.num_allocated_leaf_nodes(), allocated);
    }

    #[test]
    fn modified_query_sees_pending_writes() {
        let mut tree = tree(0.1, 16);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();

        let modified: Vec<_> = tree.query(Modified).map(|n| n.code()).collect();
        // Root, fourteen inner levels, the depth-0 leaf: one node per
        // depth on the chain.
        assert_eq!(modified.len(), tree.root_depth() as usize + 1);
        assert!(modified.contains(&code));

        tree.propagate();
        assert_eq!(tree.query(Modified).count(), 0);
    }

    #[test]
    fn memory_usage_tracks_node_counts() {
        let mut tree = tree(0.1, 16);
        let empty = tree.memory_usage();
        assert!(empty > 0);
        let code = tree.to_code(glam::DVec3::new(1.0, 2.0, 3.0), 0).unwrap();
        tree.apply(code, |v| *v = 2.0, |b| b.fill(2.0)).unwrap();
        assert!(tree.memory_usage() > empty);
        assert!(tree.memory_usage_allocated() >= tree.memory_usage());
    }
}
