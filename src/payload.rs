use std::io::Read;

use crate::Error;

/// The contract a per-node data layer implements to live inside the
/// octree.
///
/// The implementor is a model object owned by the map (sensor
/// thresholds, aggregation criteria, ...); the `Value` it manages is
/// what every node slot stores. The tree drives these hooks and nothing
/// else: it seeds fresh children with [`fill`](Payload::fill),
/// recomputes aggregates bottom-up with
/// [`aggregate`](Payload::aggregate), asks
/// [`is_collapsible`](Payload::is_collapsible) before pruning a
/// homogeneous block, and moves values through the serialization frame
/// with the read/write hooks.
pub trait Payload {
    type Value: Clone + Default;

    /// Seed a fresh child slot from its parent's state.
    fn fill(&self, parent: &Self::Value) -> Self::Value {
        parent.clone()
    }

    /// The value of the tree's root before anything is written.
    fn root_value(&self) -> Self::Value {
        Self::Value::default()
    }

    /// Recompute `parent` from its eight children. Only called on slots
    /// that have children, after the children are up to date.
    fn aggregate(&self, parent: &mut Self::Value, children: &[Self::Value; 8]);

    /// Refresh a leaf value's derived state during propagation. Called
    /// on modified slots that have no children.
    fn refresh(&self, value: &mut Self::Value) {
        let _ = value;
    }

    /// Whether a block of eight leaf children is homogeneous enough to
    /// collapse into its parent. The equality relaxation is the
    /// payload's to define; the tree guarantees every child is a leaf
    /// before asking.
    fn is_collapsible(&self, children: &[Self::Value; 8]) -> bool;

    /// Exact byte length of one serialized value record.
    fn serialized_size(&self) -> usize;

    fn write_value(&self, value: &Self::Value, out: &mut Vec<u8>);

    fn read_value(&self, input: &mut dyn Read) -> Result<Self::Value, Error>;
}
