//! Composable node predicates.
//!
//! A predicate is a pair of checks: `value_check` decides whether a
//! node itself is returned, `inner_check` whether any descendant could
//! still be. Traversals prune a whole subtree the moment the inner
//! check fails, so inner checks may be conservative (returning `true`
//! too often) but must never return `false` for a subtree holding a
//! match.
//!
//! Tuples combine predicates with AND; [`Or`] and [`Not`] cover the
//! rest. `()` is the always-true predicate.

use std::ops::RangeInclusive;

use crate::geometry::{Aabb, Sphere};
use crate::octree::NodeRef;

pub trait Predicate<V> {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool;

    /// Could any descendant of `node` satisfy this predicate? Only
    /// called for nodes that have children.
    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        let _ = node;
        true
    }
}

impl<V, T: Predicate<V> + ?Sized> Predicate<V> for &T {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        (**self).value_check(node)
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        (**self).inner_check(node)
    }
}

/// The always-true predicate.
impl<V> Predicate<V> for () {
    fn value_check(&self, _: &NodeRef<'_, V>) -> bool {
        true
    }
}

macro_rules! impl_and_for_tuple {
    ($($p:ident),+) => {
        #[allow(non_snake_case)]
        impl<V, $($p: Predicate<V>),+> Predicate<V> for ($($p,)+) {
            fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
                let ($($p,)+) = self;
                $($p.value_check(node))&&+
            }

            fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
                let ($($p,)+) = self;
                $($p.inner_check(node))&&+
            }
        }
    };
}

impl_and_for_tuple!(A);
impl_and_for_tuple!(A, B);
impl_and_for_tuple!(A, B, C);
impl_and_for_tuple!(A, B, C, D);

/// Either branch may hold.
pub struct Or<A, B>(pub A, pub B);

impl<V, A: Predicate<V>, B: Predicate<V>> Predicate<V> for Or<A, B> {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.value_check(node) || self.1.value_check(node)
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.inner_check(node) || self.1.inner_check(node)
    }
}

/// Negated value check. The inner check stays conservative: a subtree
/// failing `A` everywhere cannot be detected from the outside.
pub struct Not<A>(pub A);

impl<V, A: Predicate<V>> Predicate<V> for Not<A> {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        !self.0.value_check(node)
    }
}

/// Every walked node exists.
pub struct Exists;

impl<V> Predicate<V> for Exists {
    fn value_check(&self, _: &NodeRef<'_, V>) -> bool {
        true
    }
}

/// Nodes without materialised children.
pub struct Leaf;

impl<V> Predicate<V> for Leaf {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.is_leaf()
    }
}

/// Nodes with materialised children.
pub struct Parent;

impl<V> Predicate<V> for Parent {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        !node.is_leaf()
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        // Children at depth 0 cannot be parents.
        node.depth() > 1
    }
}

/// Nodes carrying pending un-propagated writes. Modified bits are
/// upward closed, so the inner check is exact.
pub struct Modified;

impl<V> Predicate<V> for Modified {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.is_modified()
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.is_modified()
    }
}

/// Nodes at `depth >= min`.
pub struct DepthMin(pub u8);

impl<V> Predicate<V> for DepthMin {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.depth() >= self.0
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.depth() > self.0
    }
}

/// Nodes at `depth <= max`.
pub struct DepthMax(pub u8);

impl<V> Predicate<V> for DepthMax {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        node.depth() <= self.0
    }
}

/// Nodes whose volume is fully inside the box. The inner check admits
/// any intersecting subtree.
pub struct Inside(pub Aabb);

impl<V> Predicate<V> for Inside {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.contains(&node.aabb())
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.intersects(&node.aabb())
    }
}

/// Nodes whose volume is fully inside the sphere.
pub struct Within(pub Sphere);

impl<V> Predicate<V> for Within {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.contains_aabb(&node.aabb())
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.intersects_aabb(&node.aabb())
    }
}

/// Nodes whose volume intersects the box, regardless of containment.
pub struct Intersecting(pub Aabb);

impl<V> Predicate<V> for Intersecting {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.intersects(&node.aabb())
    }

    fn inner_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.intersects(&node.aabb())
    }
}

/// User check over the node view; never prunes.
pub struct ValueCheck<F>(pub F);

impl<V, F> Predicate<V> for ValueCheck<F>
where
    F: Fn(&NodeRef<'_, V>) -> bool,
{
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        (self.0)(node)
    }
}

/// Payloads that carry a time step, for [`TimeStepIn`].
pub trait TimeStamped {
    fn time_step(&self) -> u32;
}

/// Nodes whose payload time step falls in the range. The inner check
/// is conservative: aggregation order of time steps is payload policy.
pub struct TimeStepIn(pub RangeInclusive<u32>);

impl<V: TimeStamped> Predicate<V> for TimeStepIn {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.contains(&node.value().time_step())
    }
}

/// Payloads that carry a semantic label, for [`SemanticIn`].
pub trait Labeled {
    fn label(&self) -> u32;
}

/// Nodes whose semantic label falls in the range.
pub struct SemanticIn(pub RangeInclusive<u32>);

impl<V: Labeled> Predicate<V> for SemanticIn {
    fn value_check(&self, node: &NodeRef<'_, V>) -> bool {
        self.0.contains(&node.value().label())
    }
}
