mod aabb;
pub use aabb::*;

mod sphere;
pub use sphere::*;

use glam::{dvec3, DVec3};

/// Offsets of the eight octants of a cube, in child-index order:
/// bit 0 is +x, bit 1 is +y, bit 2 is +z.
pub const OCTANT_OFFSETS: [DVec3; 8] = [
    DVec3::ZERO,
    dvec3(1.0, 0.0, 0.0),
    dvec3(0.0, 1.0, 0.0),
    dvec3(1.0, 1.0, 0.0),
    dvec3(0.0, 0.0, 1.0),
    dvec3(1.0, 0.0, 1.0),
    dvec3(0.0, 1.0, 1.0),
    DVec3::ONE,
];

/// Squared distance from a query geometry to an axis-aligned box.
///
/// Implemented by the geometries the nearest-first traversal accepts.
pub trait Distance {
    fn squared_distance(&self, aabb: &Aabb) -> f64;
}

impl Distance for DVec3 {
    fn squared_distance(&self, aabb: &Aabb) -> f64 {
        aabb.squared_distance(*self)
    }
}

impl Distance for Aabb {
    fn squared_distance(&self, aabb: &Aabb) -> f64 {
        // Component-wise gap between the two boxes.
        let gap = (self.min - aabb.max).max(aabb.min - self.max).max(DVec3::ZERO);
        gap.length_squared()
    }
}

impl Distance for Sphere {
    fn squared_distance(&self, aabb: &Aabb) -> f64 {
        let d = aabb.squared_distance(self.center).sqrt() - self.radius;
        let d = d.max(0.0);
        d * d
    }
}
