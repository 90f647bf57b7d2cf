use arrayvec::ArrayVec;
use glam::DVec3;

use super::OCTANT_OFFSETS;

/// Axis-aligned bounding box.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Cube centered at `center` with edge length `2 * half_size`.
    pub fn from_center_half_size(center: DVec3, half_size: f64) -> Self {
        Self {
            min: center - half_size,
            max: center + half_size,
        }
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    #[inline]
    pub fn half_size(&self) -> DVec3 {
        self.size() * 0.5
    }

    pub fn expand(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn contains_point(&self, point: DVec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        other.min.cmpge(self.min).all() && other.max.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Squared distance from `point` to the closest point of the box.
    /// Zero when the point is inside.
    pub fn squared_distance(&self, point: DVec3) -> f64 {
        let closest = point.clamp(self.min, self.max);
        (point - closest).length_squared()
    }

    /// The octant of this box holding child `index`. Bit 0 selects +x,
    /// bit 1 +y, bit 2 +z.
    pub fn octant(&self, index: usize) -> Aabb {
        debug_assert!(index < 8);
        let half = self.half_size();
        let min = self.min + half * OCTANT_OFFSETS[index];
        Aabb {
            min,
            max: min + half,
        }
    }

    /// All eight octants in child-index order.
    pub fn octants(&self) -> [Aabb; 8] {
        let mut cells: ArrayVec<Aabb, 8> = ArrayVec::new();
        for i in 0..8 {
            cells.push(self.octant(i));
        }
        cells.into_inner().unwrap()
    }
}

#[test]
fn octant_order_matches_child_index_convention() {
    let aabb = Aabb::new(DVec3::ZERO, DVec3::ONE);
    let cells = aabb.octants();

    // Child 0 is the all-negative corner, child 7 the all-positive one.
    assert_eq!(cells[0].min, DVec3::ZERO);
    assert_eq!(cells[7].max, DVec3::ONE);
    // Bit 0 moves along x only.
    assert_eq!(cells[1].min, glam::dvec3(0.5, 0.0, 0.0));
    // Bit 2 moves along z only.
    assert_eq!(cells[4].min, glam::dvec3(0.0, 0.0, 0.5));
    assert!(cells.iter().all(|c| c.size() == DVec3::splat(0.5)));
}

#[test]
fn squared_distance_is_zero_inside() {
    let aabb = Aabb::new(DVec3::splat(-1.0), DVec3::splat(1.0));
    assert_eq!(aabb.squared_distance(DVec3::ZERO), 0.0);
    assert_eq!(aabb.squared_distance(glam::dvec3(2.0, 0.0, 0.0)), 1.0);
    assert_eq!(aabb.squared_distance(glam::dvec3(2.0, 2.0, 0.0)), 2.0);
}

#[test]
fn intersects_and_contains() {
    let a = Aabb::new(DVec3::ZERO, DVec3::splat(2.0));
    let b = Aabb::new(DVec3::splat(1.0), DVec3::splat(3.0));
    let c = Aabb::new(DVec3::splat(0.5), DVec3::splat(1.5));

    assert!(a.intersects(&b));
    assert!(!a.contains(&b));
    assert!(a.contains(&c));
    assert!(!b.intersects(&Aabb::new(DVec3::splat(4.0), DVec3::splat(5.0))));
}
