use glam::DVec3;

use super::Aabb;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn contains_point(&self, point: DVec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }

    /// The whole box lies inside the sphere.
    pub fn contains_aabb(&self, aabb: &Aabb) -> bool {
        // The farthest corner decides.
        let center = aabb.center();
        let half = aabb.half_size();
        let mut farthest = center;
        for i in 0..3 {
            farthest[i] += if self.center[i] < center[i] { half[i] } else { -half[i] };
        }
        self.contains_point(farthest)
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        aabb.squared_distance(self.center) <= self.radius * self.radius
    }

    pub fn aabb(&self) -> Aabb {
        Aabb {
            min: self.center - self.radius,
            max: self.center + self.radius,
        }
    }
}

#[test]
fn sphere_aabb_tests() {
    use glam::dvec3;

    let s = Sphere::new(DVec3::ZERO, 1.0);
    assert!(s.contains_point(dvec3(0.5, 0.5, 0.5)));
    assert!(!s.contains_point(dvec3(1.0, 1.0, 1.0)));

    let inside = Aabb::new(DVec3::splat(-0.5), DVec3::splat(0.5));
    assert!(s.contains_aabb(&inside));

    let overlapping = Aabb::new(DVec3::splat(0.5), DVec3::splat(2.0));
    assert!(s.intersects_aabb(&overlapping));
    assert!(!s.contains_aabb(&overlapping));

    let outside = Aabb::new(DVec3::splat(2.0), DVec3::splat(3.0));
    assert!(!s.intersects_aabb(&outside));
}
