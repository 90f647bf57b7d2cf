//! Integer DDA over the key lattice and the sensor-insertion paths
//! built on it.

use ahash::HashSet;
use glam::{DVec3, IVec3};

use crate::occupancy::OccupancyMap;
use crate::{Code, Error, Key};

/// Steps through every node a ray crosses, at the keys' depth, using
/// the classic voxel-walking DDA. Yields the cells strictly before the
/// end key; the endpoint is the caller's to handle.
pub struct RayCaster {
    current: IVec3,
    end: IVec3,
    depth: u8,
    step: IVec3,
    t_delta: DVec3,
    t_max: DVec3,
    total_distance: f64,
}

impl RayCaster {
    /// `current` and `end` are the ray's first and last keys at equal
    /// depth; `origin` and `target` the world-space ray; `voxel_center`
    /// the center coordinate of the first key's node; `node_size` the
    /// node edge length at that depth.
    pub fn new(
        current: Key,
        end: Key,
        origin: DVec3,
        target: DVec3,
        voxel_center: DVec3,
        node_size: f64,
    ) -> Result<Self, Error> {
        if current.depth() != end.depth() {
            return Err(Error::InvalidArgument("ray keys at different depths"));
        }

        let depth = current.depth();
        let current_pos = IVec3::new(
            current.component(0) as i32,
            current.component(1) as i32,
            current.component(2) as i32,
        );
        let end_pos = IVec3::new(
            end.component(0) as i32,
            end.component(1) as i32,
            end.component(2) as i32,
        );

        if current_pos == end_pos {
            return Ok(Self {
                current: current_pos,
                end: end_pos,
                depth,
                step: IVec3::ZERO,
                t_delta: DVec3::INFINITY,
                t_max: DVec3::INFINITY,
                total_distance: 0.0,
            });
        }

        let mut direction = target - origin;
        let mut total_distance = direction.length();
        direction /= total_distance;
        // One node of slack so rounding at the boundary cannot strand
        // the walk short of the end key.
        total_distance += node_size;

        let mut step = IVec3::ZERO;
        let mut t_delta = DVec3::INFINITY;
        let mut t_max = DVec3::INFINITY;
        let key_step = 1i32 << depth;

        for axis in 0..3 {
            if direction[axis] == 0.0 {
                continue;
            }
            let mut border = voxel_center[axis] - origin[axis];
            if direction[axis] > 0.0 {
                step[axis] = key_step;
                border += node_size / 2.0;
            } else {
                step[axis] = -key_step;
                border -= node_size / 2.0;
            }
            t_delta[axis] = node_size / direction[axis].abs();
            t_max[axis] = border / direction[axis];
        }

        Ok(Self {
            current: current_pos,
            end: end_pos,
            depth,
            step,
            t_delta,
            t_max,
            total_distance,
        })
    }

    fn distance_moved(&self) -> f64 {
        self.t_max.min_element()
    }

    fn take_step(&mut self) {
        let axis = argmin(self.t_max);
        self.current[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];
    }
}

impl Iterator for RayCaster {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.current == self.end || self.distance_moved() > self.total_distance {
            return None;
        }
        let key = Key::new(
            self.current.x as u32,
            self.current.y as u32,
            self.current.z as u32,
            self.depth,
        );
        self.take_step();
        Some(key)
    }
}

fn argmin(v: DVec3) -> usize {
    if v.x <= v.y {
        if v.x <= v.z {
            0
        } else {
            2
        }
    } else if v.y <= v.z {
        1
    } else {
        2
    }
}

impl OccupancyMap {
    /// The DDA from `origin` to `target` over leaf-depth keys.
    pub fn ray_caster(&self, origin: DVec3, target: DVec3) -> Result<RayCaster, Error> {
        let current = self.core.to_key(origin, 0)?;
        let end = self.core.to_key(target, 0)?;
        RayCaster::new(
            current,
            end,
            origin,
            target,
            self.core.to_coord(current),
            self.core.node_size(0),
        )
    }

    /// Fold one sensor ray into the map: misses along the ray, a hit at
    /// the endpoint.
    pub fn insert_ray(&mut self, origin: DVec3, end: DVec3, propagate: bool) -> Result<(), Error> {
        let free: Vec<Code> = self.ray_caster(origin, end)?.map(Code::from_key).collect();
        let end_code = self.core.to_code(end, 0)?;
        for code in free {
            if code != end_code {
                self.insert_miss(code)?;
            }
        }
        self.insert_hit(end_code)?;
        if propagate {
            self.core.propagate();
        }
        Ok(())
    }

    /// Fold a point cloud seen from `origin` into the map. Every point
    /// traces free space along its ray and lands a hit at its voxel;
    /// points beyond `max_range` are truncated to range and contribute
    /// free space only. Cells are deduplicated per cloud, and a cell
    /// hit by any point never also takes a miss. Points outside the map
    /// are skipped.
    pub fn insert_point_cloud(
        &mut self,
        origin: DVec3,
        points: &[DVec3],
        max_range: Option<f64>,
        propagate: bool,
    ) -> Result<(), Error> {
        let origin_key = self.core.to_key(origin, 0)?;
        let mut hits: HashSet<Code> = HashSet::default();
        let mut misses: HashSet<Code> = HashSet::default();

        for &point in points {
            let mut target = point;
            let mut is_hit = true;
            if let Some(range) = max_range {
                let distance = origin.distance(point);
                if distance > range {
                    target = origin + (point - origin) * (range / distance);
                    is_hit = false;
                }
            }

            let Some(end_key) = self.core.to_key_checked(target, 0) else {
                continue;
            };
            if is_hit {
                hits.insert(Code::from_key(end_key));
            }

            let caster = RayCaster::new(
                origin_key,
                end_key,
                origin,
                target,
                self.core.to_coord(origin_key),
                self.core.node_size(0),
            )?;
            for key in caster {
                misses.insert(Code::from_key(key));
            }
        }

        // Hits win over misses within one cloud.
        for code in &hits {
            misses.remove(code);
        }
        for code in misses {
            self.insert_miss(code)?;
        }
        for code in hits {
            self.insert_hit(code)?;
        }

        if propagate {
            self.core.propagate();
        }
        Ok(())
    }
}
