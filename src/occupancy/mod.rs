//! The reference occupancy payload: a clamped log-odds scalar per node
//! with explicit unknown/free/occupied classification.

mod logit;
pub use logit::{logit, logit_clamped, probability};

mod raycast;
pub use raycast::RayCaster;

use std::io::Read;
use std::ops::{Deref, DerefMut};

use glam::DVec3;

use crate::octree::{OctreeCore, OctreeOptions};
use crate::predicate::Predicate;
use crate::{Code, Error, NodeRef, Payload};

const CONTAINS_UNKNOWN: u8 = 1;
const CONTAINS_FREE: u8 = 1 << 1;
const CONTAINS_OCCUPIED: u8 = 1 << 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OccupancyState {
    Unknown,
    Free,
    Occupied,
}

/// How a parent's log-odds is computed from its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PropagationCriteria {
    #[default]
    Max,
    Min,
    Mean,
}

/// Per-node payload: the clamped log-odds plus a cached union of the
/// states present in the subtree. The cache is refreshed during
/// propagation; it is what lets occupancy predicates prune whole
/// subtrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Occupancy {
    logit: f32,
    contains: u8,
}

impl Occupancy {
    #[inline]
    pub fn logit(&self) -> f32 {
        self.logit
    }

    #[inline]
    pub fn probability(&self) -> f32 {
        probability(self.logit)
    }
}

impl Default for Occupancy {
    fn default() -> Self {
        Self {
            logit: 0.0,
            contains: CONTAINS_UNKNOWN,
        }
    }
}

/// The sensor model: clamping band, classification thresholds, hit and
/// miss increments, and the aggregation criteria. Implements the
/// payload contract over [`Occupancy`] values.
#[derive(Clone, Copy, Debug)]
pub struct OccupancyModel {
    clamping_min_logit: f32,
    clamping_max_logit: f32,
    occupied_thres_logit: f32,
    free_thres_logit: f32,
    prob_hit_logit: f32,
    prob_miss_logit: f32,
    criteria: PropagationCriteria,
}

impl OccupancyModel {
    fn new(options: &OccupancyMapOptions) -> Self {
        let clamping_min_logit = logit(options.clamping_thres_min);
        let clamping_max_logit = logit(options.clamping_thres_max);
        Self {
            clamping_min_logit,
            clamping_max_logit,
            occupied_thres_logit: logit(options.occupied_thres),
            free_thres_logit: logit(options.free_thres),
            prob_hit_logit: logit_clamped(options.prob_hit, clamping_min_logit, clamping_max_logit),
            prob_miss_logit: logit_clamped(
                options.prob_miss,
                clamping_min_logit,
                clamping_max_logit,
            ),
            criteria: options.criteria,
        }
    }

    /// Dead-band classification: neither free nor occupied is unknown.
    pub fn classify(&self, logit: f32) -> OccupancyState {
        if logit < self.free_thres_logit {
            OccupancyState::Free
        } else if logit > self.occupied_thres_logit {
            OccupancyState::Occupied
        } else {
            OccupancyState::Unknown
        }
    }

    fn contains_mask(&self, logit: f32) -> u8 {
        match self.classify(logit) {
            OccupancyState::Unknown => CONTAINS_UNKNOWN,
            OccupancyState::Free => CONTAINS_FREE,
            OccupancyState::Occupied => CONTAINS_OCCUPIED,
        }
    }

    #[inline]
    fn clamp(&self, logit: f32) -> f32 {
        logit.clamp(self.clamping_min_logit, self.clamping_max_logit)
    }
}

impl Payload for OccupancyModel {
    type Value = Occupancy;

    fn root_value(&self) -> Occupancy {
        Occupancy {
            logit: 0.0,
            contains: self.contains_mask(0.0),
        }
    }

    fn aggregate(&self, parent: &mut Occupancy, children: &[Occupancy; 8]) {
        let logits = children.iter().map(|c| c.logit);
        parent.logit = match self.criteria {
            PropagationCriteria::Max => logits.fold(f32::MIN, f32::max),
            PropagationCriteria::Min => logits.fold(f32::MAX, f32::min),
            PropagationCriteria::Mean => logits.sum::<f32>() / 8.0,
        };
        parent.contains = children.iter().fold(0, |acc, c| acc | c.contains);
    }

    fn refresh(&self, value: &mut Occupancy) {
        value.contains = self.contains_mask(value.logit);
    }

    fn is_collapsible(&self, children: &[Occupancy; 8]) -> bool {
        children.iter().all(|c| c.logit == children[0].logit)
    }

    fn serialized_size(&self) -> usize {
        4
    }

    fn write_value(&self, value: &Occupancy, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.logit.to_le_bytes());
    }

    fn read_value(&self, input: &mut dyn Read) -> Result<Occupancy, Error> {
        let mut bytes = [0u8; 4];
        input.read_exact(&mut bytes)?;
        let logit = self.clamp(f32::from_le_bytes(bytes));
        Ok(Occupancy {
            logit,
            contains: self.contains_mask(logit),
        })
    }
}

/// Configuration of an [`OccupancyMap`]: the spatial index options plus
/// the sensor model, all probabilities.
#[derive(Clone, Copy, Debug)]
pub struct OccupancyMapOptions {
    pub octree: OctreeOptions,
    pub occupied_thres: f32,
    pub free_thres: f32,
    pub clamping_thres_min: f32,
    pub clamping_thres_max: f32,
    pub prob_hit: f32,
    pub prob_miss: f32,
    pub criteria: PropagationCriteria,
}

impl Default for OccupancyMapOptions {
    fn default() -> Self {
        Self {
            octree: OctreeOptions::default(),
            occupied_thres: 0.5,
            free_thres: 0.5,
            clamping_thres_min: 0.1192,
            clamping_thres_max: 0.971,
            prob_hit: 0.7,
            prob_miss: 0.4,
            criteria: PropagationCriteria::Max,
        }
    }
}

/// A probabilistic occupancy map over the sparse octree core.
///
/// Derefs to [`OctreeCore`] for the structural surface (queries,
/// conversions, propagation); the methods here add the log-odds update
/// rule and sensor insertion on top.
pub struct OccupancyMap {
    core: OctreeCore<OccupancyModel>,
}

impl Deref for OccupancyMap {
    type Target = OctreeCore<OccupancyModel>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl DerefMut for OccupancyMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.core
    }
}

impl OccupancyMap {
    pub fn new(options: OccupancyMapOptions) -> Result<Self, Error> {
        let model = OccupancyModel::new(&options);
        Ok(Self {
            core: OctreeCore::new(model, options.octree)?,
        })
    }

    /// Defaults everywhere except geometry.
    pub fn with_resolution(leaf_size: f64, depth_levels: u8) -> Result<Self, Error> {
        let mut options = OccupancyMapOptions::default();
        options.octree.leaf_size = leaf_size;
        options.octree.depth_levels = depth_levels;
        Self::new(options)
    }

    #[inline]
    pub fn model(&self) -> &OccupancyModel {
        self.core.payload()
    }

    pub fn occupied_thres(&self) -> f32 {
        probability(self.model().occupied_thres_logit)
    }

    pub fn free_thres(&self) -> f32 {
        probability(self.model().free_thres_logit)
    }

    pub fn clamping_thres_min_logit(&self) -> f32 {
        self.model().clamping_min_logit
    }

    pub fn clamping_thres_max_logit(&self) -> f32 {
        self.model().clamping_max_logit
    }

    pub fn criteria(&self) -> PropagationCriteria {
        self.model().criteria
    }

    /// Re-threshold the whole map. Every node is re-classified, which
    /// costs a full propagation.
    pub fn set_occupied_free_thres(&mut self, occupied: f32, free: f32) -> Result<(), Error> {
        let model = self.core.payload_mut();
        model.occupied_thres_logit = logit(occupied);
        model.free_thres_logit = logit(free);
        let root = self.core.root_code();
        self.core.set_modified(root, 0)?;
        self.core.propagate();
        Ok(())
    }

    //
    // Reading occupancy
    //

    /// Log-odds at `code`, from the node or its enclosing ancestor.
    pub fn occupancy_logit(&self, code: Code) -> Result<f32, Error> {
        Ok(self.core.find(code)?.value().logit)
    }

    /// Occupancy probability at `code`.
    pub fn occupancy(&self, code: Code) -> Result<f32, Error> {
        Ok(probability(self.occupancy_logit(code)?))
    }

    pub fn occupancy_state(&self, code: Code) -> Result<OccupancyState, Error> {
        Ok(self.model().classify(self.occupancy_logit(code)?))
    }

    /// State of the leaf voxel containing `coord`.
    pub fn state_at(&self, coord: DVec3) -> Result<OccupancyState, Error> {
        self.occupancy_state(self.core.to_code(coord, 0)?)
    }

    pub fn is_occupied(&self, code: Code) -> Result<bool, Error> {
        Ok(self.occupancy_state(code)? == OccupancyState::Occupied)
    }

    pub fn is_free(&self, code: Code) -> Result<bool, Error> {
        Ok(self.occupancy_state(code)? == OccupancyState::Free)
    }

    pub fn is_unknown(&self, code: Code) -> Result<bool, Error> {
        Ok(self.occupancy_state(code)? == OccupancyState::Unknown)
    }

    fn contains_state(&self, code: Code, mask: u8) -> Result<bool, Error> {
        let node = self.core.find(code)?;
        if node.is_leaf() {
            Ok(self.model().contains_mask(node.value().logit) & mask != 0)
        } else {
            // The cached union; exact once propagated.
            Ok(node.value().contains & mask != 0)
        }
    }

    pub fn contains_occupied(&self, code: Code) -> Result<bool, Error> {
        self.contains_state(code, CONTAINS_OCCUPIED)
    }

    pub fn contains_free(&self, code: Code) -> Result<bool, Error> {
        self.contains_state(code, CONTAINS_FREE)
    }

    pub fn contains_unknown(&self, code: Code) -> Result<bool, Error> {
        self.contains_state(code, CONTAINS_UNKNOWN)
    }

    //
    // Writing occupancy
    //

    /// Overwrite the log-odds of the subtree at `code`.
    pub fn set_occupancy_logit(&mut self, code: Code, logit: f32) -> Result<(), Error> {
        let logit = self.model().clamp(logit);
        self.core.apply(
            code,
            |value| value.logit = logit,
            |block| {
                for value in block.iter_mut() {
                    value.logit = logit;
                }
            },
        )
    }

    pub fn set_occupancy(&mut self, code: Code, probability: f32) -> Result<(), Error> {
        self.set_occupancy_logit(code, logit(probability))
    }

    /// Shift the log-odds of the subtree at `code` by `delta`, clamping
    /// into the model's band.
    pub fn update_occupancy_logit(&mut self, code: Code, delta: f32) -> Result<(), Error> {
        let model = *self.model();
        self.core.apply(
            code,
            |value| value.logit = model.clamp(value.logit + delta),
            |block| {
                for value in block.iter_mut() {
                    value.logit = model.clamp(value.logit + delta);
                }
            },
        )
    }

    /// Fold one observation with probability `probability` into the
    /// subtree at `code`: above 0.5 raises the log-odds, below lowers
    /// it.
    pub fn update_occupancy(&mut self, code: Code, probability: f32) -> Result<(), Error> {
        self.update_occupancy_logit(code, logit(probability))
    }

    /// One occupied observation, weighted by the model's `prob_hit`.
    pub fn insert_hit(&mut self, code: Code) -> Result<(), Error> {
        self.update_occupancy_logit(code, self.model().prob_hit_logit)
    }

    /// One free observation, weighted by the model's `prob_miss`.
    pub fn insert_miss(&mut self, code: Code) -> Result<(), Error> {
        self.update_occupancy_logit(code, self.model().prob_miss_logit)
    }

    /// Fold a single point observation into the leaf voxel at `coord`.
    pub fn insert_point(&mut self, coord: DVec3, occupied: bool) -> Result<(), Error> {
        let code = self.core.to_code(coord, 0)?;
        if occupied {
            self.insert_hit(code)
        } else {
            self.insert_miss(code)
        }
    }

    /// A predicate selecting nodes in `state` under this map's
    /// thresholds.
    pub fn occupancy_is(&self, state: OccupancyState) -> OccupancyIs {
        OccupancyIs {
            state,
            free_thres_logit: self.model().free_thres_logit,
            occupied_thres_logit: self.model().occupied_thres_logit,
        }
    }
}

/// Predicate over [`Occupancy`] payloads: the node classifies as
/// `state`. The inner check reads the cached contains-union, which is
/// exact for the map's own thresholds once propagated.
pub struct OccupancyIs {
    pub state: OccupancyState,
    free_thres_logit: f32,
    occupied_thres_logit: f32,
}

impl OccupancyIs {
    /// A free-standing predicate with explicit probability thresholds.
    pub fn with_thresholds(state: OccupancyState, free_thres: f32, occupied_thres: f32) -> Self {
        Self {
            state,
            free_thres_logit: logit(free_thres),
            occupied_thres_logit: logit(occupied_thres),
        }
    }

    fn classify(&self, logit: f32) -> OccupancyState {
        if logit < self.free_thres_logit {
            OccupancyState::Free
        } else if logit > self.occupied_thres_logit {
            OccupancyState::Occupied
        } else {
            OccupancyState::Unknown
        }
    }
}

impl Predicate<Occupancy> for OccupancyIs {
    fn value_check(&self, node: &NodeRef<'_, Occupancy>) -> bool {
        self.classify(node.value().logit) == self.state
    }

    fn inner_check(&self, node: &NodeRef<'_, Occupancy>) -> bool {
        let mask = match self.state {
            OccupancyState::Unknown => CONTAINS_UNKNOWN,
            OccupancyState::Free => CONTAINS_FREE,
            OccupancyState::Occupied => CONTAINS_OCCUPIED,
        };
        node.value().contains & mask != 0
    }
}
