//! Probabilistic 3D occupancy mapping on a sparse Morton-coded octree.
//!
//! The map distinguishes *unknown*, *free*, and *occupied* space. Nodes
//! live in blocks of eight siblings addressed by Morton [`Code`]s;
//! writes go through a two-phase protocol (local mutation marking
//! modified bits, then bottom-up propagation of aggregates with pruning
//! of homogeneous subtrees); queries are predicate-driven depth-first
//! or nearest-first traversals.
//!
//! [`OctreeCore`] is the spatial index, generic over the [`Payload`]
//! contract; [`occupancy::OccupancyMap`] is the reference payload: a
//! clamped log-odds scalar per node.
//!
//! ```
//! use glam::DVec3;
//! use occtree::occupancy::{OccupancyMap, OccupancyState};
//!
//! let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
//! map.insert_point(DVec3::new(1.0, 2.0, 3.0), true).unwrap();
//! map.propagate();
//! assert_eq!(
//!     map.state_at(DVec3::new(1.0, 2.0, 3.0)).unwrap(),
//!     OccupancyState::Occupied,
//! );
//! ```

pub use glam;

mod error;
pub use error::Error;

pub mod geometry;

pub mod morton;
pub use morton::{Code, Key};

mod payload;
pub use payload::Payload;

pub mod octree;
pub use octree::{
    Codec, LockMode, NodeRef, OctreeCore, OctreeOptions, Query, QueryNearest,
    MAX_DEPTH_LEVELS, MIN_DEPTH_LEVELS,
};

pub mod predicate;

pub mod occupancy;
