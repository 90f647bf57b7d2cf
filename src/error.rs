use crate::octree::{MAX_DEPTH_LEVELS, MIN_DEPTH_LEVELS};

/// Everything that can go wrong inside the map.
///
/// Bounds and argument violations are returned to the caller; the
/// `*_checked` conversions return `None` instead of erroring. I/O and
/// format failures abort the current read or write and leave the map in
/// a consistent (possibly partial) state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A coordinate, key, or code falls outside the volume the map can
    /// address, or its depth exceeds the root depth.
    #[error("coordinate, key, or code outside the map bounds")]
    OutOfBounds,

    /// `depth_levels` outside the supported range.
    #[error("depth_levels must be within [{MIN_DEPTH_LEVELS}, {MAX_DEPTH_LEVELS}], got {0}")]
    InvalidDepth(u8),

    /// A child or sibling index outside `0..8`, or a parent depth below
    /// the node's own depth.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Underlying reader or writer failure during serialization.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// Structural prefix inconsistent with the payload count, header
    /// magic mismatch, or similar malformed input.
    #[error("malformed map data: {0}")]
    Format(&'static str),

    /// The block pool could not grow. Fatal to the current operation;
    /// the map itself remains usable.
    #[error("block allocation failed")]
    Allocation,
}
