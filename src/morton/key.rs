use glam::UVec3;

/// Integer lattice coordinates of one node at a given depth.
///
/// Components live on the key lattice of the owning map: at depth `d`
/// the low `d` bits of every component are zero, so a key names the
/// whole `2^d`-voxel-wide node, not a point inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pos: UVec3,
    depth: u8,
}

impl Key {
    /// Build a key, snapping the components onto the depth's lattice.
    pub fn new(x: u32, y: u32, z: u32, depth: u8) -> Self {
        Self::from_pos(UVec3::new(x, y, z), depth)
    }

    pub fn from_pos(pos: UVec3, depth: u8) -> Self {
        debug_assert!(depth <= 21);
        Self {
            pos: (pos >> depth as u32) << depth as u32,
            depth,
        }
    }

    #[inline]
    pub fn pos(&self) -> UVec3 {
        self.pos
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub fn component(&self, axis: usize) -> u32 {
        self.pos[axis]
    }

    /// The same position named at a different depth. Going shallower
    /// zeroes the finer lattice bits.
    pub fn to_depth(self, depth: u8) -> Key {
        Key::from_pos(self.pos, depth)
    }
}

#[test]
fn key_snaps_to_lattice() {
    let key = Key::new(13, 7, 21, 2);
    assert_eq!(key.pos(), UVec3::new(12, 4, 20));
    assert_eq!(key.depth(), 2);

    // Depth 0 keeps everything.
    let key = Key::new(13, 7, 21, 0);
    assert_eq!(key.pos(), UVec3::new(13, 7, 21));

    let shallow = key.to_depth(3);
    assert_eq!(shallow.pos(), UVec3::new(8, 0, 16));
}
