use std::hash::{Hash, Hasher};

use glam::UVec3;

use crate::{Error, Key};

/// Bits of the x component in an interleaved code; y and z are the same
/// mask shifted left by one and two.
const X_MASK: u64 = 0x9249_2492_4924_9249;
const Y_MASK: u64 = X_MASK << 1;
const Z_MASK: u64 = X_MASK << 2;

/// A single value naming a specific node at a specific depth.
///
/// The value is the three-way Morton interleave of the node's key: x
/// occupies bit 0 of every triple, y bit 1, z bit 2. For a code at
/// depth `d` the low `3 * d` bits are forced to zero, so nested codes
/// share a common prefix with their ancestors and the child slot at any
/// depth is three bits away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    code: u64,
    depth: u8,
}

impl Code {
    pub fn new(code: u64, depth: u8) -> Self {
        debug_assert!(depth <= 21);
        Self {
            code: keep_above(code, 3 * depth as u32),
            depth,
        }
    }

    pub fn from_key(key: Key) -> Self {
        Self {
            code: interleave(key.pos()),
            depth: key.depth(),
        }
    }

    pub fn to_key(self) -> Key {
        Key::from_pos(deinterleave(self.code), self.depth)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.code
    }

    #[inline]
    pub fn depth(self) -> u8 {
        self.depth
    }

    /// The code of the enclosing node at `depth`, zeroing the finer
    /// interleave bits. Also valid towards deeper depths, where it
    /// names the all-negative descendant.
    pub fn to_depth(self, depth: u8) -> Code {
        Code::new(self.code, depth)
    }

    /// The ancestor at `parent_depth`.
    pub fn parent(self, parent_depth: u8) -> Result<Code, Error> {
        if parent_depth < self.depth || parent_depth > 21 {
            return Err(Error::InvalidArgument("parent depth below node depth"));
        }
        Ok(self.to_depth(parent_depth))
    }

    /// The child in slot `index`, one level deeper.
    pub fn child(self, index: usize) -> Result<Code, Error> {
        if self.depth == 0 {
            return Err(Error::InvalidArgument("depth-0 code has no children"));
        }
        if index > 7 {
            return Err(Error::InvalidArgument("child index outside 0..8"));
        }
        let child_depth = self.depth - 1;
        Ok(Code {
            code: self.code + ((index as u64) << (3 * child_depth as u32)),
            depth: child_depth,
        })
    }

    /// The sibling in slot `index` at the same depth.
    pub fn sibling(self, index: usize) -> Result<Code, Error> {
        if index > 7 {
            return Err(Error::InvalidArgument("sibling index outside 0..8"));
        }
        let above = keep_above(self.code, 3 * (self.depth as u32 + 1));
        Ok(Code {
            code: above + ((index as u64) << (3 * self.depth as u32)),
            depth: self.depth,
        })
    }

    /// The child slot this code selects at `depth`, in `0..8`.
    #[inline]
    pub fn index(self, depth: u8) -> usize {
        debug_assert!(depth <= 21);
        ((self.code >> (3 * depth as u32)) & 0x7) as usize
    }
}

impl Hash for Code {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The low 3 * depth bits are zero, so packing the depth into
        // them keeps the seed injective.
        state.write_u64(self.code | self.depth as u64);
    }
}

impl PartialOrd for Code {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Code {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Deeper codes order before their ancestors at the same prefix.
        self.code
            .cmp(&other.code)
            .then_with(|| other.depth.cmp(&self.depth))
    }
}

#[inline]
fn keep_above(code: u64, bits: u32) -> u64 {
    if bits >= 64 {
        0
    } else {
        (code >> bits) << bits
    }
}

/// Morton-interleave the three components of a key position.
#[inline]
pub fn interleave(pos: UVec3) -> u64 {
    #[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
    // SAFETY: gated on compile-time BMI2 support.
    unsafe {
        use std::arch::x86_64::_pdep_u64;
        _pdep_u64(pos.x as u64, X_MASK)
            | _pdep_u64(pos.y as u64, Y_MASK)
            | _pdep_u64(pos.z as u64, Z_MASK)
    }
    #[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
    {
        split_by_3(pos.x) | (split_by_3(pos.y) << 1) | (split_by_3(pos.z) << 2)
    }
}

/// Inverse of [`interleave`].
#[inline]
pub fn deinterleave(code: u64) -> UVec3 {
    #[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
    // SAFETY: gated on compile-time BMI2 support.
    unsafe {
        use std::arch::x86_64::_pext_u64;
        UVec3::new(
            _pext_u64(code, X_MASK) as u32,
            _pext_u64(code, Y_MASK) as u32,
            _pext_u64(code, Z_MASK) as u32,
        )
    }
    #[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
    {
        UVec3::new(
            extract_third_bits(code),
            extract_third_bits(code >> 1),
            extract_third_bits(code >> 2),
        )
    }
}

/// Portable five-stage split-by-3: spread the low 21 bits of `value`
/// so each lands on every third output bit.
pub fn split_by_3(value: u32) -> u64 {
    let mut code = (value as u64) & 0x1f_ffff;
    code = (code | code << 32) & 0x1f_0000_0000_ffff;
    code = (code | code << 16) & 0x1f_0000_ff00_00ff;
    code = (code | code << 8) & 0x100f_00f0_0f00_f00f;
    code = (code | code << 4) & 0x10c3_0c30_c30c_30c3;
    code = (code | code << 2) & 0x1249_2492_4924_9249;
    code
}

/// Portable inverse of [`split_by_3`]: gather every third bit.
pub fn extract_third_bits(code: u64) -> u32 {
    let mut a = code & 0x1249_2492_4924_9249;
    a = (a ^ (a >> 2)) & 0x10c3_0c30_c30c_30c3;
    a = (a ^ (a >> 4)) & 0x100f_00f0_0f00_f00f;
    a = (a ^ (a >> 8)) & 0x1f_0000_ff00_00ff;
    a = (a ^ (a >> 16)) & 0x1f_0000_0000_ffff;
    a = (a ^ (a >> 32)) & 0x1f_ffff;
    a as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_code_round_trip() {
        for depth in [0u8, 1, 4, 13, 21] {
            let key = Key::new(0x15_5555, 0x0a_aaaa, 0x1f_0f0f, depth);
            let code = Code::from_key(key);
            assert_eq!(code.depth(), depth);
            assert_eq!(code.to_key(), key);
        }
    }

    #[test]
    fn child_parent_sibling() {
        let code = Code::from_key(Key::new(4, 2, 6, 2));

        let child = code.child(5).unwrap();
        assert_eq!(child.depth(), 1);
        assert_eq!(child.index(1), 5);
        assert_eq!(child.parent(2).unwrap(), code);

        let sibling = child.sibling(3).unwrap();
        assert_eq!(sibling.depth(), 1);
        assert_eq!(sibling.index(1), 3);
        assert_eq!(sibling.parent(2).unwrap(), code);
        assert_eq!(sibling.sibling(5).unwrap(), child);

        assert!(Code::new(0, 0).child(0).is_err());
        assert!(code.child(8).is_err());
        assert!(child.parent(0).is_err());
    }

    #[test]
    fn codes_compare_by_node_and_depth() {
        let a = Code::from_key(Key::new(1, 0, 0, 0));
        let b = a.to_depth(1);
        assert_ne!(a, b);
        assert_eq!(a.to_depth(1), b);
    }

    #[test]
    fn index_extracts_interleaved_triples() {
        // x = 0b11, y = 0b01, z = 0b10: slot at depth 0 is x|y<<1 of the
        // low bits, slot at depth 1 comes from the next bits.
        let code = Code::from_key(Key::new(0b11, 0b01, 0b10, 0));
        assert_eq!(code.index(0), 0b011);
        assert_eq!(code.index(1), 0b101);
    }

    #[test]
    fn root_sibling_is_identity() {
        let root = Code::new(0, 21);
        assert_eq!(root.sibling(0).unwrap(), root);
    }

    proptest! {
        #[test]
        fn split_by_3_round_trips(value in 0u32..(1 << 21)) {
            prop_assert_eq!(extract_third_bits(split_by_3(value)), value);
        }

        #[test]
        fn interleave_round_trips(
            x in 0u32..(1 << 21),
            y in 0u32..(1 << 21),
            z in 0u32..(1 << 21),
        ) {
            let pos = UVec3::new(x, y, z);
            prop_assert_eq!(deinterleave(interleave(pos)), pos);
        }

        // On BMI2 targets `interleave` takes the pdep path; it must be
        // bit-identical to the portable ladder.
        #[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
        #[test]
        fn intrinsics_match_portable(
            x in 0u32..(1 << 21),
            y in 0u32..(1 << 21),
            z in 0u32..(1 << 21),
        ) {
            let pos = UVec3::new(x, y, z);
            let portable =
                split_by_3(x) | (split_by_3(y) << 1) | (split_by_3(z) << 2);
            prop_assert_eq!(interleave(pos), portable);
            let back = UVec3::new(
                extract_third_bits(portable),
                extract_third_bits(portable >> 1),
                extract_third_bits(portable >> 2),
            );
            prop_assert_eq!(deinterleave(portable), back);
        }
    }
}
