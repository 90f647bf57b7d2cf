//! The on-disk frame: fixed header, pre-order tree-structure prefix,
//! payload region. Compression of the payload region is delegated
//! through [`Codec`]; the core only frames it.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! magic "UFO" | version u8 | leaf_size f64 | depth_levels u8 |
//! compressed u8 | reserved [u8; 2]                       -- 16 bytes
//! prefix_len u64 | prefix bytes                          -- structure
//! payload_count u64
//! payload region                                         -- plain, or
//! uncompressed_size u64 | compressed_size u64 | bytes    -- via codec
//! ```
//!
//! The prefix describes, per visited block in pre-order, which slots
//! are returned (carry a payload record) and which are inner (have
//! deeper structure): two bitfield bytes for inner blocks, a single
//! returned byte for depth-1 blocks. The root contributes its own
//! saturated pair first. Slots that are neither returned nor inner are
//! leaves inheriting the parent's payload.

use std::io::{Read, Write};

use arrayvec::ArrayVec;

use crate::geometry::Aabb;
use crate::octree::{
    create_inner_children, create_leaf_children, Child, Ctx, InnerBlock, NodeRef, OctreeCore,
    MAX_DEPTH_LEVELS, MIN_DEPTH_LEVELS,
};
use crate::predicate::Predicate;
use crate::{Code, Error, Payload};

/// A compressor for the payload region. Opaque to the core: any scheme
/// works as long as `decompress(compress(x)) == x`.
pub trait Codec {
    fn compress(&self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error>;

    fn decompress(
        &self,
        data: &[u8],
        uncompressed_size: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), Error>;
}

const MAGIC: &[u8; 3] = b"UFO";
const VERSION: u8 = 1;

struct Header {
    leaf_size: f64,
    depth_levels: u8,
    compressed: bool,
}

fn write_header<W: Write>(out: &mut W, header: &Header) -> Result<(), Error> {
    out.write_all(MAGIC)?;
    out.write_all(&[VERSION])?;
    out.write_all(&header.leaf_size.to_le_bytes())?;
    out.write_all(&[header.depth_levels, header.compressed as u8, 0, 0])?;
    Ok(())
}

fn read_header<R: Read>(input: &mut R) -> Result<Header, Error> {
    let mut buf = [0u8; 16];
    input.read_exact(&mut buf)?;
    if &buf[0..3] != MAGIC {
        return Err(Error::Format("header magic mismatch"));
    }
    if buf[3] != VERSION {
        return Err(Error::Format("unsupported format version"));
    }
    Ok(Header {
        leaf_size: f64::from_le_bytes(buf[4..12].try_into().unwrap()),
        depth_levels: buf[12],
        compressed: buf[13] != 0,
    })
}

fn take_byte(cursor: &mut &[u8]) -> Result<u8, Error> {
    let (&first, rest) = cursor
        .split_first()
        .ok_or(Error::Format("structure prefix truncated"))?;
    *cursor = rest;
    Ok(first)
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl<P: Payload> OctreeCore<P> {
    /// Serialize the nodes selected by `predicate` into `out`. Returned
    /// nodes are the selected leaves, or whole subtrees summarised at
    /// `min_depth`. With a codec the payload region is compressed.
    pub fn write<W, Pred>(
        &self,
        out: &mut W,
        predicate: Pred,
        min_depth: u8,
        codec: Option<&dyn Codec>,
    ) -> Result<(), Error>
    where
        W: Write,
        Pred: Predicate<P::Value>,
    {
        write_header(
            out,
            &Header {
                leaf_size: self.leaf_size(),
                depth_levels: self.depth_levels(),
                compressed: codec.is_some(),
            },
        )?;

        let mut prefix: Vec<u8> = Vec::new();
        let mut payloads: Vec<u8> = Vec::new();
        let mut count: u64 = 0;

        let root = self.root();
        let valid_return = returnable(&predicate, min_depth, &root);
        let valid_inner = !valid_return && descendable(&predicate, min_depth, &root);
        prefix.push(if valid_return { 0xFF } else { 0 });
        prefix.push(if valid_inner { 0xFF } else { 0 });

        if valid_return {
            self.payload().write_value(root.value(), &mut payloads);
            count = 1;
        } else if valid_inner {
            write_recurs(
                self,
                &predicate,
                min_depth,
                root.code(),
                root.aabb(),
                self.root_block().children[0]
                    .as_ref()
                    .expect("non-leaf root without children"),
                &mut prefix,
                &mut payloads,
                &mut count,
            );
            if count == 0 {
                prefix.clear();
            }
        }

        out.write_all(&(prefix.len() as u64).to_le_bytes())?;
        out.write_all(&prefix)?;
        out.write_all(&count.to_le_bytes())?;

        match codec {
            None => out.write_all(&payloads)?,
            Some(codec) => {
                let mut compressed = Vec::new();
                codec.compress(&payloads, &mut compressed)?;
                out.write_all(&(payloads.len() as u64).to_le_bytes())?;
                out.write_all(&(compressed.len() as u64).to_le_bytes())?;
                out.write_all(&compressed)?;
            }
        }
        Ok(())
    }

    /// Reconstruct nodes from `input`, merging into this map. A
    /// geometry mismatch clears the map to the stored geometry first.
    /// Read slots are marked modified; `propagate` settles the
    /// aggregates before returning.
    pub fn read<R: Read>(
        &mut self,
        input: &mut R,
        codec: Option<&dyn Codec>,
        propagate: bool,
    ) -> Result<(), Error> {
        let header = read_header(input)?;
        if !(MIN_DEPTH_LEVELS..=MAX_DEPTH_LEVELS).contains(&header.depth_levels) {
            return Err(Error::Format("depth levels out of range"));
        }
        if header.leaf_size != self.leaf_size() || header.depth_levels != self.depth_levels() {
            self.clear(header.leaf_size, header.depth_levels, false)?;
        }

        let prefix_len = read_u64(input)?;
        let mut prefix = vec![0u8; prefix_len as usize];
        input.read_exact(&mut prefix)?;

        let count = read_u64(input)?;
        let payload_size = count
            .checked_mul(self.payload().serialized_size() as u64)
            .ok_or(Error::Format("payload count overflow"))? as usize;

        let payloads: Vec<u8> = if header.compressed {
            let codec = codec.ok_or(Error::Format("compressed data but no codec supplied"))?;
            let uncompressed_size = read_u64(input)?;
            if uncompressed_size as usize != payload_size {
                return Err(Error::Format("payload region size mismatch"));
            }
            let compressed_size = read_u64(input)?;
            let mut compressed = vec![0u8; compressed_size as usize];
            input.read_exact(&mut compressed)?;
            let mut data = Vec::new();
            codec.decompress(&compressed, uncompressed_size, &mut data)?;
            if data.len() != payload_size {
                return Err(Error::Format("payload region size mismatch"));
            }
            data
        } else {
            let mut data = vec![0u8; payload_size];
            input.read_exact(&mut data)?;
            data
        };

        if prefix_len == 0 {
            if count != 0 {
                return Err(Error::Format("payloads without structure"));
            }
            return Ok(());
        }

        let mut prefix_cursor: &[u8] = &prefix;
        let mut payload_cursor: &[u8] = &payloads;

        let root_return = take_byte(&mut prefix_cursor)?;
        let root_inner = take_byte(&mut prefix_cursor)?;

        let root_depth = self.root_depth();
        let ctx = Ctx {
            payload: &self.payload,
            pool: &self.pool,
            lock_mode: self.lock_mode,
            depth_locks: &self.depth_locks,
            automatic_prune: self.automatic_prune,
        };
        if root_return != 0 {
            self.root.values[0] = ctx.payload.read_value(&mut payload_cursor)?;
            self.root.set_modified(0, true);
        } else if root_inner != 0 {
            read_recurs(
                &ctx,
                &mut self.root,
                0,
                root_depth,
                &mut prefix_cursor,
                &mut payload_cursor,
            )?;
        }

        if !prefix_cursor.is_empty() {
            return Err(Error::Format("trailing structure prefix entries"));
        }
        if !payload_cursor.is_empty() {
            return Err(Error::Format("structure prefix inconsistent with payload count"));
        }

        if propagate {
            self.propagate();
        }
        Ok(())
    }
}

fn returnable<V, Pred: Predicate<V>>(
    predicate: &Pred,
    min_depth: u8,
    node: &NodeRef<'_, V>,
) -> bool {
    (node.is_leaf() || node.depth() == min_depth) && predicate.value_check(node)
}

fn descendable<V, Pred: Predicate<V>>(
    predicate: &Pred,
    min_depth: u8,
    node: &NodeRef<'_, V>,
) -> bool {
    !node.is_leaf() && node.depth() > min_depth && predicate.inner_check(node)
}

/// Emit the structure entry for `children`, the child block of the node
/// at `code`, then recurse into its descendable slots. A subtree
/// contributing no payload collapses back to an empty marker.
#[allow(clippy::too_many_arguments)]
fn write_recurs<P: Payload, Pred: Predicate<P::Value>>(
    tree: &OctreeCore<P>,
    predicate: &Pred,
    min_depth: u8,
    code: Code,
    aabb: Aabb,
    children: &Child<P::Value>,
    prefix: &mut Vec<u8>,
    payloads: &mut Vec<u8>,
    count: &mut u64,
) {
    let entry_prefix_len = prefix.len();
    let entry_count = *count;

    match children {
        Child::Leaf(leaf) => {
            let mut returned: u8 = 0;
            let mut slots: ArrayVec<usize, 8> = ArrayVec::new();
            for slot in 0..8 {
                let child = NodeRef {
                    value: &leaf.values[slot],
                    code: code.child(slot).expect("leaf block above depth 0"),
                    aabb: aabb.octant(slot),
                    is_leaf: true,
                    modified: leaf.is_modified(slot),
                };
                if predicate.value_check(&child) {
                    returned |= 1 << slot;
                    slots.push(slot);
                }
            }
            prefix.push(returned);
            for slot in slots {
                tree.payload().write_value(&leaf.values[slot], payloads);
                *count += 1;
            }
        }
        Child::Inner(inner) => {
            let mut returned: u8 = 0;
            let mut deeper: u8 = 0;
            for slot in 0..8 {
                let child = NodeRef {
                    value: &inner.values[slot],
                    code: code.child(slot).expect("inner block above depth 0"),
                    aabb: aabb.octant(slot),
                    is_leaf: inner.is_leaf(slot),
                    modified: inner.is_modified(slot),
                };
                if returnable(predicate, min_depth, &child) {
                    returned |= 1 << slot;
                } else if descendable(predicate, min_depth, &child) {
                    deeper |= 1 << slot;
                }
            }
            prefix.push(returned);
            prefix.push(deeper);

            for slot in 0..8 {
                if returned >> slot & 1 != 0 {
                    tree.payload().write_value(&inner.values[slot], payloads);
                    *count += 1;
                } else if deeper >> slot & 1 != 0 {
                    write_recurs(
                        tree,
                        predicate,
                        min_depth,
                        code.child(slot).expect("inner block above depth 0"),
                        aabb.octant(slot),
                        inner.children[slot]
                            .as_ref()
                            .expect("non-leaf slot without children"),
                        prefix,
                        payloads,
                        count,
                    );
                }
            }

            if *count == entry_count {
                prefix.truncate(entry_prefix_len);
                prefix.push(0);
                prefix.push(0);
            }
        }
    }
}

/// Rebuild the child block of the node `(block, idx)` at `depth` from
/// the structure prefix, filling returned slots from the payload
/// cursor.
fn read_recurs<P: Payload>(
    ctx: &Ctx<'_, P>,
    block: &mut InnerBlock<P::Value>,
    idx: usize,
    depth: u8,
    prefix: &mut &[u8],
    payloads: &mut &[u8],
) -> Result<(), Error> {
    if depth == 1 {
        let returned = take_byte(prefix)?;
        if returned != 0 {
            create_leaf_children(ctx, block, idx, depth);
            let leaf = block.leaf_child_mut(idx);
            for slot in 0..8 {
                if returned >> slot & 1 != 0 {
                    leaf.values[slot] = ctx.payload.read_value(payloads)?;
                    leaf.set_modified(slot, true);
                }
            }
            block.set_modified(idx, true);
        }
        return Ok(());
    }

    let returned = take_byte(prefix)?;
    let deeper = take_byte(prefix)?;
    if returned == 0 && deeper == 0 {
        return Ok(());
    }

    create_inner_children(ctx, block, idx, depth);
    let inner = block.inner_child_mut(idx);
    for slot in 0..8 {
        if returned >> slot & 1 != 0 {
            inner.values[slot] = ctx.payload.read_value(payloads)?;
            inner.set_modified(slot, true);
        } else if deeper >> slot & 1 != 0 {
            read_recurs(ctx, inner, slot, depth - 1, prefix, payloads)?;
        }
    }
    block.set_modified(idx, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use rand::{Rng, SeedableRng};

    use crate::occupancy::{OccupancyMap, OccupancyState};
    use crate::predicate::Leaf;

    /// Identity codec: tests the compression framing without dragging
    /// in a real compressor.
    struct Passthrough;

    impl Codec for Passthrough {
        fn compress(&self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
            out.extend_from_slice(data);
            Ok(())
        }

        fn decompress(
            &self,
            data: &[u8],
            _uncompressed_size: u64,
            out: &mut Vec<u8>,
        ) -> Result<(), Error> {
            out.extend_from_slice(data);
            Ok(())
        }
    }

    fn leaf_snapshot(map: &OccupancyMap) -> Vec<(u64, u8, u32)> {
        let mut nodes: Vec<(u64, u8, u32)> = map
            .query((Leaf,))
            .map(|n| (n.code().raw(), n.depth(), n.value().logit().to_bits()))
            .collect();
        nodes.sort_unstable();
        nodes
    }

    #[test]
    fn round_trip_random_points() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        for _ in 0..10_000 {
            let p = DVec3::new(
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
            );
            map.insert_point(p, rng.gen_bool(0.5)).unwrap();
        }
        map.propagate();

        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, None).unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored.read(&mut buffer.as_slice(), None, true).unwrap();

        assert_eq!(leaf_snapshot(&map), leaf_snapshot(&restored));
        assert_eq!(map.num_nodes(), restored.num_nodes());
    }

    #[test]
    fn round_trip_empty_map() {
        let map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, None).unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored.read(&mut buffer.as_slice(), None, true).unwrap();
        assert_eq!(restored.num_nodes(), 1);
        assert_eq!(leaf_snapshot(&map), leaf_snapshot(&restored));
    }

    #[test]
    fn round_trip_compressed() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        for i in 0..50 {
            let p = DVec3::new(i as f64 * 0.3 - 7.0, 0.5, -0.5);
            map.insert_point(p, true).unwrap();
        }
        map.propagate();

        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, Some(&Passthrough)).unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored
            .read(&mut buffer.as_slice(), Some(&Passthrough), true)
            .unwrap();
        assert_eq!(leaf_snapshot(&map), leaf_snapshot(&restored));

        // The same stream without a codec is rejected.
        let mut naked = OccupancyMap::with_resolution(0.1, 16).unwrap();
        assert!(matches!(
            naked.read(&mut buffer.as_slice(), None, true),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn read_adopts_stored_geometry() {
        let mut map = OccupancyMap::with_resolution(0.25, 14).unwrap();
        map.insert_point(DVec3::new(1.0, 1.0, 1.0), true).unwrap();
        map.propagate();
        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, None).unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored.read(&mut buffer.as_slice(), None, true).unwrap();
        assert_eq!(restored.depth_levels(), 14);
        assert!((restored.leaf_size() - 0.25).abs() < 1e-12);
        assert_eq!(leaf_snapshot(&map), leaf_snapshot(&restored));
    }

    #[test]
    fn predicate_filters_written_nodes() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        let occupied = DVec3::new(1.0, 1.0, 1.0);
        let free = DVec3::new(-2.0, -2.0, -2.0);
        map.insert_point(occupied, true).unwrap();
        map.insert_point(free, false).unwrap();
        map.propagate();

        let mut buffer = Vec::new();
        map.write(
            &mut buffer,
            map.occupancy_is(OccupancyState::Occupied),
            0,
            None,
        )
        .unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored.read(&mut buffer.as_slice(), None, true).unwrap();

        let occupied_code = restored.to_code(occupied, 0).unwrap();
        assert!(restored.is_occupied(occupied_code).unwrap());
        // The free observation was filtered out.
        let free_code = restored.to_code(free, 0).unwrap();
        assert!(restored.is_unknown(free_code).unwrap());
    }

    #[test]
    fn min_depth_summarises_subtrees() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        map.insert_point(DVec3::new(1.0, 1.0, 1.0), true).unwrap();
        map.propagate();

        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 3, None).unwrap();

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        restored.read(&mut buffer.as_slice(), None, true).unwrap();

        // Nothing below depth 3 was stored.
        let code = restored.to_code(DVec3::new(1.0, 1.0, 1.0), 0).unwrap();
        let node = restored.find(code).unwrap();
        assert!(node.depth() >= 3);
        // The summarised aggregate still classifies as occupied.
        assert!(restored.is_occupied(code).unwrap());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, None).unwrap();
        buffer[0] = b'X';
        assert!(matches!(
            map.read(&mut buffer.as_slice(), None, true),
            Err(Error::Format("header magic mismatch"))
        ));
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let mut map = OccupancyMap::with_resolution(0.1, 16).unwrap();
        map.insert_point(DVec3::new(1.0, 1.0, 1.0), true).unwrap();
        map.propagate();
        let mut buffer = Vec::new();
        map.write(&mut buffer, (), 0, None).unwrap();
        buffer.truncate(buffer.len() - 3);

        let mut restored = OccupancyMap::with_resolution(0.1, 16).unwrap();
        assert!(matches!(
            restored.read(&mut buffer.as_slice(), None, true),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn merge_into_existing_map() {
        let mut a = OccupancyMap::with_resolution(0.1, 16).unwrap();
        a.insert_point(DVec3::new(1.0, 1.0, 1.0), true).unwrap();
        a.propagate();
        let mut buffer = Vec::new();
        a.write(&mut buffer, (), 0, None).unwrap();

        // Same geometry: reading merges instead of clearing.
        let mut b = OccupancyMap::with_resolution(0.1, 16).unwrap();
        b.insert_point(DVec3::new(-1.0, -1.0, -1.0), true).unwrap();
        b.propagate();
        b.read(&mut buffer.as_slice(), None, true).unwrap();

        assert!(b
            .is_occupied(b.to_code(DVec3::new(1.0, 1.0, 1.0), 0).unwrap())
            .unwrap());
        assert!(b
            .is_occupied(b.to_code(DVec3::new(-1.0, -1.0, -1.0), 0).unwrap())
            .unwrap());
    }
}
