//! Chebyshev rings around a lattice cell.

use crate::geometry::BlockPos;

/// Number of cells on ring `k`.
pub fn ring_size(k: u32) -> usize {
    if k == 0 {
        1
    } else {
        8 * k as usize
    }
}

/// Cells at horizontal Chebyshev distance exactly `k` from `center`, at the
/// center's height.
///
/// Order: north edge (`z = cz - k`) with increasing x, east edge
/// (`x = cx + k`) with increasing z, south edge (`z = cz + k`) with
/// decreasing x, west edge (`x = cx - k`) with decreasing z. Corners belong
/// to the edge that reaches them first.
pub fn ring(center: BlockPos, k: u32) -> Vec<BlockPos> {
    if k == 0 {
        return vec![center];
    }
    let (cx, y, cz) = (center.x, center.y, center.z);
    let k = i32::try_from(k).unwrap_or(i32::MAX);
    // Edges clip at the i32 boundary instead of wrapping.
    let (x0, x1) = (cx.saturating_sub(k), cx.saturating_add(k));
    let (z0, z1) = (cz.saturating_sub(k), cz.saturating_add(k));
    let mut out = Vec::with_capacity(ring_size(k as u32));

    for x in x0..=x1 {
        out.push(BlockPos::new(x, y, z0));
    }
    for z in (z0 + 1)..=z1 {
        out.push(BlockPos::new(x1, y, z));
    }
    for x in (x0..x1).rev() {
        out.push(BlockPos::new(x, y, z1));
    }
    for z in ((z0 + 1)..z1).rev() {
        out.push(BlockPos::new(x0, y, z));
    }
    out
}

/// Every ring from 0 to `radius` inclusive, tagged with its index.
pub fn rings(center: BlockPos, radius: u32) -> impl Iterator<Item = (u32, BlockPos)> {
    (0..=radius).flat_map(move |k| ring(center, k).into_iter().map(move |cell| (k, cell)))
}
