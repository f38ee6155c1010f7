//! Distance field used by watershed partitioning
//!
//! Each span gets its chamfer distance (in half cells) to the nearest region
//! boundary: a missing neighbour or a neighbour with a different area id.

use crate::compact_heightfield::CompactHeightfield;

/// Computes `chf.dist` and `chf.max_distance`.
pub fn build_distance_field(chf: &mut CompactHeightfield) {
    let src = calculate_distance_field(chf);
    chf.max_distance = src.iter().copied().max().unwrap_or(0);
    chf.dist = box_blur(chf, 1, &src);
}

fn calculate_distance_field(chf: &CompactHeightfield) -> Vec<u16> {
    let w = chf.width;
    let h = chf.height;
    let mut src = vec![0xffffu16; chf.span_count];

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let area = chf.areas[i];
                let same_area = (0..4)
                    .filter_map(|dir| chf.neighbour(x, z, i, dir))
                    .filter(|&(_, _, ai)| chf.areas[ai] == area)
                    .count();
                if same_area != 4 {
                    src[i] = 0;
                }
            }
        }
    }

    let relax = |src: &mut [u16], i: usize, from: usize, cost: u32| {
        let nd = src[from] as u32 + cost;
        if nd < src[i] as u32 {
            src[i] = nd as u16;
        }
    };

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 0) {
                    relax(&mut src, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 3) {
                        relax(&mut src, i, aai, 3);
                    }
                }
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 3) {
                    relax(&mut src, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 2) {
                        relax(&mut src, i, aai, 3);
                    }
                }
            }
        }
    }

    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell_spans(x, z) {
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 2) {
                    relax(&mut src, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 1) {
                        relax(&mut src, i, aai, 3);
                    }
                }
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 1) {
                    relax(&mut src, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 0) {
                        relax(&mut src, i, aai, 3);
                    }
                }
            }
        }
    }

    src
}

/// 3x3 box blur; spans at or below `threshold` cells keep their value.
fn box_blur(chf: &CompactHeightfield, threshold: u16, src: &[u16]) -> Vec<u16> {
    let threshold = threshold * 2;
    let mut dst = vec![0u16; src.len()];

    for z in 0..chf.height {
        for x in 0..chf.width {
            for i in chf.cell_spans(x, z) {
                let cd = src[i];
                if cd <= threshold {
                    dst[i] = cd;
                    continue;
                }
                let mut d = cd as u32;
                for dir in 0..4 {
                    match chf.neighbour(x, z, i, dir) {
                        Some((ax, az, ai)) => {
                            d += src[ai] as u32;
                            d += chf
                                .neighbour(ax, az, ai, (dir + 1) & 3)
                                .map_or(cd as u32, |(_, _, ai2)| src[ai2] as u32);
                        }
                        None => d += cd as u32 * 2,
                    }
                }
                dst[i] = ((d + 5) / 9) as u16;
            }
        }
    }
    dst
}
