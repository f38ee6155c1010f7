//! Compact heightfield
//!
//! Only the walkable surfaces of the solid heightfield are kept: each span
//! describes the open space above a floor, and links to the spans an agent
//! can step to in the four axis directions.

use glam::Vec3;

use crate::context::BuildContext;
use crate::heightfield::{Heightfield, NULL_AREA, SPAN_MAX_HEIGHT};

/// Connection value of a span side with no walkable neighbour.
pub const NOT_CONNECTED: u8 = 0xff;

/// Highest neighbour layer index a connection can encode.
const MAX_LAYERS: usize = NOT_CONNECTED as usize - 1;

/// X offset of each direction.
const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
/// Z offset of each direction.
const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

/// Grid offset of direction `dir` (0..4).
#[inline]
pub fn dir_offset(dir: usize) -> (i32, i32) {
    (DIR_OFFSET_X[dir & 3], DIR_OFFSET_Z[dir & 3])
}

/// Direction of a unit axis offset.
#[inline]
pub fn dir_for_offset(dx: i32, dz: i32) -> usize {
    match (dx, dz) {
        (-1, 0) => 0,
        (0, 1) => 1,
        (1, 0) => 2,
        _ => 3,
    }
}

/// Span range of one grid column
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCell {
    /// Index of the first span of the column
    pub index: u32,
    /// Number of spans in the column
    pub count: u32,
}

/// Open space above a walkable floor
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSpan {
    /// Floor height, in cell heights
    pub y: u16,
    /// Region id (0 = none)
    pub reg: u16,
    /// Neighbour layer index per direction, or [`NOT_CONNECTED`]
    pub con: [u8; 4],
    /// Clearance above the floor, in cell heights
    pub h: u8,
}

impl CompactSpan {
    /// Neighbour layer index towards `dir`.
    #[inline]
    pub fn con(&self, dir: usize) -> Option<usize> {
        let c = self.con[dir];
        (c != NOT_CONNECTED).then_some(c as usize)
    }
}

/// Walkable spans with neighbour connectivity
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    pub width: i32,
    pub height: i32,
    pub span_count: usize,
    pub walkable_height: i32,
    pub walkable_climb: i32,
    /// Largest value in `dist`
    pub max_distance: u16,
    /// Number of regions; region ids run 1..=max_regions
    pub max_regions: u16,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub cells: Vec<CompactCell>,
    pub spans: Vec<CompactSpan>,
    /// Distance to the nearest border, filled by the distance field pass
    pub dist: Vec<u16>,
    /// Area id per span
    pub areas: Vec<u8>,
}

impl CompactHeightfield {
    /// Builds the compact representation of the walkable spans of `hf`.
    pub fn build(
        ctx: &mut BuildContext,
        walkable_height: i32,
        walkable_climb: i32,
        hf: &Heightfield,
    ) -> Self {
        let w = hf.width;
        let h = hf.height;
        let span_count = hf.walkable_span_count();

        let mut bmax = hf.bmax;
        bmax.y += walkable_height as f32 * hf.ch;

        let mut chf = Self {
            width: w,
            height: h,
            span_count,
            walkable_height,
            walkable_climb,
            max_distance: 0,
            max_regions: 0,
            bmin: hf.bmin,
            bmax,
            cs: hf.cs,
            ch: hf.ch,
            cells: vec![CompactCell::default(); (w * h) as usize],
            spans: Vec::with_capacity(span_count),
            dist: Vec::new(),
            areas: Vec::with_capacity(span_count),
        };

        for z in 0..h {
            for x in 0..w {
                let column = hf.column(x, z);
                let cell = &mut chf.cells[(x + z * w) as usize];
                cell.index = chf.spans.len() as u32;
                for (si, span) in column.iter().enumerate() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = column
                        .get(si + 1)
                        .map_or(SPAN_MAX_HEIGHT as i32, |n| n.smin as i32);
                    chf.spans.push(CompactSpan {
                        y: bot.clamp(0, 0xffff) as u16,
                        reg: 0,
                        con: [NOT_CONNECTED; 4],
                        h: (top - bot).clamp(0, 0xff) as u8,
                    });
                    chf.areas.push(span.area);
                    cell.count += 1;
                }
            }
        }

        let mut too_high_layer = 0usize;
        for z in 0..h {
            for x in 0..w {
                let cell = chf.cells[(x + z * w) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    for dir in 0..4 {
                        let (dx, dz) = dir_offset(dir);
                        let nx = x + dx;
                        let nz = z + dz;
                        if nx < 0 || nz < 0 || nx >= w || nz >= h {
                            continue;
                        }
                        let s = chf.spans[i];
                        let ncell = chf.cells[(nx + nz * w) as usize];
                        for k in ncell.index as usize..(ncell.index + ncell.count) as usize {
                            let ns = chf.spans[k];
                            let bot = s.y.max(ns.y) as i32;
                            let top = (s.y as i32 + s.h as i32).min(ns.y as i32 + ns.h as i32);
                            if top - bot >= walkable_height
                                && (ns.y as i32 - s.y as i32).abs() <= walkable_climb
                            {
                                let layer = k - ncell.index as usize;
                                if layer > MAX_LAYERS {
                                    too_high_layer = too_high_layer.max(layer);
                                    continue;
                                }
                                chf.spans[i].con[dir] = layer as u8;
                                break;
                            }
                        }
                    }
                }
            }
        }

        if too_high_layer > 0 {
            ctx.log_warning(format!(
                "compact heightfield has too many layers {too_high_layer} (max {MAX_LAYERS})"
            ));
        }
        chf
    }

    /// Spans of column (x, z) as an index range.
    #[inline]
    pub fn cell_spans(&self, x: i32, z: i32) -> std::ops::Range<usize> {
        let cell = self.cells[(x + z * self.width) as usize];
        cell.index as usize..(cell.index + cell.count) as usize
    }

    /// Neighbour of span `i` at (x, z) towards `dir`, as (nx, nz, span index).
    #[inline]
    pub fn neighbour(&self, x: i32, z: i32, i: usize, dir: usize) -> Option<(i32, i32, usize)> {
        let con = self.spans[i].con(dir)?;
        let (dx, dz) = dir_offset(dir);
        let nx = x + dx;
        let nz = z + dz;
        let cell = self.cells[(nx + nz * self.width) as usize];
        Some((nx, nz, cell.index as usize + con))
    }

    /// Number of spans with a walkable area.
    pub fn walkable_count(&self) -> usize {
        self.areas.iter().filter(|&&a| a != NULL_AREA).count()
    }

    /// World-space centre of cell (x, z) on the XZ plane.
    #[inline]
    pub fn cell_center(&self, x: i32, z: i32) -> Vec3 {
        Vec3::new(
            self.bmin.x + (x as f32 + 0.5) * self.cs,
            0.0,
            self.bmin.z + (z as f32 + 0.5) * self.cs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heightfield::WALKABLE_AREA;

    fn step_field() -> Heightfield {
        // Two floors: x < 2 at height 2, x >= 2 at height 4.
        let mut hf = Heightfield::new(4, 2, Vec3::ZERO, Vec3::new(4.0, 10.0, 2.0), 1.0, 0.5);
        for z in 0..2 {
            for x in 0..4 {
                let top = if x < 2 { 2 } else { 4 };
                hf.add_span(x, z, 0, top, WALKABLE_AREA, 1).unwrap();
            }
        }
        hf
    }

    #[test]
    fn test_connections_respect_climb() {
        let hf = step_field();
        let mut ctx = BuildContext::new();

        let chf = CompactHeightfield::build(&mut ctx, 3, 2, &hf);
        assert_eq!(chf.span_count, 8);
        let i = chf.cell_spans(1, 0).start;
        assert!(chf.neighbour(1, 0, i, 2).is_some());
        assert!(chf.neighbour(1, 0, i, 0).is_some());
        // Outside the grid.
        assert!(chf.spans[chf.cell_spans(0, 0).start].con(0).is_none());

        let steep = CompactHeightfield::build(&mut ctx, 3, 1, &hf);
        let i = steep.cell_spans(1, 0).start;
        assert!(steep.neighbour(1, 0, i, 2).is_none());
    }

    #[test]
    fn test_dir_offsets_round_trip() {
        for dir in 0..4 {
            let (dx, dz) = dir_offset(dir);
            assert_eq!(dir_for_offset(dx, dz), dir);
        }
    }

    #[test]
    fn test_empty_field_has_no_spans() {
        let hf = Heightfield::new(3, 3, Vec3::ZERO, Vec3::splat(3.0), 1.0, 1.0);
        let mut ctx = BuildContext::new();
        let chf = CompactHeightfield::build(&mut ctx, 2, 1, &hf);
        assert_eq!(chf.span_count, 0);
        assert_eq!(chf.walkable_count(), 0);
    }
}
