//! Solid heightfield
//!
//! A grid of columns on the XZ plane. Each column holds the solid spans that
//! rasterized geometry occupies, sorted bottom to top and never overlapping.

use glam::Vec3;
use navmesh_common::{Error, Result};

/// Largest representable span height.
pub const SPAN_MAX_HEIGHT: u16 = (1 << 13) - 1;

/// Area id of spans that cannot be walked on.
pub const NULL_AREA: u8 = 0;

/// Default area id of walkable spans.
pub const WALKABLE_AREA: u8 = 63;

/// A solid span within a heightfield column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Lower extent of the span, in cell heights
    pub smin: u16,
    /// Upper extent of the span, in cell heights
    pub smax: u16,
    /// Area id assigned to the span
    pub area: u8,
}

/// Voxelized solid geometry
#[derive(Debug, Clone)]
pub struct Heightfield {
    /// Number of columns along x
    pub width: i32,
    /// Number of columns along z
    pub height: i32,
    /// Minimum bounds in world space
    pub bmin: Vec3,
    /// Maximum bounds in world space
    pub bmax: Vec3,
    /// Cell size on the XZ plane
    pub cs: f32,
    /// Cell height on the Y axis
    pub ch: f32,
    /// Spans per column, indexed by `x + z * width`
    pub columns: Vec<Vec<Span>>,
}

impl Heightfield {
    /// Creates an empty heightfield
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Self {
        let cells = (width.max(0) * height.max(0)) as usize;
        Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); cells],
        }
    }

    /// Column index of cell (x, z)
    #[inline]
    pub fn column_index(&self, x: i32, z: i32) -> usize {
        (x + z * self.width) as usize
    }

    /// Spans of cell (x, z)
    #[inline]
    pub fn column(&self, x: i32, z: i32) -> &[Span] {
        &self.columns[self.column_index(x, z)]
    }

    /// Adds a span to column (x, z), merging it with any span it overlaps.
    ///
    /// When the tops of two merged spans are within `flag_merge_threshold`,
    /// the merged span keeps the larger area id.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Err(Error::InvalidInput(format!(
                "span column ({x}, {z}) outside {}x{} heightfield",
                self.width, self.height
            )));
        }
        if smin > smax {
            return Err(Error::InvalidInput(format!(
                "span minimum {smin} above maximum {smax}"
            )));
        }

        let idx = self.column_index(x, z);
        let column = &mut self.columns[idx];
        let mut new_span = Span { smin, smax, area };

        let mut i = 0;
        while i < column.len() {
            let cur = column[i];
            if cur.smin > new_span.smax {
                break;
            }
            if cur.smax < new_span.smin {
                i += 1;
                continue;
            }
            if cur.smin < new_span.smin {
                new_span.smin = cur.smin;
            }
            if cur.smax > new_span.smax {
                new_span.smax = cur.smax;
            }
            if (new_span.smax as i32 - cur.smax as i32).abs() <= flag_merge_threshold {
                new_span.area = new_span.area.max(cur.area);
            }
            column.remove(i);
        }
        column.insert(i, new_span);
        Ok(())
    }

    /// Total number of spans
    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Number of spans carrying a walkable area
    pub fn walkable_span_count(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .filter(|s| s.area != NULL_AREA)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Heightfield {
        Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 1.0)
    }

    #[test]
    fn test_heightfield_creation() {
        let hf = field();
        assert_eq!(hf.columns.len(), 16);
        assert_eq!(hf.span_count(), 0);
    }

    #[test]
    fn test_spans_stay_sorted_and_disjoint() {
        let mut hf = field();
        hf.add_span(1, 1, 10, 12, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 1, 2, 4, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 1, 6, 7, NULL_AREA, 1).unwrap();
        let col = hf.column(1, 1);
        assert_eq!(col.len(), 3);
        assert!(col.windows(2).all(|w| w[0].smax < w[1].smin));
    }

    #[test]
    fn test_overlapping_spans_merge() {
        let mut hf = field();
        hf.add_span(0, 0, 2, 5, NULL_AREA, 1).unwrap();
        hf.add_span(0, 0, 4, 6, WALKABLE_AREA, 1).unwrap();
        hf.add_span(0, 0, 1, 3, NULL_AREA, 1).unwrap();
        let col = hf.column(0, 0);
        assert_eq!(col.len(), 1);
        assert_eq!((col[0].smin, col[0].smax), (1, 6));
        assert_eq!(col[0].area, WALKABLE_AREA);
    }

    #[test]
    fn test_merge_threshold_controls_area() {
        let mut hf = field();
        hf.add_span(2, 2, 0, 10, WALKABLE_AREA, 1).unwrap();
        // Top is far above the walkable top, so the walkable flag is lost.
        hf.add_span(2, 2, 5, 20, NULL_AREA, 1).unwrap();
        assert_eq!(hf.column(2, 2)[0].area, NULL_AREA);
    }

    #[test]
    fn test_add_span_out_of_bounds() {
        let mut hf = field();
        assert!(hf.add_span(4, 0, 0, 1, 1, 1).is_err());
        assert!(hf.add_span(0, 0, 3, 1, 1, 1).is_err());
    }
}
