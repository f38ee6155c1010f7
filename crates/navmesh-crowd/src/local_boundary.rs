//! Wall segments around an agent, collected for obstacle avoidance

use glam::Vec3;
use navmesh_common::{dist_pt_seg_sqr_2d, Result};
use navmesh_detour::{NavMeshQuery, PolyRef, QueryFilter};

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    s: [Vec3; 2],
    /// Squared distance from the boundary center, for pruning
    d: f32,
}

/// The nearest walls around a point, sorted closest first
#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: Vec3,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: Vec3::splat(f32::MAX),
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects the wall segments within `collision_query_range` of `pos`,
    /// searching the polygons around `reference`.
    pub fn update(
        &mut self,
        reference: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !reference.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = pos;
        self.segs.clear();
        self.polys = query.find_local_neighbourhood(reference, pos, collision_query_range, filter)?;
        self.polys.truncate(MAX_LOCAL_POLYS);

        let range_sqr = collision_query_range * collision_query_range;
        for &poly in &self.polys {
            for seg in query.get_poly_wall_segments(poly, filter)? {
                let (d, _) = dist_pt_seg_sqr_2d(pos, seg[0], seg[1]);
                if d > range_sqr {
                    continue;
                }
                insert_segment(&mut self.segs, Segment { s: seg, d });
            }
        }
        Ok(())
    }

    /// Checks that every polygon the boundary was collected from still
    /// exists and passes the filter.
    pub fn is_valid(&self, query: &NavMeshQuery, filter: &QueryFilter) -> bool {
        !self.polys.is_empty()
            && self
                .polys
                .iter()
                .all(|&r| query.is_valid_poly_ref(r, filter))
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, i: usize) -> Option<[Vec3; 2]> {
        self.segs.get(i).map(|seg| seg.s)
    }

    pub fn segments(&self) -> impl Iterator<Item = [Vec3; 2]> + '_ {
        self.segs.iter().map(|seg| seg.s)
    }
}

/// Inserts keeping the list sorted by distance; the furthest segment falls
/// off once the list is full.
fn insert_segment(segs: &mut Vec<Segment>, seg: Segment) {
    let at = segs.iter().position(|s| seg.d < s.d).unwrap_or(segs.len());
    if at >= MAX_LOCAL_SEGS {
        return;
    }
    segs.insert(at, seg);
    segs.truncate(MAX_LOCAL_SEGS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::create_grid_navmesh;

    #[test]
    fn test_insert_keeps_nearest() {
        let mut segs = Vec::new();
        for i in (0..12).rev() {
            insert_segment(
                &mut segs,
                Segment {
                    s: [Vec3::ZERO, Vec3::X],
                    d: i as f32,
                },
            );
        }
        assert_eq!(segs.len(), MAX_LOCAL_SEGS);
        let ds: Vec<f32> = segs.iter().map(|s| s.d).collect();
        assert_eq!(ds, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_boundary_near_corner() {
        let mesh = create_grid_navmesh(4, 1.0).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut boundary = LocalBoundary::new();
        assert!(!boundary.is_valid(&query, &filter));

        let pos = Vec3::new(0.5, 0.0, 0.5);
        boundary
            .update(PolyRef::from_index(0), pos, 1.0, &mut query, &filter)
            .unwrap();
        assert!(boundary.is_valid(&query, &filter));
        assert_eq!(boundary.center(), pos);
        // The west and south walls of the corner cell come first.
        assert!(boundary.segment_count() >= 2);
        for seg in boundary.segments().take(2) {
            let (d, _) = dist_pt_seg_sqr_2d(pos, seg[0], seg[1]);
            assert!((d - 0.25).abs() < 1e-4);
        }
    }

    #[test]
    fn test_boundary_in_open_middle() {
        let mesh = create_grid_navmesh(8, 1.0).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();
        boundary
            .update(
                PolyRef::from_index(4 * 8 + 4),
                Vec3::new(4.5, 0.0, 4.5),
                1.0,
                &mut query,
                &filter,
            )
            .unwrap();
        assert_eq!(boundary.segment_count(), 0);
    }
}
