//! Path corridor
//!
//! A corridor is the polygon path an agent follows, together with the
//! agent's current position (always inside the first polygon) and its
//! target (inside the last polygon). Movement trims and extends the path
//! locally instead of re-running a full search every frame.

use glam::Vec3;
use navmesh_common::{dist_2d, dist_2d_sqr, Error, Result};
use navmesh_detour::{
    NavMeshQuery, PolyRef, QueryFilter, StraightPathFlags, StraightPathOptions, StraightPathPoint,
};

/// Maximum number of polygons in a path corridor
pub const MAX_PATH_POLYS: usize = 256;

/// Corners closer than this to the agent are dropped.
const MIN_TARGET_DIST: f32 = 0.01;

/// Search budget of a topology optimisation.
const MAX_TOPOLOGY_ITERATIONS: usize = 32;

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position in the corridor
    pos: Vec3,
    /// Target position in the corridor
    target: Vec3,
    /// Path polygon references
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new(MAX_PATH_POLYS)
    }
}

impl PathCorridor {
    /// Creates an empty corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::with_capacity(max_path),
            max_path: max_path.max(1),
        }
    }

    /// Resets the corridor to a single polygon; position and target both
    /// become `pos`.
    pub fn reset(&mut self, reference: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if reference.is_valid() {
            self.path.push(reference);
        }
    }

    /// Corners of the straight path through the corridor, at most
    /// `max_corners` of them.
    ///
    /// Corners too close to the current position are dropped, and the list
    /// stops after the first off-mesh connection start.
    pub fn find_corners(
        &self,
        max_corners: usize,
        query: &NavMeshQuery,
    ) -> Result<Vec<StraightPathPoint>> {
        if self.path.is_empty() || max_corners == 0 {
            return Ok(Vec::new());
        }

        // One extra point for the start, which is always pruned.
        let mut corners = query.find_straight_path(
            self.pos,
            self.target,
            &self.path,
            StraightPathOptions::empty(),
            max_corners + 1,
        )?;

        let skip = corners
            .iter()
            .take_while(|c| {
                !c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    && dist_2d_sqr(c.pos, self.pos) <= MIN_TARGET_DIST * MIN_TARGET_DIST
            })
            .count();
        corners.drain(..skip);

        if let Some(i) = corners
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.truncate(i + 1);
        }
        corners.truncate(max_corners);
        Ok(corners)
    }

    /// Shortcuts the start of the corridor when `next` is directly visible
    /// from the current position.
    ///
    /// The visibility ray is cast up to `path_optimization_range`; the
    /// corridor is only changed when the ray reaches its end unobstructed.
    pub fn optimize_path_visibility(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let Some(&first) = self.path.first() else {
            return Ok(());
        };

        let dist = dist_2d(self.pos, next);
        if dist < 0.01 {
            return Ok(());
        }
        // Overshoot a little so open fields collapse to a straight line.
        let dist = (dist + 0.01).min(path_optimization_range);
        let goal = self.pos + (next - self.pos) * (path_optimization_range / dist);

        let hit = query.raycast(first, self.pos, goal, filter)?;
        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }
        Ok(())
    }

    /// Replans the corridor start with a small bounded search.
    ///
    /// Returns true when the corridor changed.
    pub fn optimize_path_topology(
        &mut self,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        if self.path.len() < 3 {
            return Ok(false);
        }
        let (first, last) = (self.path[0], self.path[self.path.len() - 1]);
        let result = query.find_path_bounded(
            first,
            last,
            self.pos,
            self.target,
            filter,
            MAX_TOPOLOGY_ITERATIONS,
        )?;
        if result.path.is_empty() {
            return Ok(false);
        }
        let before = self.path.clone();
        merge_corridor_start_shortcut(&mut self.path, self.max_path, &result.path);
        Ok(before != self.path)
    }

    /// Advances the corridor past the off-mesh connection `con_ref`.
    ///
    /// Returns the polygon the connection was entered from, together with
    /// the connection's entry and exit points. The position moves to the
    /// exit point.
    pub fn move_over_off_mesh_connection(
        &mut self,
        con_ref: PolyRef,
        query: &NavMeshQuery,
    ) -> Result<(PolyRef, Vec3, Vec3)> {
        let Some(idx) = self.path.iter().position(|&r| r == con_ref) else {
            return Err(Error::StaleReference(format!(
                "off-mesh connection {} is not in the corridor",
                con_ref.id()
            )));
        };
        let prev_ref = if idx > 0 {
            self.path[idx - 1]
        } else {
            PolyRef::NULL
        };

        let (start, end) = query
            .nav_mesh()
            .off_mesh_connection_endpoints(prev_ref, con_ref)?;
        self.path.drain(..=idx);
        self.pos = end;
        Ok((prev_ref, start, end))
    }

    /// Moves the position towards `npos` along the surface, keeping the
    /// corridor consistent with the polygons crossed.
    pub fn move_position(
        &mut self,
        npos: Vec3,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let Some(&first) = self.path.first() else {
            return Err(Error::StaleReference("empty corridor".to_string()));
        };
        let (mut result, visited) = query.move_along_surface(first, self.pos, npos, filter)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        if let Some(&first) = self.path.first() {
            if let Some(h) = query.get_poly_height(first, result)? {
                result.y = h;
            }
        }
        self.pos = result;
        Ok(())
    }

    /// Moves the target towards `npos` along the surface, extending the end
    /// of the corridor.
    pub fn move_target_position(
        &mut self,
        npos: Vec3,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let Some(&last) = self.path.last() else {
            return Err(Error::StaleReference("empty corridor".to_string()));
        };
        let (result, visited) = query.move_along_surface(last, self.target, npos, filter)?;
        merge_corridor_end_moved(&mut self.path, self.max_path, &visited);
        self.target = result;
        Ok(())
    }

    /// Loads a new path and target into the corridor
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path
            .extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    /// Restarts the corridor from a known-safe polygon and position.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        self.path.clear();
        self.path.push(safe_ref);
    }

    /// Cuts the corridor at the first polygon that is no longer valid.
    ///
    /// When even the first polygon is invalid the corridor restarts from
    /// `safe_ref`. The target is clamped onto the new last polygon.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let valid = self
            .path
            .iter()
            .take_while(|&&r| query.is_valid_poly_ref(r, filter))
            .count();
        if valid == 0 {
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(valid);
        }

        if let Some(&last) = self.path.last() {
            self.target = query.closest_point_on_poly_boundary(last, self.target)?;
        }
        Ok(())
    }

    /// Checks the first `max_look_ahead` polygons against the mesh and the
    /// filter.
    pub fn is_valid(&self, max_look_ahead: usize, query: &NavMeshQuery, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&r| query.is_valid_poly_ref(r, filter))
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    /// First polygon, the one containing the position
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    /// Last polygon, the one containing the target
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}

/// Furthest polygon of `path` that also appears in `visited`, with the
/// earliest matching index in `visited`.
fn furthest_common(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, r)| visited.iter().position(|v| v == r).map(|j| (i, j)))
}

/// Merges the polygons visited by a move of the corridor start.
///
/// The visited polygons, newest first, replace everything up to the
/// furthest polygon the two lists share.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((fp, fv)) = furthest_common(path, visited) else {
        return;
    };
    let mut merged: Vec<PolyRef> = visited[fv..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[fp + 1..]);
    merged.truncate(max_path);
    *path = merged;
}

/// Merges the polygons visited by a move of the corridor end.
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let common = path
        .iter()
        .enumerate()
        .find_map(|(i, r)| visited.iter().position(|v| v == r).map(|j| (i, j)));
    let Some((fp, fv)) = common else {
        return;
    };
    path.truncate(fp + 1);
    path.extend_from_slice(&visited[fv + 1..]);
    path.truncate(max_path);
}

/// Merges a shortcut found from the corridor start (a raycast or a
/// local search) into the corridor.
pub fn merge_corridor_start_shortcut(
    path: &mut Vec<PolyRef>,
    max_path: usize,
    visited: &[PolyRef],
) {
    let Some((fp, fv)) = furthest_common(path, visited) else {
        return;
    };
    if fv == 0 {
        return;
    }
    let mut merged = visited[..fv].to_vec();
    merged.extend_from_slice(&path[fp..]);
    merged.truncate(max_path);
    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::create_grid_navmesh;

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&i| PolyRef::new(i)).collect()
    }

    #[test]
    fn test_reset_corridor() {
        let mut corridor = PathCorridor::default();
        assert_eq!(corridor.path_count(), 0);
        assert_eq!(corridor.first_poly(), PolyRef::NULL);

        let start_pos = Vec3::new(10.0, 5.0, 10.0);
        corridor.reset(PolyRef::new(42), start_pos);
        assert_eq!(corridor.pos(), start_pos);
        assert_eq!(corridor.target(), start_pos);
        assert_eq!(corridor.path(), &[PolyRef::new(42)]);
    }

    #[test]
    fn test_merge_start_moved() {
        // Moved forward into the second polygon.
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[1, 2]));
        assert_eq!(path, refs(&[2, 3]));

        // Stepped sideways off the corridor.
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[1, 9]));
        assert_eq!(path, refs(&[9, 1, 2, 3]));

        // Nothing in common leaves the path alone.
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[7, 8]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_merge_end_moved_and_shortcut() {
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_end_moved(&mut path, 256, &refs(&[3, 4, 5]));
        assert_eq!(path, refs(&[1, 2, 3, 4, 5]));

        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_shortcut(&mut path, 256, &refs(&[1, 6, 4]));
        assert_eq!(path, refs(&[1, 6, 4, 5]));

        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 2, &refs(&[1, 9]));
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_corners_and_movement_on_grid() {
        let mesh = create_grid_navmesh(4, 1.0).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let start = Vec3::new(0.5, 0.0, 0.5);
        let goal = Vec3::new(3.5, 0.0, 0.5);
        let start_ref = PolyRef::from_index(0);
        let goal_ref = PolyRef::from_index(3);
        let path = query
            .find_path(start_ref, goal_ref, start, goal, &filter)
            .unwrap();

        let mut corridor = PathCorridor::default();
        corridor.reset(start_ref, start);
        corridor.set_corridor(goal, &path);
        assert_eq!(corridor.first_poly(), start_ref);
        assert_eq!(corridor.last_poly(), goal_ref);
        assert!(corridor.is_valid(8, &query, &filter));

        // Straight row: the only corner is the goal itself.
        let corners = corridor.find_corners(4, &query).unwrap();
        assert_eq!(corners.len(), 1);
        assert!((corners[0].pos - goal).length() < 1e-4);
        assert!(corners[0].flags.contains(StraightPathFlags::END));

        corridor
            .move_position(Vec3::new(1.5, 0.0, 0.5), &mut query, &filter)
            .unwrap();
        assert!((corridor.pos() - Vec3::new(1.5, 0.0, 0.5)).length() < 1e-4);
        assert_eq!(corridor.first_poly(), PolyRef::from_index(1));
        assert_eq!(corridor.last_poly(), goal_ref);
    }

    #[test]
    fn test_visibility_shortcut() {
        let mesh = create_grid_navmesh(4, 1.0).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        // Up into the second row, across, and back down.
        let start = Vec3::new(0.5, 0.0, 0.5);
        let goal = Vec3::new(3.5, 0.0, 0.5);
        let mut corridor = PathCorridor::default();
        corridor.reset(PolyRef::from_index(0), start);
        let detour: Vec<PolyRef> = [0, 4, 5, 6, 7, 3]
            .iter()
            .map(|&i| PolyRef::from_index(i))
            .collect();
        corridor.set_corridor(goal, &detour);

        // A ray longer than the grid hits the wall: nothing changes.
        corridor
            .optimize_path_visibility(goal, 30.0, &query, &filter)
            .unwrap();
        assert_eq!(corridor.path(), detour.as_slice());

        corridor
            .optimize_path_visibility(goal, 3.2, &query, &filter)
            .unwrap();
        let row: Vec<PolyRef> = (0..4).map(PolyRef::from_index).collect();
        assert_eq!(corridor.path(), row.as_slice());
    }

    #[test]
    fn test_trim_invalid_path() {
        let mut mesh = create_grid_navmesh(4, 1.0).unwrap();
        let mut corridor = PathCorridor::default();
        let start = Vec3::new(0.5, 0.0, 0.5);
        corridor.reset(PolyRef::from_index(0), start);
        let row: Vec<PolyRef> = (0..4).map(PolyRef::from_index).collect();
        corridor.set_corridor(Vec3::new(3.5, 0.0, 0.5), &row);

        mesh.set_poly_flags(PolyRef::from_index(2), navmesh_detour::PolyFlags::DISABLED)
            .unwrap();
        let mut filter = QueryFilter::default();
        filter.exclude_flags = navmesh_detour::PolyFlags::DISABLED;
        let query = NavMeshQuery::new(&mesh);

        assert!(!corridor.is_valid(8, &query, &filter));
        corridor
            .trim_invalid_path(PolyRef::from_index(0), start, &query, &filter)
            .unwrap();
        assert_eq!(corridor.path_count(), 2);
        // Target clamped onto the boundary of the last remaining polygon.
        assert!(corridor.target().x <= 2.0 + 1e-4);
    }
}
