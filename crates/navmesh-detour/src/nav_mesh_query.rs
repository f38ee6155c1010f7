//! Navigation mesh query implementation
//!
//! Contains the [`NavMeshQuery`] structure, which performs pathfinding and
//! the spatial queries used by the crowd on a [`NavMesh`].

use std::collections::VecDeque;

use glam::Vec3;
use navmesh_common::{
    dist_pt_seg_sqr_2d, dot_2d, intersect_seg_seg_2d, intersect_segment_poly_2d,
    point_in_polygon_2d, tri_area_2d, vequal, Error, Result,
};

use crate::nav_mesh::Poly;
use crate::node_pool::{NodeFlags, NodePool, NodeQueue, MAX_SEARCH_NODES};
use crate::{
    NavMesh, PolyRef, PolyType, QueryFilter, StraightPathFlags, StraightPathOptions,
};

/// Default search box half extents of nearest-polygon queries.
pub const DEFAULT_HALF_EXTENTS: Vec3 = Vec3::new(2.0, 4.0, 2.0);

/// Heuristic scale; slightly under one so that A* prefers exact costs.
const H_SCALE: f32 = 0.999;

/// Breadth of the local searches used by the crowd.
const MAX_LOCAL_STACK: usize = 48;

/// Result of a polygon path search
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    /// Polygons from the start polygon onwards
    pub path: Vec<PolyRef>,
    /// True when the goal polygon was not reached and the path ends at the
    /// polygon nearest to it
    pub partial: bool,
}

/// Point of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon entered at this point; null at the end point
    pub poly: PolyRef,
}

/// Result of a raycast along the navigation mesh surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment, `f32::MAX` if nothing was hit
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: Vec3,
    /// Edge of the last visited polygon that was hit
    pub hit_edge: Option<usize>,
    /// Visited polygons
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    /// Checks if this represents a wall hit
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    /// Point where the segment from `start` to `end` hit the wall, or `end`.
    pub fn hit_point(&self, start: Vec3, end: Vec3) -> Vec3 {
        if self.hit_wall() {
            start.lerp(end, self.t)
        } else {
            end
        }
    }
}

/// Result of [`NavMeshQuery::find_distance_to_wall`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallDistance {
    /// Distance to the nearest wall, the search radius when none was found
    pub distance: f32,
    pub hit_pos: Vec3,
    pub hit_normal: Vec3,
}

/// Navigation mesh query structure
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    node_pool: NodePool,
    open_list: NodeQueue,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a new query with the default node budget
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_max_nodes(nav_mesh, MAX_SEARCH_NODES)
    }

    /// Creates a new query whose searches visit at most `max_nodes` polygons
    pub fn with_max_nodes(nav_mesh: &'a NavMesh, max_nodes: usize) -> Self {
        Self {
            nav_mesh,
            node_pool: NodePool::new(max_nodes.max(1)),
            open_list: NodeQueue::new(),
        }
    }

    /// Gets a reference to the navigation mesh
    pub fn nav_mesh(&self) -> &NavMesh {
        self.nav_mesh
    }

    /// Checks that the reference is valid and passes the filter
    pub fn is_valid_poly_ref(&self, reference: PolyRef, filter: &QueryFilter) -> bool {
        self.nav_mesh
            .poly(reference)
            .is_ok_and(|poly| filter.pass_filter(poly))
    }

    /// Finds the polygon nearest to `center` inside the search box
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<(PolyRef, Vec3)> {
        if !center.is_finite() || !half_extents.is_finite() {
            return Err(Error::InvalidInput(
                "nearest polygon query needs finite positions".to_string(),
            ));
        }
        self.nav_mesh
            .find_nearest_poly(center, half_extents, filter)
            .ok_or_else(|| {
                Error::PointNotFound(format!(
                    "no polygon near ({:.2}, {:.2}, {:.2})",
                    center.x, center.y, center.z
                ))
            })
    }

    /// Closest point on a polygon, and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        self.nav_mesh.closest_point_on_poly(reference, pos)
    }

    /// Closest point on the polygon outline; `pos` itself when inside
    pub fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: Vec3) -> Result<Vec3> {
        self.nav_mesh.closest_point_on_poly_boundary(reference, pos)
    }

    /// Height of the polygon surface under `pos`
    pub fn get_poly_height(&self, reference: PolyRef, pos: Vec3) -> Result<Option<f32>> {
        self.nav_mesh.poly_height(reference, pos)
    }

    /// Finds a polygon path from the start polygon to the goal polygon.
    ///
    /// Fails with [`Error::PathNotFound`] when the goal is unreachable.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        let result = self.search(start_ref, end_ref, start_pos, end_pos, filter, None)?;
        if result.partial {
            return Err(Error::PathNotFound(format!(
                "polygon {} is unreachable from polygon {}",
                end_ref.id(),
                start_ref.id()
            )));
        }
        Ok(result.path)
    }

    /// Like [`find_path`](Self::find_path), but returns the path to the
    /// polygon closest to the goal when the goal cannot be reached.
    pub fn find_path_partial(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<PathResult> {
        self.search(start_ref, end_ref, start_pos, end_pos, filter, None)
    }

    /// Best-effort search that expands at most `max_iterations` polygons.
    pub fn find_path_bounded(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_iterations: usize,
    ) -> Result<PathResult> {
        self.search(
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            Some(max_iterations),
        )
    }

    fn search(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_iterations: Option<usize>,
    ) -> Result<PathResult> {
        let mesh = self.nav_mesh;
        if !mesh.is_valid_poly_ref(start_ref) || !mesh.is_valid_poly_ref(end_ref) {
            return Err(Error::InvalidInput(format!(
                "path endpoints {} and {} must be valid polygons",
                start_ref.id(),
                end_ref.id()
            )));
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(Error::InvalidInput(
                "path endpoints must be finite".to_string(),
            ));
        }
        if start_ref == end_ref {
            return Ok(PathResult {
                path: vec![start_ref],
                partial: false,
            });
        }

        self.node_pool.clear();
        self.open_list.clear();

        let Some(start_idx) = self.node_pool.get_node(start_ref) else {
            return Err(Error::CapacityExceeded("search node pool is empty".to_string()));
        };
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = start_pos;
            start.cost = 0.0;
            start.total = start_pos.distance(end_pos) * H_SCALE;
            start.flags = NodeFlags::OPEN;
        }
        self.open_list.push(&self.node_pool, start_idx);

        let mut last_best = start_idx;
        let mut last_best_cost = self.node_pool.node(start_idx).total;
        let mut out_of_nodes = false;
        let mut iterations = 0;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            iterations += 1;

            let best = self.node_pool.node_mut(best_idx);
            best.flags.remove(NodeFlags::OPEN);
            best.flags.insert(NodeFlags::CLOSED);
            let (best_ref, best_pos, best_cost, best_parent) =
                (best.id, best.pos, best.cost, best.parent);

            if best_ref == end_ref {
                last_best = best_idx;
                break;
            }

            let best_poly = mesh.poly(best_ref)?;
            let parent_ref = best_parent.map(|p| self.node_pool.node(p).id);

            for link in mesh.poly_links(best_poly) {
                let neighbour_ref = link.reference;
                if Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Ok(neighbour_poly) = mesh.poly(neighbour_ref) else {
                    continue;
                };
                if !filter.pass_filter(neighbour_poly) {
                    continue;
                }
                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref) else {
                    out_of_nodes = true;
                    continue;
                };

                if self.node_pool.node(neighbour_idx).flags.is_empty() {
                    let mid = self.edge_mid_point(best_ref, neighbour_ref)?;
                    self.node_pool.node_mut(neighbour_idx).pos = mid;
                }
                let neighbour_pos = self.node_pool.node(neighbour_idx).pos;
                let step = filter.cost(best_pos, neighbour_pos, neighbour_poly.area);

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let end_cost = filter.cost(neighbour_pos, end_pos, neighbour_poly.area);
                    (best_cost + step + end_cost, 0.0)
                } else {
                    (
                        best_cost + step,
                        neighbour_pos.distance(end_pos) * H_SCALE,
                    )
                };
                let total = cost + heuristic;

                let node = self.node_pool.node_mut(neighbour_idx);
                if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= node.total
                {
                    continue;
                }
                node.parent = Some(best_idx);
                node.cost = cost;
                node.total = total;
                node.flags.remove(NodeFlags::CLOSED);
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(&self.node_pool, neighbour_idx);

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = neighbour_idx;
                }
            }
        }

        let path = self.node_pool.path_to(last_best);
        let partial = self.node_pool.node(last_best).id != end_ref;
        if partial {
            log::debug!(
                "partial path from {} towards {} ({} polygons{})",
                start_ref.id(),
                end_ref.id(),
                path.len(),
                if out_of_nodes { ", out of nodes" } else { "" }
            );
        }
        Ok(PathResult { path, partial })
    }

    /// Portal between two adjacent polygons, as (left, right) seen from
    /// `from_ref`, plus the types of both polygons.
    pub fn get_portal_points(
        &self,
        from_ref: PolyRef,
        to_ref: PolyRef,
    ) -> Result<(Vec3, Vec3, PolyType, PolyType)> {
        let mesh = self.nav_mesh;
        let from_poly = mesh.poly(from_ref)?;
        let to_poly = mesh.poly(to_ref)?;
        let not_adjacent = || {
            Error::InvalidInput(format!(
                "polygons {} and {} are not adjacent",
                from_ref.id(),
                to_ref.id()
            ))
        };

        let link = mesh
            .poly_links(from_poly)
            .find(|l| l.reference == to_ref)
            .ok_or_else(not_adjacent)?;

        if from_poly.is_off_mesh() {
            let v = mesh.verts()[from_poly.verts[link.edge as usize] as usize];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }
        if to_poly.is_off_mesh() {
            let back = mesh
                .poly_links(to_poly)
                .find(|l| l.reference == from_ref)
                .ok_or_else(not_adjacent)?;
            let v = mesh.verts()[to_poly.verts[back.edge as usize] as usize];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        let nv = from_poly.vert_count as usize;
        let edge = link.edge as usize;
        let left = mesh.verts()[from_poly.verts[edge] as usize];
        let right = mesh.verts()[from_poly.verts[(edge + 1) % nv] as usize];
        Ok((left, right, from_poly.poly_type, to_poly.poly_type))
    }

    /// Midpoint of the portal between two adjacent polygons
    pub fn edge_mid_point(&self, from_ref: PolyRef, to_ref: PolyRef) -> Result<Vec3> {
        let (left, right, _, _) = self.get_portal_points(from_ref, to_ref)?;
        Ok((left + right) * 0.5)
    }

    /// String-pulls a polygon corridor into at most `max_points` points.
    ///
    /// The first point is the start (flagged START), the last one the end
    /// (flagged END) unless the point budget runs out first. Points where
    /// an off-mesh connection begins are flagged OFFMESH_CONNECTION.
    pub fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        options: StraightPathOptions,
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Err(Error::InvalidInput("empty polygon corridor".to_string()));
        };
        if max_points == 0 {
            return Err(Error::InvalidInput(
                "straight path needs room for at least one point".to_string(),
            ));
        }

        let mut out = StraightPath {
            points: Vec::new(),
            max_points,
        };
        let closest_start = self.closest_point_on_poly_boundary(first, start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(last, end_pos)?;

        if out.append(closest_start, StraightPathFlags::START, first) {
            return Ok(out.points);
        }

        let with_portals = options
            .intersects(StraightPathOptions::AREA_CROSSINGS | StraightPathOptions::ALL_CROSSINGS);

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = first;
            let mut right_ref = first;

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.get_portal_points(path[i], path[i + 1]) {
                        Ok((left, right, _, to_type)) => {
                            // Starting right on the first portal.
                            if i == 0 && dist_pt_seg_sqr_2d(apex, left, right).0 < 0.001 * 0.001 {
                                i += 1;
                                continue;
                            }
                            (left, right, to_type)
                        }
                        Err(_) => {
                            // Broken corridor: stop at the last reachable polygon.
                            closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            if with_portals
                                && self.append_portals(
                                    &mut out, apex_index, i, closest_end, path, options,
                                )?
                            {
                                return Ok(out.points);
                            }
                            out.append(closest_end, StraightPathFlags::empty(), path[i]);
                            return Ok(out.points);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };
                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                if tri_area_2d(apex, portal_right, right) <= 0.0 {
                    if vequal(apex, portal_right) || tri_area_2d(apex, portal_left, right) > 0.0 {
                        portal_right = right;
                        right_ref = next_ref;
                        right_type = to_type;
                        right_index = i;
                    } else {
                        if with_portals
                            && self.append_portals(
                                &mut out, apex_index, left_index, portal_left, path, options,
                            )?
                        {
                            return Ok(out.points);
                        }
                        apex = portal_left;
                        apex_index = left_index;
                        let flags = if left_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if out.append(apex, flags, left_ref) {
                            return Ok(out.points);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                if tri_area_2d(apex, portal_left, left) >= 0.0 {
                    if vequal(apex, portal_left) || tri_area_2d(apex, portal_right, left) < 0.0 {
                        portal_left = left;
                        left_ref = next_ref;
                        left_type = to_type;
                        left_index = i;
                    } else {
                        if with_portals
                            && self.append_portals(
                                &mut out, apex_index, right_index, portal_right, path, options,
                            )?
                        {
                            return Ok(out.points);
                        }
                        apex = portal_right;
                        apex_index = right_index;
                        let flags = if right_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if out.append(apex, flags, right_ref) {
                            return Ok(out.points);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            if with_portals
                && self.append_portals(
                    &mut out,
                    apex_index,
                    path.len() - 1,
                    closest_end,
                    path,
                    options,
                )?
            {
                return Ok(out.points);
            }
        }

        out.append(closest_end, StraightPathFlags::END, PolyRef::NULL);
        Ok(out.points)
    }

    /// Appends the portal crossings between `start_idx` and `end_idx`.
    /// Returns true when the point budget is used up.
    fn append_portals(
        &self,
        out: &mut StraightPath,
        start_idx: usize,
        end_idx: usize,
        end_pos: Vec3,
        path: &[PolyRef],
        options: StraightPathOptions,
    ) -> Result<bool> {
        let Some(start_pos) = out.points.last().map(|p| p.pos) else {
            return Ok(false);
        };
        for i in start_idx..end_idx {
            let from = self.nav_mesh.poly(path[i])?;
            let to = self.nav_mesh.poly(path[i + 1])?;
            if options.contains(StraightPathOptions::AREA_CROSSINGS)
                && !options.contains(StraightPathOptions::ALL_CROSSINGS)
                && from.area == to.area
            {
                continue;
            }
            let Ok((left, right, _, _)) = self.get_portal_points(path[i], path[i + 1]) else {
                break;
            };
            if let Some((_, t)) = intersect_seg_seg_2d(start_pos, end_pos, left, right) {
                let pt = left.lerp(right, t);
                if out.append(pt, StraightPathFlags::empty(), path[i + 1]) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    ///
    /// The walk follows polygon links and stops at the first edge that has
    /// no passable neighbour.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        let mesh = self.nav_mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::InvalidInput(format!(
                "raycast start polygon {} is not valid",
                start_ref.id()
            )));
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(Error::InvalidInput("raycast needs finite positions".to_string()));
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: Vec3::ZERO,
            hit_edge: None,
            path: Vec::new(),
        };
        let mut cur_ref = start_ref;
        loop {
            let poly = mesh.poly(cur_ref)?;
            let verts = mesh.poly_verts(poly);
            let Some(seg) = intersect_segment_poly_2d(start_pos, end_pos, &verts) else {
                // Missed the polygon; keep the last t.
                return Ok(hit);
            };
            hit.hit_edge = seg.seg_max;
            if seg.tmax > hit.t {
                hit.t = seg.tmax;
            }
            hit.path.push(cur_ref);

            let Some(edge) = seg.seg_max else {
                // The end lies inside this polygon.
                hit.t = f32::MAX;
                return Ok(hit);
            };

            let next = mesh.poly_links(poly).find_map(|link| {
                if link.edge as usize != edge {
                    return None;
                }
                let next_poly = mesh.poly(link.reference).ok()?;
                (!next_poly.is_off_mesh() && filter.pass_filter(next_poly))
                    .then_some(link.reference)
            });

            match next {
                Some(next_ref) => cur_ref = next_ref,
                None => {
                    let a = verts[edge];
                    let b = verts[(edge + 1) % verts.len()];
                    let dx = b.x - a.x;
                    let dz = b.z - a.z;
                    hit.hit_normal = Vec3::new(dz, 0.0, -dx).normalize_or_zero();
                    return Ok(hit);
                }
            }
        }
    }

    /// Distance from `center` to the nearest wall within `max_radius`,
    /// searching outwards through the polygons around `start_ref`.
    pub fn find_distance_to_wall(
        &mut self,
        start_ref: PolyRef,
        center: Vec3,
        max_radius: f32,
        filter: &QueryFilter,
    ) -> Result<WallDistance> {
        let mesh = self.nav_mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::InvalidInput(format!(
                "wall distance start polygon {} is not valid",
                start_ref.id()
            )));
        }
        if !center.is_finite() || !(max_radius.is_finite() && max_radius >= 0.0) {
            return Err(Error::InvalidInput(
                "wall distance needs a finite center and a non-negative radius".to_string(),
            ));
        }

        self.node_pool.clear();
        self.open_list.clear();
        let Some(start_idx) = self.node_pool.get_node(start_ref) else {
            return Err(Error::CapacityExceeded("search node pool is empty".to_string()));
        };
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = center;
            start.cost = 0.0;
            start.total = 0.0;
            start.flags = NodeFlags::OPEN;
        }
        self.open_list.push(&self.node_pool, start_idx);

        let mut radius_sqr = max_radius * max_radius;
        let mut hit_pos = None;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            let best = self.node_pool.node_mut(best_idx);
            best.flags.remove(NodeFlags::OPEN);
            best.flags.insert(NodeFlags::CLOSED);
            let (best_ref, best_pos, best_total, best_parent) =
                (best.id, best.pos, best.total, best.parent);
            let parent_ref = best_parent.map(|p| self.node_pool.node(p).id);

            let best_poly = mesh.poly(best_ref)?;
            let verts = mesh.poly_verts(best_poly);
            let nv = verts.len();

            // Walls of this polygon.
            for j in 0..nv {
                if self.edge_is_passable(best_poly, j, filter) {
                    continue;
                }
                let vj = verts[j];
                let vi = verts[(j + 1) % nv];
                let (dist_sqr, t) = dist_pt_seg_sqr_2d(center, vj, vi);
                if dist_sqr > radius_sqr {
                    continue;
                }
                radius_sqr = dist_sqr;
                hit_pos = Some(vj.lerp(vi, t));
            }

            for link in mesh.poly_links(best_poly) {
                let neighbour_ref = link.reference;
                if Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Ok(neighbour_poly) = mesh.poly(neighbour_ref) else {
                    continue;
                };
                if neighbour_poly.is_off_mesh() || !filter.pass_filter(neighbour_poly) {
                    continue;
                }
                let va = verts[link.edge as usize % nv];
                let vb = verts[(link.edge as usize + 1) % nv];
                if dist_pt_seg_sqr_2d(center, va, vb).0 > radius_sqr {
                    continue;
                }
                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref) else {
                    continue;
                };
                if self.node_pool.node(neighbour_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                if self.node_pool.node(neighbour_idx).flags.is_empty() {
                    let mid = self.edge_mid_point(best_ref, neighbour_ref)?;
                    self.node_pool.node_mut(neighbour_idx).pos = mid;
                }
                let node = self.node_pool.node_mut(neighbour_idx);
                let total = best_total + best_pos.distance(node.pos);
                if node.flags.contains(NodeFlags::OPEN) && total >= node.total {
                    continue;
                }
                node.parent = Some(best_idx);
                node.total = total;
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(&self.node_pool, neighbour_idx);
            }
        }

        Ok(match hit_pos {
            Some(hit_pos) => WallDistance {
                distance: radius_sqr.sqrt(),
                hit_pos,
                hit_normal: (center - hit_pos).normalize_or_zero(),
            },
            None => WallDistance {
                distance: max_radius,
                hit_pos: center,
                hit_normal: Vec3::ZERO,
            },
        })
    }

    /// Moves from `start_pos` towards `end_pos` constrained to the surface.
    ///
    /// Returns the reached position and the visited polygons, the last one
    /// containing the result.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        let mesh = self.nav_mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::InvalidInput(format!(
                "move start polygon {} is not valid",
                start_ref.id()
            )));
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(Error::InvalidInput("move needs finite positions".to_string()));
        }

        self.node_pool.clear();
        let Some(start_idx) = self.node_pool.get_node(start_ref) else {
            return Err(Error::CapacityExceeded("search node pool is empty".to_string()));
        };
        self.node_pool.node_mut(start_idx).flags = NodeFlags::CLOSED;

        let mut stack = VecDeque::from([start_idx]);
        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;
        let mut best_idx = start_idx;

        let search_pos = start_pos.lerp(end_pos, 0.5);
        let search_rad = start_pos.distance(end_pos) * 0.5 + 0.001;
        let search_rad_sqr = search_rad * search_rad;

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.node_pool.node(cur_idx).id;
            let cur_poly = mesh.poly(cur_ref)?;
            let verts = mesh.poly_verts(cur_poly);
            let nv = verts.len();

            if point_in_polygon_2d(end_pos, &verts) {
                best_idx = cur_idx;
                best_pos = end_pos;
                break;
            }

            for j in 0..nv {
                let vj = verts[j];
                let vi = verts[(j + 1) % nv];
                let nei = cur_poly.neighbors[j];
                let nei_ref = PolyRef::new(nei as u32);
                let passable = nei != 0
                    && mesh.poly(nei_ref).is_ok_and(|p| filter.pass_filter(p));

                if !passable {
                    let (d, t) = dist_pt_seg_sqr_2d(end_pos, vj, vi);
                    if d < best_dist {
                        best_pos = vj.lerp(vi, t);
                        best_dist = d;
                        best_idx = cur_idx;
                    }
                    continue;
                }

                let Some(nei_idx) = self.node_pool.get_node(nei_ref) else {
                    continue;
                };
                if self.node_pool.node(nei_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                if dist_pt_seg_sqr_2d(search_pos, vj, vi).0 > search_rad_sqr {
                    continue;
                }
                if stack.len() < MAX_LOCAL_STACK {
                    let node = self.node_pool.node_mut(nei_idx);
                    node.parent = Some(cur_idx);
                    node.flags.insert(NodeFlags::CLOSED);
                    stack.push_back(nei_idx);
                }
            }
        }

        Ok((best_pos, self.node_pool.path_to(best_idx)))
    }

    /// Polygons around `center` within `radius` that do not overlap each
    /// other, as used for local boundary collection.
    pub fn find_local_neighbourhood(
        &mut self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        let mesh = self.nav_mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::InvalidInput(format!(
                "neighbourhood start polygon {} is not valid",
                start_ref.id()
            )));
        }

        self.node_pool.clear();
        let Some(start_idx) = self.node_pool.get_node(start_ref) else {
            return Err(Error::CapacityExceeded("search node pool is empty".to_string()));
        };
        self.node_pool.node_mut(start_idx).flags = NodeFlags::CLOSED;

        let mut stack = VecDeque::from([start_idx]);
        let mut result = vec![start_ref];
        let radius_sqr = radius * radius;

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.node_pool.node(cur_idx).id;
            let cur_poly = mesh.poly(cur_ref)?;
            let cur_verts = mesh.poly_verts(cur_poly);
            let nv = cur_verts.len();

            for link in mesh.poly_links(cur_poly) {
                let neighbour_ref = link.reference;
                let Ok(neighbour_poly) = mesh.poly(neighbour_ref) else {
                    continue;
                };
                if neighbour_poly.is_off_mesh() || !filter.pass_filter(neighbour_poly) {
                    continue;
                }
                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref) else {
                    continue;
                };
                if self.node_pool.node(neighbour_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                let va = cur_verts[link.edge as usize % nv];
                let vb = cur_verts[(link.edge as usize + 1) % nv];
                if dist_pt_seg_sqr_2d(center, va, vb).0 > radius_sqr {
                    continue;
                }

                let node = self.node_pool.node_mut(neighbour_idx);
                node.flags.insert(NodeFlags::CLOSED);
                node.parent = Some(cur_idx);

                // Skip polygons overlapping an earlier unconnected result.
                let neighbour_verts = mesh.poly_verts(neighbour_poly);
                let overlaps = result.iter().any(|&past_ref| {
                    if mesh
                        .poly_links(neighbour_poly)
                        .any(|l| l.reference == past_ref)
                    {
                        return false;
                    }
                    mesh.poly(past_ref).is_ok_and(|past| {
                        overlap_poly_poly_2d(&neighbour_verts, &mesh.poly_verts(past))
                    })
                });
                if overlaps {
                    continue;
                }

                result.push(neighbour_ref);
                if stack.len() < MAX_LOCAL_STACK {
                    stack.push_back(neighbour_idx);
                }
            }
        }

        Ok(result)
    }

    /// Wall segments of a polygon: edges without a neighbour that passes
    /// the filter.
    pub fn get_poly_wall_segments(
        &self,
        reference: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<[Vec3; 2]>> {
        let poly = self.nav_mesh.poly(reference)?;
        let verts = self.nav_mesh.poly_verts(poly);
        let nv = verts.len();
        Ok((0..nv)
            .filter(|&j| !self.edge_is_passable(poly, j, filter))
            .map(|j| [verts[j], verts[(j + 1) % nv]])
            .collect())
    }

    fn edge_is_passable(&self, poly: &Poly, edge: usize, filter: &QueryFilter) -> bool {
        let nei = poly.neighbors[edge];
        nei != 0
            && self
                .nav_mesh
                .poly(PolyRef::new(nei as u32))
                .is_ok_and(|p| filter.pass_filter(p))
    }
}

/// Straight path under construction
struct StraightPath {
    points: Vec<StraightPathPoint>,
    max_points: usize,
}

impl StraightPath {
    /// Appends a point, merging it into the previous one when they
    /// coincide. Returns true when the path is complete.
    fn append(&mut self, pos: Vec3, flags: StraightPathFlags, poly: PolyRef) -> bool {
        match self.points.last_mut() {
            Some(last) if vequal(last.pos, pos) => {
                last.flags = flags;
                last.poly = poly;
            }
            _ => self.points.push(StraightPathPoint { pos, flags, poly }),
        }
        flags.contains(StraightPathFlags::END) || self.points.len() >= self.max_points
    }
}

/// Separating-axis overlap test of two convex polygons on the XZ plane.
fn overlap_poly_poly_2d(a: &[Vec3], b: &[Vec3]) -> bool {
    const EPS: f32 = 1e-4;
    fn project(poly: &[Vec3], axis: Vec3) -> (f32, f32) {
        poly.iter().fold((f32::MAX, f32::MIN), |(lo, hi), v| {
            let d = dot_2d(axis, *v);
            (lo.min(d), hi.max(d))
        })
    }
    for poly in [a, b] {
        let n = poly.len();
        for j in 0..n {
            let va = poly[j];
            let vb = poly[(j + 1) % n];
            let axis = Vec3::new(vb.z - va.z, 0.0, -(vb.x - va.x));
            let (amin, amax) = project(a, axis);
            let (bmin, bmax) = project(b, axis);
            if amin + EPS > bmax || amax - EPS < bmin {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_poly_poly() {
        let square = |x: f32, z: f32| {
            vec![
                Vec3::new(x, 0.0, z),
                Vec3::new(x, 0.0, z + 1.0),
                Vec3::new(x + 1.0, 0.0, z + 1.0),
                Vec3::new(x + 1.0, 0.0, z),
            ]
        };
        assert!(overlap_poly_poly_2d(&square(0.0, 0.0), &square(0.5, 0.5)));
        // Touching edges do not count.
        assert!(!overlap_poly_poly_2d(&square(0.0, 0.0), &square(1.0, 0.0)));
        assert!(!overlap_poly_poly_2d(&square(0.0, 0.0), &square(3.0, 3.0)));
    }

    #[test]
    fn test_straight_path_merges_duplicates() {
        let mut out = StraightPath {
            points: Vec::new(),
            max_points: 3,
        };
        assert!(!out.append(Vec3::ZERO, StraightPathFlags::START, PolyRef::new(1)));
        assert!(!out.append(Vec3::ZERO, StraightPathFlags::empty(), PolyRef::new(2)));
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].poly, PolyRef::new(2));
        assert!(!out.append(Vec3::X, StraightPathFlags::empty(), PolyRef::new(2)));
        assert!(out.append(Vec3::Z, StraightPathFlags::empty(), PolyRef::new(2)));
    }

    #[test]
    fn test_raycast_hit_point() {
        let hit = RaycastHit {
            t: 0.25,
            hit_normal: Vec3::X,
            hit_edge: Some(0),
            path: Vec::new(),
        };
        let p = hit.hit_point(Vec3::ZERO, Vec3::new(4.0, 0.0, 0.0));
        assert!((p.x - 1.0).abs() < 1e-6);
        let miss = RaycastHit { t: f32::MAX, ..hit };
        assert_eq!(miss.hit_point(Vec3::ZERO, Vec3::X), Vec3::X);
    }
}
