//! Navigation mesh implementation
//!
//! The navigation mesh is a single tile of convex polygons connected by
//! links. Off-mesh connections become two-vertex polygons linked to the
//! ground polygons their endpoints land on.

use std::ops::Deref;

use glam::Vec3;
use navmesh_common::{
    closest_height_point_triangle, dist_pt_poly_edges_sqr, dist_pt_seg_sqr_2d, overlap_bounds,
    point_in_polygon_2d, Error, Result,
};
use navmesh_recast::{PolyMesh, PolyMeshDetail, DETAIL_EDGE_BOUNDARY, MESH_NULL_IDX};

use crate::off_mesh::OffMeshConnection;
use crate::{
    area_flags, nav_area, PolyFlags, PolyRef, PolyType, QueryFilter, MAX_VERTS_PER_POLY,
};

/// Link side value of links inside the tile.
const LINK_SIDE_INTERNAL: u8 = 0xff;
/// Edge value of links from a ground polygon into an off-mesh connection.
pub(crate) const LINK_EDGE_OFF_MESH: u8 = 0xff;

/// Vertex index of the start of an off-mesh polygon.
pub const OFF_MESH_SIDE_START: usize = 0;
/// Vertex index of the end of an off-mesh polygon.
pub const OFF_MESH_SIDE_END: usize = 1;

/// Link between two polygons
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Index of the next link of the same polygon
    pub next: Option<u32>,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    pub side: u8,
}

/// Polygon in the navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// First link index
    pub first_link: Option<u32>,
    /// Vertex indices
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Neighbour per edge: polygon index + 1, or 0 for a wall
    pub neighbors: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Creates a new polygon without vertices
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            first_link: None,
            verts: [0; MAX_VERTS_PER_POLY],
            neighbors: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }

    #[inline]
    pub fn is_off_mesh(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail submesh of a ground polygon
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyDetail {
    /// First vertex in the detail vertex array
    pub vert_base: u32,
    /// First triangle in the detail triangle array
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Off-mesh connection as stored in the navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshLink {
    /// Requested endpoints, before snapping
    pub pos: [Vec3; 2],
    pub radius: f32,
    /// Index of the connection's polygon
    pub poly: u16,
    pub bidirectional: bool,
    pub user_id: u32,
}

/// Vertices of one polygon
#[derive(Debug, Clone, Copy)]
pub struct PolyVerts {
    verts: [Vec3; MAX_VERTS_PER_POLY],
    len: usize,
}

impl Deref for PolyVerts {
    type Target = [Vec3];

    fn deref(&self) -> &[Vec3] {
        &self.verts[..self.len]
    }
}

/// Input of [`NavMesh::create`]
#[derive(Debug, Clone, Default)]
pub struct NavMeshCreateParams {
    /// World-space polygon vertices
    pub verts: Vec<Vec3>,
    /// Per polygon `nvp` vertex indices then `nvp` neighbour indices,
    /// padded with [`MESH_NULL_IDX`]
    pub polys: Vec<u16>,
    pub poly_flags: Vec<PolyFlags>,
    pub poly_areas: Vec<u8>,
    pub nvp: usize,
    /// Per polygon: first vertex, vertex count, first triangle, triangle
    /// count; empty to triangulate the polygons themselves
    pub detail_meshes: Vec<[u32; 4]>,
    pub detail_verts: Vec<Vec3>,
    pub detail_tris: Vec<[u8; 4]>,
    pub off_mesh: Vec<OffMeshConnection>,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: Vec3,
    pub bmax: Vec3,
}

impl NavMeshCreateParams {
    /// Collects the create parameters from a Recast build.
    ///
    /// The default walkable area becomes ground and every polygon gets
    /// the flags of its area.
    pub fn from_recast(
        poly_mesh: &PolyMesh,
        detail_mesh: &PolyMeshDetail,
        off_mesh: &[OffMeshConnection],
        walkable_height: f32,
        walkable_radius: f32,
        walkable_climb: f32,
    ) -> Self {
        let poly_areas: Vec<u8> = poly_mesh.areas.iter().map(|&a| nav_area(a)).collect();
        let poly_flags = poly_areas.iter().map(|&a| area_flags(a)).collect();
        Self {
            verts: (0..poly_mesh.verts.len())
                .map(|v| poly_mesh.world_vert(v))
                .collect(),
            polys: poly_mesh.polys.clone(),
            poly_flags,
            poly_areas,
            nvp: poly_mesh.nvp,
            detail_meshes: detail_mesh.meshes.clone(),
            detail_verts: detail_mesh.verts.clone(),
            detail_tris: detail_mesh.tris.clone(),
            off_mesh: off_mesh.to_vec(),
            walkable_height,
            walkable_radius,
            walkable_climb,
            bmin: poly_mesh.bmin,
            bmax: poly_mesh.bmax,
        }
    }

    fn poly_count(&self) -> usize {
        if self.nvp == 0 {
            0
        } else {
            self.polys.len() / (self.nvp * 2)
        }
    }

    fn validate(&self) -> Result<()> {
        if !(3..=MAX_VERTS_PER_POLY).contains(&self.nvp) {
            return Err(Error::InvalidInput(format!(
                "vertices per polygon must be within 3..={MAX_VERTS_PER_POLY}, got {}",
                self.nvp
            )));
        }
        if self.polys.len() % (self.nvp * 2) != 0 {
            return Err(Error::InvalidInput(
                "polygon array is not a multiple of the polygon stride".to_string(),
            ));
        }
        let npolys = self.poly_count();
        if self.poly_flags.len() != npolys || self.poly_areas.len() != npolys {
            return Err(Error::InvalidInput(format!(
                "{npolys} polygons but {} flags and {} areas",
                self.poly_flags.len(),
                self.poly_areas.len()
            )));
        }
        for p in self.polys.chunks(self.nvp * 2) {
            let count = p[..self.nvp].iter().take_while(|&&v| v != MESH_NULL_IDX).count();
            if count < 3 {
                return Err(Error::InvalidInput(format!(
                    "polygon with {count} vertices"
                )));
            }
            if let Some(&v) = p[..count].iter().find(|&&v| v as usize >= self.verts.len()) {
                return Err(Error::InvalidInput(format!(
                    "polygon vertex {v} out of range ({} vertices)",
                    self.verts.len()
                )));
            }
        }
        if !self.detail_meshes.is_empty() {
            if self.detail_meshes.len() != npolys {
                return Err(Error::InvalidInput(format!(
                    "{npolys} polygons but {} detail meshes",
                    self.detail_meshes.len()
                )));
            }
            for m in &self.detail_meshes {
                if (m[0] + m[1]) as usize > self.detail_verts.len()
                    || (m[2] + m[3]) as usize > self.detail_tris.len()
                {
                    return Err(Error::InvalidInput(
                        "detail mesh range out of bounds".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Navigation mesh
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMesh {
    pub(crate) verts: Vec<Vec3>,
    pub(crate) polys: Vec<Poly>,
    pub(crate) links: Vec<Link>,
    pub(crate) detail_meshes: Vec<PolyDetail>,
    pub(crate) detail_verts: Vec<Vec3>,
    pub(crate) detail_tris: Vec<[u8; 4]>,
    pub(crate) off_mesh: Vec<OffMeshLink>,
    pub(crate) bmin: Vec3,
    pub(crate) bmax: Vec3,
    pub(crate) walkable_height: f32,
    pub(crate) walkable_radius: f32,
    pub(crate) walkable_climb: f32,
}

impl NavMesh {
    /// A navigation mesh without polygons; every query on it fails
    /// gracefully.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the navigation mesh: polygons, internal links, detail
    /// meshes and off-mesh connections.
    pub fn create(params: &NavMeshCreateParams) -> Result<Self> {
        params.validate()?;
        let nvp = params.nvp;
        let npolys = params.poly_count();

        let mut mesh = NavMesh {
            verts: params.verts.clone(),
            bmin: params.bmin,
            bmax: params.bmax,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
            ..Default::default()
        };

        for (i, p) in params.polys.chunks(nvp * 2).enumerate() {
            let mut poly = Poly::new(params.poly_areas[i], PolyType::Ground, params.poly_flags[i]);
            for j in 0..nvp {
                if p[j] == MESH_NULL_IDX {
                    break;
                }
                poly.verts[j] = p[j];
                let nei = p[nvp + j];
                poly.neighbors[j] = if nei == MESH_NULL_IDX || nei as usize >= npolys {
                    0
                } else {
                    nei + 1
                };
                poly.vert_count += 1;
            }
            mesh.polys.push(poly);
        }

        mesh.build_detail(params);

        // Internal links; pushed to the front of each list.
        for i in 0..npolys {
            for j in (0..mesh.polys[i].vert_count as usize).rev() {
                let nei = mesh.polys[i].neighbors[j];
                if nei == 0 {
                    continue;
                }
                mesh.add_link(
                    i,
                    Link {
                        reference: PolyRef::new(nei as u32),
                        next: None,
                        edge: j as u8,
                        side: LINK_SIDE_INTERNAL,
                    },
                );
            }
        }

        for con in &params.off_mesh {
            mesh.add_off_mesh_connection(con);
        }

        log::debug!(
            "created navigation mesh: {} polygons ({} off-mesh), {} links",
            mesh.polys.len(),
            mesh.off_mesh.len(),
            mesh.links.len()
        );
        Ok(mesh)
    }

    fn build_detail(&mut self, params: &NavMeshCreateParams) {
        if params.detail_meshes.is_empty() {
            // Fan-triangulate the polygons themselves.
            for i in 0..self.polys.len() {
                let nv = self.polys[i].vert_count as usize;
                let vert_base = self.detail_verts.len() as u32;
                let tri_base = self.detail_tris.len() as u32;
                for j in 0..nv {
                    self.detail_verts.push(self.verts[self.polys[i].verts[j] as usize]);
                }
                for j in 2..nv {
                    let mut flags = DETAIL_EDGE_BOUNDARY << 2;
                    if j == 2 {
                        flags |= DETAIL_EDGE_BOUNDARY;
                    }
                    if j == nv - 1 {
                        flags |= DETAIL_EDGE_BOUNDARY << 4;
                    }
                    self.detail_tris.push([0, (j - 1) as u8, j as u8, flags]);
                }
                self.detail_meshes.push(PolyDetail {
                    vert_base,
                    tri_base,
                    vert_count: nv as u8,
                    tri_count: (nv - 2) as u8,
                });
            }
        } else {
            self.detail_verts = params.detail_verts.clone();
            self.detail_tris = params.detail_tris.clone();
            self.detail_meshes = params
                .detail_meshes
                .iter()
                .map(|m| PolyDetail {
                    vert_base: m[0],
                    tri_base: m[2],
                    vert_count: m[1].min(255) as u8,
                    tri_count: m[3].min(255) as u8,
                })
                .collect();
        }
    }

    fn add_link(&mut self, poly_idx: usize, mut link: Link) {
        let idx = self.links.len() as u32;
        link.next = self.polys[poly_idx].first_link;
        self.links.push(link);
        self.polys[poly_idx].first_link = Some(idx);
    }

    /// Adds the polygon of an off-mesh connection and links its endpoints
    /// to the ground polygons they land on.
    fn add_off_mesh_connection(&mut self, con: &OffMeshConnection) {
        let Ok(poly_idx) = u16::try_from(self.polys.len()) else {
            log::warn!("too many polygons for off-mesh connection");
            return;
        };
        let Ok(vend) = u16::try_from(self.verts.len() + 1) else {
            log::warn!("too many vertices for off-mesh connection");
            return;
        };
        let vbase = vend - 1;
        self.verts.push(con.start);
        self.verts.push(con.end);

        let mut poly = Poly::new(con.area, PolyType::OffMeshConnection, con.flags);
        poly.verts[0] = vbase;
        poly.verts[1] = vend;
        poly.vert_count = 2;
        self.polys.push(poly);
        self.off_mesh.push(OffMeshLink {
            pos: [con.start, con.end],
            radius: con.radius,
            poly: poly_idx,
            bidirectional: con.bidirectional,
            user_id: con.user_id,
        });
        let con_ref = PolyRef::from_index(poly_idx as usize);

        let ext = Vec3::new(con.radius, self.walkable_climb, con.radius);
        let filter = QueryFilter::default();
        for (side, pos) in [(OFF_MESH_SIDE_START, con.start), (OFF_MESH_SIDE_END, con.end)] {
            let landing = self
                .find_nearest_poly(pos, ext, &filter)
                .filter(|(_, nearest)| {
                    let dx = nearest.x - pos.x;
                    let dz = nearest.z - pos.z;
                    dx * dx + dz * dz <= con.radius * con.radius
                });
            let Some((land_ref, nearest)) = landing else {
                log::warn!(
                    "off-mesh connection {} {} point ({:.2}, {:.2}, {:.2}) is off the mesh; left unlinked",
                    con.user_id,
                    if side == OFF_MESH_SIDE_START { "start" } else { "end" },
                    pos.x,
                    pos.y,
                    pos.z
                );
                continue;
            };
            let Some(land_idx) = land_ref.index() else {
                continue;
            };
            self.verts[vbase as usize + side] = nearest;
            self.add_link(
                poly_idx as usize,
                Link {
                    reference: land_ref,
                    next: None,
                    edge: side as u8,
                    side: LINK_SIDE_INTERNAL,
                },
            );
            if side == OFF_MESH_SIDE_START || con.bidirectional {
                self.add_link(
                    land_idx,
                    Link {
                        reference: con_ref,
                        next: None,
                        edge: LINK_EDGE_OFF_MESH,
                        side: LINK_SIDE_INTERNAL,
                    },
                );
            }
        }
    }

    /// Number of polygons, off-mesh polygons included
    pub fn poly_count(&self) -> usize {
        self.polys.len()
    }

    /// Number of ground polygons
    pub fn ground_poly_count(&self) -> usize {
        self.polys.len() - self.off_mesh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polys.is_empty()
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        (self.bmin, self.bmax)
    }

    pub fn walkable_height(&self) -> f32 {
        self.walkable_height
    }

    pub fn walkable_radius(&self) -> f32 {
        self.walkable_radius
    }

    pub fn walkable_climb(&self) -> f32 {
        self.walkable_climb
    }

    pub fn polys(&self) -> &[Poly] {
        &self.polys
    }

    pub fn verts(&self) -> &[Vec3] {
        &self.verts
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn off_mesh_links(&self) -> &[OffMeshLink] {
        &self.off_mesh
    }

    /// Checks if the polygon reference names a polygon of this mesh
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        reference.index().is_some_and(|i| i < self.polys.len())
    }

    /// Gets the polygon of a reference
    pub fn poly(&self, reference: PolyRef) -> Result<&Poly> {
        reference
            .index()
            .and_then(|i| self.polys.get(i))
            .ok_or_else(|| {
                Error::StaleReference(format!("polygon reference {} is not valid", reference.id()))
            })
    }

    /// Sets the flags of a polygon
    pub fn set_poly_flags(&mut self, reference: PolyRef, flags: PolyFlags) -> Result<()> {
        self.poly(reference)?;
        if let Some(poly) = reference.index().and_then(|i| self.polys.get_mut(i)) {
            poly.flags = flags;
        }
        Ok(())
    }

    /// Sets the area of a polygon
    pub fn set_poly_area(&mut self, reference: PolyRef, area: u8) -> Result<()> {
        self.poly(reference)?;
        if let Some(poly) = reference.index().and_then(|i| self.polys.get_mut(i)) {
            poly.area = area;
        }
        Ok(())
    }

    /// World-space vertices of a polygon
    pub fn poly_verts(&self, poly: &Poly) -> PolyVerts {
        let mut verts = [Vec3::ZERO; MAX_VERTS_PER_POLY];
        let len = poly.vert_count as usize;
        for (slot, &v) in verts.iter_mut().zip(&poly.verts[..len]) {
            *slot = self.verts[v as usize];
        }
        PolyVerts { verts, len }
    }

    /// Links of a polygon, most recently added first
    pub fn poly_links<'a>(&'a self, poly: &Poly) -> impl Iterator<Item = &'a Link> + 'a {
        let links = &self.links;
        std::iter::successors(poly.first_link.map(|i| &links[i as usize]), move |l| {
            l.next.map(|i| &links[i as usize])
        })
    }

    /// Off-mesh record of an off-mesh polygon
    pub fn off_mesh_link(&self, reference: PolyRef) -> Option<&OffMeshLink> {
        let idx = reference.index()?;
        self.off_mesh.iter().find(|c| c.poly as usize == idx)
    }

    /// Endpoints of an off-mesh connection, ordered so that the first one
    /// is where the connection is entered from `prev_ref`.
    pub fn off_mesh_connection_endpoints(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        let poly = self.poly(con_ref)?;
        if !poly.is_off_mesh() {
            return Err(Error::InvalidInput(format!(
                "polygon {} is not an off-mesh connection",
                con_ref.id()
            )));
        }
        // The link back to the previous polygon tells which end we are at.
        let mut idx0 = OFF_MESH_SIDE_START;
        let mut idx1 = OFF_MESH_SIDE_END;
        for link in self.poly_links(poly) {
            if link.edge == 0 {
                if link.reference != prev_ref {
                    idx0 = OFF_MESH_SIDE_END;
                    idx1 = OFF_MESH_SIDE_START;
                }
                break;
            }
        }
        Ok((
            self.verts[poly.verts[idx0] as usize],
            self.verts[poly.verts[idx1] as usize],
        ))
    }

    /// Bounds of a polygon
    pub fn poly_bounds(&self, poly: &Poly) -> (Vec3, Vec3) {
        let verts = self.poly_verts(poly);
        verts
            .iter()
            .fold((verts[0], verts[0]), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
    }

    /// Ground polygons overlapping the box that pass the filter
    pub fn query_polygons(&self, bmin: Vec3, bmax: Vec3, filter: &QueryFilter) -> Vec<PolyRef> {
        self.polys
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_off_mesh() && filter.pass_filter(p))
            .filter(|(_, p)| {
                let (pmin, pmax) = self.poly_bounds(p);
                overlap_bounds(bmin, bmax, pmin, pmax)
            })
            .map(|(i, _)| PolyRef::from_index(i))
            .collect()
    }

    /// Nearest ground polygon to `center` within the box of `half_extents`.
    ///
    /// Points above a polygon prefer it as long as they are within climb
    /// height of its surface.
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for reference in self.query_polygons(center - half_extents, center + half_extents, filter) {
            let Ok((closest, over_poly)) = self.closest_point_on_poly(reference, center) else {
                continue;
            };
            let diff = center - closest;
            let d = if over_poly {
                let d = diff.y.abs() - self.walkable_climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                diff.length_squared()
            };
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((reference, closest, d));
            }
        }
        best.map(|(r, p, _)| (r, p))
    }

    /// Closest point on a polygon, and whether `pos` lies over it.
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        let poly = self.poly(reference)?;
        if poly.is_off_mesh() {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, v0, v1);
            return Ok((v0.lerp(v1, t), false));
        }
        if let Some(h) = self.poly_height(reference, pos)? {
            return Ok((Vec3::new(pos.x, h, pos.z), true));
        }
        let closest = self.closest_point_on_poly_boundary(reference, pos)?;
        let closest = match self.poly_height(reference, closest)? {
            Some(h) => Vec3::new(closest.x, h, closest.z),
            None => self
                .closest_point_on_detail_edges(reference, pos)
                .unwrap_or(closest),
        };
        Ok((closest, false))
    }

    /// Point on the polygon outline nearest to `pos`, or `pos` itself when
    /// it lies inside.
    pub fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: Vec3) -> Result<Vec3> {
        let poly = self.poly(reference)?;
        let verts = self.poly_verts(poly);
        let mut ed = Vec::with_capacity(MAX_VERTS_PER_POLY);
        let mut et = Vec::with_capacity(MAX_VERTS_PER_POLY);
        if dist_pt_poly_edges_sqr(pos, &verts, &mut ed, &mut et) {
            return Ok(pos);
        }
        let (imin, _) = ed
            .iter()
            .enumerate()
            .fold((0, f32::MAX), |(bi, bd), (i, &d)| if d < bd { (i, d) } else { (bi, bd) });
        let va = verts[imin];
        let vb = verts[(imin + 1) % verts.len()];
        Ok(va.lerp(vb, et[imin]))
    }

    /// Height of the polygon surface under `pos`, or `None` when `pos` is
    /// outside the polygon.
    pub fn poly_height(&self, reference: PolyRef, pos: Vec3) -> Result<Option<f32>> {
        let poly = self.poly(reference)?;
        if poly.is_off_mesh() {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, v0, v1);
            return Ok(Some(v0.y + (v1.y - v0.y) * t));
        }
        let verts = self.poly_verts(poly);
        if !point_in_polygon_2d(pos, &verts) {
            return Ok(None);
        }
        for [a, b, c] in self.detail_triangles(reference) {
            if let Some(h) = closest_height_point_triangle(pos, a, b, c) {
                return Ok(Some(h));
            }
        }
        // On an edge shared by no detail triangle; use the nearest edge.
        Ok(self.closest_point_on_detail_edges(reference, pos).map(|p| p.y))
    }

    /// World-space detail triangles of a ground polygon
    pub fn detail_triangles(&self, reference: PolyRef) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        let detail = reference
            .index()
            .and_then(|i| self.detail_meshes.get(i))
            .copied()
            .unwrap_or_default();
        let tris = &self.detail_tris
            [detail.tri_base as usize..(detail.tri_base + detail.tri_count as u32) as usize];
        let base = detail.vert_base as usize;
        tris.iter().map(move |t| {
            [
                self.detail_verts[base + t[0] as usize],
                self.detail_verts[base + t[1] as usize],
                self.detail_verts[base + t[2] as usize],
            ]
        })
    }

    /// Detail triangles with their edge flags
    fn detail_triangles_with_flags(
        &self,
        reference: PolyRef,
    ) -> impl Iterator<Item = ([Vec3; 3], u8)> + '_ {
        let detail = reference
            .index()
            .and_then(|i| self.detail_meshes.get(i))
            .copied()
            .unwrap_or_default();
        let tris = &self.detail_tris
            [detail.tri_base as usize..(detail.tri_base + detail.tri_count as u32) as usize];
        self.detail_triangles(reference)
            .zip(tris.iter().map(|t| t[3]))
    }

    /// Nearest point on the boundary edges of the detail mesh
    fn closest_point_on_detail_edges(&self, reference: PolyRef, pos: Vec3) -> Option<Vec3> {
        let mut best: Option<(f32, Vec3)> = None;
        for (tri, flags) in self.detail_triangles_with_flags(reference) {
            for k in 0..3 {
                if (flags >> (k * 2)) & DETAIL_EDGE_BOUNDARY == 0 {
                    continue;
                }
                let va = tri[k];
                let vb = tri[(k + 1) % 3];
                let (d, t) = dist_pt_seg_sqr_2d(pos, va, vb);
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, va.lerp(vb, t)));
                }
            }
        }
        best.map(|(_, p)| p)
    }

    /// Encodes the mesh as JSON
    #[cfg(feature = "serialization")]
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decodes a mesh encoded by [`NavMesh::to_json_bytes`]
    #[cfg(feature = "serialization")]
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{create_grid_navmesh, grid_params};

    #[test]
    fn test_grid_links() {
        let mesh = create_grid_navmesh(3, 2.0).unwrap();
        assert_eq!(mesh.poly_count(), 9);
        // Center polygon links to its four neighbours.
        let center = mesh.poly(PolyRef::from_index(4)).unwrap();
        let mut neighbours: Vec<u32> = mesh.poly_links(center).map(|l| l.reference.id()).collect();
        neighbours.sort();
        assert_eq!(neighbours, vec![2, 4, 6, 8]);
        // Corner polygon links to two.
        let corner = mesh.poly(PolyRef::from_index(0)).unwrap();
        assert_eq!(mesh.poly_links(corner).count(), 2);
    }

    #[test]
    fn test_invalid_refs() {
        let mesh = create_grid_navmesh(2, 1.0).unwrap();
        assert!(mesh.is_valid_poly_ref(PolyRef::new(4)));
        assert!(!mesh.is_valid_poly_ref(PolyRef::new(5)));
        assert!(!mesh.is_valid_poly_ref(PolyRef::NULL));
        assert!(matches!(
            mesh.poly(PolyRef::new(99)),
            Err(Error::StaleReference(_))
        ));
    }

    #[test]
    fn test_height_and_closest_point() {
        let mesh = create_grid_navmesh(2, 1.0).unwrap();
        let r = PolyRef::from_index(0);
        let h = mesh.poly_height(r, Vec3::new(0.5, 3.0, 0.5)).unwrap();
        assert_eq!(h, Some(0.0));
        assert_eq!(mesh.poly_height(r, Vec3::new(5.0, 0.0, 5.0)).unwrap(), None);

        let (p, over) = mesh.closest_point_on_poly(r, Vec3::new(-1.0, 0.0, 0.5)).unwrap();
        assert!(!over);
        assert!((p - Vec3::new(0.0, 0.0, 0.5)).length() < 1e-5);
    }

    #[test]
    fn test_find_nearest_poly() {
        let mesh = create_grid_navmesh(3, 2.0).unwrap();
        let filter = QueryFilter::default();
        let (r, p) = mesh
            .find_nearest_poly(Vec3::new(3.0, 0.5, 3.0), Vec3::new(2.0, 4.0, 2.0), &filter)
            .unwrap();
        assert_eq!(r, PolyRef::from_index(4));
        assert!((p - Vec3::new(3.0, 0.0, 3.0)).length() < 1e-5);
        assert!(mesh
            .find_nearest_poly(Vec3::new(50.0, 0.0, 50.0), Vec3::new(2.0, 4.0, 2.0), &filter)
            .is_none());
    }

    #[test]
    fn test_create_rejects_bad_indices() {
        let mut params = grid_params(2, 1.0);
        params.polys[0] = 500;
        assert!(matches!(
            NavMesh::create(&params),
            Err(Error::InvalidInput(_))
        ));
        let mut params = grid_params(2, 1.0);
        params.poly_areas.pop();
        assert!(NavMesh::create(&params).is_err());
    }

    #[test]
    fn test_off_mesh_connection_needs_vertex_indices() {
        let mut params = grid_params(3, 1.0);
        params.verts.resize(u16::MAX as usize - 2, Vec3::ZERO);
        for _ in 0..2 {
            params.off_mesh.push(
                OffMeshConnection::new(
                    Vec3::new(0.5, 0.0, 0.5),
                    Vec3::new(2.5, 0.0, 2.5),
                    0.5,
                    false,
                    crate::POLYAREA_JUMP,
                    PolyFlags::JUMP,
                )
                .unwrap(),
            );
        }

        // Room for the endpoints of one connection only.
        let mesh = NavMesh::create(&params).unwrap();
        assert_eq!(mesh.off_mesh_links().len(), 1);
        assert_eq!(mesh.poly_count(), mesh.ground_poly_count() + 1);
        assert_eq!(mesh.verts.len(), u16::MAX as usize);
    }

    #[test]
    fn test_empty_mesh() {
        let mesh = NavMesh::empty();
        assert!(mesh.is_empty());
        assert!(mesh
            .find_nearest_poly(Vec3::ZERO, Vec3::splat(10.0), &QueryFilter::default())
            .is_none());
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_json_bytes() {
        let mesh = create_grid_navmesh(2, 1.0).unwrap();
        let bytes = mesh.to_json_bytes().unwrap();
        let back = NavMesh::from_json_bytes(&bytes).unwrap();
        assert_eq!(back.polys, mesh.polys);
        assert_eq!(back.links, mesh.links);
    }
}
