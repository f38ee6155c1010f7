//! Convex polygon mesh built from region contours
//!
//! Every contour is ear-clipped into triangles, shared vertices are welded
//! and neighbouring triangles are greedily merged into convex polygons of
//! at most `nvp` vertices. Per-edge adjacency is computed last.

use std::collections::HashMap;

use glam::Vec3;
use navmesh_common::{Error, Result};

use crate::context::BuildContext;
use crate::contour::ContourSet;
use crate::grid_geometry::{self as gg, GridVert};

/// Index value of an unused polygon vertex slot or a missing neighbour.
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Polygon mesh in voxel coordinates
#[derive(Debug, Clone)]
pub struct PolyMesh {
    /// Vertices (x, y, z) in cells, relative to `bmin`
    pub verts: Vec<[u16; 3]>,
    /// Per polygon `nvp` vertex indices followed by `nvp` neighbour indices
    pub polys: Vec<u16>,
    /// Region id per polygon
    pub regs: Vec<u16>,
    /// User flags per polygon
    pub flags: Vec<u16>,
    /// Area id per polygon
    pub areas: Vec<u8>,
    pub npolys: usize,
    /// Maximum vertices per polygon
    pub nvp: usize,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    /// Simplification error the contours were built with
    pub max_edge_error: f32,
}

impl PolyMesh {
    /// An empty mesh over the given bounds.
    pub fn empty(bmin: Vec3, bmax: Vec3, cs: f32, ch: f32, nvp: usize) -> Self {
        Self {
            verts: Vec::new(),
            polys: Vec::new(),
            regs: Vec::new(),
            flags: Vec::new(),
            areas: Vec::new(),
            npolys: 0,
            nvp,
            bmin,
            bmax,
            cs,
            ch,
            max_edge_error: 0.0,
        }
    }

    /// Vertex slots of polygon `i`, padded with [`MESH_NULL_IDX`].
    #[inline]
    pub fn poly(&self, i: usize) -> &[u16] {
        let base = i * self.nvp * 2;
        &self.polys[base..base + self.nvp]
    }

    /// Neighbour polygon per edge of polygon `i`.
    #[inline]
    pub fn neighbours(&self, i: usize) -> &[u16] {
        let base = i * self.nvp * 2 + self.nvp;
        &self.polys[base..base + self.nvp]
    }

    /// Number of used vertex slots of polygon `i`.
    pub fn vert_count(&self, i: usize) -> usize {
        count_poly_verts(self.poly(i))
    }

    /// World-space position of vertex `v`.
    pub fn world_vert(&self, v: usize) -> Vec3 {
        let p = self.verts[v];
        Vec3::new(
            self.bmin.x + p[0] as f32 * self.cs,
            self.bmin.y + p[1] as f32 * self.ch,
            self.bmin.z + p[2] as f32 * self.cs,
        )
    }

    /// Builds the polygon mesh of a contour set.
    pub fn build(ctx: &mut BuildContext, cset: &ContourSet, nvp: usize) -> Result<Self> {
        if !(3..=crate::MAX_VERTS_PER_POLY).contains(&nvp) {
            return Err(Error::InvalidInput(format!(
                "vertices per polygon must be within 3..={}",
                crate::MAX_VERTS_PER_POLY
            )));
        }
        let mut mesh = Self::empty(cset.bmin, cset.bmax, cset.cs, cset.ch, nvp);
        mesh.max_edge_error = cset.max_error;

        let mut welder = VertexWelder::default();
        for (ci, cont) in cset.contours.iter().enumerate() {
            if cont.verts.len() < 3 {
                continue;
            }

            let (tris, complete) = triangulate(&cont.verts);
            if !complete {
                ctx.log_warning(format!("bad triangulation of contour {ci}"));
            }

            let indices: Vec<u16> = cont
                .verts
                .iter()
                .map(|v| welder.add(&mut mesh.verts, v))
                .collect::<Result<_>>()?;

            let mut polys: Vec<Vec<u16>> = tris
                .iter()
                .filter(|t| t[0] != t[1] && t[0] != t[2] && t[1] != t[2])
                .map(|t| vec![indices[t[0]], indices[t[1]], indices[t[2]]])
                .collect();
            if polys.is_empty() {
                continue;
            }

            if nvp > 3 {
                merge_polys(&mut polys, &mesh.verts, nvp);
            }

            for poly in polys {
                let mut slots = vec![MESH_NULL_IDX; nvp * 2];
                slots[..poly.len()].copy_from_slice(&poly);
                mesh.polys.extend_from_slice(&slots);
                mesh.regs.push(cont.reg);
                mesh.areas.push(cont.area);
                mesh.npolys += 1;
            }
        }

        mesh.flags = vec![0; mesh.npolys];
        build_mesh_adjacency(&mut mesh.polys, mesh.npolys, nvp);

        ctx.log_progress(format!(
            "built polygon mesh: {} vertices, {} polygons",
            mesh.verts.len(),
            mesh.npolys
        ));
        Ok(mesh)
    }
}

fn count_poly_verts(p: &[u16]) -> usize {
    p.iter().position(|&v| v == MESH_NULL_IDX).unwrap_or(p.len())
}

/// Welds vertices that share x and z and are within two cells in height.
#[derive(Default)]
struct VertexWelder {
    buckets: HashMap<(i32, i32), Vec<u16>>,
}

impl VertexWelder {
    fn add(&mut self, verts: &mut Vec<[u16; 3]>, v: &GridVert) -> Result<u16> {
        let bucket = self.buckets.entry((v[0], v[2])).or_default();
        if let Some(&i) = bucket
            .iter()
            .find(|&&i| (verts[i as usize][1] as i32 - v[1]).abs() <= 2)
        {
            return Ok(i);
        }
        if verts.len() >= MESH_NULL_IDX as usize {
            return Err(Error::BuildFailure("polygon mesh vertex limit reached".to_string()));
        }
        let i = verts.len() as u16;
        verts.push([
            v[0].clamp(0, 0xffff) as u16,
            v[1].clamp(0, 0xffff) as u16,
            v[2].clamp(0, 0xffff) as u16,
        ]);
        bucket.push(i);
        Ok(i)
    }
}

fn in_cone(i: usize, j: usize, verts: &[GridVert], indices: &[usize], loose: bool) -> bool {
    let n = indices.len();
    let pi = &verts[indices[i]];
    let pj = &verts[indices[j]];
    let pi1 = &verts[indices[gg::next(i, n)]];
    let pin1 = &verts[indices[gg::prev(i, n)]];
    if gg::left_on(pin1, pi, pi1) {
        if loose {
            return gg::left_on(pi, pj, pin1) && gg::left_on(pj, pi, pi1);
        }
        return gg::left(pi, pj, pin1) && gg::left(pj, pi, pi1);
    }
    !(gg::left_on(pi, pj, pi1) && gg::left_on(pj, pi, pin1))
}

/// True if (i, j) does not cross any polygon edge.
fn diagonalie(i: usize, j: usize, verts: &[GridVert], indices: &[usize], loose: bool) -> bool {
    let n = indices.len();
    let d0 = &verts[indices[i]];
    let d1 = &verts[indices[j]];
    for k in 0..n {
        let k1 = gg::next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = &verts[indices[k]];
        let p1 = &verts[indices[k1]];
        if gg::vequal(d0, p0) || gg::vequal(d1, p0) || gg::vequal(d0, p1) || gg::vequal(d1, p1) {
            continue;
        }
        let crosses = if loose {
            gg::intersect_prop(d0, d1, p0, p1)
        } else {
            gg::intersect(d0, d1, p0, p1)
        };
        if crosses {
            return false;
        }
    }
    true
}

fn diagonal(i: usize, j: usize, verts: &[GridVert], indices: &[usize], loose: bool) -> bool {
    in_cone(i, j, verts, indices, loose) && diagonalie(i, j, verts, indices, loose)
}

/// Ear-clips a contour. Returns the triangles as contour vertex indices and
/// whether the whole contour could be triangulated.
fn triangulate(verts: &[GridVert]) -> (Vec<[usize; 3]>, bool) {
    let mut indices: Vec<usize> = (0..verts.len()).collect();
    let mut ears: Vec<bool> = vec![false; verts.len()];
    let mut tris = Vec::with_capacity(verts.len().saturating_sub(2));

    let n = indices.len();
    for i in 0..n {
        let i1 = gg::next(i, n);
        let i2 = gg::next(i1, n);
        ears[i1] = diagonal(i, i2, verts, &indices, false);
    }

    while indices.len() > 3 {
        let n = indices.len();
        let ear_len = |i: usize, far: usize, indices: &[usize]| {
            let p0 = verts[indices[i]];
            let p2 = verts[indices[far]];
            let dx = p2[0] - p0[0];
            let dz = p2[2] - p0[2];
            dx * dx + dz * dz
        };

        // Shortest ear first.
        let mut best: Option<(usize, i32)> = None;
        for i in 0..n {
            let i1 = gg::next(i, n);
            if ears[i1] {
                let len = ear_len(i, gg::next(i1, n), &indices);
                if best.map_or(true, |(_, l)| len < l) {
                    best = Some((i, len));
                }
            }
        }

        if best.is_none() {
            // Overlapping contour segments can hide every ear; retry with a
            // looser cone test.
            for i in 0..n {
                let i1 = gg::next(i, n);
                let i2 = gg::next(i1, n);
                if diagonal(i, i2, verts, &indices, true) {
                    let len = ear_len(i, gg::next(i2, n), &indices);
                    if best.map_or(true, |(_, l)| len < l) {
                        best = Some((i, len));
                    }
                }
            }
        }

        let Some((i, _)) = best else {
            return (tris, false);
        };
        let mut i1 = gg::next(i, n);
        let i2 = gg::next(i1, n);
        tris.push([indices[i], indices[i1], indices[i2]]);

        indices.remove(i1);
        ears.remove(i1);
        let n = indices.len();
        if i1 >= n {
            i1 = 0;
        }
        let i = gg::prev(i1, n);
        ears[i] = diagonal(gg::prev(i, n), i1, verts, &indices, false);
        ears[i1] = diagonal(i, gg::next(i1, n), verts, &indices, false);
    }

    tris.push([indices[0], indices[1], indices[2]]);
    (tris, true)
}

#[inline]
fn uleft(a: [u16; 3], b: [u16; 3], c: [u16; 3]) -> bool {
    (b[0] as i32 - a[0] as i32) * (c[2] as i32 - a[2] as i32)
        - (c[0] as i32 - a[0] as i32) * (b[2] as i32 - a[2] as i32)
        < 0
}

/// Squared length of the shared edge if `pa` and `pb` can be merged into a
/// convex polygon of at most `nvp` vertices, with the shared edge indices.
fn poly_merge_value(pa: &[u16], pb: &[u16], verts: &[[u16; 3]], nvp: usize) -> Option<(i32, usize, usize)> {
    let na = pa.len();
    let nb = pb.len();
    if na + nb - 2 > nvp {
        return None;
    }

    let mut shared = None;
    'outer: for i in 0..na {
        let (mut va0, mut va1) = (pa[i], pa[(i + 1) % na]);
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let (mut vb0, mut vb1) = (pb[j], pb[(j + 1) % nb]);
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    let (ea, eb) = shared?;

    let v = |i: u16| verts[i as usize];
    if !uleft(v(pa[(ea + na - 1) % na]), v(pa[ea]), v(pb[(eb + 2) % nb])) {
        return None;
    }
    if !uleft(v(pb[(eb + nb - 1) % nb]), v(pb[eb]), v(pa[(ea + 2) % na])) {
        return None;
    }

    let a = v(pa[ea]);
    let b = v(pa[(ea + 1) % na]);
    let dx = a[0] as i32 - b[0] as i32;
    let dz = a[2] as i32 - b[2] as i32;
    Some((dx * dx + dz * dz, ea, eb))
}

/// Greedily merges polygons across their longest shared edge.
fn merge_polys(polys: &mut Vec<Vec<u16>>, verts: &[[u16; 3]], nvp: usize) {
    loop {
        let mut best: Option<(i32, usize, usize, usize, usize)> = None;
        for j in 0..polys.len() {
            for k in j + 1..polys.len() {
                if let Some((value, ea, eb)) = poly_merge_value(&polys[j], &polys[k], verts, nvp) {
                    if best.map_or(true, |b| value > b.0) {
                        best = Some((value, j, k, ea, eb));
                    }
                }
            }
        }
        let Some((_, pa, pb, ea, eb)) = best else {
            break;
        };

        let a = &polys[pa];
        let b = &polys[pb];
        let (na, nb) = (a.len(), b.len());
        let mut merged = Vec::with_capacity(na + nb - 2);
        for i in 0..na - 1 {
            merged.push(a[(ea + 1 + i) % na]);
        }
        for i in 0..nb - 1 {
            merged.push(b[(eb + 1 + i) % nb]);
        }
        polys[pa] = merged;
        polys.swap_remove(pb);
    }
}

/// Fills the neighbour half of every polygon record.
fn build_mesh_adjacency(polys: &mut [u16], npolys: usize, nvp: usize) {
    struct Edge {
        poly: [usize; 2],
        poly_edge: [usize; 2],
    }

    let edge_verts = |polys: &[u16], i: usize, j: usize| {
        let t = &polys[i * nvp * 2..i * nvp * 2 + nvp];
        let v0 = t[j];
        let v1 = if j + 1 >= nvp || t[j + 1] == MESH_NULL_IDX {
            t[0]
        } else {
            t[j + 1]
        };
        (v0, v1)
    };

    let mut edges: Vec<Edge> = Vec::new();
    let mut lookup: HashMap<(u16, u16), Vec<usize>> = HashMap::new();
    for i in 0..npolys {
        let nv = count_poly_verts(&polys[i * nvp * 2..i * nvp * 2 + nvp]);
        for j in 0..nv {
            let (v0, v1) = edge_verts(polys, i, j);
            if v0 < v1 {
                lookup.entry((v0, v1)).or_default().push(edges.len());
                edges.push(Edge {
                    poly: [i, i],
                    poly_edge: [j, 0],
                });
            }
        }
    }
    for i in 0..npolys {
        let nv = count_poly_verts(&polys[i * nvp * 2..i * nvp * 2 + nvp]);
        for j in 0..nv {
            let (v0, v1) = edge_verts(polys, i, j);
            if v0 > v1 {
                if let Some(candidates) = lookup.get(&(v1, v0)) {
                    if let Some(&e) = candidates
                        .iter()
                        .find(|&&e| edges[e].poly[0] == edges[e].poly[1])
                    {
                        edges[e].poly[1] = i;
                        edges[e].poly_edge[1] = j;
                    }
                }
            }
        }
    }

    for e in &edges {
        if e.poly[0] != e.poly[1] {
            polys[e.poly[0] * nvp * 2 + nvp + e.poly_edge[0]] = e.poly[1] as u16;
            polys[e.poly[1] * nvp * 2 + nvp + e.poly_edge[1]] = e.poly[0] as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::Contour;

    fn quad_contour() -> Vec<GridVert> {
        // Outline winding as traced from the heightfield.
        vec![[0, 2, 0, 0], [0, 2, 10, 0], [10, 2, 10, 0], [10, 2, 0, 0]]
    }

    fn cset(contours: Vec<Contour>) -> ContourSet {
        ContourSet {
            contours,
            bmin: Vec3::ZERO,
            bmax: Vec3::splat(10.0),
            cs: 1.0,
            ch: 0.5,
            width: 10,
            height: 10,
            max_error: 1.3,
        }
    }

    #[test]
    fn test_triangulate_convex_and_concave() {
        let (tris, ok) = triangulate(&quad_contour());
        assert!(ok);
        assert_eq!(tris.len(), 2);

        // L shape.
        let l = vec![
            [0, 0, 0, 0],
            [0, 0, 4, 0],
            [2, 0, 4, 0],
            [2, 0, 2, 0],
            [4, 0, 2, 0],
            [4, 0, 0, 0],
        ];
        let (tris, ok) = triangulate(&l);
        assert!(ok);
        assert_eq!(tris.len(), 4);
    }

    #[test]
    fn test_quad_contour_becomes_single_polygon() {
        let contours = vec![Contour {
            verts: quad_contour(),
            rverts: Vec::new(),
            reg: 1,
            area: 63,
        }];
        let mut ctx = BuildContext::new();
        let mesh = PolyMesh::build(&mut ctx, &cset(contours), 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.vert_count(0), 4);
        assert_eq!(mesh.areas[0], 63);
        assert!(mesh.neighbours(0).iter().all(|&n| n == MESH_NULL_IDX));

        let tri_mesh = PolyMesh::build(&mut ctx, &cset(vec![Contour {
            verts: quad_contour(),
            rverts: Vec::new(),
            reg: 1,
            area: 63,
        }]), 3)
        .unwrap();
        assert_eq!(tri_mesh.npolys, 2);
        let linked = (0..2).filter(|&p| tri_mesh.neighbours(p).iter().any(|&n| n != MESH_NULL_IDX));
        assert_eq!(linked.count(), 2);
    }

    #[test]
    fn test_adjacent_contours_share_vertices() {
        let left = vec![[0, 2, 0, 2], [0, 2, 10, 0], [5, 2, 10, 2], [5, 2, 0, 0]];
        let right = vec![[5, 2, 0, 1], [5, 2, 10, 0], [10, 2, 10, 0], [10, 2, 0, 0]];
        let contours = vec![
            Contour {
                verts: left,
                rverts: Vec::new(),
                reg: 1,
                area: 63,
            },
            Contour {
                verts: right,
                rverts: Vec::new(),
                reg: 2,
                area: 1,
            },
        ];
        let mut ctx = BuildContext::new();
        let mesh = PolyMesh::build(&mut ctx, &cset(contours), 6).unwrap();
        assert_eq!(mesh.verts.len(), 6);
        assert_eq!(mesh.npolys, 2);
        assert!(mesh.neighbours(0).contains(&1));
        assert!(mesh.neighbours(1).contains(&0));
        assert_eq!(mesh.regs, vec![1, 2]);
        assert_eq!(mesh.areas, vec![63, 1]);
    }

    #[test]
    fn test_rejects_bad_nvp() {
        let mut ctx = BuildContext::new();
        assert!(PolyMesh::build(&mut ctx, &cset(Vec::new()), 2).is_err());
        assert!(PolyMesh::build(&mut ctx, &cset(Vec::new()), 7).is_err());
    }
}
