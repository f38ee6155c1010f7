//! Detail mesh
//!
//! Polygons of the navigation mesh are flat approximations of the walkable
//! surface. The detail mesh triangulates every polygon again with extra
//! vertices sampled from the compact heightfield so that heights along and
//! inside the polygon stay within `sample_max_error` of the real surface.

use std::collections::VecDeque;

use glam::Vec3;
use navmesh_common::{dist_pt_seg_sqr, dist_pt_seg_sqr_2d, Result};

use crate::compact_heightfield::{dir_for_offset, CompactHeightfield};
use crate::context::BuildContext;
use crate::polymesh::{PolyMesh, MESH_NULL_IDX};

const UNSET_HEIGHT: u16 = 0xffff;
const MAX_VERTS: usize = 127;
/// Triangle indices are stored as bytes.
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

/// Triangle edge flag: the edge lies on the polygon boundary.
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x01;

const EV_UNDEF: i32 = -1;
const EV_HULL: i32 = -2;

/// Per-polygon height triangulation
#[derive(Debug, Clone, Default)]
pub struct PolyMeshDetail {
    /// Per polygon: first vertex, vertex count, first triangle, triangle count
    pub meshes: Vec<[u32; 4]>,
    /// World-space vertices; each submesh starts with its polygon's vertices
    pub verts: Vec<Vec3>,
    /// Submesh-local vertex indices and edge flags (two bits per edge)
    pub tris: Vec<[u8; 4]>,
}

impl PolyMeshDetail {
    /// Builds the detail mesh of every polygon of `mesh`.
    ///
    /// `sample_dist` and `sample_max_error` are world units; a zero sample
    /// distance only triangulates the polygon outlines.
    pub fn build(
        ctx: &mut BuildContext,
        mesh: &PolyMesh,
        chf: &CompactHeightfield,
        sample_dist: f32,
        sample_max_error: f32,
    ) -> Result<Self> {
        let mut dmesh = PolyMeshDetail::default();
        if mesh.verts.is_empty() || mesh.npolys == 0 {
            return Ok(dmesh);
        }

        let cs = mesh.cs;
        let ch = mesh.ch;
        let orig = mesh.bmin;
        let height_search_radius = (mesh.max_edge_error.ceil() as i32).max(1);

        // Grid bounds of every polygon, padded by one cell.
        let mut bounds = Vec::with_capacity(mesh.npolys);
        let mut max_hw = 0;
        let mut max_hh = 0;
        for i in 0..mesh.npolys {
            let p = mesh.poly(i);
            let (mut xmin, mut xmax, mut zmin, mut zmax) = (chf.width, 0, chf.height, 0);
            for &v in p.iter().take_while(|&&v| v != MESH_NULL_IDX) {
                let v = mesh.verts[v as usize];
                xmin = xmin.min(v[0] as i32);
                xmax = xmax.max(v[0] as i32);
                zmin = zmin.min(v[2] as i32);
                zmax = zmax.max(v[2] as i32);
            }
            let b = (
                (xmin - 1).max(0),
                (xmax + 1).min(chf.width),
                (zmin - 1).max(0),
                (zmax + 1).min(chf.height),
            );
            if b.0 < b.1 && b.2 < b.3 {
                max_hw = max_hw.max(b.1 - b.0);
                max_hh = max_hh.max(b.3 - b.2);
            }
            bounds.push(b);
        }

        let mut hp = HeightPatch {
            data: vec![UNSET_HEIGHT; (max_hw * max_hh).max(1) as usize],
            xmin: 0,
            zmin: 0,
            width: 0,
            height: 0,
        };
        let mut queue = VecDeque::new();
        let mut builder = DetailBuilder::default();

        for i in 0..mesh.npolys {
            let p = mesh.poly(i);
            let poly_verts: Vec<u16> = p.iter().copied().take_while(|&v| v != MESH_NULL_IDX).collect();
            let poly: Vec<Vec3> = poly_verts
                .iter()
                .map(|&v| {
                    let v = mesh.verts[v as usize];
                    Vec3::new(v[0] as f32 * cs, v[1] as f32 * ch, v[2] as f32 * cs)
                })
                .collect();

            let (xmin, xmax, zmin, zmax) = bounds[i];
            hp.xmin = xmin;
            hp.zmin = zmin;
            hp.width = (xmax - xmin).max(0);
            hp.height = (zmax - zmin).max(0);
            get_height_data(ctx, chf, &poly_verts, &mesh.verts, &mut hp, &mut queue, mesh.regs[i]);

            builder.build_poly_detail(
                ctx,
                &poly,
                sample_dist,
                sample_max_error,
                height_search_radius,
                chf,
                &hp,
            );

            let vbase = dmesh.verts.len() as u32;
            let tbase = dmesh.tris.len() as u32;
            dmesh.verts.extend(builder.verts.iter().map(|&v| v + orig));
            for t in &builder.tris {
                dmesh.tris.push([t[0] as u8, t[1] as u8, t[2] as u8, t[3] as u8]);
            }
            dmesh.meshes.push([
                vbase,
                builder.verts.len() as u32,
                tbase,
                builder.tris.len() as u32,
            ]);
        }

        ctx.log_progress(format!(
            "built detail mesh: {} vertices, {} triangles",
            dmesh.verts.len(),
            dmesh.tris.len()
        ));
        Ok(dmesh)
    }

    /// Vertices of the submesh of polygon `i`.
    pub fn submesh_verts(&self, i: usize) -> &[Vec3] {
        let m = self.meshes[i];
        &self.verts[m[0] as usize..(m[0] + m[1]) as usize]
    }

    /// Triangles of the submesh of polygon `i`.
    pub fn submesh_tris(&self, i: usize) -> &[[u8; 4]] {
        let m = self.meshes[i];
        &self.tris[m[2] as usize..(m[2] + m[3]) as usize]
    }
}

/// Heights of the cells under one polygon.
struct HeightPatch {
    data: Vec<u16>,
    xmin: i32,
    zmin: i32,
    width: i32,
    height: i32,
}

impl HeightPatch {
    fn len(&self) -> usize {
        (self.width * self.height) as usize
    }

    fn reset(&mut self, value: u16) {
        let n = self.len();
        self.data[..n].fill(value);
    }

    #[inline]
    fn at(&self, hx: i32, hz: i32) -> u16 {
        self.data[(hx + hz * self.width) as usize]
    }

    #[inline]
    fn set(&mut self, hx: i32, hz: i32, v: u16) {
        self.data[(hx + hz * self.width) as usize] = v;
    }

    #[inline]
    fn contains(&self, hx: i32, hz: i32) -> bool {
        hx >= 0 && hz >= 0 && hx < self.width && hz < self.height
    }
}

/// Fills the height patch with the floor heights of the polygon's region,
/// flooding outwards from the region border.
fn get_height_data(
    ctx: &mut BuildContext,
    chf: &CompactHeightfield,
    poly: &[u16],
    verts: &[[u16; 3]],
    hp: &mut HeightPatch,
    queue: &mut VecDeque<(i32, i32, usize)>,
    region: u16,
) {
    hp.reset(UNSET_HEIGHT);
    queue.clear();
    if hp.len() == 0 {
        return;
    }

    let mut empty = true;
    for hz in 0..hp.height {
        let z = hp.zmin + hz;
        for hx in 0..hp.width {
            let x = hp.xmin + hx;
            for i in chf.cell_spans(x, z) {
                let s = chf.spans[i];
                if s.reg != region {
                    continue;
                }
                hp.set(hx, hz, s.y);
                empty = false;
                let border = (0..4).any(|dir| {
                    chf.neighbour(x, z, i, dir)
                        .is_some_and(|(_, _, ai)| chf.spans[ai].reg != region)
                });
                if border {
                    queue.push_back((x, z, i));
                }
                break;
            }
        }
    }

    if empty {
        seed_with_poly_center(ctx, chf, poly, verts, hp, queue);
    }

    while let Some((cx, cz, ci)) = queue.pop_front() {
        for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            let hx = ax - hp.xmin;
            let hz = az - hp.zmin;
            if !hp.contains(hx, hz) || hp.at(hx, hz) != UNSET_HEIGHT {
                continue;
            }
            hp.set(hx, hz, chf.spans[ai].y);
            queue.push_back((ax, az, ai));
        }
    }
}

/// Seeds the height flood from the span nearest the polygon centre, reached
/// by walking from the span closest to one of the polygon's vertices.
fn seed_with_poly_center(
    ctx: &mut BuildContext,
    chf: &CompactHeightfield,
    poly: &[u16],
    verts: &[[u16; 3]],
    hp: &mut HeightPatch,
    queue: &mut VecDeque<(i32, i32, usize)>,
) {
    const OFFSETS: [(i32, i32); 9] = [
        (0, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut start: Option<(i32, i32, usize)> = None;
    let mut dmin = i32::MAX;
    'search: for &pv in poly {
        let v = verts[pv as usize];
        for (dx, dz) in OFFSETS {
            let ax = v[0] as i32 + dx;
            let az = v[2] as i32 + dz;
            let ay = v[1] as i32;
            if ax < hp.xmin || ax >= hp.xmin + hp.width || az < hp.zmin || az >= hp.zmin + hp.height {
                continue;
            }
            for i in chf.cell_spans(ax, az) {
                let d = (ay - chf.spans[i].y as i32).abs();
                if d < dmin {
                    start = Some((ax, az, i));
                    dmin = d;
                }
                if dmin == 0 {
                    break 'search;
                }
            }
        }
    }
    let Some(start) = start else {
        return;
    };

    let n = poly.len() as i32;
    let pcx = poly.iter().map(|&v| verts[v as usize][0] as i32).sum::<i32>() / n;
    let pcz = poly.iter().map(|&v| verts[v as usize][2] as i32).sum::<i32>() / n;

    // Depth-first walk towards the centre, visiting each cell once.
    let mut stack = vec![start];
    let mut dirs = [0usize, 1, 2, 3];
    hp.reset(0);
    let mut current = start;
    loop {
        let Some(cur) = stack.pop() else {
            ctx.log_warning("walk towards polygon center failed to reach center");
            break;
        };
        current = cur;
        let (cx, cz, ci) = cur;
        if cx == pcx && cz == pcz {
            break;
        }

        let direct = if cx == pcx {
            dir_for_offset(0, if pcz > cz { 1 } else { -1 })
        } else {
            dir_for_offset(if pcx > cx { 1 } else { -1 }, 0)
        };
        // The direct direction is pushed last so it is tried first.
        dirs.swap(direct, 3);
        for &dir in &dirs {
            let Some((nx, nz, ni)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            let hx = nx - hp.xmin;
            let hz = nz - hp.zmin;
            if !hp.contains(hx, hz) || hp.at(hx, hz) != 0 {
                continue;
            }
            hp.set(hx, hz, 1);
            stack.push((nx, nz, ni));
        }
        dirs.swap(direct, 3);
    }

    let (cx, cz, ci) = current;
    queue.clear();
    queue.push_back(current);
    hp.reset(UNSET_HEIGHT);
    hp.set(cx - hp.xmin, cz - hp.zmin, chf.spans[ci].y);
}

/// Height under (fx, fz) from the patch, searching outwards in rings when
/// the cell itself has no data.
fn get_height(fx: f32, fy: f32, fz: f32, ics: f32, ch: f32, radius: i32, hp: &HeightPatch) -> f32 {
    let ix = ((fx * ics + 0.01).floor() as i32 - hp.xmin).clamp(0, hp.width - 1);
    let iz = ((fz * ics + 0.01).floor() as i32 - hp.zmin).clamp(0, hp.height - 1);
    let mut h = hp.at(ix, iz);

    if h == UNSET_HEIGHT {
        // Spiral outwards, keeping the closest height of the first ring
        // that has any.
        let (mut x, mut z, mut dx, mut dz) = (1i32, 0i32, 1i32, 0i32);
        let max_size = radius * 2 + 1;
        let max_iter = max_size * max_size - 1;
        let mut next_ring_start = 8;
        let mut next_ring_iters = 16;
        let mut dmin = f32::MAX;
        for i in 0..max_iter {
            let nx = ix + x;
            let nz = iz + z;
            if hp.contains(nx, nz) {
                let nh = hp.at(nx, nz);
                if nh != UNSET_HEIGHT {
                    let d = (nh as f32 * ch - fy).abs();
                    if d < dmin {
                        h = nh;
                        dmin = d;
                    }
                }
            }
            if i + 1 == next_ring_start {
                if h != UNSET_HEIGHT {
                    break;
                }
                next_ring_start += next_ring_iters;
                next_ring_iters += 8;
            }
            if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
                let tmp = dx;
                dx = -dz;
                dz = tmp;
            }
            x += dx;
            z += dz;
        }
    }

    if h == UNSET_HEIGHT {
        fy
    } else {
        h as f32 * ch
    }
}

fn poly_min_extent(verts: &[Vec3]) -> f32 {
    let n = verts.len();
    let mut min_dist = f32::MAX;
    for i in 0..n {
        let ni = (i + 1) % n;
        let p1 = verts[i];
        let p2 = verts[ni];
        let max_edge_dist = (0..n)
            .filter(|&j| j != i && j != ni)
            .map(|j| dist_pt_seg_sqr_2d(verts[j], p1, p2).0)
            .fold(0.0f32, f32::max);
        min_dist = min_dist.min(max_edge_dist);
    }
    min_dist.sqrt()
}

/// Squared distance to the polygon outline, negative when inside.
fn dist_to_poly(verts: &[Vec3], p: Vec3) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z)) && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x) {
            inside = !inside;
        }
        dmin = dmin.min(dist_pt_seg_sqr_2d(p, vj, vi).0);
        j = i;
    }
    if inside {
        -dmin
    } else {
        dmin
    }
}

fn dist_pt_tri(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;
    let dot = |u: Vec3, v: Vec3| u.x * v.x + u.z * v.z;
    let dot00 = dot(v0, v0);
    let dot01 = dot(v0, v1);
    let dot02 = dot(v0, v2);
    let dot11 = dot(v1, v1);
    let dot12 = dot(v1, v2);

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() < f32::EPSILON {
        return None;
    }
    let inv = 1.0 / denom;
    let u = (dot11 * dot02 - dot01 * dot12) * inv;
    let v = (dot00 * dot12 - dot01 * dot02) * inv;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + v0.y * u + v1.y * v;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn dist_to_tri_mesh(p: Vec3, verts: &[Vec3], tris: &[[i32; 4]]) -> Option<f32> {
    tris.iter()
        .filter_map(|t| {
            dist_pt_tri(
                p,
                verts[t[0] as usize],
                verts[t[1] as usize],
                verts[t[2] as usize],
            )
        })
        .reduce(f32::min)
}

#[inline]
fn vcross2(p1: Vec3, p2: Vec3, p3: Vec3) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

#[inline]
fn vdist2(a: Vec3, b: Vec3) -> f32 {
    navmesh_common::dist_2d(a, b)
}

fn circum_circle(p1: Vec3, p2: Vec3, p3: Vec3) -> (Vec3, f32) {
    const EPS: f32 = 1e-6;
    // Relative to p1 for precision.
    let v1 = Vec3::ZERO;
    let v2 = p2 - p1;
    let v3 = p3 - p1;
    let cp = vcross2(v1, v2, v3);
    if cp.abs() > EPS {
        let sq = |v: Vec3| v.x * v.x + v.z * v.z;
        let (v1sq, v2sq, v3sq) = (sq(v1), sq(v2), sq(v3));
        let c = Vec3::new(
            (v1sq * (v2.z - v3.z) + v2sq * (v3.z - v1.z) + v3sq * (v1.z - v2.z)) / (2.0 * cp),
            0.0,
            (v1sq * (v3.x - v2.x) + v2sq * (v1.x - v3.x) + v3sq * (v2.x - v1.x)) / (2.0 * cp),
        );
        let r = vdist2(c, v1);
        (c + p1, r)
    } else {
        (p1, 0.0)
    }
}

fn overlap_seg_seg_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

#[inline]
fn jitter_x(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0x8da6_b343) & 0xffff) as f32 / 65535.0 * 2.0) - 1.0
}

#[inline]
fn jitter_z(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0xd816_3841) & 0xffff) as f32 / 65535.0 * 2.0) - 1.0
}

/// Scratch state reused across polygons.
#[derive(Default)]
struct DetailBuilder {
    /// Polygon-local vertices (relative to the mesh origin)
    verts: Vec<Vec3>,
    /// Triangles: three vertex indices and edge flags
    tris: Vec<[i32; 4]>,
    /// Delaunay edges: start, end, left face, right face
    edges: Vec<[i32; 4]>,
    hull: Vec<usize>,
}

impl DetailBuilder {
    #[allow(clippy::too_many_arguments)]
    fn build_poly_detail(
        &mut self,
        ctx: &mut BuildContext,
        input: &[Vec3],
        sample_dist: f32,
        sample_max_error: f32,
        height_search_radius: i32,
        chf: &CompactHeightfield,
        hp: &HeightPatch,
    ) {
        let nin = input.len();
        let cs = chf.cs;
        let ics = 1.0 / cs;
        let ch = chf.ch;

        self.verts.clear();
        self.verts.extend_from_slice(input);
        self.tris.clear();
        self.edges.clear();
        self.hull.clear();
        if hp.len() == 0 {
            self.triangulate_hull_of_input(nin);
            return;
        }

        let min_extent = poly_min_extent(&self.verts);

        // Tessellate the outline first so neighbouring polygons share the
        // same edge samples.
        if sample_dist > 0.0 {
            let mut edge = [Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];
            let mut j = nin - 1;
            for i in 0..nin {
                let mut vj = input[j];
                let mut vi = input[i];
                let mut swapped = false;
                if (vj.x - vi.x).abs() < 1e-6 {
                    if vj.z > vi.z {
                        std::mem::swap(&mut vj, &mut vi);
                        swapped = true;
                    }
                } else if vj.x > vi.x {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }

                let d = vi - vj;
                let len = (d.x * d.x + d.z * d.z).sqrt();
                let mut nn = 1 + (len / sample_dist).floor() as usize;
                if nn >= MAX_VERTS_PER_EDGE {
                    nn = MAX_VERTS_PER_EDGE - 1;
                }
                if self.verts.len() + nn >= MAX_VERTS {
                    nn = (MAX_VERTS - 1).saturating_sub(self.verts.len()).max(1);
                }

                for (k, slot) in edge.iter_mut().enumerate().take(nn + 1) {
                    let u = k as f32 / nn as f32;
                    let mut pos = vj + d * u;
                    pos.y = get_height(pos.x, pos.y, pos.z, ics, ch, height_search_radius, hp);
                    *slot = pos;
                }

                // Keep only samples deviating more than the allowed error.
                let mut idx = vec![0usize, nn];
                let mut k = 0;
                while k + 1 < idx.len() {
                    let a = idx[k];
                    let b = idx[k + 1];
                    let va = edge[a];
                    let vb = edge[b];
                    let mut maxd = 0.0;
                    let mut maxi = None;
                    for (m, &p) in edge.iter().enumerate().take(b).skip(a + 1) {
                        let dev = dist_pt_seg_sqr(p, va, vb);
                        if dev > maxd {
                            maxd = dev;
                            maxi = Some(m);
                        }
                    }
                    match maxi {
                        Some(m) if maxd > sample_max_error * sample_max_error => idx.insert(k + 1, m),
                        _ => k += 1,
                    }
                }

                self.hull.push(j);
                let inner = &idx[1..idx.len() - 1];
                let ordered: Vec<usize> = if swapped {
                    inner.iter().rev().copied().collect()
                } else {
                    inner.to_vec()
                };
                for k in ordered {
                    self.hull.push(self.verts.len());
                    self.verts.push(edge[k]);
                }
                j = i;
            }
        } else {
            self.hull.extend(0..nin);
        }

        // Slivers get no interior samples.
        if min_extent < sample_dist * 2.0 {
            self.triangulate_hull(nin);
            self.set_tri_flags();
            return;
        }

        self.triangulate_hull(nin);
        if self.tris.is_empty() {
            ctx.log_warning(format!("could not triangulate polygon ({} verts)", self.verts.len()));
            return;
        }

        if sample_dist > 0.0 {
            let (bmin, bmax) = input
                .iter()
                .fold((input[0], input[0]), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            let x0 = (bmin.x / sample_dist).floor() as i32;
            let x1 = (bmax.x / sample_dist).ceil() as i32;
            let z0 = (bmin.z / sample_dist).floor() as i32;
            let z1 = (bmax.z / sample_dist).ceil() as i32;

            let mut samples: Vec<(i32, f32, i32, bool)> = Vec::new();
            for z in z0..z1 {
                for x in x0..x1 {
                    let pt = Vec3::new(
                        x as f32 * sample_dist,
                        (bmax.y + bmin.y) * 0.5,
                        z as f32 * sample_dist,
                    );
                    if dist_to_poly(input, pt) > -sample_dist / 2.0 {
                        continue;
                    }
                    let y = get_height(pt.x, pt.y, pt.z, ics, ch, height_search_radius, hp);
                    samples.push((x, y, z, false));
                }
            }

            // Add the worst sample until the surface is within tolerance.
            for _ in 0..samples.len() {
                if self.verts.len() >= MAX_VERTS {
                    break;
                }
                let mut best: Option<(usize, f32, Vec3)> = None;
                for (i, s) in samples.iter().enumerate() {
                    if s.3 {
                        continue;
                    }
                    let pt = Vec3::new(
                        s.0 as f32 * sample_dist + jitter_x(i) * cs * 0.1,
                        s.1,
                        s.2 as f32 * sample_dist + jitter_z(i) * cs * 0.1,
                    );
                    let Some(d) = dist_to_tri_mesh(pt, &self.verts, &self.tris) else {
                        continue;
                    };
                    if best.map_or(d > 0.0, |b| d > b.1) {
                        best = Some((i, d, pt));
                    }
                }
                let Some((bi, bd, bpt)) = best else {
                    break;
                };
                if bd <= sample_max_error {
                    break;
                }
                samples[bi].3 = true;
                self.verts.push(bpt);
                self.delaunay_hull(ctx);
            }
        }

        if self.tris.len() > MAX_TRIS {
            ctx.log_error(format!(
                "shrinking detail triangle count from {} to {MAX_TRIS}",
                self.tris.len()
            ));
            self.tris.truncate(MAX_TRIS);
        }
        self.set_tri_flags();
    }

    fn triangulate_hull_of_input(&mut self, nin: usize) {
        self.hull.clear();
        self.hull.extend(0..nin);
        self.triangulate_hull(nin);
        self.set_tri_flags();
    }

    /// Fan-like triangulation of the hull that always advances the side
    /// with the shorter new perimeter.
    fn triangulate_hull(&mut self, nin: usize) {
        let nhull = self.hull.len();
        if nhull < 3 {
            return;
        }
        let hull = &self.hull;
        let verts = &self.verts;
        let mut start = 0;
        let mut left = 1;
        let mut right = nhull - 1;

        // Start from the ear with the shortest perimeter; only original
        // vertices can be ear tips.
        let mut dmin = f32::MAX;
        for i in 0..nhull {
            if hull[i] >= nin {
                continue;
            }
            let pi = (i + nhull - 1) % nhull;
            let ni = (i + 1) % nhull;
            let pv = verts[hull[pi]];
            let cv = verts[hull[i]];
            let nv = verts[hull[ni]];
            let d = vdist2(pv, cv) + vdist2(cv, nv) + vdist2(nv, pv);
            if d < dmin {
                start = i;
                left = ni;
                right = pi;
                dmin = d;
            }
        }

        let mut tris = vec![[hull[start] as i32, hull[left] as i32, hull[right] as i32, 0]];
        while (left + 1) % nhull != right {
            let nleft = (left + 1) % nhull;
            let nright = (right + nhull - 1) % nhull;
            let cvleft = verts[hull[left]];
            let nvleft = verts[hull[nleft]];
            let cvright = verts[hull[right]];
            let nvright = verts[hull[nright]];
            let dleft = vdist2(cvleft, nvleft) + vdist2(nvleft, cvright);
            let dright = vdist2(cvright, nvright) + vdist2(cvleft, nvright);

            if dleft < dright {
                tris.push([hull[left] as i32, hull[nleft] as i32, hull[right] as i32, 0]);
                left = nleft;
            } else {
                tris.push([hull[left] as i32, hull[nright] as i32, hull[right] as i32, 0]);
                right = nright;
            }
        }
        self.tris = tris;
    }

    fn set_tri_flags(&mut self) {
        let hull = &self.hull;
        let nhull = hull.len();
        let on_hull = |a: i32, b: i32| {
            // Interior samples come after the hull vertices.
            if a as usize >= nhull || b as usize >= nhull {
                return false;
            }
            let mut j = nhull - 1;
            for i in 0..nhull {
                if a as usize == hull[j] && b as usize == hull[i] {
                    return true;
                }
                j = i;
            }
            false
        };
        for t in self.tris.iter_mut() {
            let mut flags = 0;
            if on_hull(t[0], t[1]) {
                flags |= DETAIL_EDGE_BOUNDARY as i32;
            }
            if on_hull(t[1], t[2]) {
                flags |= (DETAIL_EDGE_BOUNDARY as i32) << 2;
            }
            if on_hull(t[2], t[0]) {
                flags |= (DETAIL_EDGE_BOUNDARY as i32) << 4;
            }
            t[3] = flags;
        }
    }

    fn find_edge(&self, s: i32, t: i32) -> Option<usize> {
        self.edges
            .iter()
            .position(|e| (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s))
    }

    fn add_edge(&mut self, ctx: &mut BuildContext, s: i32, t: i32, l: i32, r: i32) {
        let max_edges = self.verts.len() * 10;
        if self.edges.len() >= max_edges {
            ctx.log_error(format!("too many detail edges ({})", self.edges.len()));
            return;
        }
        if self.find_edge(s, t).is_none() {
            self.edges.push([s, t, l, r]);
        }
    }

    fn update_left_face(&mut self, e: usize, s: i32, t: i32, f: i32) {
        let edge = &mut self.edges[e];
        if edge[0] == s && edge[1] == t && edge[2] == EV_UNDEF {
            edge[2] = f;
        } else if edge[1] == s && edge[0] == t && edge[3] == EV_UNDEF {
            edge[3] = f;
        }
    }

    fn overlap_edges(&self, s1: i32, t1: i32) -> bool {
        let pts = &self.verts;
        self.edges.iter().any(|e| {
            let (s0, t0) = (e[0], e[1]);
            if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
                return false;
            }
            overlap_seg_seg_2d(
                pts[s0 as usize],
                pts[t0 as usize],
                pts[s1 as usize],
                pts[t1 as usize],
            )
        })
    }

    fn complete_facet(&mut self, ctx: &mut BuildContext, e: usize, nfaces: &mut i32) {
        const EPS: f32 = 1e-5;
        let edge = self.edges[e];
        let (s, t) = if edge[2] == EV_UNDEF {
            (edge[0], edge[1])
        } else if edge[3] == EV_UNDEF {
            (edge[1], edge[0])
        } else {
            return;
        };

        let npts = self.verts.len() as i32;
        let pts = &self.verts;
        let ps = pts[s as usize];
        let pt_t = pts[t as usize];

        // Best point left of the edge.
        let mut pt = npts;
        let mut c = Vec3::ZERO;
        let mut r = -1.0f32;
        for u in 0..npts {
            if u == s || u == t {
                continue;
            }
            let pu = self.verts[u as usize];
            if vcross2(ps, pt_t, pu) <= EPS {
                continue;
            }
            if r < 0.0 {
                pt = u;
                (c, r) = circum_circle(ps, pt_t, pu);
                continue;
            }
            let d = vdist2(c, pu);
            let tol = 0.001;
            if d > r * (1.0 + tol) {
                continue;
            } else if d < r * (1.0 - tol) {
                pt = u;
                (c, r) = circum_circle(ps, pt_t, pu);
            } else {
                if self.overlap_edges(s, u) || self.overlap_edges(t, u) {
                    continue;
                }
                pt = u;
                (c, r) = circum_circle(ps, pt_t, pu);
            }
        }

        if pt < npts {
            self.update_left_face(e, s, t, *nfaces);
            match self.find_edge(pt, s) {
                None => self.add_edge(ctx, pt, s, *nfaces, EV_UNDEF),
                Some(e2) => self.update_left_face(e2, pt, s, *nfaces),
            }
            match self.find_edge(t, pt) {
                None => self.add_edge(ctx, t, pt, *nfaces, EV_UNDEF),
                Some(e2) => self.update_left_face(e2, t, pt, *nfaces),
            }
            *nfaces += 1;
        } else {
            self.update_left_face(e, s, t, EV_HULL);
        }
    }

    /// Delaunay triangulation of all vertices, constrained to the hull.
    fn delaunay_hull(&mut self, ctx: &mut BuildContext) {
        self.edges.clear();
        let nhull = self.hull.len();
        let mut j = nhull - 1;
        for i in 0..nhull {
            let (a, b) = (self.hull[j] as i32, self.hull[i] as i32);
            self.add_edge(ctx, a, b, EV_HULL, EV_UNDEF);
            j = i;
        }

        let mut nfaces = 0;
        let mut current = 0;
        while current < self.edges.len() {
            if self.edges[current][2] == EV_UNDEF {
                self.complete_facet(ctx, current, &mut nfaces);
            }
            if self.edges[current][3] == EV_UNDEF {
                self.complete_facet(ctx, current, &mut nfaces);
            }
            current += 1;
        }

        let mut tris = vec![[-1i32, -1, -1, 0]; nfaces as usize];
        for e in &self.edges {
            if e[3] >= 0 {
                let t = &mut tris[e[3] as usize];
                if t[0] == -1 {
                    t[0] = e[0];
                    t[1] = e[1];
                } else if t[0] == e[1] {
                    t[2] = e[0];
                } else if t[1] == e[0] {
                    t[2] = e[1];
                }
            }
            if e[2] >= 0 {
                let t = &mut tris[e[2] as usize];
                if t[0] == -1 {
                    t[0] = e[1];
                    t[1] = e[0];
                } else if t[0] == e[0] {
                    t[2] = e[1];
                } else if t[1] == e[1] {
                    t[2] = e[0];
                }
            }
        }

        let before = tris.len();
        tris.retain(|t| t[0] != -1 && t[1] != -1 && t[2] != -1);
        if tris.len() != before {
            ctx.log_warning(format!(
                "removed {} dangling detail faces",
                before - tris.len()
            ));
        }
        self.tris = tris;
    }
}
