//! Region contours
//!
//! Traces the outline of every region on the compact heightfield, simplifies
//! it into a polygon and stitches hole contours into their outline so that
//! each region ends up with a single simple polygon.

use glam::Vec3;

use crate::compact_heightfield::CompactHeightfield;
use crate::context::BuildContext;
use crate::grid_geometry::{self as gg, GridVert};

/// Mask of the neighbour region id stored in a contour vertex tag.
pub const CONTOUR_REG_MASK: i32 = 0xffff;
/// Tag bit: the edge following this vertex separates two area ids.
pub const AREA_BORDER: i32 = 0x20000;

/// Split long edges on the outer boundary of the mesh.
pub const CONTOUR_TESS_WALL_EDGES: u32 = 0x01;
/// Split long edges between different area ids.
pub const CONTOUR_TESS_AREA_EDGES: u32 = 0x02;

/// Simplified outline of one region
#[derive(Debug, Clone, Default)]
pub struct Contour {
    /// Simplified vertices; the tag holds the neighbour region id and flags
    pub verts: Vec<GridVert>,
    /// Raw traced vertices
    pub rverts: Vec<GridVert>,
    /// Region id
    pub reg: u16,
    /// Area id
    pub area: u8,
}

/// All region contours of a compact heightfield
#[derive(Debug, Clone)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub width: i32,
    pub height: i32,
    pub max_error: f32,
}

impl ContourSet {
    /// Traces and simplifies the contours of every region.
    ///
    /// `max_error` and `max_edge_len` are in cells.
    pub fn build(
        ctx: &mut BuildContext,
        chf: &CompactHeightfield,
        max_error: f32,
        max_edge_len: i32,
        build_flags: u32,
    ) -> Self {
        let mut cset = ContourSet {
            contours: Vec::new(),
            bmin: chf.bmin,
            bmax: chf.bmax,
            cs: chf.cs,
            ch: chf.ch,
            width: chf.width,
            height: chf.height,
            max_error,
        };

        // Bit per side: set when the side is a region boundary.
        let mut flags = vec![0u8; chf.span_count];
        for z in 0..chf.height {
            for x in 0..chf.width {
                for i in chf.cell_spans(x, z) {
                    let reg = chf.spans[i].reg;
                    if reg == 0 {
                        flags[i] = 0;
                        continue;
                    }
                    let mut connected = 0u8;
                    for dir in 0..4 {
                        let r = chf
                            .neighbour(x, z, i, dir)
                            .map_or(0, |(_, _, ai)| chf.spans[ai].reg);
                        if r == reg {
                            connected |= 1 << dir;
                        }
                    }
                    flags[i] = connected ^ 0xf;
                }
            }
        }

        let mut raw = Vec::new();
        let mut simplified = Vec::new();
        for z in 0..chf.height {
            for x in 0..chf.width {
                for i in chf.cell_spans(x, z) {
                    if flags[i] == 0 || flags[i] == 0xf {
                        flags[i] = 0;
                        continue;
                    }
                    let reg = chf.spans[i].reg;
                    if reg == 0 {
                        continue;
                    }
                    let area = chf.areas[i];

                    raw.clear();
                    simplified.clear();
                    walk_contour(x, z, i, chf, &mut flags, &mut raw);
                    simplify_contour(&raw, &mut simplified, max_error, max_edge_len, build_flags);
                    remove_degenerate_segments(&mut simplified);

                    if simplified.len() >= 3 {
                        cset.contours.push(Contour {
                            verts: simplified.clone(),
                            rverts: raw.clone(),
                            reg,
                            area,
                        });
                    }
                }
            }
        }

        cset.merge_holes(ctx, chf.max_regions);
        ctx.log_progress(format!("built {} contours", cset.contours.len()));
        cset
    }

    fn merge_holes(&mut self, ctx: &mut BuildContext, max_regions: u16) {
        let winding: Vec<bool> = self
            .contours
            .iter()
            .map(|c| calc_area_of_polygon_2d(&c.verts) >= 0)
            .collect();
        if winding.iter().all(|&outline| outline) {
            return;
        }

        let nregions = max_regions as usize + 1;
        let mut outlines: Vec<Option<usize>> = vec![None; nregions];
        let mut holes: Vec<Vec<usize>> = vec![Vec::new(); nregions];
        for (i, c) in self.contours.iter().enumerate() {
            let reg = c.reg as usize;
            if reg >= nregions {
                continue;
            }
            if winding[i] {
                if outlines[reg].is_some() {
                    ctx.log_error(format!("multiple outlines for region {reg}"));
                }
                outlines[reg] = Some(i);
            } else {
                holes[reg].push(i);
            }
        }

        for reg in 0..nregions {
            if holes[reg].is_empty() {
                continue;
            }
            match outlines[reg] {
                Some(outline) => self.merge_region_holes(ctx, outline, &holes[reg]),
                None => ctx.log_error(format!(
                    "missing outline for region {reg}, can not merge holes"
                )),
            }
        }
    }

    fn merge_region_holes(&mut self, ctx: &mut BuildContext, outline: usize, hole_ids: &[usize]) {
        // Left-most vertex of each hole, holes sorted left to right.
        let mut holes: Vec<(usize, usize, i32, i32)> = hole_ids
            .iter()
            .map(|&h| {
                let verts = &self.contours[h].verts;
                let (leftmost, minx, minz) = find_left_most_vertex(verts);
                (h, leftmost, minx, minz)
            })
            .collect();
        holes.sort_by(|a, b| (a.2, a.3).cmp(&(b.2, b.3)));

        let mut diags: Vec<(usize, i32)> = Vec::new();
        for hi in 0..holes.len() {
            let (hole, mut best_vertex, _, _) = holes[hi];
            let hole_len = self.contours[hole].verts.len();
            let mut index = None;

            for _ in 0..hole_len {
                let corner = self.contours[hole].verts[best_vertex];
                let outline_verts = &self.contours[outline].verts;
                diags.clear();
                for j in 0..outline_verts.len() {
                    if in_cone(j, outline_verts, &corner) {
                        let dx = outline_verts[j][0] - corner[0];
                        let dz = outline_verts[j][2] - corner[2];
                        diags.push((j, dx * dx + dz * dz));
                    }
                }
                diags.sort_by_key(|d| d.1);

                index = diags.iter().map(|d| d.0).find(|&j| {
                    let pt = outline_verts[j];
                    if intersect_seg_contour(&pt, &corner, Some(j), outline_verts) {
                        return false;
                    }
                    !holes[hi..].iter().any(|&(other, ..)| {
                        intersect_seg_contour(&pt, &corner, None, &self.contours[other].verts)
                    })
                });
                if index.is_some() {
                    break;
                }
                best_vertex = (best_vertex + 1) % hole_len;
            }

            let Some(ia) = index else {
                ctx.log_warning(format!(
                    "failed to find merge points for hole of region {}",
                    self.contours[outline].reg
                ));
                continue;
            };
            let hole_verts = std::mem::take(&mut self.contours[hole].verts);
            let outline_verts = &mut self.contours[outline].verts;
            *outline_verts = merge_contours(outline_verts, &hole_verts, ia, best_vertex);
        }
    }
}

/// Height of the corner between span `i` and its neighbours towards `dir`
/// and `dir + 1`.
fn corner_height(x: i32, z: i32, i: usize, dir: usize, chf: &CompactHeightfield) -> i32 {
    let dirp = (dir + 1) & 3;
    let mut ch = chf.spans[i].y as i32;
    if let Some((ax, az, ai)) = chf.neighbour(x, z, i, dir) {
        ch = ch.max(chf.spans[ai].y as i32);
        if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, dirp) {
            ch = ch.max(chf.spans[ai2].y as i32);
        }
    }
    if let Some((ax, az, ai)) = chf.neighbour(x, z, i, dirp) {
        ch = ch.max(chf.spans[ai].y as i32);
        if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, dir) {
            ch = ch.max(chf.spans[ai2].y as i32);
        }
    }
    ch
}

fn walk_contour(
    mut x: i32,
    mut z: i32,
    mut i: usize,
    chf: &CompactHeightfield,
    flags: &mut [u8],
    points: &mut Vec<GridVert>,
) {
    let mut dir = 0usize;
    while flags[i] & (1 << dir) == 0 {
        dir += 1;
    }
    let start_dir = dir;
    let start_i = i;
    let area = chf.areas[i];

    for _ in 0..40000 {
        if flags[i] & (1 << dir) != 0 {
            let py = corner_height(x, z, i, dir, chf);
            let (px, pz) = match dir {
                0 => (x, z + 1),
                1 => (x + 1, z + 1),
                2 => (x + 1, z),
                _ => (x, z),
            };
            let mut r = 0i32;
            if let Some((_, _, ai)) = chf.neighbour(x, z, i, dir) {
                r = chf.spans[ai].reg as i32;
                if area != chf.areas[ai] {
                    r |= AREA_BORDER;
                }
            }
            points.push([px, py, pz, r]);
            flags[i] &= !(1 << dir);
            dir = (dir + 1) & 3;
        } else {
            let Some((nx, nz, ni)) = chf.neighbour(x, z, i, dir) else {
                return;
            };
            x = nx;
            z = nz;
            i = ni;
            dir = (dir + 3) & 3;
        }
        if start_i == i && start_dir == dir {
            break;
        }
    }
}

/// Squared distance from (x, z) to segment p-q.
fn distance_pt_seg(x: i32, z: i32, px: i32, pz: i32, qx: i32, qz: i32) -> f32 {
    let pqx = (qx - px) as f32;
    let pqz = (qz - pz) as f32;
    let dx = (x - px) as f32;
    let dz = (z - pz) as f32;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = px as f32 + t * pqx - x as f32;
    let dz = pz as f32 + t * pqz - z as f32;
    dx * dx + dz * dz
}

/// Simplifies a raw contour. The tag of each output vertex first holds the
/// index of its raw vertex and is finally replaced by the raw edge flags.
fn simplify_contour(
    points: &[GridVert],
    simplified: &mut Vec<GridVert>,
    max_error: f32,
    max_edge_len: i32,
    build_flags: u32,
) {
    let pn = points.len();
    if pn == 0 {
        return;
    }

    let has_connections = points.iter().any(|p| p[3] & CONTOUR_REG_MASK != 0);
    if has_connections {
        // Keep every vertex where the neighbour region or area changes.
        for i in 0..pn {
            let ii = (i + 1) % pn;
            let different_regs = (points[i][3] & CONTOUR_REG_MASK) != (points[ii][3] & CONTOUR_REG_MASK);
            let area_borders = (points[i][3] & AREA_BORDER) != (points[ii][3] & AREA_BORDER);
            if different_regs || area_borders {
                simplified.push([points[i][0], points[i][1], points[i][2], i as i32]);
            }
        }
    }

    if simplified.is_empty() {
        // Seed with the lower-left and upper-right vertices.
        let mut ll = 0usize;
        let mut ur = 0usize;
        for (i, p) in points.iter().enumerate() {
            let l = points[ll];
            if p[0] < l[0] || (p[0] == l[0] && p[2] < l[2]) {
                ll = i;
            }
            let u = points[ur];
            if p[0] > u[0] || (p[0] == u[0] && p[2] > u[2]) {
                ur = i;
            }
        }
        simplified.push([points[ll][0], points[ll][1], points[ll][2], ll as i32]);
        simplified.push([points[ur][0], points[ur][1], points[ur][2], ur as i32]);
    }

    // Insert the farthest raw vertex until every segment is within tolerance.
    let max_error_sqr = max_error * max_error;
    let mut i = 0;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();
        let (mut ax, mut az, ai) = (simplified[i][0], simplified[i][2], simplified[i][3] as usize);
        let (mut bx, mut bz, bi) = (simplified[ii][0], simplified[ii][2], simplified[ii][3] as usize);

        // Traverse in lexicographic order so both sides of a shared edge
        // simplify the same way.
        let (mut ci, cinc, endi) = if bx > ax || (bx == ax && bz > az) {
            ((ai + 1) % pn, 1, bi)
        } else {
            std::mem::swap(&mut ax, &mut bx);
            std::mem::swap(&mut az, &mut bz);
            ((bi + pn - 1) % pn, pn - 1, ai)
        };

        let mut maxd = 0.0;
        let mut maxi = None;
        if points[ci][3] & CONTOUR_REG_MASK == 0 || points[ci][3] & AREA_BORDER != 0 {
            while ci != endi {
                let d = distance_pt_seg(points[ci][0], points[ci][2], ax, az, bx, bz);
                if d > maxd {
                    maxd = d;
                    maxi = Some(ci);
                }
                ci = (ci + cinc) % pn;
            }
        }

        match maxi {
            Some(m) if maxd > max_error_sqr => {
                simplified.insert(i + 1, [points[m][0], points[m][1], points[m][2], m as i32]);
            }
            _ => i += 1,
        }
    }

    // Split long edges.
    if max_edge_len > 0 && build_flags & (CONTOUR_TESS_WALL_EDGES | CONTOUR_TESS_AREA_EDGES) != 0 {
        let mut i = 0;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();
            let (ax, az, ai) = (simplified[i][0], simplified[i][2], simplified[i][3] as usize);
            let (bx, bz, bi) = (simplified[ii][0], simplified[ii][2], simplified[ii][3] as usize);

            let ci = (ai + 1) % pn;
            let tess = (build_flags & CONTOUR_TESS_WALL_EDGES != 0
                && points[ci][3] & CONTOUR_REG_MASK == 0)
                || (build_flags & CONTOUR_TESS_AREA_EDGES != 0 && points[ci][3] & AREA_BORDER != 0);

            let mut maxi = None;
            if tess {
                let dx = bx - ax;
                let dz = bz - az;
                if dx * dx + dz * dz > max_edge_len * max_edge_len {
                    let n = if bi < ai { bi + pn - ai } else { bi - ai };
                    if n > 1 {
                        maxi = Some(if bx > ax || (bx == ax && bz > az) {
                            (ai + n / 2) % pn
                        } else {
                            (ai + (n + 1) / 2) % pn
                        });
                    }
                }
            }

            match maxi {
                Some(m) => {
                    simplified.insert(i + 1, [points[m][0], points[m][1], points[m][2], m as i32]);
                }
                None => i += 1,
            }
        }
    }

    // Edge flags come from the raw vertex after the simplified vertex.
    for v in simplified.iter_mut() {
        let ai = (v[3] as usize + 1) % pn;
        v[3] = points[ai][3] & (CONTOUR_REG_MASK | AREA_BORDER);
    }
}

fn remove_degenerate_segments(simplified: &mut Vec<GridVert>) {
    let mut i = 0;
    while i < simplified.len() {
        let ni = gg::next(i, simplified.len());
        if simplified.len() > 1 && gg::vequal(&simplified[i], &simplified[ni]) {
            simplified.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Twice the signed area of the contour; negative for holes.
fn calc_area_of_polygon_2d(verts: &[GridVert]) -> i32 {
    let n = verts.len();
    let mut area = 0;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        area += vi[0] * vj[2] - vj[0] * vi[2];
        j = i;
    }
    (area + 1) / 2
}

fn find_left_most_vertex(verts: &[GridVert]) -> (usize, i32, i32) {
    let mut best = (0, verts[0][0], verts[0][2]);
    for (i, v) in verts.iter().enumerate().skip(1) {
        if v[0] < best.1 || (v[0] == best.1 && v[2] < best.2) {
            best = (i, v[0], v[2]);
        }
    }
    best
}

/// True if `pj` lies in the cone of outline vertex `i`.
fn in_cone(i: usize, verts: &[GridVert], pj: &GridVert) -> bool {
    let n = verts.len();
    let pi = &verts[i];
    let pi1 = &verts[gg::next(i, n)];
    let pin1 = &verts[gg::prev(i, n)];
    if gg::left_on(pin1, pi, pi1) {
        return gg::left(pi, pj, pin1) && gg::left(pj, pi, pi1);
    }
    !(gg::left_on(pi, pj, pi1) && gg::left_on(pj, pi, pin1))
}

/// True if segment d0-d1 crosses an edge of `verts` not incident to vertex `skip`.
fn intersect_seg_contour(d0: &GridVert, d1: &GridVert, skip: Option<usize>, verts: &[GridVert]) -> bool {
    let n = verts.len();
    for k in 0..n {
        let k1 = gg::next(k, n);
        if skip == Some(k) || skip == Some(k1) {
            continue;
        }
        let p0 = &verts[k];
        let p1 = &verts[k1];
        if gg::vequal(d0, p0) || gg::vequal(d1, p0) || gg::vequal(d0, p1) || gg::vequal(d1, p1) {
            continue;
        }
        if gg::intersect(d0, d1, p0, p1) {
            return true;
        }
    }
    false
}

/// Joins hole `b` into outline `a` through the diagonal (ia, ib).
fn merge_contours(a: &[GridVert], b: &[GridVert], ia: usize, ib: usize) -> Vec<GridVert> {
    let mut verts = Vec::with_capacity(a.len() + b.len() + 2);
    for i in 0..=a.len() {
        verts.push(a[(ia + i) % a.len()]);
    }
    for i in 0..=b.len() {
        verts.push(b[(ib + i) % b.len()]);
    }
    verts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance_field::build_distance_field;
    use crate::heightfield::{Heightfield, NULL_AREA, WALKABLE_AREA};
    use crate::region::build_regions_watershed;

    fn regions_chf(size: i32, hole: Option<(i32, i32)>) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 5.0, size as f32),
            1.0,
            0.5,
        );
        for z in 0..size {
            for x in 0..size {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        let mut chf = CompactHeightfield::build(&mut ctx, 2, 1, &hf);
        if let Some((lo, hi)) = hole {
            for z in lo..hi {
                for x in lo..hi {
                    let i = chf.cell_spans(x, z).start;
                    chf.areas[i] = NULL_AREA;
                }
            }
        }
        build_distance_field(&mut chf);
        build_regions_watershed(&mut ctx, &mut chf, 0, 400).unwrap();
        chf
    }

    #[test]
    fn test_square_region_simplifies_to_quad() {
        let chf = regions_chf(10, None);
        let mut ctx = BuildContext::new();
        let cset = ContourSet::build(&mut ctx, &chf, 1.3, 0, CONTOUR_TESS_WALL_EDGES);
        assert_eq!(cset.contours.len(), 1);
        let c = &cset.contours[0];
        assert_eq!(c.verts.len(), 4);
        assert_eq!(c.rverts.len(), 40);
        for v in &c.verts {
            assert!(v[0] == 0 || v[0] == 10);
            assert!(v[2] == 0 || v[2] == 10);
            assert_eq!(v[1], 2);
        }
    }

    #[test]
    fn test_long_edges_are_split() {
        let chf = regions_chf(10, None);
        let mut ctx = BuildContext::new();
        let cset = ContourSet::build(&mut ctx, &chf, 1.3, 4, CONTOUR_TESS_WALL_EDGES);
        let verts = &cset.contours[0].verts;
        assert!(verts.len() > 4);
        for i in 0..verts.len() {
            let a = verts[i];
            let b = verts[(i + 1) % verts.len()];
            let d2 = (b[0] - a[0]).pow(2) + (b[2] - a[2]).pow(2);
            assert!(d2 <= 16);
        }
    }

    #[test]
    fn test_hole_is_merged_into_outline() {
        let chf = regions_chf(12, Some((5, 7)));
        let mut ctx = BuildContext::new();
        let cset = ContourSet::build(&mut ctx, &chf, 1.3, 0, CONTOUR_TESS_WALL_EDGES);
        let live: Vec<_> = cset.contours.iter().filter(|c| !c.verts.is_empty()).collect();
        for c in &live {
            assert!(calc_area_of_polygon_2d(&c.verts) > 0);
        }
        assert_eq!(ctx.count(crate::context::LogLevel::Error), 0);
    }

    #[test]
    fn test_polygon_area_sign() {
        let ccw = [[0, 0, 0, 0], [0, 0, 4, 0], [4, 0, 4, 0], [4, 0, 0, 0]];
        assert!(calc_area_of_polygon_2d(&ccw) > 0);
        let mut cw = ccw;
        cw.reverse();
        assert!(calc_area_of_polygon_2d(&cw) < 0);
    }
}
