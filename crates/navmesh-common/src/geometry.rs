//! 2D and 3D geometry kernel
//!
//! Most predicates work on the XZ plane with Y up. Winding conventions follow
//! the polygon mesh: a positive [`tri_area_2d`] means the three points turn
//! clockwise when looking down the Y axis.

use glam::Vec3;

/// Threshold below which two points are considered the same.
const EQUAL_THRESHOLD: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);

/// Twice the signed area of the triangle (a, b, c) on the XZ plane.
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// 2D perp-dot product on the XZ plane.
#[inline]
pub fn perp_2d(u: Vec3, v: Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Dot product on the XZ plane.
#[inline]
pub fn dot_2d(u: Vec3, v: Vec3) -> f32 {
    u.x * v.x + u.z * v.z
}

/// Squared distance on the XZ plane.
#[inline]
pub fn dist_2d_sqr(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Distance on the XZ plane.
#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_2d_sqr(a, b).sqrt()
}

/// Returns true if the two points are practically the same.
#[inline]
pub fn vequal(a: Vec3, b: Vec3) -> bool {
    a.distance_squared(b) < EQUAL_THRESHOLD
}

/// Squared XZ distance from `p` to segment (a, b) and the segment parameter.
pub fn dist_pt_seg_sqr_2d(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let pqx = b.x - a.x;
    let pqz = b.z - a.z;
    let dx = p.x - a.x;
    let dz = p.z - a.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let ex = a.x + t * pqx - p.x;
    let ez = a.z + t * pqz - p.z;
    (ex * ex + ez * ez, t)
}

/// Squared 3D distance from `p` to segment (a, b).
pub fn dist_pt_seg_sqr(p: Vec3, a: Vec3, b: Vec3) -> f32 {
    let pq = b - a;
    let d = pq.length_squared();
    let mut t = pq.dot(p - a);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    (a + pq * t).distance_squared(p)
}

/// Point-in-polygon test on the XZ plane (crossing number).
pub fn point_in_polygon_2d(p: Vec3, verts: &[Vec3]) -> bool {
    let n = verts.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Point-in-polygon test that also reports the squared distance and
/// parameter to every edge. Edge `j` runs from vertex `j` to vertex `j + 1`.
pub fn dist_pt_poly_edges_sqr(p: Vec3, verts: &[Vec3], ed: &mut Vec<f32>, et: &mut Vec<f32>) -> bool {
    let n = verts.len();
    ed.clear();
    et.clear();
    ed.resize(n, 0.0);
    et.resize(n, 0.0);
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        let (d, t) = dist_pt_seg_sqr_2d(p, vj, vi);
        ed[j] = d;
        et[j] = t;
        j = i;
    }
    inside
}

/// Result of clipping a segment against a convex polygon on the XZ plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyHit {
    /// Parameter where the segment enters the polygon
    pub tmin: f32,
    /// Parameter where the segment leaves the polygon
    pub tmax: f32,
    /// Edge crossed when entering, if the start lies outside
    pub seg_min: Option<usize>,
    /// Edge crossed when leaving, if the end lies outside
    pub seg_max: Option<usize>,
}

/// Clips segment (p0, p1) against the convex polygon `verts`.
///
/// Edge indices refer to the edge starting at that vertex.
pub fn intersect_segment_poly_2d(p0: Vec3, p1: Vec3, verts: &[Vec3]) -> Option<SegmentPolyHit> {
    const EPS: f32 = 1e-8;
    let n = verts.len();
    let mut hit = SegmentPolyHit {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = p1 - p0;
    let mut j = n.checked_sub(1)?;
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = p0 - verts[j];
        let num = perp_2d(edge, diff);
        let den = perp_2d(dir, edge);
        if den.abs() < EPS {
            // Parallel to the edge.
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }
    Some(hit)
}

/// Intersects segments (ap, aq) and (bp, bq) on the XZ plane, returning
/// the parameters along each.
pub fn intersect_seg_seg_2d(ap: Vec3, aq: Vec3, bp: Vec3, bq: Vec3) -> Option<(f32, f32)> {
    let u = aq - ap;
    let v = bq - bp;
    let w = ap - bp;
    let d = u.x * v.z - u.z * v.x;
    if d.abs() < 1e-6 {
        return None;
    }
    let s = (v.x * w.z - v.z * w.x) / d;
    let t = (u.x * w.z - u.z * w.x) / d;
    Some((s, t))
}

/// Height of the triangle (a, b, c) under `p`, if `p` projects inside it.
pub fn closest_height_point_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPS: f32 = 1e-6;
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;
    let mut denom = denom;
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }
    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a.y + (v0.y * u + v1.y * v) / denom)
    } else {
        None
    }
}

/// Intersects segment (sp, sq) with triangle (a, b, c), either face.
///
/// Returns the parameter of the hit along the segment.
pub fn intersect_segment_triangle(sp: Vec3, sq: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPS: f32 = 1e-9;
    let dir = sq - sp;
    let e1 = b - a;
    let e2 = c - a;
    let h = dir.cross(e2);
    let det = e1.dot(h);
    if det.abs() < EPS {
        return None;
    }
    let inv = 1.0 / det;
    let s = sp - a;
    let u = s.dot(h) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    if (0.0..=1.0).contains(&t) {
        Some(t)
    } else {
        None
    }
}

/// Checks if two axis-aligned bounding boxes overlap.
#[inline]
pub fn overlap_bounds(amin: Vec3, amax: Vec3, bmin: Vec3, bmax: Vec3) -> bool {
    amin.x <= bmax.x
        && amax.x >= bmin.x
        && amin.y <= bmax.y
        && amax.y >= bmin.y
        && amin.z <= bmax.z
        && amax.z >= bmin.z
}

/// Bounds of a point set. Returns `None` for an empty set.
pub fn calc_bounds(verts: &[Vec3]) -> Option<(Vec3, Vec3)> {
    let first = *verts.first()?;
    Some(
        verts
            .iter()
            .fold((first, first), |(bmin, bmax), v| (bmin.min(*v), bmax.max(*v))),
    )
}

/// Unit normal of triangle (v0, v1, v2).
#[inline]
pub fn calc_tri_normal(v0: Vec3, v1: Vec3, v2: Vec3) -> Vec3 {
    (v1 - v0).cross(v2 - v0).normalize_or_zero()
}

/// Signed area of a polygon on the XZ plane. Negative for holes traced by
/// the contour builder.
pub fn poly_area_2d(verts: &[Vec3]) -> f32 {
    let n = verts.len();
    let mut area = 0.0;
    for i in 2..n {
        area += tri_area_2d(verts[0], verts[i - 1], verts[i]);
    }
    area * 0.5
}
