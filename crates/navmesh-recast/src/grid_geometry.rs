//! Exact predicates on integer grid vertices
//!
//! Contour and polygon mesh vertices live on the voxel grid; these tests run
//! on their x and z components without rounding error.

/// A grid vertex: x, y, z and a per-vertex tag.
pub type GridVert = [i32; 4];

#[inline]
pub(crate) fn area2(a: &GridVert, b: &GridVert, c: &GridVert) -> i32 {
    (b[0] - a[0]) * (c[2] - a[2]) - (c[0] - a[0]) * (b[2] - a[2])
}

/// True if `c` is strictly left of the directed line a -> b.
#[inline]
pub(crate) fn left(a: &GridVert, b: &GridVert, c: &GridVert) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: &GridVert, b: &GridVert, c: &GridVert) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: &GridVert, b: &GridVert, c: &GridVert) -> bool {
    area2(a, b, c) == 0
}

/// Same x and z.
#[inline]
pub(crate) fn vequal(a: &GridVert, b: &GridVert) -> bool {
    a[0] == b[0] && a[2] == b[2]
}

/// Proper intersection: the segments share a point interior to both.
pub(crate) fn intersect_prop(a: &GridVert, b: &GridVert, c: &GridVert, d: &GridVert) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// True if `c` lies on the closed segment a-b.
fn between(a: &GridVert, b: &GridVert, c: &GridVert) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a[0] != b[0] {
        (a[0] <= c[0] && c[0] <= b[0]) || (a[0] >= c[0] && c[0] >= b[0])
    } else {
        (a[2] <= c[2] && c[2] <= b[2]) || (a[2] >= c[2] && c[2] >= b[2])
    }
}

/// Proper or improper intersection of segments a-b and c-d.
pub(crate) fn intersect(a: &GridVert, b: &GridVert, c: &GridVert, d: &GridVert) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

#[inline]
pub(crate) fn next(i: usize, n: usize) -> usize {
    if i + 1 < n {
        i + 1
    } else {
        0
    }
}

#[inline]
pub(crate) fn prev(i: usize, n: usize) -> usize {
    if i >= 1 {
        i - 1
    } else {
        n - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: i32, z: i32) -> GridVert {
        [x, 0, z, 0]
    }

    #[test]
    fn test_segment_intersection() {
        assert!(intersect(&v(0, 0), &v(4, 4), &v(0, 4), &v(4, 0)));
        assert!(intersect_prop(&v(0, 0), &v(4, 4), &v(0, 4), &v(4, 0)));
        // Touching at an endpoint is improper.
        assert!(intersect(&v(0, 0), &v(2, 2), &v(2, 2), &v(4, 0)));
        assert!(!intersect_prop(&v(0, 0), &v(2, 2), &v(2, 2), &v(4, 0)));
        assert!(!intersect(&v(0, 0), &v(1, 0), &v(0, 1), &v(1, 1)));
    }

    #[test]
    fn test_orientation() {
        assert!(left(&v(0, 0), &v(0, 2), &v(1, 1)));
        assert!(!left(&v(0, 0), &v(0, 2), &v(-1, 1)));
        assert!(left_on(&v(0, 0), &v(0, 2), &v(0, 5)));
        assert_eq!(next(2, 3), 0);
        assert_eq!(prev(0, 3), 2);
    }
}
