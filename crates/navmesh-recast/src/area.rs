//! Area id assignment
//!
//! Triangle slope classification before rasterization, and erosion, median
//! filtering and shape marking on the compact heightfield.

use glam::Vec3;
use navmesh_common::{calc_tri_normal, point_in_polygon_2d};

use crate::compact_heightfield::CompactHeightfield;
use crate::heightfield::{NULL_AREA, WALKABLE_AREA};

/// Classifies triangles by slope: [`WALKABLE_AREA`] if the face normal is
/// within `walkable_slope_angle` degrees of vertical, [`NULL_AREA`] otherwise.
///
/// Both windings count, so downward-facing input is still walkable.
pub fn mark_walkable_triangles(
    walkable_slope_angle: f32,
    verts: &[Vec3],
    tris: &[[u32; 3]],
) -> Vec<u8> {
    let threshold = walkable_slope_angle.to_radians().cos();
    tris.iter()
        .map(|t| {
            let n = calc_tri_normal(
                verts[t[0] as usize],
                verts[t[1] as usize],
                verts[t[2] as usize],
            );
            if n.y.abs() > threshold {
                WALKABLE_AREA
            } else {
                NULL_AREA
            }
        })
        .collect()
}

/// Removes walkable spans closer than `radius` cells to a non-walkable
/// boundary, using a two-pass chamfer distance transform.
pub fn erode_walkable_area(chf: &mut CompactHeightfield, radius: i32) {
    let w = chf.width;
    let h = chf.height;
    let mut dist = vec![0xffu8; chf.span_count];

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    dist[i] = 0;
                    continue;
                }
                let walkable_neighbours = (0..4)
                    .filter_map(|dir| chf.neighbour(x, z, i, dir))
                    .filter(|&(_, _, ni)| chf.areas[ni] != NULL_AREA)
                    .count();
                if walkable_neighbours != 4 {
                    dist[i] = 0;
                }
            }
        }
    }

    let relax = |dist: &mut [u8], i: usize, from: usize, cost: u8| {
        let nd = dist[from].saturating_add(cost);
        if nd < dist[i] {
            dist[i] = nd;
        }
    };

    // Pass 1: (-1,0), (-1,-1), (0,-1), (1,-1).
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 0) {
                    relax(&mut dist, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 3) {
                        relax(&mut dist, i, aai, 3);
                    }
                }
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 3) {
                    relax(&mut dist, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 2) {
                        relax(&mut dist, i, aai, 3);
                    }
                }
            }
        }
    }

    // Pass 2: (1,0), (1,1), (0,1), (-1,1).
    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell_spans(x, z) {
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 2) {
                    relax(&mut dist, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 1) {
                        relax(&mut dist, i, aai, 3);
                    }
                }
                if let Some((ax, az, ai)) = chf.neighbour(x, z, i, 1) {
                    relax(&mut dist, i, ai, 2);
                    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, 0) {
                        relax(&mut dist, i, aai, 3);
                    }
                }
            }
        }
    }

    let threshold = (radius * 2).clamp(0, 0xff) as u8;
    for (area, &d) in chf.areas.iter_mut().zip(&dist) {
        if d < threshold {
            *area = NULL_AREA;
        }
    }
}

/// Replaces each walkable area id by the median of its 3x3 neighbourhood.
pub fn median_filter_walkable_area(chf: &mut CompactHeightfield) {
    let w = chf.width;
    let h = chf.height;
    let mut areas = vec![0xffu8; chf.span_count];

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let area = chf.areas[i];
                if area == NULL_AREA {
                    areas[i] = area;
                    continue;
                }
                let mut nei = [area; 9];
                for dir in 0..4 {
                    let Some((ax, az, ai)) = chf.neighbour(x, z, i, dir) else {
                        continue;
                    };
                    if chf.areas[ai] != NULL_AREA {
                        nei[dir * 2] = chf.areas[ai];
                    }
                    if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, (dir + 1) & 3) {
                        if chf.areas[ai2] != NULL_AREA {
                            nei[dir * 2 + 1] = chf.areas[ai2];
                        }
                    }
                }
                nei.sort_unstable();
                areas[i] = nei[4];
            }
        }
    }
    chf.areas = areas;
}

/// Clamped cell range covering `[bmin, bmax]`, or `None` when outside.
fn cell_range(chf: &CompactHeightfield, bmin: Vec3, bmax: Vec3) -> Option<(i32, i32, i32, i32, i32, i32)> {
    let minx = ((bmin.x - chf.bmin.x) / chf.cs) as i32;
    let miny = ((bmin.y - chf.bmin.y) / chf.ch) as i32;
    let minz = ((bmin.z - chf.bmin.z) / chf.cs) as i32;
    let maxx = ((bmax.x - chf.bmin.x) / chf.cs) as i32;
    let maxy = ((bmax.y - chf.bmin.y) / chf.ch) as i32;
    let maxz = ((bmax.z - chf.bmin.z) / chf.cs) as i32;

    if maxx < 0 || minx >= chf.width || maxz < 0 || minz >= chf.height {
        return None;
    }
    Some((
        minx.max(0),
        miny,
        minz.max(0),
        maxx.min(chf.width - 1),
        maxy,
        maxz.min(chf.height - 1),
    ))
}

/// Sets the area of walkable spans whose floor lies inside the box.
pub fn mark_box_area(chf: &mut CompactHeightfield, bmin: Vec3, bmax: Vec3, area: u8) {
    let Some((minx, miny, minz, maxx, maxy, maxz)) = cell_range(chf, bmin, bmax) else {
        return;
    };
    for z in minz..=maxz {
        for x in minx..=maxx {
            for i in chf.cell_spans(x, z) {
                let y = chf.spans[i].y as i32;
                if y >= miny && y <= maxy && chf.areas[i] != NULL_AREA {
                    chf.areas[i] = area;
                }
            }
        }
    }
}

/// Sets the area of walkable spans inside the extruded convex polygon.
pub fn mark_convex_poly_area(
    chf: &mut CompactHeightfield,
    verts: &[Vec3],
    hmin: f32,
    hmax: f32,
    area: u8,
) {
    let Some((mut bmin, mut bmax)) = navmesh_common::calc_bounds(verts) else {
        return;
    };
    bmin.y = hmin;
    bmax.y = hmax;
    let Some((minx, miny, minz, maxx, maxy, maxz)) = cell_range(chf, bmin, bmax) else {
        return;
    };
    for z in minz..=maxz {
        for x in minx..=maxx {
            let center = chf.cell_center(x, z);
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    continue;
                }
                let y = chf.spans[i].y as i32;
                if y >= miny && y <= maxy && point_in_polygon_2d(center, verts) {
                    chf.areas[i] = area;
                }
            }
        }
    }
}

/// Sets the area of walkable spans inside the vertical cylinder standing on
/// `pos`.
pub fn mark_cylinder_area(chf: &mut CompactHeightfield, pos: Vec3, radius: f32, height: f32, area: u8) {
    let bmin = Vec3::new(pos.x - radius, pos.y, pos.z - radius);
    let bmax = Vec3::new(pos.x + radius, pos.y + height, pos.z + radius);
    let Some((minx, miny, minz, maxx, maxy, maxz)) = cell_range(chf, bmin, bmax) else {
        return;
    };
    let r2 = radius * radius;
    for z in minz..=maxz {
        for x in minx..=maxx {
            let center = chf.cell_center(x, z);
            let dx = center.x - pos.x;
            let dz = center.z - pos.z;
            if dx * dx + dz * dz >= r2 {
                continue;
            }
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    continue;
                }
                let y = chf.spans[i].y as i32;
                if y >= miny && y <= maxy {
                    chf.areas[i] = area;
                }
            }
        }
    }
}
