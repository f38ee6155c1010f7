//! Triangle rasterization into a solid heightfield
//!
//! Each triangle is clipped against the grid rows and then the grid columns;
//! the vertical extent of every clipped piece becomes a span.

use glam::Vec3;
use navmesh_common::{overlap_bounds, Result};

use crate::heightfield::{Heightfield, SPAN_MAX_HEIGHT};

/// Splits the convex polygon `input` along the plane `v[axis] = x`.
///
/// `below` receives the part with `v[axis] < x`, `above` the remainder.
fn divide_poly(input: &[Vec3], below: &mut Vec<Vec3>, above: &mut Vec<Vec3>, x: f32, axis: usize) {
    below.clear();
    above.clear();
    if input.is_empty() {
        return;
    }
    let d: Vec<f32> = input.iter().map(|v| x - v[axis]).collect();

    let n = input.len();
    let mut j = n - 1;
    for i in 0..n {
        let ina = d[j] >= 0.0;
        let inb = d[i] >= 0.0;
        if ina != inb {
            let s = d[j] / (d[j] - d[i]);
            let v = input[j] + (input[i] - input[j]) * s;
            below.push(v);
            above.push(v);
            // Vertices exactly on the plane go to one side only.
            if d[i] > 0.0 {
                below.push(input[i]);
            } else if d[i] < 0.0 {
                above.push(input[i]);
            }
        } else {
            if d[i] >= 0.0 {
                below.push(input[i]);
                if d[i] != 0.0 {
                    j = i;
                    continue;
                }
            }
            above.push(input[i]);
        }
        j = i;
    }
}

/// Rasterizes a single triangle.
pub fn rasterize_triangle(
    hf: &mut Heightfield,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    area: u8,
    flag_merge_threshold: i32,
) -> Result<()> {
    let tmin = v0.min(v1).min(v2);
    let tmax = v0.max(v1).max(v2);
    if !overlap_bounds(hf.bmin, hf.bmax, tmin, tmax) {
        return Ok(());
    }

    let w = hf.width;
    let h = hf.height;
    let by = hf.bmax.y - hf.bmin.y;
    let ics = 1.0 / hf.cs;
    let ich = 1.0 / hf.ch;

    let z0 = (((tmin.z - hf.bmin.z) * ics) as i32).clamp(-1, h - 1);
    let z1 = (((tmax.z - hf.bmin.z) * ics) as i32).clamp(0, h - 1);

    let mut remaining = vec![v0, v1, v2];
    let mut row = Vec::with_capacity(7);
    let mut rest = Vec::with_capacity(7);
    let mut cell = Vec::with_capacity(7);
    let mut right = Vec::with_capacity(7);

    for z in z0..=z1 {
        let cz = hf.bmin.z + z as f32 * hf.cs;
        divide_poly(&remaining, &mut row, &mut rest, cz + hf.cs, 2);
        std::mem::swap(&mut remaining, &mut rest);
        if row.len() < 3 || z < 0 {
            continue;
        }

        let (min_x, max_x) = row
            .iter()
            .fold((row[0].x, row[0].x), |(lo, hi), v| (lo.min(v.x), hi.max(v.x)));
        let x0 = (((min_x - hf.bmin.x) * ics) as i32).clamp(-1, w - 1);
        let x1 = (((max_x - hf.bmin.x) * ics) as i32).clamp(0, w - 1);

        let mut strip = row.clone();
        for x in x0..=x1 {
            let cx = hf.bmin.x + x as f32 * hf.cs;
            divide_poly(&strip, &mut cell, &mut right, cx + hf.cs, 0);
            std::mem::swap(&mut strip, &mut right);
            if cell.len() < 3 || x < 0 {
                continue;
            }

            let (smin, smax) = cell
                .iter()
                .fold((cell[0].y, cell[0].y), |(lo, hi), v| (lo.min(v.y), hi.max(v.y)));
            let smin = smin - hf.bmin.y;
            let smax = smax - hf.bmin.y;
            if smax < 0.0 || smin > by {
                continue;
            }
            let smin = smin.max(0.0);
            let smax = smax.min(by);

            let ismin = ((smin * ich).floor() as i32).clamp(0, SPAN_MAX_HEIGHT as i32) as u16;
            let ismax =
                ((smax * ich).ceil() as i32).clamp(ismin as i32 + 1, SPAN_MAX_HEIGHT as i32) as u16;

            hf.add_span(x, z, ismin, ismax, area, flag_merge_threshold)?;
        }
    }
    Ok(())
}

/// Rasterizes indexed triangles with one area id per triangle.
pub fn rasterize_triangles(
    hf: &mut Heightfield,
    verts: &[Vec3],
    tris: &[[u32; 3]],
    areas: &[u8],
    flag_merge_threshold: i32,
) -> Result<()> {
    for (tri, &area) in tris.iter().zip(areas) {
        let v0 = verts[tri[0] as usize];
        let v1 = verts[tri[1] as usize];
        let v2 = verts[tri[2] as usize];
        rasterize_triangle(hf, v0, v1, v2, area, flag_merge_threshold)?;
    }
    Ok(())
}
