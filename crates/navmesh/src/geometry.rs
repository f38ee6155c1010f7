//! Input geometry store
//!
//! Triangle soup the navigation mesh is built from. Raw polygon lists are
//! fan-triangulated on the way in; the store also answers segment queries
//! against the original triangles.

use glam::Vec3;
use navmesh_common::{calc_bounds, intersect_segment_triangle, Error, Result};

/// Triangle mesh used as build input
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct InputGeometry {
    verts: Vec<Vec3>,
    tris: Vec<[u32; 3]>,
    bmin: Vec3,
    bmax: Vec3,
}

impl InputGeometry {
    /// Reads flat `xyz` vertex triples and a face list of
    /// `[count, i0, .., i(count-1)]` records.
    ///
    /// Faces with more than three vertices are triangulated as fans around
    /// their first vertex. Nothing is kept when any part of the input is
    /// malformed.
    pub fn from_raw(vertices: &[f32], faces: &[i32]) -> Result<Self> {
        if vertices.is_empty() {
            return Err(Error::InvalidInput("no vertices".to_string()));
        }
        if vertices.len() % 3 != 0 {
            return Err(Error::InvalidInput(format!(
                "vertex array length {} is not a multiple of 3",
                vertices.len()
            )));
        }
        let verts: Vec<Vec3> = vertices.chunks_exact(3).map(Vec3::from_slice).collect();

        let mut tris = Vec::new();
        let mut cursor = 0;
        while cursor < faces.len() {
            let count = faces[cursor];
            if count < 3 {
                return Err(Error::InvalidInput(format!(
                    "face at offset {cursor} has {count} vertices"
                )));
            }
            let count = count as usize;
            let Some(face) = faces.get(cursor + 1..cursor + 1 + count) else {
                return Err(Error::InvalidInput(format!(
                    "face at offset {cursor} is truncated: {count} indices announced, {} left",
                    faces.len() - cursor - 1
                )));
            };
            let mut indices = Vec::with_capacity(count);
            for &i in face {
                match u32::try_from(i) {
                    Ok(v) if (v as usize) < verts.len() => indices.push(v),
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "face at offset {cursor} references vertex {i} outside 0..{}",
                            verts.len()
                        )))
                    }
                }
            }
            for j in 2..count {
                tris.push([indices[0], indices[j - 1], indices[j]]);
            }
            cursor += count + 1;
        }

        Self::from_triangles(verts, tris)
    }

    /// Takes an already triangulated mesh.
    pub fn from_triangles(verts: Vec<Vec3>, tris: Vec<[u32; 3]>) -> Result<Self> {
        if let Some(v) = verts.iter().find(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(format!("non-finite vertex {v}")));
        }
        if let Some(t) = tris
            .iter()
            .find(|t| t.iter().any(|&i| i as usize >= verts.len()))
        {
            return Err(Error::InvalidInput(format!(
                "triangle {t:?} references a vertex outside 0..{}",
                verts.len()
            )));
        }
        let (bmin, bmax) = calc_bounds(&verts)
            .ok_or_else(|| Error::InvalidInput("no vertices".to_string()))?;
        Ok(Self {
            verts,
            tris,
            bmin,
            bmax,
        })
    }

    pub fn verts(&self) -> &[Vec3] {
        &self.verts
    }

    pub fn tris(&self) -> &[[u32; 3]] {
        &self.tris
    }

    /// Axis-aligned bounds of the vertices
    pub fn bounds(&self) -> (Vec3, Vec3) {
        (self.bmin, self.bmax)
    }

    /// Nearest hit of segment `start..end` against the triangles, as a
    /// fraction of the segment. Both faces of a triangle count.
    pub fn raycast(&self, start: Vec3, end: Vec3) -> Option<f32> {
        // Cheap reject against the mesh bounds.
        let (lo, hi) = (start.min(end), start.max(end));
        if lo.cmpgt(self.bmax).any() || hi.cmplt(self.bmin).any() {
            return None;
        }
        self.tris
            .iter()
            .filter_map(|t| {
                intersect_segment_triangle(
                    start,
                    end,
                    self.verts[t[0] as usize],
                    self.verts[t[1] as usize],
                    self.verts[t[2] as usize],
                )
            })
            .min_by(f32::total_cmp)
    }

    /// Per-triangle area ids: walkable where the slope is at most
    /// `walkable_slope_angle` degrees, null elsewhere.
    pub fn mark_walkable_triangles(&self, walkable_slope_angle: f32) -> Vec<u8> {
        navmesh_recast::mark_walkable_triangles(walkable_slope_angle, &self.verts, &self.tris)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navmesh_recast::{NULL_AREA, WALKABLE_AREA};

    fn quad() -> (Vec<f32>, Vec<i32>) {
        (
            vec![
                0.0, 0.0, 0.0, //
                10.0, 0.0, 0.0, //
                10.0, 0.0, 10.0, //
                0.0, 0.0, 10.0,
            ],
            vec![4, 0, 1, 2, 3],
        )
    }

    #[test]
    fn test_fan_triangulation() {
        let (verts, faces) = quad();
        let geom = InputGeometry::from_raw(&verts, &faces).unwrap();
        assert_eq!(geom.verts().len(), 4);
        assert_eq!(geom.tris(), &[[0, 1, 2], [0, 2, 3]]);
        assert_eq!(geom.bounds(), (Vec3::ZERO, Vec3::new(10.0, 0.0, 10.0)));
    }

    #[test]
    fn test_mixed_faces() {
        let (verts, _) = quad();
        let geom = InputGeometry::from_raw(&verts, &[3, 0, 1, 2, 3, 0, 2, 3]).unwrap();
        assert_eq!(geom.tris().len(), 2);
    }

    #[test]
    fn test_rejects_malformed_input() {
        let (verts, faces) = quad();
        let invalid = |v: &[f32], f: &[i32]| {
            matches!(InputGeometry::from_raw(v, f), Err(Error::InvalidInput(_)))
        };
        assert!(invalid(&verts[..11], &faces));
        assert!(invalid(&[], &[]));
        assert!(invalid(&verts, &[2, 0, 1]));
        assert!(invalid(&verts, &[4, 0, 1, 2]));
        assert!(invalid(&verts, &[3, 0, 1, 4]));
        assert!(invalid(&verts, &[3, 0, -1, 2]));

        let mut nan = verts.clone();
        nan[4] = f32::NAN;
        assert!(invalid(&nan, &faces));
    }

    #[test]
    fn test_raycast_hits_either_face() {
        let (verts, faces) = quad();
        let geom = InputGeometry::from_raw(&verts, &faces).unwrap();

        let down = geom.raycast(Vec3::new(5.0, 4.0, 5.0), Vec3::new(5.0, -4.0, 5.0));
        assert!((down.unwrap() - 0.5).abs() < 1e-5);
        let up = geom.raycast(Vec3::new(5.0, -2.0, 5.0), Vec3::new(5.0, 6.0, 5.0));
        assert!((up.unwrap() - 0.25).abs() < 1e-5);

        assert!(geom
            .raycast(Vec3::new(5.0, 4.0, 5.0), Vec3::new(5.0, 1.0, 5.0))
            .is_none());
        assert!(geom
            .raycast(Vec3::new(20.0, 4.0, 5.0), Vec3::new(20.0, -4.0, 5.0))
            .is_none());
    }

    #[test]
    fn test_walkable_marking() {
        let geom = InputGeometry::from_triangles(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 1], [0, 3, 1]],
        )
        .unwrap();
        assert_eq!(
            geom.mark_walkable_triangles(45.0),
            vec![WALKABLE_AREA, WALKABLE_AREA, NULL_AREA]
        );
    }
}
