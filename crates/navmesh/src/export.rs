//! Mesh views of a built navigation mesh

use glam::Vec3;
use navmesh_detour::{NavMesh, PolyRef};

/// Vertices and triangle index triples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Triangulation {
    pub verts: Vec<Vec3>,
    pub tris: Vec<[u32; 3]>,
}

/// Vertices, flattened polygon indices and the vertex count of each polygon
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Polygonization {
    pub verts: Vec<Vec3>,
    pub polys: Vec<u32>,
    pub sizes: Vec<u32>,
}

impl Triangulation {
    /// Flat `xyz` vertex array
    pub fn flat_verts(&self) -> Vec<f32> {
        self.verts.iter().flat_map(|v| v.to_array()).collect()
    }

    /// Flat index array, three per triangle
    pub fn flat_indices(&self) -> Vec<u32> {
        self.tris.iter().flatten().copied().collect()
    }
}

impl Polygonization {
    pub fn flat_verts(&self) -> Vec<f32> {
        self.verts.iter().flat_map(|v| v.to_array()).collect()
    }
}

/// Ground polygons split into fans around their first vertex.
pub fn triangulate(mesh: &NavMesh) -> Triangulation {
    let mut tris = Vec::new();
    for poly in mesh.polys().iter().filter(|p| !p.is_off_mesh()) {
        let v = &poly.verts[..poly.vert_count as usize];
        for j in 2..v.len() {
            tris.push([v[0] as u32, v[j - 1] as u32, v[j] as u32]);
        }
    }
    Triangulation {
        verts: mesh.verts().to_vec(),
        tris,
    }
}

/// Detail triangles of every ground polygon, three fresh vertices each.
pub fn triangulate_detail(mesh: &NavMesh) -> Triangulation {
    let mut out = Triangulation::default();
    for (i, _) in mesh
        .polys()
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_off_mesh())
    {
        for tri in mesh.detail_triangles(PolyRef::from_index(i)) {
            let base = out.verts.len() as u32;
            out.verts.extend_from_slice(&tri);
            out.tris.push([base, base + 1, base + 2]);
        }
    }
    out
}

/// Ground polygons as index lists into the mesh vertices.
pub fn polygonize(mesh: &NavMesh) -> Polygonization {
    let mut out = Polygonization {
        verts: mesh.verts().to_vec(),
        ..Default::default()
    };
    for poly in mesh.polys().iter().filter(|p| !p.is_off_mesh()) {
        let n = poly.vert_count as usize;
        out.polys.extend(poly.verts[..n].iter().map(|&v| v as u32));
        out.sizes.push(n as u32);
    }
    out
}
