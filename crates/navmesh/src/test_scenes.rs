//! Scenes shared by the facade tests

use crate::Navmesh;

/// Flat square from the origin to (`size`, 0, `size`) as raw arrays.
pub fn plane_raw(size: f32) -> (Vec<f32>, Vec<i32>) {
    (
        vec![
            0.0, 0.0, 0.0, //
            size, 0.0, 0.0, //
            size, 0.0, size, //
            0.0, 0.0, size,
        ],
        vec![3, 0, 1, 2, 3, 0, 2, 3],
    )
}

/// Navmesh holding the plane, not yet built. Coarser cells than the
/// defaults keep the builds quick.
pub fn plane_navmesh(size: f32) -> Navmesh {
    let (verts, faces) = plane_raw(size);
    let mut nm = Navmesh::new();
    nm.init_by_raw(&verts, &faces).unwrap();
    nm.update_settings([("cellSize", 0.5), ("cellHeight", 0.2)])
        .unwrap();
    nm
}

/// Built plane navmesh.
pub fn built_plane(size: f32) -> Navmesh {
    let mut nm = plane_navmesh(size);
    nm.build_navmesh().unwrap();
    nm
}
