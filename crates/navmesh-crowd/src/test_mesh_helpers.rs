//! Meshes for crowd tests

use std::sync::Arc;

use glam::Vec3;
use navmesh_common::Result;
use navmesh_detour::{
    NavMesh, NavMeshCreateParams, OffMeshConnection, PolyFlags, MAX_VERTS_PER_POLY,
    POLYAREA_GROUND, POLYAREA_JUMP,
};
use navmesh_recast::{
    BuildContext, BuildSettings, ConvexVolumeSet, RecastBuilder, RecastConfig, MESH_NULL_IDX,
};

/// `nx` by `nz` grid of square polygons of side `cell` at `origin`.
/// Polygon `z * nx + x` covers cell (x, z).
fn grid_params_at(nx: usize, nz: usize, cell: f32, origin: Vec3) -> NavMeshCreateParams {
    let nvp = MAX_VERTS_PER_POLY;
    let vid = |x: usize, z: usize| (z * (nx + 1) + x) as u16;
    let pid = |x: usize, z: usize| (z * nx + x) as u16;

    let verts = (0..=nz)
        .flat_map(|z| (0..=nx).map(move |x| (x, z)))
        .map(|(x, z)| origin + Vec3::new(x as f32 * cell, 0.0, z as f32 * cell))
        .collect();

    let mut polys = Vec::with_capacity(nx * nz * nvp * 2);
    for z in 0..nz {
        for x in 0..nx {
            let mut p = vec![MESH_NULL_IDX; nvp * 2];
            p[..4].copy_from_slice(&[vid(x, z), vid(x, z + 1), vid(x + 1, z + 1), vid(x + 1, z)]);
            if x > 0 {
                p[nvp] = pid(x - 1, z);
            }
            if z + 1 < nz {
                p[nvp + 1] = pid(x, z + 1);
            }
            if x + 1 < nx {
                p[nvp + 2] = pid(x + 1, z);
            }
            if z > 0 {
                p[nvp + 3] = pid(x, z - 1);
            }
            polys.extend(p);
        }
    }

    NavMeshCreateParams {
        verts,
        polys,
        poly_flags: vec![PolyFlags::WALK; nx * nz],
        poly_areas: vec![POLYAREA_GROUND; nx * nz],
        nvp,
        walkable_height: 2.0,
        walkable_radius: 0.6,
        walkable_climb: 0.9,
        bmin: origin,
        bmax: origin + Vec3::new(nx as f32 * cell, 1.0, nz as f32 * cell),
        ..Default::default()
    }
}

pub fn create_grid_navmesh(n: usize, cell: f32) -> Result<NavMesh> {
    NavMesh::create(&grid_params_at(n, n, cell, Vec3::ZERO))
}

pub fn shared_grid_navmesh(n: usize, cell: f32) -> Arc<NavMesh> {
    Arc::new(create_grid_navmesh(n, cell).expect("grid navmesh"))
}

/// Two 4x4 grids of cell 2 (x 0..8 and x 12..20) joined by a one-way jump
/// from (7, 0, 3) to (13, 0, 3).
pub fn jump_islands_navmesh() -> Arc<NavMesh> {
    let mut params = grid_params_at(4, 4, 2.0, Vec3::ZERO);
    let other = grid_params_at(4, 4, 2.0, Vec3::new(12.0, 0.0, 0.0));
    let nvp = params.nvp;
    let vert_offset = params.verts.len() as u16;
    let poly_offset = (params.polys.len() / (nvp * 2)) as u16;
    let shift = |base: u16| move |v: &u16| if *v == MESH_NULL_IDX { *v } else { *v + base };

    params.verts.extend(other.verts);
    for p in other.polys.chunks(nvp * 2) {
        params.polys.extend(p[..nvp].iter().map(shift(vert_offset)));
        params.polys.extend(p[nvp..].iter().map(shift(poly_offset)));
    }
    params.poly_flags.extend(other.poly_flags);
    params.poly_areas.extend(other.poly_areas);
    params.bmax = other.bmax;
    params.off_mesh = vec![OffMeshConnection::new(
        Vec3::new(7.0, 0.0, 3.0),
        Vec3::new(13.0, 0.0, 3.0),
        0.5,
        false,
        POLYAREA_JUMP,
        PolyFlags::JUMP,
    )
    .expect("valid connection")];
    Arc::new(NavMesh::create(&params).expect("islands navmesh"))
}

/// Full Recast build of a flat square plane of side `size`.
pub fn build_plane_navmesh(size: f32) -> Arc<NavMesh> {
    let verts = vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, size),
        Vec3::new(size, 0.0, size),
        Vec3::new(size, 0.0, 0.0),
    ];
    let tris = vec![[0, 1, 2], [0, 2, 3]];
    let settings = BuildSettings::default();
    let config = RecastConfig::from_settings(
        &settings,
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(size, 1.0, size),
    )
    .expect("plane config");
    let mut ctx = BuildContext::new();
    let output = RecastBuilder::new(config)
        .build(&mut ctx, &verts, &tris, &ConvexVolumeSet::new())
        .expect("plane build");
    let params = NavMeshCreateParams::from_recast(
        &output.poly_mesh,
        &output.detail_mesh,
        &[],
        settings.agent_height,
        settings.agent_radius,
        settings.agent_max_climb,
    );
    Arc::new(NavMesh::create(&params).expect("plane navmesh"))
}
