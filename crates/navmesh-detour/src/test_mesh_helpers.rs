//! Test mesh creation helpers
//!
//! Grids of unit squares laid out directly as polygon data, plus a helper
//! that runs the full Recast build on simple input geometry.

use glam::Vec3;
use navmesh_common::Result;
use navmesh_recast::{
    BuildContext, BuildSettings, ConvexVolumeSet, RecastBuilder, RecastConfig, MESH_NULL_IDX,
};

use crate::{NavMesh, NavMeshCreateParams, OffMeshConnection, PolyFlags, MAX_VERTS_PER_POLY};

/// `nx` by `nz` grid of square polygons of side `cell`, starting at
/// `origin`. Polygon `z * nx + x` covers cell (x, z).
pub fn grid_params_at(nx: usize, nz: usize, cell: f32, origin: Vec3) -> NavMeshCreateParams {
    let nvp = MAX_VERTS_PER_POLY;
    let vid = |x: usize, z: usize| (z * (nx + 1) + x) as u16;
    let pid = |x: usize, z: usize| (z * nx + x) as u16;

    let mut verts = Vec::new();
    for z in 0..=nz {
        for x in 0..=nx {
            verts.push(origin + Vec3::new(x as f32 * cell, 0.0, z as f32 * cell));
        }
    }

    let mut polys = Vec::new();
    for z in 0..nz {
        for x in 0..nx {
            let mut p = vec![MESH_NULL_IDX; nvp * 2];
            // Clockwise seen from above: west, north, east and south edges.
            p[0] = vid(x, z);
            p[1] = vid(x, z + 1);
            p[2] = vid(x + 1, z + 1);
            p[3] = vid(x + 1, z);
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

    let npolys = nx * nz;
    NavMeshCreateParams {
        verts,
        polys,
        poly_flags: vec![PolyFlags::WALK; npolys],
        poly_areas: vec![crate::POLYAREA_GROUND; npolys],
        nvp,
        walkable_height: 2.0,
        walkable_radius: 0.6,
        walkable_climb: 0.9,
        bmin: origin,
        bmax: origin + Vec3::new(nx as f32 * cell, 1.0, nz as f32 * cell),
        ..Default::default()
    }
}

/// Square `n` by `n` grid at the origin
pub fn grid_params(n: usize, cell: f32) -> NavMeshCreateParams {
    grid_params_at(n, n, cell, Vec3::ZERO)
}

pub fn create_grid_navmesh(n: usize, cell: f32) -> Result<NavMesh> {
    NavMesh::create(&grid_params(n, cell))
}

/// Two disconnected 3x3 unit grids: one at x 0..3, one at x 5..8.
pub fn islands_params() -> NavMeshCreateParams {
    let mut a = grid_params_at(3, 3, 1.0, Vec3::ZERO);
    let b = grid_params_at(3, 3, 1.0, Vec3::new(5.0, 0.0, 0.0));
    let vert_offset = a.verts.len() as u16;
    let poly_offset = (a.polys.len() / (a.nvp * 2)) as u16;
    let nvp = a.nvp;

    a.verts.extend(b.verts);
    for p in b.polys.chunks(nvp * 2) {
        let (verts, neis) = p.split_at(nvp);
        a.polys.extend(
            verts
                .iter()
                .map(|&v| if v == MESH_NULL_IDX { v } else { v + vert_offset }),
        );
        a.polys.extend(
            neis.iter()
                .map(|&n| if n == MESH_NULL_IDX { n } else { n + poly_offset }),
        );
    }
    a.poly_flags.extend(b.poly_flags);
    a.poly_areas.extend(b.poly_areas);
    a.bmax = b.bmax;
    a
}

/// Jump connection from the first island to the second.
pub fn island_connection(bidirectional: bool) -> OffMeshConnection {
    OffMeshConnection::new(
        Vec3::new(2.5, 0.0, 1.5),
        Vec3::new(5.5, 0.0, 1.5),
        0.5,
        bidirectional,
        crate::POLYAREA_JUMP,
        PolyFlags::JUMP,
    )
    .expect("valid connection")
}

/// Runs the Recast build on a flat square plane of side `size` and
/// creates the navigation mesh from it.
pub fn build_plane_navmesh(size: f32) -> Result<NavMesh> {
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
    )?;
    let mut ctx = BuildContext::new();
    let output = RecastBuilder::new(config.clone()).build(
        &mut ctx,
        &verts,
        &tris,
        &ConvexVolumeSet::new(),
    )?;
    let params = NavMeshCreateParams::from_recast(
        &output.poly_mesh,
        &output.detail_mesh,
        &[],
        settings.agent_height,
        settings.agent_radius,
        settings.agent_max_climb,
    );
    NavMesh::create(&params)
}
