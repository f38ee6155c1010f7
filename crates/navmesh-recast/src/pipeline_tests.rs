//! End-to-end build scenarios on small synthetic scenes

use glam::Vec3;
use navmesh_common::{calc_bounds, point_in_polygon_2d, Error};

use crate::*;

fn plane(size: f32) -> (Vec<Vec3>, Vec<[u32; 3]>) {
    let verts = vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(size, 0.0, 0.0),
        Vec3::new(size, 0.0, size),
        Vec3::new(0.0, 0.0, size),
    ];
    (verts, vec![[0, 1, 2], [0, 2, 3]])
}

fn builder_for(verts: &[Vec3], settings: &BuildSettings) -> RecastBuilder {
    let (bmin, bmax) = calc_bounds(verts).unwrap();
    RecastBuilder::new(RecastConfig::from_settings(settings, bmin, bmax).unwrap())
}

fn poly_world_verts(mesh: &PolyMesh, i: usize) -> Vec<Vec3> {
    mesh.poly(i)[..mesh.vert_count(i)]
        .iter()
        .map(|&v| mesh.world_vert(v as usize))
        .collect()
}

#[test]
fn test_flat_plane_builds_eroded_mesh() {
    let (verts, tris) = plane(10.0);
    let settings = BuildSettings::default();
    let builder = builder_for(&verts, &settings);
    let mut ctx = BuildContext::new();
    let out = builder
        .build(&mut ctx, &verts, &tris, &ConvexVolumeSet::new())
        .unwrap();

    let mesh = &out.poly_mesh;
    assert!(mesh.npolys > 0);
    assert_eq!(out.detail_mesh.meshes.len(), mesh.npolys);
    for i in 0..mesh.npolys {
        assert!(mesh.vert_count(i) >= 3);
        assert!(mesh.vert_count(i) <= settings.verts_per_poly as usize);
        assert_eq!(mesh.areas[i], WALKABLE_AREA);
    }
    // The agent radius keeps the mesh away from the plane's edge.
    for v in 0..mesh.verts.len() {
        let p = mesh.world_vert(v);
        assert!(p.x >= 0.5 && p.x <= 9.5, "x {}", p.x);
        assert!(p.z >= 0.5 && p.z <= 9.5, "z {}", p.z);
        assert!(p.y >= -0.01 && p.y <= 0.5, "y {}", p.y);
    }
    for p in &out.detail_mesh.verts {
        assert!(p.y >= -0.01 && p.y <= 0.5, "detail y {}", p.y);
    }
    assert!(ctx.timer_duration(TimerCategory::Total).is_some());
    assert_eq!(ctx.count(LogLevel::Error), 0);
}

#[test]
fn test_every_partition_covers_the_plane() {
    let (verts, tris) = plane(10.0);
    let settings = BuildSettings::default();
    for partition in [
        PartitionType::Watershed,
        PartitionType::Monotone,
        PartitionType::Layers,
    ] {
        let builder = builder_for(&verts, &settings).with_partition(partition);
        let mut ctx = BuildContext::new();
        let out = builder
            .build(&mut ctx, &verts, &tris, &ConvexVolumeSet::new())
            .unwrap();
        assert!(out.poly_mesh.npolys > 0, "{partition:?} built nothing");
        let center = Vec3::new(5.0, 0.0, 5.0);
        let covered = (0..out.poly_mesh.npolys)
            .any(|i| point_in_polygon_2d(center, &poly_world_verts(&out.poly_mesh, i)));
        assert!(covered, "{partition:?} left the center uncovered");
    }
}

#[test]
fn test_null_volume_cuts_a_hole() {
    let (verts, tris) = plane(12.0);
    let settings = BuildSettings::default();
    let builder = builder_for(&verts, &settings);
    let mut volumes = ConvexVolumeSet::new();
    volumes
        .add(
            ConvexVolume::from_box(
                Vec3::new(4.5, -1.0, 4.5),
                Vec3::new(7.5, 1.0, 7.5),
                NULL_AREA,
            )
            .unwrap(),
        )
        .unwrap();
    let mut ctx = BuildContext::new();
    let out = builder.build(&mut ctx, &verts, &tris, &volumes).unwrap();

    let mesh = &out.poly_mesh;
    assert!(mesh.npolys > 0);
    let center = Vec3::new(6.0, 0.0, 6.0);
    for i in 0..mesh.npolys {
        assert!(!point_in_polygon_2d(center, &poly_world_verts(mesh, i)));
    }
}

#[test]
fn test_area_volume_tags_polygons() {
    let (verts, tris) = plane(12.0);
    let settings = BuildSettings::default();
    let builder = builder_for(&verts, &settings);
    let mut volumes = ConvexVolumeSet::new();
    volumes
        .add(ConvexVolume::from_box(Vec3::new(0.0, -1.0, 0.0), Vec3::new(6.0, 1.0, 12.0), 2).unwrap())
        .unwrap();
    let mut ctx = BuildContext::new();
    let out = builder.build(&mut ctx, &verts, &tris, &volumes).unwrap();
    assert!(out.poly_mesh.areas.contains(&2));
    assert!(out.poly_mesh.areas.contains(&WALKABLE_AREA));
}

#[test]
fn test_steep_geometry_gives_empty_mesh_with_warning() {
    // A single vertical wall.
    let verts = vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(5.0, 0.0, 0.0),
        Vec3::new(5.0, 5.0, 0.0),
        Vec3::new(0.0, 5.0, 0.0),
    ];
    let tris = vec![[0, 1, 2], [0, 2, 3]];
    let (bmin, mut bmax) = calc_bounds(&verts).unwrap();
    bmax.z += 1.0;
    let config = RecastConfig::from_settings(&BuildSettings::default(), bmin, bmax).unwrap();
    let mut ctx = BuildContext::new();
    let out = RecastBuilder::new(config)
        .build(&mut ctx, &verts, &tris, &ConvexVolumeSet::new())
        .unwrap();
    assert_eq!(out.poly_mesh.npolys, 0);
    assert!(out.detail_mesh.meshes.is_empty());
    assert!(ctx.count(LogLevel::Warning) > 0);
}

#[test]
fn test_out_of_range_index_is_rejected() {
    let (verts, _) = plane(4.0);
    let builder = builder_for(&verts, &BuildSettings::default());
    let mut ctx = BuildContext::new();
    let err = builder
        .build(&mut ctx, &verts, &[[0, 1, 9]], &ConvexVolumeSet::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn test_extra_erosion_shrinks_mesh() {
    let (verts, tris) = plane(10.0);
    let settings = BuildSettings::default();
    let extent = |builder: RecastBuilder| {
        let mut ctx = BuildContext::new();
        let out = builder
            .build(&mut ctx, &verts, &tris, &ConvexVolumeSet::new())
            .unwrap();
        (0..out.poly_mesh.verts.len())
            .map(|v| out.poly_mesh.world_vert(v).x)
            .fold(f32::MAX, f32::min)
    };
    let base = extent(builder_for(&verts, &settings));
    let eroded = extent(builder_for(&verts, &settings).with_extra_erosion(4));
    assert!(eroded > base + 0.5, "{eroded} vs {base}");
}
