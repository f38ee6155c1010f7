//! Off-mesh connection linking, pathfinding and string pulling

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use navmesh_common::Error;

    use crate::test_mesh_helpers::{island_connection, islands_params};
    use crate::{
        NavMesh, NavMeshQuery, OffMeshConnection, PolyFlags, PolyRef, PolyType, QueryFilter,
        StraightPathFlags, StraightPathOptions, DEFAULT_HALF_EXTENTS, POLYAREA_JUMP,
    };

    const START: Vec3 = Vec3::new(0.5, 0.0, 1.5);
    const GOAL: Vec3 = Vec3::new(7.5, 0.0, 1.5);

    fn islands_with(connections: Vec<OffMeshConnection>) -> NavMesh {
        let mut params = islands_params();
        params.off_mesh = connections;
        NavMesh::create(&params).unwrap()
    }

    fn locate(query: &NavMeshQuery, pos: Vec3) -> PolyRef {
        query
            .find_nearest_poly(pos, DEFAULT_HALF_EXTENTS, &QueryFilter::default())
            .unwrap()
            .0
    }

    fn path_between(
        mesh: &NavMesh,
        from: Vec3,
        to: Vec3,
        filter: &QueryFilter,
    ) -> navmesh_common::Result<Vec<PolyRef>> {
        let mut query = NavMeshQuery::new(mesh);
        let (sr, er) = (locate(&query, from), locate(&query, to));
        query.find_path(sr, er, from, to, filter)
    }

    #[test]
    fn test_connection_polygon_and_links() {
        let mesh = islands_with(vec![island_connection(false)]);
        assert_eq!(mesh.poly_count(), 19);
        assert_eq!(mesh.ground_poly_count(), 18);

        let con_ref = PolyRef::from_index(18);
        let con = mesh.poly(con_ref).unwrap();
        assert_eq!(con.poly_type, PolyType::OffMeshConnection);
        assert_eq!(con.vert_count, 2);
        assert_eq!(con.area, POLYAREA_JUMP);
        assert_eq!(mesh.poly_links(con).count(), 2);

        // Only the start side links into the connection.
        let start_land = PolyRef::from_index(5);
        let end_land = PolyRef::from_index(9 + 3);
        let enters = |r: PolyRef| {
            let p = mesh.poly(r).unwrap();
            mesh.poly_links(p).any(|l| l.reference == con_ref)
        };
        assert!(enters(start_land));
        assert!(!enters(end_land));

        let link = mesh.off_mesh_link(con_ref).unwrap();
        assert_eq!(link.user_id, 0);
        assert_eq!(link.pos[0], Vec3::new(2.5, 0.0, 1.5));
    }

    #[test]
    fn test_path_uses_connection() {
        let mesh = islands_with(vec![island_connection(false)]);
        let filter = QueryFilter::default();
        let path = path_between(&mesh, START, GOAL, &filter).unwrap();
        let con_ref = PolyRef::from_index(18);
        assert!(path.contains(&con_ref));

        let query = NavMeshQuery::new(&mesh);
        let points = query
            .find_straight_path(START, GOAL, &path, StraightPathOptions::empty(), 32)
            .unwrap();
        let off_mesh = points
            .iter()
            .find(|p| p.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
            .expect("off-mesh point");
        assert_eq!(off_mesh.poly, con_ref);
        assert!((off_mesh.pos - Vec3::new(2.5, 0.0, 1.5)).length() < 1e-4);
        let last = points.last().unwrap();
        assert!(last.flags.contains(StraightPathFlags::END));
        assert!((last.pos - GOAL).length() < 1e-4);
    }

    #[test]
    fn test_one_way_connection() {
        let filter = QueryFilter::default();
        let one_way = islands_with(vec![island_connection(false)]);
        let err = path_between(&one_way, GOAL, START, &filter).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));

        let two_way = islands_with(vec![island_connection(true)]);
        let back = path_between(&two_way, GOAL, START, &filter).unwrap();
        assert!(back.contains(&PolyRef::from_index(18)));
    }

    #[test]
    fn test_connection_respects_filter() {
        let mesh = islands_with(vec![island_connection(true)]);
        let mut filter = QueryFilter::default();
        filter.exclude_flags = PolyFlags::JUMP;
        assert!(path_between(&mesh, START, GOAL, &filter).is_err());
    }

    #[test]
    fn test_unresolved_endpoint_leaves_connection_unlinked() {
        let con = OffMeshConnection::new(
            Vec3::new(2.5, 0.0, 1.5),
            Vec3::new(4.0, 0.0, 1.5),
            0.5,
            true,
            POLYAREA_JUMP,
            PolyFlags::JUMP,
        )
        .unwrap();
        let mesh = islands_with(vec![con]);
        assert_eq!(mesh.poly_count(), 19);
        let con_poly = mesh.poly(PolyRef::from_index(18)).unwrap();
        assert_eq!(mesh.poly_links(con_poly).count(), 1);
        assert!(path_between(&mesh, START, GOAL, &QueryFilter::default()).is_err());
    }

    #[test]
    fn test_endpoint_order_follows_entry_side() {
        let mesh = islands_with(vec![island_connection(true)]);
        let con_ref = PolyRef::from_index(18);
        let start_land = PolyRef::from_index(5);
        let end_land = PolyRef::from_index(12);

        let (a, b) = mesh.off_mesh_connection_endpoints(start_land, con_ref).unwrap();
        assert_eq!(a, Vec3::new(2.5, 0.0, 1.5));
        assert_eq!(b, Vec3::new(5.5, 0.0, 1.5));

        let (a, b) = mesh.off_mesh_connection_endpoints(end_land, con_ref).unwrap();
        assert_eq!(a, Vec3::new(5.5, 0.0, 1.5));
        assert_eq!(b, Vec3::new(2.5, 0.0, 1.5));

        assert!(mesh
            .off_mesh_connection_endpoints(start_land, start_land)
            .is_err());
    }

    #[test]
    fn test_raycast_ignores_connections() {
        let mesh = islands_with(vec![island_connection(true)]);
        let query = NavMeshQuery::new(&mesh);
        let hit = query
            .raycast(
                PolyRef::from_index(3),
                START,
                GOAL,
                &QueryFilter::default(),
            )
            .unwrap();
        assert!(hit.hit_wall());
        assert!((hit.hit_point(START, GOAL).x - 3.0).abs() < 1e-4);
    }
}
