//! Crowd simulation scenarios on grid, plane and off-mesh test meshes

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec3;
    use navmesh_common::{dist_2d, Error};
    use navmesh_detour::{PolyFlags, PolyRef};

    use crate::test_mesh_helpers::{
        build_plane_navmesh, create_grid_navmesh, jump_islands_navmesh, shared_grid_navmesh,
    };
    use crate::{AgentParams, Crowd, CrowdAgentState, MoveRequestState, ObstacleAvoidanceParams};

    fn run(crowd: &mut Crowd, steps: usize, dt: f32) {
        for _ in 0..steps {
            crowd.update(dt).unwrap();
        }
    }

    #[test]
    fn test_agent_walks_towards_target_on_plane() {
        let mesh = build_plane_navmesh(100.0);
        let mut crowd = Crowd::new(8, 0.6, mesh).unwrap();
        let start = Vec3::new(50.0, 0.0, 50.0);
        let target = Vec3::new(90.0, 0.0, 90.0);

        let idx = crowd.add_agent(start, AgentParams::default()).unwrap();
        assert_eq!(crowd.agent(idx).unwrap().state, CrowdAgentState::Walking);
        let initial = crowd.agent(idx).unwrap().npos;

        crowd.request_move_target_position(idx, target).unwrap();
        assert_eq!(
            crowd.agent(idx).unwrap().target_state,
            MoveRequestState::Requesting
        );

        crowd.update(0.1).unwrap();
        assert_eq!(crowd.agent(idx).unwrap().target_state, MoveRequestState::Valid);

        run(&mut crowd, 49, 0.1);
        let agent = crowd.agent(idx).unwrap();
        assert!(dist_2d(agent.npos, target) < dist_2d(initial, target));
        // Five seconds at up to 3.5 m/s along the diagonal.
        let travelled = dist_2d(agent.npos, initial);
        assert!(travelled > 8.0 && travelled < 17.6, "travelled {travelled}");
        assert!(agent.vel.length() <= agent.params.max_speed + 1e-3);
    }

    #[test]
    fn test_agent_reaches_target_and_stops() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(10, 1.0)).unwrap();
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 5.5), AgentParams::default()).unwrap();
        crowd
            .request_move_target_position(idx, Vec3::new(8.5, 0.0, 5.5))
            .unwrap();
        run(&mut crowd, 80, 0.1);

        let agent = crowd.agent(idx).unwrap();
        assert!(dist_2d(agent.npos, Vec3::new(8.5, 0.0, 5.5)) < 0.5);
        assert!(agent.vel.length() < 0.5);
    }

    #[test]
    fn test_zero_speed_agent_never_moves() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(10, 1.0)).unwrap();
        let params = AgentParams {
            max_speed: 0.0,
            ..Default::default()
        };
        let still = crowd.add_agent(Vec3::new(5.0, 0.0, 5.0), params).unwrap();
        let start = crowd.agent(still).unwrap().npos;
        crowd
            .request_move_target_position(still, Vec3::new(9.5, 0.0, 9.5))
            .unwrap();

        // A second agent walks straight through it.
        let walker = crowd.add_agent(Vec3::new(1.5, 0.0, 5.0), AgentParams::default()).unwrap();
        crowd
            .request_move_target_position(walker, Vec3::new(9.5, 0.0, 5.0))
            .unwrap();

        for dt in [0.1, 0.5, 0.016, 1.0] {
            run(&mut crowd, 10, dt);
            assert_eq!(crowd.agent(still).unwrap().npos, start);
        }
        crowd.request_move_velocity(still, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        run(&mut crowd, 10, 0.1);
        assert_eq!(crowd.agent(still).unwrap().npos, start);
    }

    fn displacement_over_second_window(boost: bool) -> f32 {
        let mut crowd = Crowd::new(2, 0.6, shared_grid_navmesh(40, 1.0)).unwrap();
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 20.5), AgentParams::default()).unwrap();
        crowd
            .request_move_target_position(idx, Vec3::new(38.5, 0.0, 20.5))
            .unwrap();
        run(&mut crowd, 10, 0.1);

        if boost {
            let params = AgentParams {
                max_speed: 6.0,
                max_acceleration: 20.0,
                ..AgentParams::default()
            };
            crowd.update_agent_parameters(idx, params).unwrap();
        }
        let before = crowd.agent(idx).unwrap().npos;
        run(&mut crowd, 10, 0.1);
        dist_2d(crowd.agent(idx).unwrap().npos, before)
    }

    #[test]
    fn test_faster_agent_covers_more_ground() {
        let base = displacement_over_second_window(false);
        let boosted = displacement_over_second_window(true);
        assert!(base > 1.0);
        assert!(boosted > base, "boosted {boosted} vs base {base}");
    }

    #[test]
    fn test_capacity_and_slot_reuse() {
        let mut crowd = Crowd::new(2, 0.6, shared_grid_navmesh(6, 1.0)).unwrap();
        assert_eq!(crowd.max_agent_count(), 2);
        let a = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), AgentParams::default()).unwrap();
        let b = crowd.add_agent(Vec3::new(4.5, 0.0, 4.5), AgentParams::default()).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(crowd.agent_count(), 2);
        assert!(matches!(
            crowd.add_agent(Vec3::new(2.5, 0.0, 2.5), AgentParams::default()),
            Err(Error::CapacityExceeded(_))
        ));

        crowd.remove_agent(a).unwrap();
        assert_eq!(crowd.agent_count(), 1);
        assert_eq!(crowd.active_agents(), vec![1]);
        let c = crowd.add_agent(Vec3::new(2.5, 0.0, 2.5), AgentParams::default()).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn test_stale_and_invalid_requests() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(6, 1.0)).unwrap();
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), AgentParams::default()).unwrap();
        crowd.remove_agent(idx).unwrap();

        assert!(matches!(crowd.agent(idx), Err(Error::StaleReference(_))));
        assert!(matches!(crowd.remove_agent(idx), Err(Error::StaleReference(_))));
        assert!(matches!(crowd.agent(99), Err(Error::StaleReference(_))));
        assert!(matches!(
            crowd.request_move_target(idx, PolyRef::from_index(0), Vec3::new(0.5, 0.0, 0.5)),
            Err(Error::StaleReference(_))
        ));
        assert!(matches!(
            crowd.request_move_velocity(idx, Vec3::X),
            Err(Error::StaleReference(_))
        ));

        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), AgentParams::default()).unwrap();
        assert!(matches!(
            crowd.request_move_target(idx, PolyRef::NULL, Vec3::ZERO),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            crowd.request_move_target(idx, PolyRef::from_index(500), Vec3::ZERO),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(crowd.update(-0.1), Err(Error::InvalidInput(_))));
        assert!(matches!(crowd.update(f32::NAN), Err(Error::InvalidInput(_))));
        assert!(matches!(
            crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), AgentParams::with_radius(-1.0)),
            Err(Error::InvalidInput(_))
        ));
        assert!(crowd.set_obstacle_avoidance_params(8, ObstacleAvoidanceParams::default()).is_err());
        assert!(crowd.filter(16).is_err());
    }

    #[test]
    fn test_agent_off_mesh_is_invalid() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(6, 1.0)).unwrap();
        let idx = crowd.add_agent(Vec3::new(50.0, 0.0, 50.0), AgentParams::default()).unwrap();
        let agent = crowd.agent(idx).unwrap();
        assert_eq!(agent.state, CrowdAgentState::Invalid);
        assert!(!agent.corridor.first_poly().is_valid());

        // Invalid agents are skipped by the update.
        run(&mut crowd, 5, 0.1);
        assert_eq!(crowd.agent(idx).unwrap().npos, Vec3::new(50.0, 0.0, 50.0));
    }

    #[test]
    fn test_overlapping_agents_are_pushed_apart() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(10, 1.0)).unwrap();
        let a = crowd.add_agent(Vec3::new(5.0, 0.0, 5.0), AgentParams::default()).unwrap();
        let b = crowd.add_agent(Vec3::new(5.1, 0.0, 5.0), AgentParams::default()).unwrap();
        crowd.update(0.1).unwrap();

        let pa = crowd.agent(a).unwrap().npos;
        let pb = crowd.agent(b).unwrap().npos;
        assert!(dist_2d(pa, pb) > 0.9);
        assert!(pa.x < 5.0 && pb.x > 5.1);
        assert_eq!(crowd.agent(a).unwrap().neighbours[0].idx, b);
    }

    #[test]
    fn test_velocity_request_and_reset() {
        let mut crowd = Crowd::new(4, 0.6, shared_grid_navmesh(20, 1.0)).unwrap();
        let idx = crowd.add_agent(Vec3::new(5.5, 0.0, 10.5), AgentParams::default()).unwrap();
        crowd.request_move_velocity(idx, Vec3::new(2.0, 0.0, 0.0)).unwrap();
        run(&mut crowd, 10, 0.1);

        let agent = crowd.agent(idx).unwrap();
        assert_eq!(agent.target_state, MoveRequestState::Velocity);
        assert!(agent.npos.x > 6.5);
        assert!((agent.npos.z - 10.5).abs() < 0.2);
        assert!(agent.corners.is_empty());

        crowd.reset_move_target(idx).unwrap();
        run(&mut crowd, 20, 0.1);
        let agent = crowd.agent(idx).unwrap();
        assert_eq!(agent.target_state, MoveRequestState::None);
        assert!(agent.vel.length() < 0.01);
    }

    #[test]
    fn test_agent_walks_around_excluded_polygons() {
        // A wall of disabled cells at x 4..5, open only in the top row.
        let mut mesh = create_grid_navmesh(8, 1.0).unwrap();
        for z in 0..7 {
            mesh.set_poly_flags(PolyRef::from_index(z * 8 + 4), PolyFlags::DISABLED)
                .unwrap();
        }
        let mut crowd = Crowd::new(2, 0.4, Arc::new(mesh)).unwrap();
        crowd.filter_mut(0).unwrap().exclude_flags = PolyFlags::DISABLED;
        let idx = crowd
            .add_agent(Vec3::new(1.5, 0.0, 0.5), AgentParams::with_radius(0.4))
            .unwrap();
        let goal = Vec3::new(7.5, 0.0, 0.5);
        crowd.request_move_target_position(idx, goal).unwrap();

        for _ in 0..120 {
            crowd.update(0.1).unwrap();
            let p = crowd.agent(idx).unwrap().npos;
            if p.x > 4.01 && p.x < 4.99 {
                assert!(p.z > 6.99, "agent crossed the wall at {p:?}");
            }
        }
        assert!(dist_2d(crowd.agent(idx).unwrap().npos, goal) < 1.0);
    }

    #[test]
    fn test_agent_traverses_off_mesh_connection() {
        let mut crowd = Crowd::new(2, 0.6, jump_islands_navmesh()).unwrap();
        let idx = crowd.add_agent(Vec3::new(1.0, 0.0, 3.0), AgentParams::default()).unwrap();
        crowd
            .request_move_target_position(idx, Vec3::new(19.0, 0.0, 3.0))
            .unwrap();

        let mut saw_off_mesh = false;
        for _ in 0..120 {
            crowd.update(0.1).unwrap();
            let agent = crowd.agent(idx).unwrap();
            if agent.state == CrowdAgentState::OffMesh {
                saw_off_mesh = true;
                assert!(agent.off_mesh_connection().is_some());
            }
        }
        assert!(saw_off_mesh);

        let agent = crowd.agent(idx).unwrap();
        assert_eq!(agent.state, CrowdAgentState::Walking);
        assert!(agent.npos.x > 12.0, "ended at {:?}", agent.npos);
        assert!(dist_2d(agent.npos, Vec3::new(19.0, 0.0, 3.0)) < 1.0);
    }
}
