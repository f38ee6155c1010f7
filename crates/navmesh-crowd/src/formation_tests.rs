//! Formations driving crowd agents

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use navmesh_common::{dist_2d, Error};

    use crate::test_mesh_helpers::shared_grid_navmesh;
    use crate::{AgentParams, Crowd, FormationController, FormationType, MoveRequestState};

    fn crowd_with_agents(positions: &[Vec3]) -> (Crowd, Vec<usize>) {
        let mut crowd = Crowd::new(16, 0.6, shared_grid_navmesh(24, 1.0)).unwrap();
        let agents = positions
            .iter()
            .map(|&p| crowd.add_agent(p, AgentParams::default()).unwrap())
            .collect();
        (crowd, agents)
    }

    fn step(fc: &mut FormationController, crowd: &mut Crowd, steps: usize) {
        for _ in 0..steps {
            fc.update(crowd, 0.1).unwrap();
            crowd.update(0.1).unwrap();
        }
    }

    #[test]
    fn test_line_formation_reaches_slots() {
        let (mut crowd, agents) = crowd_with_agents(&[
            Vec3::new(4.5, 0.0, 4.5),
            Vec3::new(6.5, 0.0, 4.5),
            Vec3::new(8.5, 0.0, 4.5),
        ]);
        let mut fc = FormationController::new();
        let id = fc.create(FormationType::Line, 2.0).unwrap();
        for &a in &agents {
            fc.add_agent(&crowd, id, a).unwrap();
        }
        fc.set_target(id, Vec3::new(12.0, 0.0, 14.0), Vec3::Z).unwrap();

        step(&mut fc, &mut crowd, 100);

        let slots = [
            Vec3::new(10.0, 0.0, 14.0),
            Vec3::new(12.0, 0.0, 14.0),
            Vec3::new(14.0, 0.0, 14.0),
        ];
        for (&a, slot) in agents.iter().zip(slots) {
            let agent = crowd.agent(a).unwrap();
            assert!(
                dist_2d(agent.npos, slot) < 0.75,
                "agent {a} at {:?}, slot {slot:?}",
                agent.npos
            );
            assert_eq!(agent.target_state, MoveRequestState::Valid);
        }
    }

    #[test]
    fn test_followers_trail_leader() {
        let (mut crowd, agents) = crowd_with_agents(&[
            Vec3::new(3.5, 0.0, 12.0),
            Vec3::new(2.5, 0.0, 10.0),
            Vec3::new(2.5, 0.0, 14.0),
        ]);
        let leader = agents[0];
        let mut fc = FormationController::new();
        let id = fc.create(FormationType::Column, 2.0).unwrap();
        for &a in &agents {
            fc.add_agent(&crowd, id, a).unwrap();
        }
        fc.set_leader(id, leader).unwrap();
        assert_eq!(fc.info(id).unwrap().leader, Some(leader));

        crowd
            .request_move_target_position(leader, Vec3::new(20.5, 0.0, 12.0))
            .unwrap();
        step(&mut fc, &mut crowd, 40);

        // The leader heads along +x; the column trails behind it.
        let lead = crowd.agent(leader).unwrap().npos;
        assert!(lead.x > 12.0);
        for &a in &agents[1..] {
            let p = crowd.agent(a).unwrap().npos;
            assert!(p.x < lead.x, "follower {a} at {p:?} is ahead of {lead:?}");
            assert!(dist_2d(p, lead) < 8.0);
        }
    }

    #[test]
    fn test_membership_is_exclusive() {
        let (crowd, agents) = crowd_with_agents(&[Vec3::new(2.5, 0.0, 2.5), Vec3::new(5.5, 0.0, 5.5)]);
        let mut fc = FormationController::new();
        let a = fc.create(FormationType::Line, 1.0).unwrap();
        let b = fc.create(FormationType::Wedge, 1.0).unwrap();

        fc.add_agent(&crowd, a, agents[0]).unwrap();
        // Adding twice to the same formation is fine.
        fc.add_agent(&crowd, a, agents[0]).unwrap();
        assert_eq!(fc.agents(a).unwrap(), &[agents[0]]);
        assert!(matches!(
            fc.add_agent(&crowd, b, agents[0]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            fc.add_agent(&crowd, 42, agents[1]),
            Err(Error::StaleReference(_))
        ));
        assert!(matches!(
            fc.add_agent(&crowd, b, 15),
            Err(Error::StaleReference(_))
        ));
        assert!(matches!(
            fc.set_leader(b, agents[0]),
            Err(Error::InvalidInput(_))
        ));

        fc.set_leader(a, agents[0]).unwrap();
        assert_eq!(fc.remove_agent(agents[0]).unwrap(), a);
        assert_eq!(fc.info(a).unwrap().leader, None);
        assert!(fc.remove_agent(agents[0]).is_err());

        fc.add_agent(&crowd, b, agents[0]).unwrap();
        assert_eq!(fc.formation_of(agents[0]), Some(b));
    }

    #[test]
    fn test_removed_crowd_agents_are_pruned() {
        let (mut crowd, agents) = crowd_with_agents(&[
            Vec3::new(2.5, 0.0, 2.5),
            Vec3::new(4.5, 0.0, 2.5),
        ]);
        let mut fc = FormationController::new();
        let id = fc.create(FormationType::Box, 1.5).unwrap();
        for &a in &agents {
            fc.add_agent(&crowd, id, a).unwrap();
        }
        fc.set_leader(id, agents[1]).unwrap();
        fc.set_target(id, Vec3::new(10.0, 0.0, 10.0), Vec3::X).unwrap();

        crowd.remove_agent(agents[1]).unwrap();
        fc.update(&mut crowd, 0.1).unwrap();

        let info = fc.info(id).unwrap();
        assert_eq!(info.agent_count, 1);
        assert_eq!(info.leader, None);
        assert_eq!(fc.agents(id).unwrap(), &[agents[0]]);
        assert_eq!(
            crowd.agent(agents[0]).unwrap().target_state,
            MoveRequestState::Requesting
        );
        assert!(fc.update(&mut crowd, -1.0).is_err());
    }

    #[test]
    fn test_delete_keeps_agents_in_crowd() {
        let (crowd, agents) = crowd_with_agents(&[Vec3::new(2.5, 0.0, 2.5)]);
        let mut fc = FormationController::new();
        let id = fc.create(FormationType::Circle, 1.0).unwrap();
        fc.add_agent(&crowd, id, agents[0]).unwrap();
        fc.delete(id).unwrap();

        assert_eq!(fc.count(), 0);
        assert!(crowd.is_agent_active(agents[0]));
        assert_eq!(fc.formation_of(agents[0]), None);
        assert!(fc.agents(id).is_err());
    }
}
