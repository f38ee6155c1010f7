//! Formation control for groups of crowd agents
//!
//! A formation assigns each member a slot around an anchor point and keeps
//! requesting moves to those slots. The anchor is either an explicit target
//! or, when no target is set, the current position of the leader.

use std::collections::BTreeMap;
use std::f32::consts::PI;

use glam::Vec3;
use navmesh_common::{dist_2d_sqr, Error, Result};

use crate::crowd::{Crowd, MoveRequestState};

/// Maximum number of live formations
pub const MAX_FORMATIONS: usize = 256;

/// Maximum number of agents in a single formation
pub const MAX_FORMATION_SIZE: usize = 64;

/// Followers re-target the leader at most this often, in seconds.
const FOLLOW_INTERVAL: f32 = 0.25;

/// A slot has to move this far before its agent gets a new request.
const SLOT_REQUEST_THRESHOLD: f32 = 0.1;

/// Formation types supported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[repr(u8)]
pub enum FormationType {
    /// Side by side, centred on the anchor
    Line = 0,
    /// Single file behind the anchor
    Column = 1,
    /// Rows widening behind the anchor
    Wedge = 2,
    /// Square grid behind the anchor
    Box = 3,
    Circle = 4,
}

impl TryFrom<i32> for FormationType {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(FormationType::Line),
            1 => Ok(FormationType::Column),
            2 => Ok(FormationType::Wedge),
            3 => Ok(FormationType::Box),
            4 => Ok(FormationType::Circle),
            _ => Err(Error::InvalidInput(format!(
                "unknown formation type {value}"
            ))),
        }
    }
}

/// Snapshot of a formation's state
#[derive(Debug, Clone, PartialEq)]
pub struct FormationInfo {
    pub id: usize,
    pub formation_type: FormationType,
    pub spacing: f32,
    pub leader: Option<usize>,
    pub agent_count: usize,
    pub has_target: bool,
    /// Explicit target, zero when none is set
    pub target_pos: Vec3,
    /// Unit facing direction
    pub target_dir: Vec3,
}

#[derive(Debug, Clone)]
struct Formation {
    formation_type: FormationType,
    spacing: f32,
    members: Vec<usize>,
    leader: Option<usize>,
    target: Option<Vec3>,
    dir: Vec3,
    /// Last slot requested per member
    requested: BTreeMap<usize, Vec3>,
    follow_elapsed: f32,
}

impl Formation {
    fn new(formation_type: FormationType, spacing: f32) -> Self {
        Self {
            formation_type,
            spacing,
            members: Vec::new(),
            leader: None,
            target: None,
            dir: Vec3::Z,
            requested: BTreeMap::new(),
            follow_elapsed: FOLLOW_INTERVAL,
        }
    }

    fn remove_member(&mut self, agent: usize) {
        self.members.retain(|&a| a != agent);
        self.requested.remove(&agent);
        if self.leader == Some(agent) {
            self.leader = None;
        }
    }
}

/// Offset of slot `i` of `n` from the anchor.
///
/// `dir` is the unit facing direction; slots behind the anchor lie against
/// it and `right` is perpendicular to it on the XZ plane.
pub fn slot_offset(
    formation_type: FormationType,
    i: usize,
    n: usize,
    spacing: f32,
    dir: Vec3,
) -> Vec3 {
    let right = Vec3::new(dir.z, 0.0, -dir.x);
    let right = if right.length() > 0.001 {
        right.normalize()
    } else {
        right
    };
    let s = spacing;
    let fi = i as f32;

    let offset = match formation_type {
        FormationType::Line => {
            let center = (n / 2) as f32;
            right * ((fi - center) * s)
        }
        FormationType::Column => -dir * (fi * s),
        FormationType::Wedge => {
            let row = (fi.sqrt() as usize) as f32;
            let col = fi - row * row;
            right * ((col - row * 0.5) * s) - dir * (row * s)
        }
        FormationType::Box => {
            let side = ((n as f32).sqrt().ceil() as usize).max(1);
            let row = (i / side) as f32;
            let col = (i % side) as f32;
            right * ((col - side as f32 * 0.5) * s) - dir * (row * s)
        }
        FormationType::Circle => {
            let n = n.max(1) as f32;
            let angle = fi / n * 2.0 * PI;
            let radius = s * n / (2.0 * PI);
            right * (radius * angle.cos()) + dir * (radius * angle.sin())
        }
    };
    Vec3::new(offset.x, 0.0, offset.z)
}

/// Manages formations of crowd agents
#[derive(Debug, Clone, Default)]
pub struct FormationController {
    formations: BTreeMap<usize, Formation>,
    next_id: usize,
}

impl FormationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty formation and returns its id.
    pub fn create(&mut self, formation_type: FormationType, spacing: f32) -> Result<usize> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(Error::InvalidInput(format!(
                "formation spacing {spacing} must be positive"
            )));
        }
        if self.formations.len() >= MAX_FORMATIONS {
            return Err(Error::CapacityExceeded(format!(
                "at most {MAX_FORMATIONS} formations"
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.formations
            .insert(id, Formation::new(formation_type, spacing));
        log::debug!("created formation {id} ({formation_type:?}, spacing {spacing:.2})");
        Ok(id)
    }

    /// Deletes a formation. Its members stay in the crowd.
    pub fn delete(&mut self, id: usize) -> Result<()> {
        self.formations
            .remove(&id)
            .map(|_| log::debug!("deleted formation {id}"))
            .ok_or_else(|| unknown_formation(id))
    }

    /// Adds an active crowd agent to a formation.
    ///
    /// Adding a member again is a no-op; an agent belongs to at most one
    /// formation.
    pub fn add_agent(&mut self, crowd: &Crowd, id: usize, agent: usize) -> Result<()> {
        if !crowd.is_agent_active(agent) {
            return Err(Error::StaleReference(format!(
                "agent {agent} is not active"
            )));
        }
        if let Some(other) = self.formation_of(agent) {
            if other == id {
                log::warn!("agent {agent} already in formation {id}");
                return Ok(());
            }
            return Err(Error::InvalidInput(format!(
                "agent {agent} already belongs to formation {other}"
            )));
        }
        let formation = self
            .formations
            .get_mut(&id)
            .ok_or_else(|| unknown_formation(id))?;
        if formation.members.len() >= MAX_FORMATION_SIZE {
            return Err(Error::CapacityExceeded(format!(
                "formation {id} already has {MAX_FORMATION_SIZE} members"
            )));
        }
        formation.members.push(agent);
        log::debug!("added agent {agent} to formation {id}");
        Ok(())
    }

    /// Removes an agent from whichever formation holds it and returns that
    /// formation's id.
    pub fn remove_agent(&mut self, agent: usize) -> Result<usize> {
        let id = self.formation_of(agent).ok_or_else(|| {
            Error::InvalidInput(format!("agent {agent} is not in any formation"))
        })?;
        if let Some(formation) = self.formations.get_mut(&id) {
            formation.remove_member(agent);
        }
        log::debug!("removed agent {agent} from formation {id}");
        Ok(id)
    }

    /// Sets the anchor point and facing of a formation.
    pub fn set_target(&mut self, id: usize, pos: Vec3, dir: Vec3) -> Result<()> {
        if !pos.is_finite() || !dir.is_finite() {
            return Err(Error::InvalidInput(
                "formation target must be finite".to_string(),
            ));
        }
        let formation = self
            .formations
            .get_mut(&id)
            .ok_or_else(|| unknown_formation(id))?;
        formation.target = Some(pos);
        formation.dir = if dir.length() > 0.001 {
            dir.normalize()
        } else {
            Vec3::Z
        };
        formation.requested.clear();
        Ok(())
    }

    /// Drops the explicit target; the formation follows its leader again.
    pub fn clear_target(&mut self, id: usize) -> Result<()> {
        let formation = self
            .formations
            .get_mut(&id)
            .ok_or_else(|| unknown_formation(id))?;
        formation.target = None;
        formation.requested.clear();
        Ok(())
    }

    pub fn set_leader(&mut self, id: usize, agent: usize) -> Result<()> {
        let formation = self
            .formations
            .get_mut(&id)
            .ok_or_else(|| unknown_formation(id))?;
        if !formation.members.contains(&agent) {
            return Err(Error::InvalidInput(format!(
                "agent {agent} is not a member of formation {id}"
            )));
        }
        formation.leader = Some(agent);
        formation.follow_elapsed = FOLLOW_INTERVAL;
        Ok(())
    }

    /// Members in insertion order
    pub fn agents(&self, id: usize) -> Result<&[usize]> {
        self.formations
            .get(&id)
            .map(|f| f.members.as_slice())
            .ok_or_else(|| unknown_formation(id))
    }

    pub fn info(&self, id: usize) -> Result<FormationInfo> {
        let f = self.formations.get(&id).ok_or_else(|| unknown_formation(id))?;
        Ok(FormationInfo {
            id,
            formation_type: f.formation_type,
            spacing: f.spacing,
            leader: f.leader,
            agent_count: f.members.len(),
            has_target: f.target.is_some(),
            target_pos: f.target.unwrap_or(Vec3::ZERO),
            target_dir: f.dir,
        })
    }

    /// Number of live formations
    pub fn count(&self) -> usize {
        self.formations.len()
    }

    /// Id of the formation holding `agent`
    pub fn formation_of(&self, agent: usize) -> Option<usize> {
        self.formations
            .iter()
            .find(|(_, f)| f.members.contains(&agent))
            .map(|(&id, _)| id)
    }

    pub fn clear(&mut self) {
        self.formations.clear();
    }

    /// Requests moves to the formation slots.
    ///
    /// Members that left the crowd are pruned first. A formation with an
    /// explicit target sends a request when a slot moved or the member has
    /// no live request; a leader-anchored formation re-targets the
    /// followers periodically.
    pub fn update(&mut self, crowd: &mut Crowd, dt: f32) -> Result<()> {
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "time step {dt} must be finite and non-negative"
            )));
        }

        for (&id, formation) in self.formations.iter_mut() {
            let stale: Vec<usize> = formation
                .members
                .iter()
                .copied()
                .filter(|&a| !crowd.is_agent_active(a))
                .collect();
            for agent in stale {
                log::debug!("pruned inactive agent {agent} from formation {id}");
                formation.remove_member(agent);
            }
            if formation.members.is_empty() {
                continue;
            }

            match formation.target {
                Some(anchor) => update_with_target(id, formation, crowd, anchor),
                None => update_following_leader(id, formation, crowd, dt),
            }
        }
        Ok(())
    }
}

fn update_with_target(id: usize, formation: &mut Formation, crowd: &mut Crowd, anchor: Vec3) {
    let n = formation.members.len();
    for i in 0..n {
        let agent = formation.members[i];
        let offset = slot_offset(formation.formation_type, i, n, formation.spacing, formation.dir);
        let slot = anchor + offset;

        let stalled = crowd.agent(agent).is_ok_and(|a| {
            matches!(
                a.target_state,
                MoveRequestState::None | MoveRequestState::Failed
            )
        });
        let moved = formation.requested.get(&agent).map_or(true, |&prev| {
            dist_2d_sqr(prev, slot) > SLOT_REQUEST_THRESHOLD * SLOT_REQUEST_THRESHOLD
        });
        if !(stalled || moved) {
            continue;
        }
        request_slot(id, formation, crowd, agent, slot);
    }
}

fn update_following_leader(id: usize, formation: &mut Formation, crowd: &mut Crowd, dt: f32) {
    let Some(leader) = formation.leader else {
        return;
    };
    formation.follow_elapsed += dt;
    if formation.follow_elapsed < FOLLOW_INTERVAL {
        return;
    }
    formation.follow_elapsed = 0.0;

    let Ok(leader_agent) = crowd.agent(leader) else {
        return;
    };
    let anchor = leader_agent.npos;
    let vel = Vec3::new(leader_agent.vel.x, 0.0, leader_agent.vel.z);
    if vel.length() > 0.01 {
        formation.dir = vel.normalize();
    }

    let n = formation.members.len();
    let followers: Vec<usize> = formation
        .members
        .iter()
        .copied()
        .filter(|&a| a != leader)
        .collect();
    for (k, agent) in followers.into_iter().enumerate() {
        let offset = slot_offset(
            formation.formation_type,
            k + 1,
            n,
            formation.spacing,
            formation.dir,
        );
        request_slot(id, formation, crowd, agent, anchor + offset);
    }
}

fn request_slot(id: usize, formation: &mut Formation, crowd: &mut Crowd, agent: usize, slot: Vec3) {
    match crowd.request_move_target_position(agent, slot) {
        Ok(()) => {
            formation.requested.insert(agent, slot);
        }
        Err(err) => log::debug!("formation {id}: slot of agent {agent} unreachable: {err}"),
    }
}

fn unknown_formation(id: usize) -> Error {
    Error::StaleReference(format!("formation {id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn test_formation_type_from_i32() {
        assert_eq!(FormationType::try_from(0).unwrap(), FormationType::Line);
        assert_eq!(FormationType::try_from(4).unwrap(), FormationType::Circle);
        assert!(FormationType::try_from(5).is_err());
        assert!(FormationType::try_from(-1).is_err());
    }

    #[test]
    fn test_line_slots() {
        // Facing +z, right is +x.
        let dir = Vec3::Z;
        let slots: Vec<Vec3> = (0..3)
            .map(|i| slot_offset(FormationType::Line, i, 3, 2.0, dir))
            .collect();
        assert!(approx(slots[0], Vec3::new(-2.0, 0.0, 0.0)));
        assert!(approx(slots[1], Vec3::ZERO));
        assert!(approx(slots[2], Vec3::new(2.0, 0.0, 0.0)));

        // Even counts centre on slot n/2.
        assert!(approx(
            slot_offset(FormationType::Line, 0, 4, 1.0, dir),
            Vec3::new(-2.0, 0.0, 0.0)
        ));
    }

    #[test]
    fn test_column_and_wedge_slots() {
        let dir = Vec3::X;
        // Right of +x is -z.
        assert!(approx(
            slot_offset(FormationType::Column, 2, 4, 1.5, dir),
            Vec3::new(-3.0, 0.0, 0.0)
        ));
        assert!(approx(slot_offset(FormationType::Wedge, 0, 4, 1.0, dir), Vec3::ZERO));
        // Slot 1: row 1, col 0.
        assert!(approx(
            slot_offset(FormationType::Wedge, 1, 4, 1.0, dir),
            Vec3::new(-1.0, 0.0, 0.5)
        ));
        // Slot 3: row 1, col 2.
        assert!(approx(
            slot_offset(FormationType::Wedge, 3, 4, 1.0, dir),
            Vec3::new(-1.0, 0.0, -1.5)
        ));
    }

    #[test]
    fn test_box_and_circle_slots() {
        let dir = Vec3::Z;
        // Four members: side 2.
        assert!(approx(
            slot_offset(FormationType::Box, 0, 4, 1.0, dir),
            Vec3::new(-1.0, 0.0, 0.0)
        ));
        assert!(approx(
            slot_offset(FormationType::Box, 3, 4, 1.0, dir),
            Vec3::new(0.0, 0.0, -1.0)
        ));

        let n = 4;
        let radius = 2.0 * n as f32 / (2.0 * PI);
        for i in 0..n {
            let off = slot_offset(FormationType::Circle, i, n, 2.0, dir);
            assert!((off.length() - radius).abs() < 1e-4);
        }
        assert!(approx(
            slot_offset(FormationType::Circle, 1, n, 2.0, dir),
            Vec3::new(0.0, 0.0, radius)
        ));
    }

    #[test]
    fn test_create_and_delete() {
        let mut fc = FormationController::new();
        assert_eq!(fc.create(FormationType::Line, 2.0).unwrap(), 0);
        assert_eq!(fc.create(FormationType::Box, 1.0).unwrap(), 1);
        assert_eq!(fc.count(), 2);
        assert!(matches!(
            fc.create(FormationType::Line, 0.0),
            Err(Error::InvalidInput(_))
        ));

        fc.delete(0).unwrap();
        assert!(matches!(fc.delete(0), Err(Error::StaleReference(_))));
        // Ids are never reused.
        assert_eq!(fc.create(FormationType::Column, 1.0).unwrap(), 2);
        assert_eq!(fc.count(), 2);
    }

    #[test]
    fn test_set_target_normalizes_direction() {
        let mut fc = FormationController::new();
        let id = fc.create(FormationType::Line, 2.0).unwrap();
        fc.set_target(id, Vec3::new(1.0, 0.0, 1.0), Vec3::new(3.0, 0.0, 4.0))
            .unwrap();
        let info = fc.info(id).unwrap();
        assert!(info.has_target);
        assert!(approx(info.target_dir, Vec3::new(0.6, 0.0, 0.8)));

        fc.set_target(id, Vec3::ZERO, Vec3::splat(0.0001)).unwrap();
        assert_eq!(fc.info(id).unwrap().target_dir, Vec3::Z);

        fc.clear_target(id).unwrap();
        assert!(!fc.info(id).unwrap().has_target);
    }
}
