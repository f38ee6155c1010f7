//! Crowd management
//!
//! The crowd owns a fixed table of agent slots and advances all of them in
//! lock step. Each update checks corridors, resolves move requests, gathers
//! neighbours and walls, steers towards the next corner, avoids obstacles,
//! integrates, separates overlapping agents and finally constrains every
//! agent to the navigation mesh surface.
//!
//! Per-agent work that only reads shared state (neighbour gathering,
//! boundary and corner queries, velocity planning) runs on the rayon pool.
//! Every parallel pass reads a snapshot of the agent table taken before the
//! pass and writes only the agent it was computed for, so results do not
//! depend on scheduling.

use std::sync::Arc;

use bitflags::bitflags;
use glam::Vec3;
use navmesh_common::{dist_2d, dist_2d_sqr, tri_area_2d, Error, Result};
use navmesh_detour::{
    NavMesh, NavMeshQuery, PathResult, PolyRef, QueryFilter, StraightPathFlags,
    StraightPathPoint,
};
use rayon::prelude::*;

use crate::local_boundary::LocalBoundary;
use crate::obstacle_avoidance::{ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
use crate::path_corridor::{PathCorridor, MAX_PATH_POLYS};
use crate::proximity_grid::ProximityGrid;

/// The maximum number of neighbours an agent takes into account for
/// steering decisions.
pub const MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners an agent looks ahead in its path.
pub const MAX_CORNERS: usize = 4;

/// Number of obstacle avoidance profiles of a crowd.
pub const MAX_OBSTACLE_AVOIDANCE_PARAMS: usize = 8;

/// Number of query filters of a crowd.
pub const MAX_QUERY_FILTER_TYPE: usize = 16;

/// Default radius of an agent
const DEFAULT_AGENT_RADIUS: f32 = 0.6;

/// Default height of an agent
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;

/// Default max acceleration of an agent
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;

/// Default max speed of an agent
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

const MAX_QUICK_SEARCH_ITERATIONS: usize = 20;
const MAX_QUICK_SEARCH_POLYS: usize = 32;
const MAX_PATH_QUEUE_NODES: usize = 4096;
const CHECK_LOOKAHEAD: usize = 10;
const TARGET_REPLAN_DELAY: f32 = 1.0;
const TOPOLOGY_OPT_INTERVAL: f32 = 0.5;
const COLLISION_ITERATIONS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
const MAX_GRID_QUERY_ITEMS: usize = 32;
const MAX_AVOIDANCE_SEGMENTS: usize = 8;

bitflags! {
    /// Behaviours applied to an agent during updates
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct UpdateFlags: u8 {
        const ANTICIPATE_TURNS = 1;
        const OBSTACLE_AVOIDANCE = 2;
        const SEPARATION = 4;
        /// Shortcut the corridor when a later corner is visible
        const OPTIMIZE_VIS = 8;
        /// Periodically replan the corridor start with a local search
        const OPTIMIZE_TOPO = 16;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::ANTICIPATE_TURNS
            | UpdateFlags::OPTIMIZE_VIS
            | UpdateFlags::OPTIMIZE_TOPO
            | UpdateFlags::OBSTACLE_AVOIDANCE
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Range within which neighbours and walls are considered
    pub collision_query_range: f32,
    /// How far ahead the corridor may be shortcut
    pub path_optimization_range: f32,
    /// Strength of the push away from neighbours
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index of the avoidance profile
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter
    pub query_filter_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self::with_radius(DEFAULT_AGENT_RADIUS)
    }
}

impl AgentParams {
    /// Default parameters for an agent of the given radius; the query
    /// ranges scale with it.
    pub fn with_radius(radius: f32) -> Self {
        Self {
            radius,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: radius * 12.0,
            path_optimization_range: radius * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::InvalidInput(format!(
                "agent radius {} must be positive",
                self.radius
            )));
        }
        if !(self.height.is_finite() && self.height > 0.0) {
            return Err(Error::InvalidInput(format!(
                "agent height {} must be positive",
                self.height
            )));
        }
        let non_negative = [
            ("max speed", self.max_speed),
            ("max acceleration", self.max_acceleration),
            ("collision query range", self.collision_query_range),
            ("path optimization range", self.path_optimization_range),
            ("separation weight", self.separation_weight),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidInput(format!(
                    "agent {name} {value} must be non-negative"
                )));
            }
        }
        if self.obstacle_avoidance_type as usize >= MAX_OBSTACLE_AVOIDANCE_PARAMS {
            return Err(Error::InvalidInput(format!(
                "obstacle avoidance type {} out of range 0..{}",
                self.obstacle_avoidance_type, MAX_OBSTACLE_AVOIDANCE_PARAMS
            )));
        }
        if self.query_filter_type as usize >= MAX_QUERY_FILTER_TYPE {
            return Err(Error::InvalidInput(format!(
                "query filter type {} out of range 0..{}",
                self.query_filter_type, MAX_QUERY_FILTER_TYPE
            )));
        }
        Ok(())
    }
}

/// What the agent is currently traversing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CrowdAgentState {
    /// Not on the navigation mesh
    #[default]
    Invalid = 0,
    /// Moving on regular polygons
    Walking = 1,
    /// Animating over an off-mesh connection
    OffMesh = 2,
}

/// Progress of the agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MoveRequestState {
    #[default]
    None = 0,
    Failed = 1,
    Valid = 2,
    Requesting = 3,
    WaitingForQueue = 4,
    WaitingForPath = 5,
    /// Steered by an explicit velocity instead of a path
    Velocity = 6,
}

/// A nearby agent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    /// Index of the neighbouring agent
    pub idx: usize,
    /// Distance on the XZ plane
    pub dist: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct OffMeshAnimation {
    init_pos: Vec3,
    start_pos: Vec3,
    end_pos: Vec3,
    poly_ref: PolyRef,
    t: f32,
    tmax: f32,
    active: bool,
}

/// Agent slot of a crowd
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub active: bool,
    pub state: CrowdAgentState,
    /// The corridor ends short of the requested target
    pub partial: bool,
    pub corridor: PathCorridor,
    pub boundary: LocalBoundary,
    topology_opt_time: f32,
    pub neighbours: Vec<CrowdNeighbour>,
    /// Speed the agent currently wants to move at
    pub desired_speed: f32,
    /// Current position
    pub npos: Vec3,
    /// Desired velocity from steering
    pub dvel: Vec3,
    /// Velocity chosen by obstacle avoidance
    pub nvel: Vec3,
    /// Actual velocity
    pub vel: Vec3,
    pub params: AgentParams,
    /// Next corners of the straight path
    pub corners: Vec<StraightPathPoint>,
    pub target_state: MoveRequestState,
    pub target_ref: PolyRef,
    /// Target position, or the requested velocity in velocity mode
    pub target_pos: Vec3,
    target_replan: bool,
    target_replan_time: f32,
    anim: OffMeshAnimation,
}

impl CrowdAgent {
    fn new(params: AgentParams) -> Self {
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(MAX_PATH_POLYS),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neighbours: Vec::with_capacity(MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params,
            corners: Vec::with_capacity(MAX_CORNERS),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            target_replan: false,
            target_replan_time: 0.0,
            anim: OffMeshAnimation::default(),
        }
    }

    fn is_walking(&self) -> bool {
        self.active && self.state == CrowdAgentState::Walking
    }

    /// Whether the agent follows a path rather than idling or being
    /// steered by velocity
    fn has_path_target(&self) -> bool {
        !matches!(
            self.target_state,
            MoveRequestState::None | MoveRequestState::Velocity
        )
    }

    fn request_replan(&mut self) {
        self.target_replan = true;
        self.target_state = MoveRequestState::Requesting;
    }

    /// Off-mesh connection being traversed, if any
    pub fn off_mesh_connection(&self) -> Option<PolyRef> {
        self.anim.active.then_some(self.anim.poly_ref)
    }
}

/// Crowd manager
#[derive(Debug)]
pub struct Crowd {
    nav_mesh: Arc<NavMesh>,
    max_agent_radius: f32,
    agents: Vec<CrowdAgent>,
    obstacle_query_params: [ObstacleAvoidanceParams; MAX_OBSTACLE_AVOIDANCE_PARAMS],
    filters: Vec<QueryFilter>,
    grid: ProximityGrid,
    ext: Vec3,
    velocity_sample_count: usize,
}

impl Crowd {
    /// Creates a crowd of at most `max_agents` agents on `nav_mesh`.
    ///
    /// `max_agent_radius` sizes the proximity grid and the search box used
    /// to place agents and targets on the mesh.
    pub fn new(max_agents: usize, max_agent_radius: f32, nav_mesh: Arc<NavMesh>) -> Result<Self> {
        if max_agents == 0 {
            return Err(Error::InvalidInput(
                "a crowd needs room for at least one agent".to_string(),
            ));
        }
        if !(max_agent_radius.is_finite() && max_agent_radius > 0.0) {
            return Err(Error::InvalidInput(format!(
                "max agent radius {max_agent_radius} must be positive"
            )));
        }

        let r = max_agent_radius;
        log::debug!("crowd created: {max_agents} agents, max radius {r:.2}");
        Ok(Self {
            nav_mesh,
            max_agent_radius: r,
            agents: (0..max_agents)
                .map(|_| CrowdAgent::new(AgentParams::default()))
                .collect(),
            obstacle_query_params: [ObstacleAvoidanceParams::default(); MAX_OBSTACLE_AVOIDANCE_PARAMS],
            filters: vec![QueryFilter::default(); MAX_QUERY_FILTER_TYPE],
            grid: ProximityGrid::new(r * 3.0),
            ext: Vec3::new(r * 2.0, r * 1.5, r * 2.0),
            velocity_sample_count: 0,
        })
    }

    pub fn nav_mesh(&self) -> &Arc<NavMesh> {
        &self.nav_mesh
    }

    pub fn max_agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn max_agent_radius(&self) -> f32 {
        self.max_agent_radius
    }

    /// Number of active agents
    pub fn agent_count(&self) -> usize {
        self.agents.iter().filter(|a| a.active).count()
    }

    /// Indices of the active agents, ascending
    pub fn active_agents(&self) -> Vec<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.active)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_agent_active(&self, idx: usize) -> bool {
        self.agents.get(idx).is_some_and(|a| a.active)
    }

    /// Search box half extents used to snap positions onto the mesh
    pub fn query_half_extents(&self) -> Vec3 {
        self.ext
    }

    /// Candidate velocities evaluated during the last update
    pub fn velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    /// Gets an active agent
    pub fn agent(&self, idx: usize) -> Result<&CrowdAgent> {
        self.agents
            .get(idx)
            .filter(|a| a.active)
            .ok_or_else(|| Error::StaleReference(format!("agent {idx} is not active")))
    }

    fn agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        self.agents
            .get_mut(idx)
            .filter(|a| a.active)
            .ok_or_else(|| Error::StaleReference(format!("agent {idx} is not active")))
    }

    pub fn filter(&self, idx: usize) -> Result<&QueryFilter> {
        self.filters.get(idx).ok_or_else(|| {
            Error::InvalidInput(format!(
                "query filter {idx} out of range 0..{MAX_QUERY_FILTER_TYPE}"
            ))
        })
    }

    pub fn filter_mut(&mut self, idx: usize) -> Result<&mut QueryFilter> {
        self.filters.get_mut(idx).ok_or_else(|| {
            Error::InvalidInput(format!(
                "query filter {idx} out of range 0..{MAX_QUERY_FILTER_TYPE}"
            ))
        })
    }

    pub fn obstacle_avoidance_params(&self, idx: usize) -> Result<&ObstacleAvoidanceParams> {
        self.obstacle_query_params.get(idx).ok_or_else(|| {
            Error::InvalidInput(format!(
                "avoidance profile {idx} out of range 0..{MAX_OBSTACLE_AVOIDANCE_PARAMS}"
            ))
        })
    }

    pub fn set_obstacle_avoidance_params(
        &mut self,
        idx: usize,
        params: ObstacleAvoidanceParams,
    ) -> Result<()> {
        params.validate()?;
        let slot = self.obstacle_query_params.get_mut(idx).ok_or_else(|| {
            Error::InvalidInput(format!(
                "avoidance profile {idx} out of range 0..{MAX_OBSTACLE_AVOIDANCE_PARAMS}"
            ))
        })?;
        *slot = params;
        Ok(())
    }

    /// Adds an agent at the mesh position nearest to `pos`.
    ///
    /// Returns the agent index. When no polygon is found near `pos` the
    /// agent is still added, in the invalid state.
    pub fn add_agent(&mut self, pos: Vec3, params: AgentParams) -> Result<usize> {
        params.validate()?;
        if !pos.is_finite() {
            return Err(Error::InvalidInput(
                "agent position must be finite".to_string(),
            ));
        }
        let Some(idx) = self.agents.iter().position(|a| !a.active) else {
            return Err(Error::CapacityExceeded(format!(
                "all {} agent slots are in use",
                self.agents.len()
            )));
        };

        let filter = &self.filters[params.query_filter_type as usize];
        let query = NavMeshQuery::new(&self.nav_mesh);
        let (reference, nearest) = match query.find_nearest_poly(pos, self.ext, filter) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("agent {idx} placed off the navigation mesh: {err}");
                (PolyRef::NULL, pos)
            }
        };

        let mut agent = CrowdAgent::new(params);
        agent.corridor.reset(reference, nearest);
        agent.npos = nearest;
        agent.state = if reference.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        agent.active = true;
        self.agents[idx] = agent;
        log::debug!(
            "agent {idx} added at ({:.2}, {:.2}, {:.2})",
            nearest.x,
            nearest.y,
            nearest.z
        );
        Ok(idx)
    }

    /// Removes an agent; its slot becomes free for reuse.
    pub fn remove_agent(&mut self, idx: usize) -> Result<()> {
        let agent = self.agent_mut(idx)?;
        agent.active = false;
        agent.anim = OffMeshAnimation::default();
        log::debug!("agent {idx} removed");
        Ok(())
    }

    /// Requests a path to `pos` inside polygon `reference`. The search runs
    /// during the next update.
    pub fn request_move_target(&mut self, idx: usize, reference: PolyRef, pos: Vec3) -> Result<()> {
        if !reference.is_valid() || !self.nav_mesh.is_valid_poly_ref(reference) {
            return Err(Error::InvalidInput(format!(
                "target polygon {} is not valid",
                reference.id()
            )));
        }
        if !pos.is_finite() {
            return Err(Error::InvalidInput(
                "target position must be finite".to_string(),
            ));
        }
        let agent = self.agent_mut(idx)?;
        agent.target_ref = reference;
        agent.target_pos = pos;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::Requesting;
        Ok(())
    }

    /// Snaps `pos` onto the mesh with the agent's filter and requests a
    /// path to it.
    pub fn request_move_target_position(&mut self, idx: usize, pos: Vec3) -> Result<()> {
        let agent = self.agent(idx)?;
        let filter = &self.filters[agent.params.query_filter_type as usize];
        let (reference, nearest) =
            NavMeshQuery::new(&self.nav_mesh).find_nearest_poly(pos, self.ext, filter)?;
        self.request_move_target(idx, reference, nearest)
    }

    /// Steers the agent with an explicit velocity instead of a path.
    pub fn request_move_velocity(&mut self, idx: usize, vel: Vec3) -> Result<()> {
        if !vel.is_finite() {
            return Err(Error::InvalidInput(
                "agent velocity must be finite".to_string(),
            ));
        }
        let agent = self.agent_mut(idx)?;
        agent.target_ref = PolyRef::NULL;
        agent.target_pos = vel;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::Velocity;
        Ok(())
    }

    /// Drops the move request; the agent slows down to a stop.
    pub fn reset_move_target(&mut self, idx: usize) -> Result<()> {
        let agent = self.agent_mut(idx)?;
        agent.target_ref = PolyRef::NULL;
        agent.target_pos = Vec3::ZERO;
        agent.dvel = Vec3::ZERO;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::None;
        Ok(())
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: AgentParams) -> Result<()> {
        params.validate()?;
        self.agent_mut(idx)?.params = params;
        Ok(())
    }

    /// Advances the simulation by `dt` seconds.
    pub fn update(&mut self, dt: f32) -> Result<()> {
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "time step {dt} must be finite and non-negative"
            )));
        }
        let mesh = Arc::clone(&self.nav_mesh);
        let mut query = NavMeshQuery::new(&mesh);
        self.velocity_sample_count = 0;

        self.check_path_validity(&mut query, dt);
        self.update_move_requests(&mesh, &mut query);
        self.update_topology_optimization(&mut query, dt);

        self.grid.clear();
        for (i, ag) in self.agents.iter().enumerate().filter(|(_, a)| a.active) {
            self.grid.add_item(i, ag.npos, ag.params.radius);
        }

        self.update_neighbourhoods(&mesh);
        self.update_corners(&mesh);
        self.trigger_off_mesh_connections(&query);
        self.update_steering();
        self.plan_velocities();
        self.integrate(dt);
        self.resolve_collisions();
        self.move_on_surface(&mesh);
        self.update_off_mesh_animations(dt);
        Ok(())
    }

    /// Repairs corridors whose polygons became invalid and flags agents
    /// whose path needs replanning.
    fn check_path_validity(&mut self, query: &mut NavMeshQuery, dt: f32) {
        let ext = self.ext;
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];
            ag.target_replan_time += dt;
            let mut replan = false;

            let agent_pos = ag.npos;
            let mut agent_ref = ag.corridor.first_poly();
            if !query.is_valid_poly_ref(agent_ref, filter) {
                match query.find_nearest_poly(agent_pos, ext, filter) {
                    Ok((r, _)) => agent_ref = r,
                    Err(_) => {
                        log::debug!("agent {idx} lost the navigation mesh");
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.partial = false;
                        ag.boundary.reset();
                        ag.state = CrowdAgentState::Invalid;
                        continue;
                    }
                }
                ag.corridor.fix_path_start(agent_ref, agent_pos);
                ag.boundary.reset();
                replan = true;
            }

            if !ag.has_path_target() {
                continue;
            }

            if ag.target_state != MoveRequestState::Failed {
                if !query.is_valid_poly_ref(ag.target_ref, filter) {
                    match query.find_nearest_poly(ag.target_pos, ext, filter) {
                        Ok((r, nearest)) => {
                            ag.target_ref = r;
                            ag.target_pos = nearest;
                        }
                        Err(_) => ag.target_ref = PolyRef::NULL,
                    }
                    replan = true;
                }
                if !ag.target_ref.is_valid() {
                    ag.corridor.reset(agent_ref, agent_pos);
                    ag.partial = false;
                    ag.target_state = MoveRequestState::None;
                }
            }

            if !ag.corridor.is_valid(CHECK_LOOKAHEAD, query, filter) {
                if let Err(err) = ag.corridor.trim_invalid_path(agent_ref, agent_pos, query, filter) {
                    log::debug!("agent {idx}: trimming corridor failed: {err}");
                }
                ag.boundary.reset();
                replan = true;
            }

            // Close to the end of a path that does not reach the target yet.
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > TARGET_REPLAN_DELAY
                && ag.corridor.path_count() < CHECK_LOOKAHEAD
                && ag.corridor.last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != MoveRequestState::None {
                ag.request_replan();
            }
        }
    }

    /// Resolves pending move requests: a quick bounded search first, then
    /// a full search for the requests it could not complete.
    fn update_move_requests(&mut self, mesh: &NavMesh, query: &mut NavMeshQuery) {
        for ag in self.agents.iter_mut() {
            if !ag.active
                || ag.state == CrowdAgentState::Invalid
                || ag.target_state != MoveRequestState::Requesting
            {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];
            let first = ag.corridor.first_poly();
            if !first.is_valid() || !ag.target_ref.is_valid() {
                ag.target_state = MoveRequestState::Failed;
                continue;
            }

            let quick = query.find_path_bounded(
                first,
                ag.target_ref,
                ag.npos,
                ag.target_pos,
                filter,
                MAX_QUICK_SEARCH_ITERATIONS,
            );
            let mut req_path = Vec::new();
            let mut req_pos = ag.npos;
            if let Ok(PathResult { mut path, .. }) = quick {
                path.truncate(MAX_QUICK_SEARCH_POLYS);
                match path.last() {
                    Some(&last) if last == ag.target_ref => {
                        req_pos = ag.target_pos;
                        req_path = path;
                    }
                    Some(&last) => {
                        // Constrain the intermediate target inside the last polygon.
                        if let Ok((p, _)) = query.closest_point_on_poly(last, ag.target_pos) {
                            req_pos = p;
                            req_path = path;
                        }
                    }
                    None => {}
                }
            }
            if req_path.is_empty() {
                req_pos = ag.npos;
                req_path.push(first);
            }

            ag.corridor.set_corridor(req_pos, &req_path);
            ag.boundary.reset();
            ag.partial = false;
            if ag.corridor.last_poly() == ag.target_ref {
                ag.target_state = MoveRequestState::Valid;
                ag.target_replan_time = 0.0;
            } else {
                ag.target_state = MoveRequestState::WaitingForQueue;
            }
        }

        // Oldest requests first.
        let mut queue: Vec<usize> = self
            .agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.active && a.target_state == MoveRequestState::WaitingForQueue)
            .map(|(i, _)| i)
            .collect();
        queue.sort_by(|&a, &b| {
            self.agents[b]
                .target_replan_time
                .total_cmp(&self.agents[a].target_replan_time)
        });
        if queue.is_empty() {
            return;
        }

        let mut path_query = NavMeshQuery::with_max_nodes(mesh, MAX_PATH_QUEUE_NODES);
        for idx in queue {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            ag.target_state = MoveRequestState::WaitingForPath;
            let result = path_query.find_path_partial(
                ag.corridor.last_poly(),
                ag.target_ref,
                ag.corridor.target(),
                ag.target_pos,
                filter,
            );
            match result {
                Ok(result) => apply_path_result(ag, result, query),
                Err(err) => {
                    log::debug!("agent {idx}: path request failed: {err}");
                    ag.target_state = MoveRequestState::Failed;
                    ag.target_replan_time = 0.0;
                }
            }
        }
    }

    fn update_topology_optimization(&mut self, query: &mut NavMeshQuery, dt: f32) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking()
                || !ag.has_path_target()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time < TOPOLOGY_OPT_INTERVAL {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];
            if let Err(err) = ag.corridor.optimize_path_topology(query, filter) {
                log::debug!("agent {idx}: topology optimisation failed: {err}");
            }
            ag.boundary.reset();
            ag.topology_opt_time = 0.0;
        }
    }

    /// Gathers neighbours from the grid and refreshes the wall boundaries
    /// of agents that moved far enough.
    fn update_neighbourhoods(&mut self, mesh: &NavMesh) {
        let agents = &self.agents;
        let grid = &self.grid;
        let neighbours: Vec<Vec<CrowdNeighbour>> = (0..agents.len())
            .into_par_iter()
            .map(|i| {
                let ag = &agents[i];
                if !ag.is_walking() {
                    return Vec::new();
                }
                find_neighbours(
                    i,
                    ag.npos,
                    ag.params.height,
                    ag.params.collision_query_range,
                    agents,
                    grid,
                )
            })
            .collect();
        for (ag, neis) in self.agents.iter_mut().zip(neighbours) {
            ag.neighbours = neis;
        }

        let filters = &self.filters;
        self.agents.par_iter_mut().for_each_init(
            || NavMeshQuery::new(mesh),
            |query, ag| {
                if !ag.is_walking() {
                    return;
                }
                let filter = &filters[ag.params.query_filter_type as usize];
                let range = ag.params.collision_query_range;
                let update_thr = range * 0.25;
                if dist_2d_sqr(ag.npos, ag.boundary.center()) > update_thr * update_thr
                    || !ag.boundary.is_valid(query, filter)
                {
                    let first = ag.corridor.first_poly();
                    if let Err(err) = ag.boundary.update(first, ag.npos, range, query, filter) {
                        log::debug!("boundary update failed: {err}");
                    }
                }
            },
        );
    }

    /// Finds the next corners of every path-following agent and shortcuts
    /// corridors towards visible corners.
    fn update_corners(&mut self, mesh: &NavMesh) {
        let filters = &self.filters;
        self.agents.par_iter_mut().for_each_init(
            || NavMeshQuery::new(mesh),
            |query, ag| {
                if !ag.is_walking() {
                    return;
                }
                if !ag.has_path_target() {
                    ag.corners.clear();
                    return;
                }
                ag.corners = ag
                    .corridor
                    .find_corners(MAX_CORNERS, query)
                    .unwrap_or_else(|err| {
                        log::debug!("corner search failed: {err}");
                        Vec::new()
                    });

                if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty() {
                    let filter = &filters[ag.params.query_filter_type as usize];
                    let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                    let range = ag.params.path_optimization_range;
                    if let Err(err) = ag.corridor.optimize_path_visibility(target, range, query, filter) {
                        log::debug!("visibility optimisation failed: {err}");
                    }
                }
            },
        );
    }

    /// Starts the off-mesh animation of agents close enough to the start of
    /// an off-mesh connection.
    fn trigger_off_mesh_connections(&mut self, query: &NavMeshQuery) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() || !ag.has_path_target() || ag.params.max_speed <= 0.0 {
                continue;
            }
            let Some(&last) = ag.corners.last() else {
                continue;
            };
            let trigger_radius = ag.params.radius * 2.25;
            if !last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                || dist_2d_sqr(ag.npos, last.pos) >= trigger_radius * trigger_radius
            {
                continue;
            }

            match ag.corridor.move_over_off_mesh_connection(last.poly, query) {
                Ok((_, start, end)) => {
                    ag.anim = OffMeshAnimation {
                        init_pos: ag.npos,
                        start_pos: start,
                        end_pos: end,
                        poly_ref: last.poly,
                        t: 0.0,
                        tmax: dist_2d(start, end) / ag.params.max_speed * 0.5,
                        active: true,
                    };
                    ag.state = CrowdAgentState::OffMesh;
                    ag.corners.clear();
                    ag.neighbours.clear();
                    log::debug!("agent {idx} entered off-mesh connection {}", last.poly.id());
                }
                // A blocked connection is picked up by the next validity check.
                Err(err) => log::debug!("agent {idx}: off-mesh connection failed: {err}"),
            }
        }
    }

    /// Desired velocities from the corners, plus separation.
    fn update_steering(&mut self) {
        let agents = &self.agents;
        let steering: Vec<Option<(Vec3, f32)>> =
            agents.par_iter().map(|ag| steer(ag, agents)).collect();
        for (ag, s) in self.agents.iter_mut().zip(steering) {
            if let Some((dvel, speed)) = s {
                ag.dvel = dvel;
                ag.desired_speed = speed;
            }
        }
    }

    /// New velocities from obstacle avoidance, or the desired velocity.
    fn plan_velocities(&mut self) {
        let agents = &self.agents;
        let profiles = &self.obstacle_query_params;
        let planned: Vec<Option<(Vec3, usize)>> = agents
            .par_iter()
            .map_init(
                || ObstacleAvoidanceQuery::new(MAX_NEIGHBOURS, MAX_AVOIDANCE_SEGMENTS),
                |oq, ag| plan_velocity(ag, agents, profiles, oq),
            )
            .collect();
        for (ag, p) in self.agents.iter_mut().zip(planned) {
            if let Some((nvel, ns)) = p {
                ag.nvel = nvel;
                self.velocity_sample_count += ns;
            }
        }
    }

    fn integrate(&mut self, dt: f32) {
        for ag in self.agents.iter_mut().filter(|a| a.is_walking()) {
            let max_delta = ag.params.max_acceleration * dt;
            let mut dv = ag.nvel - ag.vel;
            let ds = dv.length();
            if ds > max_delta {
                dv *= max_delta / ds;
            }
            ag.vel += dv;

            let speed = ag.vel.length();
            if speed > ag.params.max_speed {
                ag.vel *= ag.params.max_speed / speed;
            }
            if ag.vel.length() > 0.0001 {
                ag.npos += ag.vel * dt;
            } else {
                ag.vel = Vec3::ZERO;
            }
        }
    }

    /// Pushes overlapping agents apart.
    fn resolve_collisions(&mut self) {
        for _ in 0..COLLISION_ITERATIONS {
            let agents = &self.agents;
            let disps: Vec<Vec3> = (0..agents.len())
                .into_par_iter()
                .map(|i| collision_displacement(i, agents))
                .collect();
            for (ag, disp) in self.agents.iter_mut().zip(disps) {
                // Agents that cannot move are not pushed either.
                if ag.is_walking() && ag.params.max_speed > 0.0 {
                    ag.npos += disp;
                }
            }
        }
    }

    /// Moves corridors to the integrated positions and snaps the agents
    /// back onto the surface.
    fn move_on_surface(&mut self, mesh: &NavMesh) {
        let filters = &self.filters;
        self.agents.par_iter_mut().for_each_init(
            || NavMeshQuery::new(mesh),
            |query, ag| {
                if !ag.is_walking() {
                    return;
                }
                if ag.params.max_speed > 0.0 {
                    let filter = &filters[ag.params.query_filter_type as usize];
                    if let Err(err) = ag.corridor.move_position(ag.npos, query, filter) {
                        log::debug!("surface move failed: {err}");
                    }
                    ag.npos = ag.corridor.pos();
                }
                // Without a path the corridor shrinks to the current polygon.
                if !ag.has_path_target() {
                    ag.corridor.reset(ag.corridor.first_poly(), ag.npos);
                    ag.partial = false;
                }
            },
        );
    }

    fn update_off_mesh_animations(&mut self, dt: f32) {
        for ag in self.agents.iter_mut().filter(|a| a.active && a.anim.active) {
            let anim = &mut ag.anim;
            anim.t += dt;
            if anim.t > anim.tmax {
                anim.active = false;
                ag.npos = anim.end_pos;
                ag.state = CrowdAgentState::Walking;
                continue;
            }
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            ag.npos = if anim.t < ta {
                anim.init_pos.lerp(anim.start_pos, tween(anim.t, 0.0, ta))
            } else {
                anim.start_pos.lerp(anim.end_pos, tween(anim.t, ta, tb))
            };
            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
        }
    }
}

/// Merges a full search result behind the corridor start.
fn apply_path_result(ag: &mut CrowdAgent, result: PathResult, query: &NavMeshQuery) {
    ag.target_replan_time = 0.0;
    ag.partial = result.partial;

    let path = ag.corridor.path();
    // The search started at the end of the corridor as it was when the
    // request was issued.
    let mut valid = !result.path.is_empty() && path.last() == result.path.first();
    let mut merged = Vec::new();
    if valid {
        merged.extend_from_slice(&path[..path.len() - 1]);
        merged.extend_from_slice(&result.path);
        merged.truncate(MAX_PATH_POLYS);
        remove_trackbacks(&mut merged);

        if let Some(&last) = merged.last() {
            if last != ag.target_ref {
                match query.closest_point_on_poly(last, ag.target_pos) {
                    Ok((p, _)) => ag.target_pos = p,
                    Err(_) => valid = false,
                }
            }
        }
    }

    if valid {
        ag.corridor.set_corridor(ag.target_pos, &merged);
        ag.boundary.reset();
        ag.target_state = MoveRequestState::Valid;
    } else {
        ag.target_state = MoveRequestState::Failed;
    }
}

/// Removes `A, B, A` back-and-forth sequences.
fn remove_trackbacks(path: &mut Vec<PolyRef>) {
    let mut j = 1;
    while j + 1 < path.len() {
        if path[j - 1] == path[j + 1] {
            path.drain(j - 1..j + 1);
            j = (j - 1).max(1);
        } else {
            j += 1;
        }
    }
}

/// Agents within `range` of `pos`, closest first.
fn find_neighbours(
    skip: usize,
    pos: Vec3,
    height: f32,
    range: f32,
    agents: &[CrowdAgent],
    grid: &ProximityGrid,
) -> Vec<CrowdNeighbour> {
    let mut result: Vec<CrowdNeighbour> = grid
        .query_items(pos, range, MAX_GRID_QUERY_ITEMS)
        .into_iter()
        .filter(|&id| id != skip)
        .filter_map(|id| {
            let other = agents.get(id).filter(|a| a.active)?;
            let diff = pos - other.npos;
            if diff.y.abs() >= (height + other.params.height) / 2.0 {
                return None;
            }
            let dist_sqr = diff.x * diff.x + diff.z * diff.z;
            (dist_sqr <= range * range).then(|| CrowdNeighbour {
                idx: id,
                dist: dist_sqr.sqrt(),
            })
        })
        .collect();
    result.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.idx.cmp(&b.idx)));
    result.truncate(MAX_NEIGHBOURS);
    result
}

/// Desired velocity and speed of one agent, or `None` if it is not
/// steering this frame.
fn steer(ag: &CrowdAgent, agents: &[CrowdAgent]) -> Option<(Vec3, f32)> {
    if !ag.is_walking() || ag.target_state == MoveRequestState::None {
        return None;
    }

    let (mut dvel, desired_speed) = if ag.target_state == MoveRequestState::Velocity {
        (ag.target_pos, ag.target_pos.length())
    } else {
        let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
            smooth_steer_direction(ag)
        } else {
            straight_steer_direction(ag)
        };
        // Slow down towards the end of the path.
        let slow_down_radius = ag.params.radius * 2.0;
        let speed_scale = distance_to_goal(ag, slow_down_radius) / slow_down_radius;
        let speed = ag.params.max_speed;
        (dir * (speed * speed_scale), speed)
    };

    if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
        let separation_dist = ag.params.collision_query_range;
        let inv_separation_dist = 1.0 / separation_dist.max(f32::EPSILON);
        let mut disp = Vec3::ZERO;
        let mut w = 0.0;
        for nei in &ag.neighbours {
            let other = &agents[nei.idx];
            let mut diff = ag.npos - other.npos;
            diff.y = 0.0;
            let dist_sqr = diff.length_squared();
            if dist_sqr < 0.00001 || dist_sqr > separation_dist * separation_dist {
                continue;
            }
            let dist = dist_sqr.sqrt();
            let weight = ag.params.separation_weight
                * (1.0 - (dist * inv_separation_dist) * (dist * inv_separation_dist));
            disp += diff * (weight / dist);
            w += 1.0;
        }
        if w > 0.0001 {
            dvel += disp / w;
            let speed_sqr = dvel.length_squared();
            let desired_sqr = desired_speed * desired_speed;
            if speed_sqr > desired_sqr {
                dvel *= desired_sqr / speed_sqr;
            }
        }
    }
    Some((dvel, desired_speed))
}

/// Steers so that the turn at the first corner starts early.
fn smooth_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let Some(first) = ag.corners.first() else {
        return Vec3::ZERO;
    };
    let second = &ag.corners[1.min(ag.corners.len() - 1)];

    let mut dir0 = first.pos - ag.npos;
    let mut dir1 = second.pos - ag.npos;
    dir0.y = 0.0;
    dir1.y = 0.0;
    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 /= len1;
    }
    Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5).normalize_or_zero()
}

fn straight_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let Some(first) = ag.corners.first() else {
        return Vec3::ZERO;
    };
    let mut dir = first.pos - ag.npos;
    dir.y = 0.0;
    dir.normalize_or_zero()
}

/// Distance to the path end when it is among the corners, capped at
/// `range`.
fn distance_to_goal(ag: &CrowdAgent, range: f32) -> f32 {
    match ag.corners.last() {
        Some(last) if last.flags.contains(StraightPathFlags::END) => {
            dist_2d(ag.npos, last.pos).min(range)
        }
        _ => range,
    }
}

fn plan_velocity(
    ag: &CrowdAgent,
    agents: &[CrowdAgent],
    profiles: &[ObstacleAvoidanceParams],
    oq: &mut ObstacleAvoidanceQuery,
) -> Option<(Vec3, usize)> {
    if !ag.is_walking() {
        return None;
    }
    if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
        return Some((ag.dvel, 0));
    }

    oq.reset();
    for nei in &ag.neighbours {
        let other = &agents[nei.idx];
        oq.add_circle(other.npos, other.params.radius, other.vel, other.dvel);
    }
    for seg in ag.boundary.segments() {
        // Walls facing away from the agent do not block it.
        if tri_area_2d(ag.npos, seg[0], seg[1]) < 0.0 {
            continue;
        }
        oq.add_segment(seg[0], seg[1]);
    }

    let params = &profiles[ag.params.obstacle_avoidance_type as usize];
    let (nvel, ns) = if params.adaptive_depth > 0 {
        oq.sample_velocity_adaptive(ag.npos, ag.params.radius, ag.desired_speed, ag.vel, ag.dvel, params)
    } else {
        oq.sample_velocity_grid(ag.npos, ag.params.radius, ag.desired_speed, ag.vel, ag.dvel, params)
    };
    Some((nvel, ns))
}

fn collision_displacement(idx: usize, agents: &[CrowdAgent]) -> Vec3 {
    let ag = &agents[idx];
    if !ag.is_walking() {
        return Vec3::ZERO;
    }
    let mut disp = Vec3::ZERO;
    let mut w = 0.0;
    for nei in &ag.neighbours {
        let other = &agents[nei.idx];
        let mut diff = ag.npos - other.npos;
        diff.y = 0.0;
        let dist_sqr = diff.length_squared();
        let r = ag.params.radius + other.params.radius;
        if dist_sqr > r * r {
            continue;
        }
        let dist = dist_sqr.sqrt();
        let pen = if dist < 0.0001 {
            // On top of each other: pick diverging directions.
            diff = if idx > nei.idx {
                Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
            } else {
                Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
            };
            0.01
        } else {
            (1.0 / dist) * ((r - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
        };
        disp += diff * pen;
        w += 1.0;
    }
    if w > 0.0001 {
        disp /= w;
    }
    disp
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= f32::EPSILON {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_params_defaults() {
        let params = AgentParams::default();
        assert_eq!(params.radius, 0.6);
        assert_eq!(params.height, 2.0);
        assert_eq!(params.max_acceleration, 8.0);
        assert_eq!(params.max_speed, 3.5);
        assert!((params.collision_query_range - 7.2).abs() < 1e-5);
        assert!((params.path_optimization_range - 18.0).abs() < 1e-5);
        assert_eq!(params.separation_weight, 2.0);
        assert_eq!(params.obstacle_avoidance_type, 3);
        assert_eq!(params.query_filter_type, 0);
        assert!(params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO));
        assert!(!params.update_flags.contains(UpdateFlags::SEPARATION));
        assert_eq!(params.update_flags.bits(), 1 | 2 | 8 | 16);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_agent_params_validation() {
        let bad = [
            AgentParams {
                radius: 0.0,
                ..Default::default()
            },
            AgentParams {
                height: -1.0,
                ..Default::default()
            },
            AgentParams {
                max_speed: -0.1,
                ..Default::default()
            },
            AgentParams {
                obstacle_avoidance_type: 8,
                ..Default::default()
            },
            AgentParams {
                query_filter_type: 16,
                ..Default::default()
            },
            AgentParams {
                max_acceleration: f32::NAN,
                ..Default::default()
            },
        ];
        for params in bad {
            assert!(matches!(params.validate(), Err(Error::InvalidInput(_))));
        }
        let still = AgentParams {
            max_speed: 0.0,
            ..Default::default()
        };
        assert!(still.validate().is_ok());
    }

    #[test]
    fn test_state_discriminants() {
        assert_eq!(CrowdAgentState::Invalid as u8, 0);
        assert_eq!(CrowdAgentState::OffMesh as u8, 2);
        assert_eq!(MoveRequestState::Requesting as u8, 3);
        assert_eq!(MoveRequestState::Velocity as u8, 6);
    }

    #[test]
    fn test_remove_trackbacks() {
        let r = |ids: &[u32]| ids.iter().map(|&i| PolyRef::new(i)).collect::<Vec<_>>();
        let mut path = r(&[1, 2, 1, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, r(&[1, 3]));

        let mut path = r(&[1, 2, 3, 2, 4]);
        remove_trackbacks(&mut path);
        assert_eq!(path, r(&[1, 2, 4]));

        let mut path = r(&[1, 2, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, r(&[1, 2, 3]));
    }

    #[test]
    fn test_tween() {
        assert_eq!(tween(0.5, 0.0, 1.0), 0.5);
        assert_eq!(tween(2.0, 0.0, 1.0), 1.0);
        assert_eq!(tween(-1.0, 0.0, 1.0), 0.0);
        assert_eq!(tween(0.0, 0.0, 0.0), 1.0);
    }
}
