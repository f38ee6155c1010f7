//! The [`Navmesh`] facade
//!
//! Owns the input geometry, build settings and area markup, the built
//! navigation mesh, an optional crowd and the formations driving it.
//!
//! Area markup (convex volumes, off-mesh connections, erosion, median
//! filter, slope) is recorded against the input and only reaches the
//! navigation mesh on the next [`Navmesh::build_navmesh`]; the built mesh
//! is never edited in place. Rebuilding or loading replaces the mesh and
//! drops the crowd and formations that referred to the old one.
//!
//! Every failing operation returns an [`Error`] and also records it in the
//! build log retrieved with [`Navmesh::get_log`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use glam::Vec3;
use navmesh_common::{Error, Result};
use navmesh_crowd::{
    AgentParams, Crowd, CrowdAgent, CrowdAgentState, FormationController, FormationInfo,
    FormationType, MoveRequestState, ObstacleAvoidanceParams,
};
use navmesh_detour::{
    NavMesh, NavMeshCreateParams, NavMeshQuery, OffMeshConnection, OffMeshConnectionSet,
    PolyFlags, PolyRef, QueryFilter, StraightPathOptions, DEFAULT_HALF_EXTENTS, MAX_AREAS,
};
use navmesh_recast::{
    BuildContext, BuildSettings, ConvexVolume, ConvexVolumeSet, PartitionType, RecastBuilder,
    RecastConfig, TimerCategory,
};
use rayon::prelude::*;

use crate::export::{self, Polygonization, Triangulation};
use crate::geometry::InputGeometry;
use crate::snapshot::{check_extension, Snapshot};

/// Most points a straight path query returns
pub const MAX_STRAIGHT_PATH_POINTS: usize = 256;

/// Search radius of [`Navmesh::distance_to_wall`]
pub const WALL_SEARCH_RADIUS: f32 = 100.0;

/// Node budget of each worker in batched path queries
const BATCH_MAX_NODES: usize = 2048;

/// Result of [`Navmesh::raycast`]
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceHit {
    /// Fraction of `start..end` walked before the wall, `f32::MAX` when
    /// nothing is in the way
    pub t: f32,
    /// Snapped start and the point where the walk stopped
    pub points: Vec<Vec3>,
}

impl SurfaceHit {
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }
}

/// Snapshot of one crowd agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    pub active: bool,
    pub state: CrowdAgentState,
    pub partial: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Velocity wanted by steering
    pub desired_velocity: Vec3,
    /// Velocity picked by obstacle avoidance
    pub avoidance_velocity: Vec3,
    pub desired_speed: f32,
    pub params: AgentParams,
    pub target_state: MoveRequestState,
    pub target_pos: Vec3,
}

impl From<&CrowdAgent> for AgentState {
    fn from(agent: &CrowdAgent) -> Self {
        Self {
            active: agent.active,
            state: agent.state,
            partial: agent.partial,
            position: agent.npos,
            velocity: agent.vel,
            desired_velocity: agent.dvel,
            avoidance_velocity: agent.nvel,
            desired_speed: agent.desired_speed,
            params: agent.params.clone(),
            target_state: agent.target_state,
            target_pos: agent.target_pos,
        }
    }
}

impl AgentState {
    /// Keyed view with the field names of the binding surface.
    pub fn entries(&self) -> BTreeMap<&'static str, f32> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let p = &self.params;
        BTreeMap::from([
            ("active", flag(self.active)),
            ("state", self.state as u8 as f32),
            ("partial", flag(self.partial)),
            ("posX", self.position.x),
            ("posY", self.position.y),
            ("posZ", self.position.z),
            ("velX", self.velocity.x),
            ("velY", self.velocity.y),
            ("velZ", self.velocity.z),
            ("dvelX", self.desired_velocity.x),
            ("dvelY", self.desired_velocity.y),
            ("dvelZ", self.desired_velocity.z),
            ("nvelX", self.avoidance_velocity.x),
            ("nvelY", self.avoidance_velocity.y),
            ("nvelZ", self.avoidance_velocity.z),
            ("desiredSpeed", self.desired_speed),
            ("radius", p.radius),
            ("height", p.height),
            ("maxAcceleration", p.max_acceleration),
            ("maxSpeed", p.max_speed),
            ("collisionQueryRange", p.collision_query_range),
            ("pathOptimizationRange", p.path_optimization_range),
            ("separationWeight", p.separation_weight),
            ("targetState", self.target_state as u8 as f32),
            ("targetPosX", self.target_pos.x),
            ("targetPosY", self.target_pos.y),
            ("targetPosZ", self.target_pos.z),
        ])
    }
}

/// Navigation mesh generation, queries and crowd simulation behind one
/// object
#[derive(Debug)]
pub struct Navmesh {
    settings: BuildSettings,
    partition: PartitionType,
    geometry: Option<InputGeometry>,
    volumes: ConvexVolumeSet,
    off_mesh: OffMeshConnectionSet,
    extra_erosion: i32,
    median_filter: bool,
    pending_markup: bool,
    nav_mesh: Arc<NavMesh>,
    built: bool,
    /// A build ran, even if it failed and left the mesh empty
    queryable: bool,
    query_filter: QueryFilter,
    half_extents: Vec3,
    ctx: BuildContext,
    crowd: Option<Crowd>,
    formations: FormationController,
}

impl Default for Navmesh {
    fn default() -> Self {
        Self::new()
    }
}

fn not_initialized(what: &str) -> Error {
    Error::NotBuilt(format!("{what} is not initialized"))
}

impl Navmesh {
    pub fn new() -> Self {
        Self {
            settings: BuildSettings::default(),
            partition: PartitionType::default(),
            geometry: None,
            volumes: ConvexVolumeSet::new(),
            off_mesh: OffMeshConnectionSet::new(),
            extra_erosion: 0,
            median_filter: false,
            pending_markup: false,
            nav_mesh: Arc::new(NavMesh::empty()),
            built: false,
            queryable: false,
            query_filter: QueryFilter::default(),
            half_extents: DEFAULT_HALF_EXTENTS,
            ctx: BuildContext::new(),
            crowd: None,
            formations: FormationController::new(),
        }
    }

    /// Drops geometry, markup, the navigation mesh, the crowd and the log.
    /// Settings are kept.
    pub fn clear(&mut self) {
        self.geometry = None;
        self.reset_markup();
        self.drop_mesh();
        self.ctx.clear_logs();
    }

    fn reset_markup(&mut self) {
        self.volumes.clear();
        self.off_mesh.clear();
        self.extra_erosion = 0;
        self.median_filter = false;
        self.pending_markup = false;
    }

    fn drop_mesh(&mut self) {
        self.nav_mesh = Arc::new(NavMesh::empty());
        self.built = false;
        self.queryable = false;
        self.drop_crowd();
    }

    fn drop_crowd(&mut self) {
        self.crowd = None;
        self.formations.clear();
    }

    /// Passes `result` through, recording a failure in the build log.
    fn record<T>(&mut self, what: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.ctx.log_error(format!("{what}: {e}"));
        }
        result
    }

    fn require_built(&self) -> Result<()> {
        if self.built {
            Ok(())
        } else {
            Err(Error::NotBuilt("navigation mesh is not built".to_string()))
        }
    }

    /// Queries run once a build was attempted; a failed build leaves an
    /// empty mesh that finds nothing.
    fn require_queryable(&self) -> Result<()> {
        if self.queryable {
            Ok(())
        } else {
            self.require_built()
        }
    }

    fn require_geometry(&self) -> Result<&InputGeometry> {
        self.geometry
            .as_ref()
            .ok_or_else(|| not_initialized("geometry"))
    }

    // Geometry

    /// Loads flat `xyz` vertices and `[count, i0, ..]` faces.
    ///
    /// Malformed input is rejected and leaves the current state untouched.
    /// Accepted input replaces the geometry and clears markup, the
    /// navigation mesh and the crowd.
    pub fn init_by_raw(&mut self, vertices: &[f32], faces: &[i32]) -> Result<()> {
        let geometry = InputGeometry::from_raw(vertices, faces);
        let geometry = self.record("init by raw", geometry)?;
        self.init_by_geometry(geometry);
        Ok(())
    }

    pub fn init_by_geometry(&mut self, geometry: InputGeometry) {
        self.ctx.log_progress(format!(
            "loaded geometry: {} vertices, {} triangles",
            geometry.verts().len(),
            geometry.tris().len()
        ));
        self.geometry = Some(geometry);
        self.reset_markup();
        self.drop_mesh();
    }

    pub fn geometry(&self) -> Option<&InputGeometry> {
        self.geometry.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.geometry.is_some()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Bounds of the input geometry as `[minx, miny, minz, maxx, maxy, maxz]`
    pub fn get_bounding_box(&mut self) -> Result<[f32; 6]> {
        let bounds = self.require_geometry().map(InputGeometry::bounds);
        let (bmin, bmax) = self.record("get bounding box", bounds)?;
        Ok([bmin.x, bmin.y, bmin.z, bmax.x, bmax.y, bmax.z])
    }

    // Settings

    pub fn get_settings(&self) -> BuildSettings {
        self.settings
    }

    /// Replaces the settings, clamped into their accepted ranges.
    pub fn set_settings(&mut self, settings: BuildSettings) -> Result<()> {
        let sanitized = settings.sanitized();
        self.settings = self.record("set settings", sanitized)?;
        Ok(())
    }

    /// Settings keyed by their binding names (`cellSize`, ...)
    pub fn get_settings_map(&self) -> BTreeMap<&'static str, f32> {
        self.settings.entries().into_iter().collect()
    }

    /// Updates the named settings and leaves the others alone. Nothing
    /// changes when a key is unknown or a value is not finite.
    pub fn update_settings<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a str, f32)>,
    ) -> Result<()> {
        let mut settings = self.settings;
        let updated = entries
            .into_iter()
            .try_for_each(|(key, value)| settings.set(key, value))
            .and_then(|()| settings.sanitized());
        self.settings = self.record("set settings", updated)?;
        Ok(())
    }

    pub fn get_partition_type(&self) -> PartitionType {
        self.partition
    }

    pub fn set_partition_type(&mut self, partition: PartitionType) {
        self.partition = partition;
    }

    /// Sets the partition type from its numeric id (0 watershed,
    /// 1 monotone, 2 layers).
    pub fn set_partition_index(&mut self, index: i32) -> Result<()> {
        let partition = PartitionType::from_index(index);
        self.partition = self.record("set partition type", partition)?;
        Ok(())
    }

    // Build

    /// Builds the navigation mesh from the geometry, settings and markup.
    ///
    /// On failure the navigation mesh is left empty, queries on it find
    /// nothing and the reason is in the log. The crowd and formations are
    /// dropped either way.
    pub fn build_navmesh(&mut self) -> Result<()> {
        self.drop_mesh();
        self.queryable = self.geometry.is_some();
        let mesh = self.build_mesh();
        let mesh = self.record("build navmesh", mesh)?;
        self.nav_mesh = Arc::new(mesh);
        self.built = true;
        self.pending_markup = false;
        Ok(())
    }

    fn build_mesh(&mut self) -> Result<NavMesh> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| not_initialized("geometry"))?;
        let (bmin, bmax) = geometry.bounds();
        let config = RecastConfig::from_settings(&self.settings, bmin, bmax)?;
        let output = RecastBuilder::new(config)
            .with_partition(self.partition)
            .with_extra_erosion(self.extra_erosion)
            .with_median_filter(self.median_filter)
            .build(&mut self.ctx, geometry.verts(), geometry.tris(), &self.volumes)?;
        if output.poly_mesh.npolys == 0 {
            return Err(Error::BuildFailure(
                "no walkable polygons in the input".to_string(),
            ));
        }

        self.ctx.start_timer(TimerCategory::NavMeshData);
        let s = &self.settings;
        let params = NavMeshCreateParams::from_recast(
            &output.poly_mesh,
            &output.detail_mesh,
            self.off_mesh.all(),
            s.agent_height,
            s.agent_radius,
            s.agent_max_climb,
        );
        let mesh = NavMesh::create(&params);
        self.ctx.stop_timer(TimerCategory::NavMeshData);
        let mesh = mesh?;

        let total = self
            .ctx
            .timer_duration(TimerCategory::Total)
            .unwrap_or_default();
        self.ctx.log_progress(format!(
            "navigation mesh ready: {} polygons, {} off-mesh connections ({:.1} ms)",
            mesh.ground_poly_count(),
            mesh.poly_count() - mesh.ground_poly_count(),
            total.as_secs_f64() * 1000.0
        ));
        Ok(mesh)
    }

    /// Returns the build log, one entry per line, and clears it.
    pub fn get_log(&mut self) -> String {
        self.ctx.take_log_text()
    }

    pub fn build_context(&self) -> &BuildContext {
        &self.ctx
    }

    /// The current navigation mesh; empty until a build succeeds
    pub fn nav_mesh(&self) -> &Arc<NavMesh> {
        &self.nav_mesh
    }

    // Persistence

    /// Writes settings, geometry, markup and the navigation mesh to a
    /// `.bin` file.
    pub fn save_navmesh(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let saved = self.write_snapshot(path.as_ref());
        self.record("save navmesh", saved)
    }

    fn write_snapshot(&self, path: &Path) -> Result<()> {
        check_extension(path)?;
        self.require_built()?;
        Snapshot {
            settings: self.settings,
            partition: self.partition,
            extra_erosion: self.extra_erosion,
            median_filter: self.median_filter,
            geometry: self.geometry.clone(),
            volumes: self.volumes.clone(),
            off_mesh: self.off_mesh.clone(),
            nav_mesh: Arc::clone(&self.nav_mesh),
        }
        .save(path)
    }

    /// Replaces everything with the contents of a snapshot file. A file
    /// that cannot be read leaves the current state untouched.
    pub fn load_navmesh(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = Snapshot::load(path.as_ref());
        let snapshot = self.record("load navmesh", snapshot)?;
        self.drop_crowd();
        self.settings = snapshot.settings;
        self.partition = snapshot.partition;
        self.extra_erosion = snapshot.extra_erosion;
        self.median_filter = snapshot.median_filter;
        self.geometry = snapshot.geometry;
        self.volumes = snapshot.volumes;
        self.off_mesh = snapshot.off_mesh;
        self.pending_markup = false;
        self.built = !snapshot.nav_mesh.is_empty();
        self.queryable = true;
        self.nav_mesh = snapshot.nav_mesh;
        self.ctx.log_progress(format!(
            "loaded navigation mesh: {} polygons",
            self.nav_mesh.poly_count()
        ));
        Ok(())
    }

    // Exports

    /// Ground polygons as triangle fans
    pub fn get_navmesh_triangulation(&mut self) -> Result<Triangulation> {
        let tris = self.require_queryable().map(|()| export::triangulate(&self.nav_mesh));
        self.record("get navmesh triangulation", tris)
    }

    /// Detail triangles of the ground polygons
    pub fn get_navmesh_detail_triangulation(&mut self) -> Result<Triangulation> {
        let tris = self
            .require_queryable()
            .map(|()| export::triangulate_detail(&self.nav_mesh));
        self.record("get navmesh detail triangulation", tris)
    }

    pub fn get_navmesh_polygonization(&mut self) -> Result<Polygonization> {
        let polys = self.require_queryable().map(|()| export::polygonize(&self.nav_mesh));
        self.record("get navmesh polygonization", polys)
    }

    // Queries

    /// Filter used by path and spatial queries
    pub fn query_filter(&self) -> &QueryFilter {
        &self.query_filter
    }

    pub fn set_query_filter(&mut self, filter: QueryFilter) {
        self.query_filter = filter;
    }

    /// Search box half size used to locate query endpoints
    pub fn query_half_extents(&self) -> Vec3 {
        self.half_extents
    }

    pub fn set_query_half_extents(&mut self, half_extents: Vec3) -> Result<()> {
        if !(half_extents.is_finite() && half_extents.cmpgt(Vec3::ZERO).all()) {
            let err = Error::InvalidInput(format!(
                "query half extents {half_extents} must be positive"
            ));
            return self.record("set query half extents", Err(err));
        }
        self.half_extents = half_extents;
        Ok(())
    }

    /// Polygon corridor from `start` to `end`, both snapped to the mesh.
    pub fn find_path(&mut self, start: Vec3, end: Vec3) -> Result<Vec<PolyRef>> {
        let path = self.path_polys(start, end, &self.query_filter);
        self.record("find path", path)
    }

    pub fn find_path_with_filter(
        &mut self,
        start: Vec3,
        end: Vec3,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        let path = self.path_polys(start, end, filter);
        self.record("find path", path)
    }

    fn path_polys(&self, start: Vec3, end: Vec3, filter: &QueryFilter) -> Result<Vec<PolyRef>> {
        self.require_queryable()?;
        let mut query = NavMeshQuery::new(&self.nav_mesh);
        let (start_ref, start_pos) = query.find_nearest_poly(start, self.half_extents, filter)?;
        let (end_ref, end_pos) = query.find_nearest_poly(end, self.half_extents, filter)?;
        query.find_path(start_ref, end_ref, start_pos, end_pos, filter)
    }

    /// String-pulled path from `start` to `end`.
    ///
    /// `vertex_mode` 0 keeps only the corners, 1 adds a point where the
    /// area changes, 2 adds a point at every polygon edge crossed.
    pub fn pathfind_straight(&mut self, start: Vec3, end: Vec3, vertex_mode: i32) -> Result<Vec<Vec3>> {
        let filter = self.query_filter.clone();
        self.pathfind_straight_with_filter(start, end, vertex_mode, &filter)
    }

    pub fn pathfind_straight_with_filter(
        &mut self,
        start: Vec3,
        end: Vec3,
        vertex_mode: i32,
        filter: &QueryFilter,
    ) -> Result<Vec<Vec3>> {
        let options = StraightPathOptions::from_vertex_mode(vertex_mode);
        let path = self.require_queryable().and_then(|()| {
            let mut query = NavMeshQuery::new(&self.nav_mesh);
            straight_path(&mut query, filter, self.half_extents, start, end, options)
        });
        self.record("find straight path", path)
    }

    /// Straight paths for many `(start, end)` pairs, computed in parallel.
    ///
    /// Each pair succeeds or fails on its own; the outer error only
    /// reports a mesh that is not built.
    pub fn pathfind_straight_batch(
        &mut self,
        pairs: &[(Vec3, Vec3)],
        vertex_mode: i32,
    ) -> Result<Vec<Result<Vec<Vec3>>>> {
        let built = self.require_queryable();
        self.record("find straight path batch", built)?;

        let options = StraightPathOptions::from_vertex_mode(vertex_mode);
        let mesh: &NavMesh = &self.nav_mesh;
        let filter = &self.query_filter;
        let half_extents = self.half_extents;
        let results: Vec<Result<Vec<Vec3>>> = pairs
            .par_iter()
            .map_init(
                || NavMeshQuery::with_max_nodes(mesh, BATCH_MAX_NODES),
                |query, &(start, end)| {
                    straight_path(query, filter, half_extents, start, end, options)
                },
            )
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            self.ctx.log_warning(format!(
                "find straight path batch: {failed} of {} pairs failed",
                pairs.len()
            ));
        }
        Ok(results)
    }

    /// Flat form of [`Navmesh::pathfind_straight_batch`]: `coordinates`
    /// holds `sx, sy, sz, ex, ey, ez` per pair and the result holds
    /// `count, x, y, z, ..` per pair, with a count of 0 for failed pairs.
    pub fn pathfind_straight_batch_flat(
        &mut self,
        coordinates: &[f32],
        vertex_mode: i32,
    ) -> Result<Vec<f32>> {
        if coordinates.len() % 6 != 0 {
            let err = Error::InvalidInput(format!(
                "batch coordinates length {} is not a multiple of 6",
                coordinates.len()
            ));
            return self.record("find straight path batch", Err(err));
        }
        let pairs: Vec<(Vec3, Vec3)> = coordinates
            .chunks_exact(6)
            .map(|c| (Vec3::from_slice(&c[..3]), Vec3::from_slice(&c[3..])))
            .collect();

        let mut out = Vec::new();
        for result in self.pathfind_straight_batch(&pairs, vertex_mode)? {
            match result {
                Ok(points) => {
                    out.push(points.len() as f32);
                    out.extend(points.iter().flat_map(|p| p.to_array()));
                }
                Err(_) => out.push(0.0),
            }
        }
        Ok(out)
    }

    /// Distance from `point` to the nearest wall of the navigation mesh,
    /// searched up to [`WALL_SEARCH_RADIUS`].
    pub fn distance_to_wall(&mut self, point: Vec3) -> Result<f32> {
        let distance = self.require_queryable().and_then(|()| {
            let mut query = NavMeshQuery::new(&self.nav_mesh);
            let filter = &self.query_filter;
            let (reference, pos) = query.find_nearest_poly(point, self.half_extents, filter)?;
            query
                .find_distance_to_wall(reference, pos, WALL_SEARCH_RADIUS, filter)
                .map(|wall| wall.distance)
        });
        self.record("distance to wall", distance)
    }

    /// Walks the mesh surface from `start` towards `end`. The walk stops
    /// at `end` when nothing is in the way, at the wall hit otherwise.
    pub fn raycast(&mut self, start: Vec3, end: Vec3) -> Result<SurfaceHit> {
        let hit = self.require_queryable().and_then(|()| {
            let query = NavMeshQuery::new(&self.nav_mesh);
            let filter = &self.query_filter;
            let (start_ref, start_pos) = query.find_nearest_poly(start, self.half_extents, filter)?;
            let hit = query.raycast(start_ref, start_pos, end, filter)?;
            let mut hit_pos = hit.hit_point(start_pos, end);
            if let Some(&last) = hit.path.last() {
                if let Some(h) = query.get_poly_height(last, hit_pos)? {
                    hit_pos.y = h;
                }
            }
            Ok(SurfaceHit {
                t: hit.t,
                points: vec![start_pos, hit_pos],
            })
        });
        self.record("raycast", hit)
    }

    /// First intersection of segment `start..end` with the input
    /// triangles, or `end` when the segment hits nothing.
    pub fn hit_mesh(&mut self, start: Vec3, end: Vec3) -> Result<Vec3> {
        let hit = self.require_geometry().map(|geometry| {
            geometry
                .raycast(start, end)
                .map_or(end, |t| start + (end - start) * t)
        });
        self.record("hit mesh", hit)
    }

    // Crowd

    /// Creates a crowd of up to `max_agents` agents on the current mesh,
    /// replacing any previous crowd and its formations.
    pub fn init_crowd(&mut self, max_agents: usize, max_agent_radius: f32) -> Result<()> {
        self.drop_crowd();
        let crowd = self
            .require_queryable()
            .and_then(|()| Crowd::new(max_agents, max_agent_radius, Arc::clone(&self.nav_mesh)));
        self.crowd = Some(self.record("init crowd", crowd)?);
        Ok(())
    }

    pub fn crowd(&self) -> Option<&Crowd> {
        self.crowd.as_ref()
    }

    fn with_crowd<T>(&mut self, what: &str, f: impl FnOnce(&mut Crowd) -> Result<T>) -> Result<T> {
        let result = match self.crowd.as_mut() {
            Some(crowd) => f(crowd),
            None => Err(not_initialized("crowd")),
        };
        self.record(what, result)
    }

    pub fn add_agent(&mut self, pos: Vec3, params: AgentParams) -> Result<usize> {
        self.with_crowd("add agent", |crowd| crowd.add_agent(pos, params))
    }

    /// Removes the agent from the crowd and from its formation.
    pub fn remove_agent(&mut self, idx: usize) -> Result<()> {
        self.with_crowd("remove agent", |crowd| crowd.remove_agent(idx))?;
        if self.formations.formation_of(idx).is_some() {
            let left = self.formations.remove_agent(idx).map(|_| ());
            self.record("remove agent", left)?;
        }
        Ok(())
    }

    pub fn update_crowd(&mut self, dt: f32) -> Result<()> {
        self.with_crowd("update crowd", |crowd| crowd.update(dt))
    }

    /// Sends the agent to the mesh point nearest to `pos`.
    pub fn set_agent_target(&mut self, idx: usize, pos: Vec3) -> Result<()> {
        self.with_crowd("set agent target", |crowd| {
            let (reference, nearest) = crowd
                .nav_mesh()
                .find_nearest_poly(pos, DEFAULT_HALF_EXTENTS, &QueryFilter::default())
                .ok_or_else(|| {
                    Error::PointNotFound(format!(
                        "no polygon near target ({:.2}, {:.2}, {:.2})",
                        pos.x, pos.y, pos.z
                    ))
                })?;
            crowd.request_move_target(idx, reference, nearest)
        })
    }

    pub fn set_agent_velocity(&mut self, idx: usize, vel: Vec3) -> Result<()> {
        self.with_crowd("set agent velocity", |crowd| {
            crowd.request_move_velocity(idx, vel)
        })
    }

    pub fn reset_agent_target(&mut self, idx: usize) -> Result<()> {
        self.with_crowd("reset agent target", |crowd| crowd.reset_move_target(idx))
    }

    pub fn get_agent_position(&mut self, idx: usize) -> Result<Vec3> {
        self.with_crowd("get agent position", |crowd| {
            crowd.agent(idx).map(|a| a.npos)
        })
    }

    pub fn get_agent_velocity(&mut self, idx: usize) -> Result<Vec3> {
        self.with_crowd("get agent velocity", |crowd| {
            crowd.agent(idx).map(|a| a.vel)
        })
    }

    pub fn get_agent_state(&mut self, idx: usize) -> Result<AgentState> {
        self.with_crowd("get agent state", |crowd| {
            crowd.agent(idx).map(AgentState::from)
        })
    }

    pub fn get_agent_parameters(&mut self, idx: usize) -> Result<AgentParams> {
        self.with_crowd("get agent parameters", |crowd| {
            crowd.agent(idx).map(|a| a.params.clone())
        })
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: AgentParams) -> Result<()> {
        self.with_crowd("update agent parameters", |crowd| {
            crowd.update_agent_parameters(idx, params)
        })
    }

    /// Number of active agents
    pub fn get_agent_count(&mut self) -> Result<usize> {
        self.with_crowd("get agent count", |crowd| Ok(crowd.agent_count()))
    }

    /// Number of agent slots
    pub fn get_max_agent_count(&mut self) -> Result<usize> {
        self.with_crowd("get max agent count", |crowd| Ok(crowd.max_agent_count()))
    }

    pub fn get_active_agents(&mut self) -> Result<Vec<usize>> {
        self.with_crowd("get active agents", |crowd| Ok(crowd.active_agents()))
    }

    /// False when there is no crowd.
    pub fn is_agent_active(&self, idx: usize) -> bool {
        self.crowd
            .as_ref()
            .is_some_and(|crowd| crowd.is_agent_active(idx))
    }

    pub fn get_agent_neighbors(&mut self, idx: usize) -> Result<Vec<usize>> {
        self.with_crowd("get agent neighbors", |crowd| {
            crowd
                .agent(idx)
                .map(|a| a.neighbours.iter().map(|n| n.idx).collect())
        })
    }

    /// Upcoming corners of the agent's straight path
    pub fn get_agent_corners(&mut self, idx: usize) -> Result<Vec<Vec3>> {
        self.with_crowd("get agent corners", |crowd| {
            crowd
                .agent(idx)
                .map(|a| a.corners.iter().map(|c| c.pos).collect())
        })
    }

    pub fn get_query_half_extents(&mut self) -> Result<Vec3> {
        self.with_crowd("get query half extents", |crowd| {
            Ok(crowd.query_half_extents())
        })
    }

    pub fn set_obstacle_avoidance_params(
        &mut self,
        idx: usize,
        params: ObstacleAvoidanceParams,
    ) -> Result<()> {
        self.with_crowd("set obstacle avoidance params", |crowd| {
            crowd.set_obstacle_avoidance_params(idx, params)
        })
    }

    pub fn get_obstacle_avoidance_params(&mut self, idx: usize) -> Result<ObstacleAvoidanceParams> {
        self.with_crowd("get obstacle avoidance params", |crowd| {
            crowd.obstacle_avoidance_params(idx).copied()
        })
    }

    pub fn set_query_filter_area_cost(&mut self, filter: usize, area: u8, cost: f32) -> Result<()> {
        self.with_crowd("set query filter area cost", |crowd| {
            check_area(area)?;
            if !(cost.is_finite() && cost >= 0.0) {
                return Err(Error::InvalidInput(format!(
                    "area cost {cost} must be finite and non-negative"
                )));
            }
            crowd.filter_mut(filter)?.set_area_cost(area, cost);
            Ok(())
        })
    }

    pub fn get_query_filter_area_cost(&mut self, filter: usize, area: u8) -> Result<f32> {
        self.with_crowd("get query filter area cost", |crowd| {
            check_area(area)?;
            Ok(crowd.filter(filter)?.area_cost(area))
        })
    }

    pub fn set_query_filter_include_flags(&mut self, filter: usize, flags: PolyFlags) -> Result<()> {
        self.with_crowd("set query filter include flags", |crowd| {
            crowd.filter_mut(filter)?.include_flags = flags;
            Ok(())
        })
    }

    pub fn set_query_filter_exclude_flags(&mut self, filter: usize, flags: PolyFlags) -> Result<()> {
        self.with_crowd("set query filter exclude flags", |crowd| {
            crowd.filter_mut(filter)?.exclude_flags = flags;
            Ok(())
        })
    }

    // Convex volumes and off-mesh connections

    fn note_markup(&mut self, what: &str) {
        self.pending_markup = true;
        if self.built {
            self.ctx.log_progress(format!(
                "{what} recorded; rebuild the navigation mesh to apply it"
            ));
        }
    }

    /// Whether markup changed since the last build
    pub fn has_pending_markup(&self) -> bool {
        self.pending_markup
    }

    /// Adds a convex volume and returns its index.
    pub fn add_convex_volume(
        &mut self,
        verts: &[Vec3],
        hmin: f32,
        hmax: f32,
        area: u8,
    ) -> Result<usize> {
        let volume = ConvexVolume::new(verts.to_vec(), hmin, hmax, area);
        self.add_volume("add convex volume", volume)
    }

    fn add_volume(&mut self, what: &str, volume: Result<ConvexVolume>) -> Result<usize> {
        let index = self
            .require_geometry()
            .and(volume)
            .and_then(|volume| self.volumes.add(volume));
        let index = self.record(what, index)?;
        self.note_markup("convex volume");
        Ok(index)
    }

    pub fn delete_convex_volume(&mut self, index: usize) -> Result<()> {
        let deleted = self.volumes.delete(index).map(|_| ());
        self.record("delete convex volume", deleted)?;
        self.note_markup("convex volume removal");
        Ok(())
    }

    pub fn get_convex_volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn get_convex_volume(&mut self, index: usize) -> Result<ConvexVolume> {
        let volume = self.volumes.get(index).cloned();
        self.record("get convex volume", volume)
    }

    pub fn get_all_convex_volumes(&self) -> &[ConvexVolume] {
        self.volumes.all()
    }

    /// Adds an off-mesh connection and returns its index.
    pub fn add_offmesh_connection(
        &mut self,
        start: Vec3,
        end: Vec3,
        radius: f32,
        bidirectional: bool,
        area: u8,
        flags: PolyFlags,
    ) -> Result<usize> {
        let index = self
            .require_geometry()
            .and_then(|_| OffMeshConnection::new(start, end, radius, bidirectional, area, flags))
            .and_then(|con| self.off_mesh.add(con));
        let index = self.record("add off-mesh connection", index)?;
        self.note_markup("off-mesh connection");
        Ok(index)
    }

    pub fn delete_offmesh_connection(&mut self, index: usize) -> Result<()> {
        let deleted = self.off_mesh.delete(index).map(|_| ());
        self.record("delete off-mesh connection", deleted)?;
        self.note_markup("off-mesh connection removal");
        Ok(())
    }

    pub fn get_offmesh_connection_count(&self) -> usize {
        self.off_mesh.len()
    }

    pub fn get_offmesh_connection(&mut self, index: usize) -> Result<OffMeshConnection> {
        let con = self.off_mesh.get(index).cloned();
        self.record("get off-mesh connection", con)
    }

    pub fn get_all_offmesh_connections(&self) -> &[OffMeshConnection] {
        self.off_mesh.all()
    }

    // Area markup

    /// Marks an axis-aligned box, from `bmin.y` to `bmax.y`, with `area`.
    pub fn mark_box_area(&mut self, bmin: Vec3, bmax: Vec3, area: u8) -> Result<usize> {
        self.add_volume("mark box area", ConvexVolume::from_box(bmin, bmax, area))
    }

    /// Marks an eight-sided prism around `pos`, from `pos.y` up to
    /// `pos.y + height`, with `area`.
    pub fn mark_cylinder_area(
        &mut self,
        pos: Vec3,
        radius: f32,
        height: f32,
        area: u8,
    ) -> Result<usize> {
        self.add_volume(
            "mark cylinder area",
            ConvexVolume::from_cylinder(pos, radius, height, area),
        )
    }

    pub fn mark_convex_poly_area(
        &mut self,
        verts: &[Vec3],
        hmin: f32,
        hmax: f32,
        area: u8,
    ) -> Result<usize> {
        let volume = ConvexVolume::new(verts.to_vec(), hmin, hmax, area);
        self.add_volume("mark convex poly area", volume)
    }

    /// Sets the steepest walkable slope, in degrees, used by the next build.
    pub fn mark_walkable_triangles(&mut self, walkable_slope_angle: f32) -> Result<()> {
        let settings = self.require_geometry().and_then(|_| {
            BuildSettings {
                agent_max_slope: walkable_slope_angle,
                ..self.settings
            }
            .sanitized()
        });
        self.settings = self.record("mark walkable triangles", settings)?;
        self.note_markup("walkable slope");
        Ok(())
    }

    /// Erodes the walkable area by `radius` extra voxels on the next build.
    pub fn erode_walkable_area(&mut self, radius: i32) -> Result<()> {
        let checked = self.require_geometry().and_then(|_| {
            if radius < 0 {
                Err(Error::InvalidInput(format!(
                    "erosion radius {radius} must be non-negative"
                )))
            } else {
                Ok(())
            }
        });
        self.record("erode walkable area", checked)?;
        self.extra_erosion = radius;
        self.note_markup("erosion");
        Ok(())
    }

    /// Applies a median filter to the walkable area on the next build.
    pub fn median_filter_walkable_area(&mut self) -> Result<()> {
        let checked = self.require_geometry().map(|_| ());
        self.record("median filter walkable area", checked)?;
        self.median_filter = true;
        self.note_markup("median filter");
        Ok(())
    }

    // Formations

    pub fn formations(&self) -> &FormationController {
        &self.formations
    }

    pub fn create_formation(&mut self, formation_type: FormationType, spacing: f32) -> Result<usize> {
        let id = match self.crowd {
            Some(_) => self.formations.create(formation_type, spacing),
            None => Err(not_initialized("crowd")),
        };
        let id = self.record("create formation", id)?;
        self.ctx.log_progress(format!(
            "created formation {id} ({formation_type:?}, spacing {spacing:.2})"
        ));
        Ok(id)
    }

    /// Deletes the formation; its agents stay in the crowd.
    pub fn delete_formation(&mut self, id: usize) -> Result<()> {
        let deleted = self.formations.delete(id);
        self.record("delete formation", deleted)
    }

    pub fn add_agent_to_formation(&mut self, id: usize, agent: usize) -> Result<()> {
        let added = match self.crowd.as_ref() {
            Some(crowd) => self.formations.add_agent(crowd, id, agent),
            None => Err(not_initialized("crowd")),
        };
        self.record("add agent to formation", added)?;
        self.ctx
            .log_progress(format!("added agent {agent} to formation {id}"));
        Ok(())
    }

    /// Removes the agent from its formation and returns the formation id.
    pub fn remove_agent_from_formation(&mut self, agent: usize) -> Result<usize> {
        let removed = self.formations.remove_agent(agent);
        self.record("remove agent from formation", removed)
    }

    pub fn set_formation_target(&mut self, id: usize, pos: Vec3, dir: Vec3) -> Result<()> {
        let set = self.formations.set_target(id, pos, dir);
        self.record("set formation target", set)
    }

    pub fn set_formation_leader(&mut self, id: usize, agent: usize) -> Result<()> {
        let set = self.formations.set_leader(id, agent);
        self.record("set formation leader", set)?;
        self.ctx
            .log_progress(format!("agent {agent} leads formation {id}"));
        Ok(())
    }

    pub fn get_formation_agents(&mut self, id: usize) -> Result<Vec<usize>> {
        let agents = self.formations.agents(id).map(<[usize]>::to_vec);
        self.record("get formation agents", agents)
    }

    pub fn get_formation_info(&mut self, id: usize) -> Result<FormationInfo> {
        let info = self.formations.info(id);
        self.record("get formation info", info)
    }

    pub fn get_formation_count(&self) -> usize {
        self.formations.count()
    }

    /// Issues slot move requests for every formation.
    pub fn update_formations(&mut self, dt: f32) -> Result<()> {
        let updated = match self.crowd.as_mut() {
            Some(crowd) => self.formations.update(crowd, dt),
            None => Err(not_initialized("crowd")),
        };
        self.record("update formations", updated)
    }
}

fn check_area(area: u8) -> Result<()> {
    if (area as usize) < MAX_AREAS {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "area {area} out of range 0..{MAX_AREAS}"
        )))
    }
}

fn straight_path(
    query: &mut NavMeshQuery,
    filter: &QueryFilter,
    half_extents: Vec3,
    start: Vec3,
    end: Vec3,
    options: StraightPathOptions,
) -> Result<Vec<Vec3>> {
    let (start_ref, start_pos) = query.find_nearest_poly(start, half_extents, filter)?;
    let (end_ref, end_pos) = query.find_nearest_poly(end, half_extents, filter)?;
    let path = query.find_path(start_ref, end_ref, start_pos, end_pos, filter)?;
    let points =
        query.find_straight_path(start_pos, end_pos, &path, options, MAX_STRAIGHT_PATH_POINTS)?;
    Ok(points.into_iter().map(|p| p.pos).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD_VERTS: [f32; 12] = [
        0.0, 0.0, 0.0, //
        20.0, 0.0, 0.0, //
        20.0, 0.0, 20.0, //
        0.0, 0.0, 20.0,
    ];
    const QUAD_FACES: [i32; 5] = [4, 0, 1, 2, 3];

    #[test]
    fn test_invalid_raw_input_keeps_state() {
        let mut nm = Navmesh::new();
        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        let bounds = nm.get_bounding_box().unwrap();

        assert!(matches!(
            nm.init_by_raw(&QUAD_VERTS[..10], &QUAD_FACES),
            Err(Error::InvalidInput(_))
        ));
        assert!(nm.init_by_raw(&QUAD_VERTS, &[4, 0, 1, 2, 9]).is_err());
        assert_eq!(nm.get_bounding_box().unwrap(), bounds);
        assert_eq!(bounds, [0.0, 0.0, 0.0, 20.0, 0.0, 20.0]);
        assert!(nm.get_log().contains("ERROR: init by raw"));
    }

    #[test]
    fn test_settings_are_clamped() {
        let mut nm = Navmesh::new();
        nm.update_settings([("cellSize", 0.0), ("vertsPerPoly", 9.0), ("agentRadius", -1.0)])
            .unwrap();
        let s = nm.get_settings();
        assert_eq!(s.cell_size, navmesh_recast::MIN_CELL_SIZE);
        assert_eq!(s.verts_per_poly, 6.0);
        assert_eq!(s.agent_radius, 0.0);

        nm.update_settings([("agentMaxSlope", 120.0), ("vertsPerPoly", 1.0)])
            .unwrap();
        assert!(nm.get_settings().agent_max_slope < 90.0);
        assert_eq!(nm.get_settings_map()["vertsPerPoly"], 3.0);

        let before = nm.get_settings();
        assert!(nm.update_settings([("cellSize", 0.5), ("bogus", 1.0)]).is_err());
        assert!(nm.update_settings([("cellHeight", f32::NAN)]).is_err());
        assert_eq!(nm.get_settings(), before);
    }

    #[test]
    fn test_partition_type_index() {
        let mut nm = Navmesh::new();
        nm.set_partition_index(2).unwrap();
        assert_eq!(nm.get_partition_type(), PartitionType::Layers);
        assert!(nm.set_partition_index(7).is_err());
        assert_eq!(nm.get_partition_type(), PartitionType::Layers);
    }

    #[test]
    fn test_operations_before_build() {
        let mut nm = Navmesh::new();
        assert!(matches!(nm.build_navmesh(), Err(Error::NotBuilt(_))));
        assert!(matches!(nm.get_bounding_box(), Err(Error::NotBuilt(_))));
        assert!(matches!(
            nm.hit_mesh(Vec3::ZERO, Vec3::ONE),
            Err(Error::NotBuilt(_))
        ));
        assert!(matches!(
            nm.mark_box_area(Vec3::ZERO, Vec3::ONE, 1),
            Err(Error::NotBuilt(_))
        ));

        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        assert!(matches!(
            nm.find_path(Vec3::ZERO, Vec3::ONE),
            Err(Error::NotBuilt(_))
        ));
        assert!(nm.pathfind_straight_batch(&[], 0).is_err());
        assert!(nm.get_navmesh_triangulation().is_err());
        assert!(matches!(nm.init_crowd(4, 0.6), Err(Error::NotBuilt(_))));
        assert!(matches!(nm.add_agent(Vec3::ZERO, AgentParams::default()), Err(Error::NotBuilt(_))));
        assert!(nm.create_formation(FormationType::Line, 1.0).is_err());
        assert!(!nm.is_agent_active(0));

        let log = nm.get_log();
        assert!(log.contains("find path"));
        assert!(log.contains("init crowd"));
        assert_eq!(nm.get_log(), "");
    }

    #[test]
    fn test_hit_mesh() {
        let mut nm = Navmesh::new();
        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        let hit = nm
            .hit_mesh(Vec3::new(5.0, 10.0, 5.0), Vec3::new(5.0, -10.0, 5.0))
            .unwrap();
        assert!(hit.distance(Vec3::new(5.0, 0.0, 5.0)) < 1e-4);

        let miss_end = Vec3::new(30.0, -10.0, 5.0);
        assert_eq!(
            nm.hit_mesh(Vec3::new(30.0, 10.0, 5.0), miss_end).unwrap(),
            miss_end
        );
    }

    #[test]
    fn test_markup_bookkeeping() {
        let mut nm = Navmesh::new();
        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        assert!(!nm.has_pending_markup());

        let a = nm.mark_box_area(Vec3::new(2.0, -1.0, 2.0), Vec3::new(4.0, 1.0, 4.0), 1).unwrap();
        let b = nm
            .mark_cylinder_area(Vec3::new(10.0, -1.0, 10.0), 2.0, 3.0, 2)
            .unwrap();
        assert_eq!((a, b), (0, 1));
        assert!(nm.has_pending_markup());
        assert_eq!(nm.get_convex_volume(1).unwrap().verts.len(), 8);
        assert_eq!(nm.get_convex_volume(0).unwrap().hmax, 1.0);

        assert!(matches!(
            nm.add_convex_volume(&[Vec3::ZERO, Vec3::X], 0.0, 1.0, 1),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            nm.delete_convex_volume(5),
            Err(Error::StaleReference(_))
        ));
        nm.delete_convex_volume(0).unwrap();
        assert_eq!(nm.get_convex_volume_count(), 1);

        let c = nm
            .add_offmesh_connection(Vec3::ZERO, Vec3::X, 0.5, true, 5, PolyFlags::JUMP)
            .unwrap();
        assert_eq!(nm.get_offmesh_connection(c).unwrap().radius, 0.5);
        assert!(matches!(
            nm.get_offmesh_connection(3),
            Err(Error::StaleReference(_))
        ));

        assert!(nm.erode_walkable_area(-1).is_err());
        nm.erode_walkable_area(2).unwrap();
        nm.median_filter_walkable_area().unwrap();
        nm.mark_walkable_triangles(30.0).unwrap();
        assert_eq!(nm.get_settings().agent_max_slope, 30.0);

        // New geometry starts without markup.
        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        assert_eq!(nm.get_convex_volume_count(), 0);
        assert_eq!(nm.get_offmesh_connection_count(), 0);
        assert!(!nm.has_pending_markup());
    }

    #[test]
    fn test_convex_volume_capacity() {
        let mut nm = Navmesh::new();
        nm.init_by_raw(&QUAD_VERTS, &QUAD_FACES).unwrap();
        for i in 0..navmesh_recast::MAX_CONVEX_VOLUMES {
            let x = i as f32 * 0.05;
            nm.mark_box_area(Vec3::new(x, -1.0, 0.0), Vec3::new(x + 0.05, 1.0, 1.0), 1)
                .unwrap();
        }
        assert!(matches!(
            nm.mark_box_area(Vec3::ZERO, Vec3::ONE, 1),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_agent_state_entries() {
        let state = AgentState {
            active: true,
            state: CrowdAgentState::Walking,
            partial: false,
            position: Vec3::new(1.0, 2.0, 3.0),
            velocity: Vec3::X,
            desired_velocity: Vec3::ZERO,
            avoidance_velocity: Vec3::ZERO,
            desired_speed: 3.5,
            params: AgentParams::default(),
            target_state: MoveRequestState::Valid,
            target_pos: Vec3::new(4.0, 0.0, 6.0),
        };
        let entries = state.entries();
        assert_eq!(entries.len(), 27);
        assert_eq!(entries["active"], 1.0);
        assert_eq!(entries["state"], 1.0);
        assert_eq!(entries["posZ"], 3.0);
        assert_eq!(entries["targetState"], 2.0);
        assert_eq!(entries["maxSpeed"], 3.5);
    }
}
