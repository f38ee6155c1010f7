//! Navigation meshes for walking agents
//!
//! [`Navmesh`] ties the pipeline together: it takes a triangle mesh and
//! build settings, voxelizes the walkable surface into a polygon mesh,
//! answers path and surface queries on it, and drives a crowd of agents
//! and their formations.
//!
//! ```no_run
//! use glam::Vec3;
//! use navmesh::Navmesh;
//!
//! # fn main() -> navmesh::Result<()> {
//! let mut nm = Navmesh::new();
//! nm.init_by_raw(
//!     &[0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 100.0, 0.0, 100.0, 0.0, 0.0, 100.0],
//!     &[3, 0, 1, 2, 3, 0, 2, 3],
//! )?;
//! nm.build_navmesh()?;
//! let path = nm.pathfind_straight(Vec3::new(10.0, 0.0, 10.0), Vec3::new(90.0, 0.0, 90.0), 0)?;
//! # Ok(())
//! # }
//! ```
//!
//! Area markup (convex volumes, off-mesh connections, erosion and the
//! median filter) is recorded before a build and applied by it. Marking
//! after a build only takes effect once the mesh is rebuilt.
//!
//! # Crates
//!
//! - [`navmesh_recast`]: voxelization, regions, contours and polygon meshes
//! - [`navmesh_detour`]: the runtime mesh, queries and the binary codec
//! - [`navmesh_crowd`]: crowd simulation and formations

mod export;
mod geometry;
mod navmesh;
mod snapshot;

#[cfg(test)]
mod test_scenes;


pub use export::{polygonize, triangulate, triangulate_detail, Polygonization, Triangulation};
pub use geometry::InputGeometry;
pub use navmesh::{
    AgentState, Navmesh, SurfaceHit, MAX_STRAIGHT_PATH_POINTS, WALL_SEARCH_RADIUS,
};
pub use snapshot::{Snapshot, SNAPSHOT_EXTENSION, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

pub use navmesh_common::{Error, Result};
pub use navmesh_crowd::{
    AgentParams, CrowdAgentState, FormationInfo, FormationType, MoveRequestState,
    ObstacleAvoidanceParams, UpdateFlags,
};
pub use navmesh_detour::{
    PolyFlags, PolyRef, QueryFilter, POLYAREA_DOOR, POLYAREA_GRASS, POLYAREA_GROUND,
    POLYAREA_JUMP, POLYAREA_ROAD, POLYAREA_WATER,
};
pub use navmesh_recast::{BuildSettings, ConvexVolume, PartitionType};

pub use navmesh_common as common;
pub use navmesh_crowd as crowd;
pub use navmesh_detour as detour;
pub use navmesh_recast as recast;
