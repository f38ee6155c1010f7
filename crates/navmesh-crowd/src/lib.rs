//! Multi-agent crowd simulation on navigation meshes
//!
//! Agents share one navigation mesh and are advanced together: each keeps a
//! path corridor towards its target, steers towards the next corners,
//! avoids neighbours and walls by sampling candidate velocities, and is
//! constrained to the mesh surface. Formations group agents into slots
//! around a target or a leader.
//!
//! # Architecture
//!
//! - [`Crowd`]: agent table and the per-frame update
//! - [`PathCorridor`]: polygon corridor from an agent to its target
//! - [`LocalBoundary`]: nearby wall segments
//! - [`ObstacleAvoidanceQuery`]: velocity sampling against circles and segments
//! - [`ProximityGrid`]: spatial hash for neighbour lookups
//! - [`FormationController`]: formation slots and move requests

pub mod crowd;
pub mod formation;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

pub use crowd::*;
pub use formation::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;

#[cfg(test)]
mod test_mesh_helpers;

#[cfg(test)]
mod crowd_tests;
#[cfg(test)]
mod formation_tests;
