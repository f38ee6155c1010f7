//! Detour stage of the navmesh pipeline
//!
//! Runtime navigation mesh built from the Recast polygon mesh: polygons,
//! adjacency links, detail heights and off-mesh connections, together with
//! the query engine (nearest polygon, A* paths, string pulling, raycasts and
//! the local queries used by crowd simulation) and a binary codec.

mod binary_format;
mod nav_mesh;
mod nav_mesh_query;
mod node_pool;
mod off_mesh;
mod query_filter;

#[cfg(test)]
mod test_mesh_helpers;

#[cfg(test)]
mod off_mesh_connection_tests;

pub use binary_format::{NAVMESH_MAGIC, NAVMESH_VERSION};
pub use nav_mesh::{
    Link, NavMesh, NavMeshCreateParams, OffMeshLink, Poly, PolyDetail, PolyVerts,
    OFF_MESH_SIDE_END, OFF_MESH_SIDE_START,
};
pub use nav_mesh_query::{
    NavMeshQuery, PathResult, RaycastHit, StraightPathPoint, WallDistance, DEFAULT_HALF_EXTENTS,
};
pub use node_pool::{Node, NodeFlags, NodePool, NodeQueue, MAX_SEARCH_NODES};
pub use off_mesh::{OffMeshConnection, OffMeshConnectionSet, MAX_OFFMESH_CONNECTIONS};
pub use query_filter::{QueryFilter, MAX_AREAS};

pub use navmesh_recast::MAX_VERTS_PER_POLY;

use bitflags::bitflags;

/// Reference to a polygon of the navigation mesh
///
/// The null reference (0) never names a polygon; valid references are the
/// polygon index plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u32);

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a new polygon reference from its raw id
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Reference of the polygon at `index`
    pub fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    /// Gets the raw id of the polygon reference
    pub fn id(&self) -> u32 {
        self.0
    }

    /// Polygon index, or `None` for the null reference
    pub fn index(&self) -> Option<usize> {
        self.0.checked_sub(1).map(|i| i as usize)
    }

    /// Checks if the polygon reference is valid (non-zero)
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PolyRef> for u32 {
    fn from(r: PolyRef) -> Self {
        r.0
    }
}

bitflags! {
    /// Polygon flags, matched against query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        /// Ability to walk (ground, grass, road)
        const WALK = 0x01;
        /// Ability to swim (water)
        const SWIM = 0x02;
        /// Ability to move through doors
        const DOOR = 0x04;
        /// Ability to jump
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
        /// All abilities
        const ALL = 0xffff;
    }
}

/// Area id of ground polygons; also what the default walkable area becomes.
pub const POLYAREA_GROUND: u8 = 0;
pub const POLYAREA_WATER: u8 = 1;
pub const POLYAREA_ROAD: u8 = 2;
pub const POLYAREA_DOOR: u8 = 3;
pub const POLYAREA_GRASS: u8 = 4;
pub const POLYAREA_JUMP: u8 = 5;

/// Default traversal flags of an area id.
pub fn area_flags(area: u8) -> PolyFlags {
    match area {
        POLYAREA_GROUND | POLYAREA_ROAD | POLYAREA_GRASS => PolyFlags::WALK,
        POLYAREA_WATER => PolyFlags::SWIM,
        POLYAREA_DOOR => PolyFlags::WALK | PolyFlags::DOOR,
        POLYAREA_JUMP => PolyFlags::JUMP,
        _ => PolyFlags::WALK,
    }
}

/// Maps voxel-stage area ids to navigation areas.
pub fn nav_area(voxel_area: u8) -> u8 {
    if voxel_area == navmesh_recast::WALKABLE_AREA {
        POLYAREA_GROUND
    } else {
        voxel_area
    }
}

/// Polygon type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[repr(u8)]
pub enum PolyType {
    /// Regular ground polygon
    #[default]
    Ground = 0,
    /// Two-vertex polygon standing for an off-mesh connection
    OffMeshConnection = 1,
}

bitflags! {
    /// Flags of the points returned by string pulling
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StraightPathFlags: u8 {
        /// The point is the path start
        const START = 0x01;
        /// The point is the path end
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

bitflags! {
    /// Extra vertices emitted by string pulling
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StraightPathOptions: u8 {
        /// Add a vertex at every polygon edge crossing where the area changes
        const AREA_CROSSINGS = 0x01;
        /// Add a vertex at every polygon edge crossing
        const ALL_CROSSINGS = 0x02;
    }
}

impl StraightPathOptions {
    /// Options for the numeric vertex mode of the binding surface
    /// (0 none, 1 area crossings, 2 all crossings).
    pub fn from_vertex_mode(mode: i32) -> Self {
        match mode {
            1 => StraightPathOptions::AREA_CROSSINGS,
            2 => StraightPathOptions::ALL_CROSSINGS,
            _ => StraightPathOptions::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poly_ref() {
        assert!(!PolyRef::NULL.is_valid());
        assert_eq!(PolyRef::NULL.index(), None);
        let r = PolyRef::from_index(4);
        assert_eq!(r.id(), 5);
        assert_eq!(r.index(), Some(4));
        assert_eq!(u32::from(r), 5);
    }

    #[test]
    fn test_area_flags() {
        assert_eq!(area_flags(POLYAREA_GROUND), PolyFlags::WALK);
        assert_eq!(area_flags(POLYAREA_WATER), PolyFlags::SWIM);
        assert_eq!(area_flags(POLYAREA_DOOR), PolyFlags::WALK | PolyFlags::DOOR);
        assert_eq!(area_flags(POLYAREA_JUMP), PolyFlags::JUMP);
        assert_eq!(nav_area(navmesh_recast::WALKABLE_AREA), POLYAREA_GROUND);
        assert_eq!(nav_area(POLYAREA_ROAD), POLYAREA_ROAD);
    }

    #[test]
    fn test_vertex_mode_options() {
        assert!(StraightPathOptions::from_vertex_mode(0).is_empty());
        assert_eq!(
            StraightPathOptions::from_vertex_mode(2),
            StraightPathOptions::ALL_CROSSINGS
        );
    }
}
