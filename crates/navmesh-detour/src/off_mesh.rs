//! Off-mesh connection definitions
//!
//! Connections are build input: they are linked into the navigation mesh
//! the next time it is created.

use glam::Vec3;
use navmesh_common::{Error, Result};

use crate::PolyFlags;

/// Capacity of an [`OffMeshConnectionSet`].
pub const MAX_OFFMESH_CONNECTIONS: usize = 256;

/// A jump, ladder or drop between two points of the walkable surface
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    /// Snap radius of the endpoints
    pub radius: f32,
    /// Traversable from the end back to the start as well
    pub bidirectional: bool,
    pub area: u8,
    pub flags: PolyFlags,
    pub user_id: u32,
}

impl OffMeshConnection {
    /// Creates a connection, rejecting non-finite positions and negative radii.
    pub fn new(
        start: Vec3,
        end: Vec3,
        radius: f32,
        bidirectional: bool,
        area: u8,
        flags: PolyFlags,
    ) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() {
            return Err(Error::InvalidInput(
                "off-mesh connection endpoints must be finite".to_string(),
            ));
        }
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "off-mesh connection radius {radius} must be non-negative"
            )));
        }
        Ok(Self {
            start,
            end,
            radius,
            bidirectional,
            area,
            flags,
            user_id: 0,
        })
    }

    /// Straight-line length of the connection
    pub fn length(&self) -> f32 {
        self.start.distance(self.end)
    }
}

/// Bounded, index-addressed list of off-mesh connections
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnectionSet {
    connections: Vec<OffMeshConnection>,
}

impl OffMeshConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a connection and returns its index
    pub fn add(&mut self, mut connection: OffMeshConnection) -> Result<usize> {
        if self.connections.len() >= MAX_OFFMESH_CONNECTIONS {
            return Err(Error::CapacityExceeded(format!(
                "at most {MAX_OFFMESH_CONNECTIONS} off-mesh connections"
            )));
        }
        let index = self.connections.len();
        if connection.user_id == 0 {
            connection.user_id = 1000 + index as u32;
        }
        self.connections.push(connection);
        Ok(index)
    }

    /// Removes the connection at `index`; later connections shift down
    pub fn delete(&mut self, index: usize) -> Result<OffMeshConnection> {
        if index >= self.connections.len() {
            return Err(self.stale(index));
        }
        Ok(self.connections.remove(index))
    }

    pub fn get(&self, index: usize) -> Result<&OffMeshConnection> {
        self.connections.get(index).ok_or_else(|| self.stale(index))
    }

    pub fn all(&self) -> &[OffMeshConnection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    fn stale(&self, index: usize) -> Error {
        Error::StaleReference(format!(
            "off-mesh connection {index} does not exist ({} defined)",
            self.connections.len()
        ))
    }
}
