//! Common utilities and data structures shared by the navmesh crates
//!
//! Holds the error taxonomy used across the build pipeline, the query engine
//! and the crowd simulator, together with the small geometry kernel that all
//! of them operate on. Geometry helpers work on the XZ plane (Y-up).

mod geometry;

pub use geometry::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed geometry, out-of-range indices or parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Degenerate or empty geometry after filtering
    #[error("navigation mesh build failed: {0}")]
    BuildFailure(String),

    /// The navigation mesh, geometry or crowd has not been set up yet
    #[error("not initialized: {0}")]
    NotBuilt(String),

    /// No path connects the requested endpoints
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A point could not be located on the navigation mesh
    #[error("point not found: {0}")]
    PointNotFound(String),

    /// A fixed-size slot table is full
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An id refers to a removed or never-created object
    #[error("stale reference: {0}")]
    StaleReference(String),

    /// Snapshot encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the "not found" family of query results.
    pub fn is_query_unresolvable(&self) -> bool {
        matches!(self, Error::PathNotFound(_) | Error::PointNotFound(_))
    }
}

/// Result type for navmesh operations
pub type Result<T> = std::result::Result<T, Error>;
