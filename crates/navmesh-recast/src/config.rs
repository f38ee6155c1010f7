//! Build settings and the derived voxel-space configuration
//!
//! [`BuildSettings`] is the user-facing parameter record, expressed in world
//! units. [`RecastConfig`] is what the pipeline stages consume: the same
//! parameters converted to voxel units and bound to a concrete grid.

use glam::Vec3;
use navmesh_common::{Error, Result};

/// Smallest accepted cell size and cell height.
pub const MIN_CELL_SIZE: f32 = 0.0001;

/// Largest slope accepted for `agent_max_slope`, in degrees.
pub const MAX_WALKABLE_SLOPE: f32 = 89.99;

/// Region partitioning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[repr(u8)]
pub enum PartitionType {
    /// Flood fill from distance field maxima; fewest regions, slowest
    #[default]
    Watershed = 0,
    /// Row sweep; fast, long thin regions
    Monotone = 1,
    /// Sweep then height layering; suited to multi-story geometry
    Layers = 2,
}

impl PartitionType {
    /// Converts the numeric id used by the binding surface.
    pub fn from_index(index: i32) -> Result<Self> {
        match index {
            0 => Ok(PartitionType::Watershed),
            1 => Ok(PartitionType::Monotone),
            2 => Ok(PartitionType::Layers),
            _ => Err(Error::InvalidInput(format!(
                "unknown partition type {index}"
            ))),
        }
    }

    /// Numeric id of the partition type.
    pub fn index(self) -> i32 {
        self as i32
    }
}

/// Navigation mesh build settings, in world units
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
#[cfg_attr(feature = "serialization", serde(rename_all = "camelCase", default))]
pub struct BuildSettings {
    /// Voxel size on the XZ plane
    pub cell_size: f32,
    /// Voxel size on the Y axis
    pub cell_height: f32,
    /// Minimum clearance an agent needs
    pub agent_height: f32,
    /// Agent radius; walkable area is eroded by this much
    pub agent_radius: f32,
    /// Largest ledge an agent can step up
    pub agent_max_climb: f32,
    /// Steepest walkable slope in degrees
    pub agent_max_slope: f32,
    /// Regions smaller than this (in cells, per side) are discarded
    pub region_min_size: f32,
    /// Regions smaller than this (in cells, per side) are merged
    pub region_merge_size: f32,
    /// Longest contour edge along the mesh border
    pub edge_max_len: f32,
    /// Largest deviation of a simplified contour from the raw contour, in cells
    pub edge_max_error: f32,
    /// Maximum number of vertices per polygon, 3 to 6
    pub verts_per_poly: f32,
    /// Detail mesh sampling distance, in cells
    pub detail_sample_dist: f32,
    /// Largest height deviation of the detail mesh, in cell heights
    pub detail_sample_max_error: f32,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0,
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6.0,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
        }
    }
}

impl BuildSettings {
    /// Field names used by the keyed get/set surface.
    pub const KEYS: [&'static str; 13] = [
        "cellSize",
        "cellHeight",
        "agentHeight",
        "agentRadius",
        "agentMaxClimb",
        "agentMaxSlope",
        "regionMinSize",
        "regionMergeSize",
        "edgeMaxLen",
        "edgeMaxError",
        "vertsPerPoly",
        "detailSampleDist",
        "detailSampleMaxError",
    ];

    /// Returns a copy with every value clamped into its accepted range.
    ///
    /// Non-finite values are rejected.
    pub fn sanitized(&self) -> Result<Self> {
        for (key, value) in self.entries() {
            if !value.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "setting {key} is not a finite number"
                )));
            }
        }
        Ok(Self {
            cell_size: self.cell_size.max(MIN_CELL_SIZE),
            cell_height: self.cell_height.max(MIN_CELL_SIZE),
            agent_height: self.agent_height.max(0.0),
            agent_radius: self.agent_radius.max(0.0),
            agent_max_climb: self.agent_max_climb.max(0.0),
            agent_max_slope: self.agent_max_slope.clamp(0.0, MAX_WALKABLE_SLOPE),
            region_min_size: self.region_min_size.max(0.0),
            region_merge_size: self.region_merge_size.max(0.0),
            edge_max_len: self.edge_max_len.max(0.0),
            edge_max_error: self.edge_max_error.max(0.0),
            verts_per_poly: self.verts_per_poly.clamp(3.0, 6.0).floor(),
            detail_sample_dist: self.detail_sample_dist.max(0.0),
            detail_sample_max_error: self.detail_sample_max_error.max(0.0),
        })
    }

    /// Key/value view of the settings.
    pub fn entries(&self) -> [(&'static str, f32); 13] {
        [
            ("cellSize", self.cell_size),
            ("cellHeight", self.cell_height),
            ("agentHeight", self.agent_height),
            ("agentRadius", self.agent_radius),
            ("agentMaxClimb", self.agent_max_climb),
            ("agentMaxSlope", self.agent_max_slope),
            ("regionMinSize", self.region_min_size),
            ("regionMergeSize", self.region_merge_size),
            ("edgeMaxLen", self.edge_max_len),
            ("edgeMaxError", self.edge_max_error),
            ("vertsPerPoly", self.verts_per_poly),
            ("detailSampleDist", self.detail_sample_dist),
            ("detailSampleMaxError", self.detail_sample_max_error),
        ]
    }

    /// Sets one value by key. Unknown keys are an error.
    pub fn set(&mut self, key: &str, value: f32) -> Result<()> {
        let slot = match key {
            "cellSize" => &mut self.cell_size,
            "cellHeight" => &mut self.cell_height,
            "agentHeight" => &mut self.agent_height,
            "agentRadius" => &mut self.agent_radius,
            "agentMaxClimb" => &mut self.agent_max_climb,
            "agentMaxSlope" => &mut self.agent_max_slope,
            "regionMinSize" => &mut self.region_min_size,
            "regionMergeSize" => &mut self.region_merge_size,
            "edgeMaxLen" => &mut self.edge_max_len,
            "edgeMaxError" => &mut self.edge_max_error,
            "vertsPerPoly" => &mut self.verts_per_poly,
            "detailSampleDist" => &mut self.detail_sample_dist,
            "detailSampleMaxError" => &mut self.detail_sample_max_error,
            _ => {
                return Err(Error::InvalidInput(format!("unknown setting {key}")));
            }
        };
        *slot = value;
        Ok(())
    }

    /// Looks up one value by key.
    pub fn get(&self, key: &str) -> Option<f32> {
        self.entries()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Parses settings from JSON; missing keys keep their defaults.
    #[cfg(feature = "serialization")]
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: BuildSettings =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        settings.sanitized()
    }

    /// Serializes the settings to pretty JSON.
    #[cfg(feature = "serialization")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Configuration parameters for Recast navigation mesh generation, in voxel units
#[derive(Debug, Clone)]
pub struct RecastConfig {
    /// The width of the field along the x-axis, in cells
    pub width: i32,
    /// The height of the field along the z-axis, in cells
    pub height: i32,
    /// The width/depth resolution of the field (cell size)
    pub cs: f32,
    /// The height resolution of the field (cell height)
    pub ch: f32,
    /// The minimum bounds of the field's AABB
    pub bmin: Vec3,
    /// The maximum bounds of the field's AABB
    pub bmax: Vec3,
    /// The maximum slope in degrees that is considered walkable
    pub walkable_slope_angle: f32,
    /// Minimum floor to ceiling height, in cell heights
    pub walkable_height: i32,
    /// Maximum ledge height that is still traversable, in cell heights
    pub walkable_climb: i32,
    /// Erosion distance from obstacles, in cells
    pub walkable_radius: i32,
    /// Maximum contour edge length along the mesh border, in cells
    pub max_edge_len: i32,
    /// Maximum deviation of simplified contours, in cells
    pub max_simplification_error: f32,
    /// Minimum number of cells of an isolated region
    pub min_region_area: i32,
    /// Regions below this many cells get merged into neighbours
    pub merge_region_area: i32,
    /// Maximum number of vertices per polygon
    pub max_vertices_per_polygon: usize,
    /// Detail sampling distance, world units (0 disables sampling)
    pub detail_sample_dist: f32,
    /// Maximum detail surface deviation, world units
    pub detail_sample_max_error: f32,
}

impl RecastConfig {
    /// Derives the voxel-space configuration for geometry bounded by
    /// `bmin`/`bmax`.
    pub fn from_settings(settings: &BuildSettings, bmin: Vec3, bmax: Vec3) -> Result<Self> {
        let s = settings.sanitized()?;
        let cs = s.cell_size;
        let ch = s.cell_height;
        let (width, height) = calc_grid_size(bmin, bmax, cs);
        let config = Self {
            width,
            height,
            cs,
            ch,
            bmin,
            bmax,
            walkable_slope_angle: s.agent_max_slope,
            walkable_height: (s.agent_height / ch).ceil() as i32,
            walkable_climb: (s.agent_max_climb / ch).floor() as i32,
            walkable_radius: (s.agent_radius / cs).ceil() as i32,
            max_edge_len: (s.edge_max_len / cs) as i32,
            max_simplification_error: s.edge_max_error,
            min_region_area: (s.region_min_size * s.region_min_size) as i32,
            merge_region_area: (s.region_merge_size * s.region_merge_size) as i32,
            max_vertices_per_polygon: s.verts_per_poly as usize,
            detail_sample_dist: if s.detail_sample_dist < 0.9 {
                0.0
            } else {
                cs * s.detail_sample_dist
            },
            detail_sample_max_error: ch * s.detail_sample_max_error,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidInput(format!(
                "invalid grid size {}x{}",
                self.width, self.height
            )));
        }
        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::InvalidInput(
                "invalid cell size or height".to_string(),
            ));
        }
        if !(0.0..90.0).contains(&self.walkable_slope_angle) {
            return Err(Error::InvalidInput(
                "invalid walkable slope angle".to_string(),
            ));
        }
        if !(3..=crate::MAX_VERTS_PER_POLY).contains(&self.max_vertices_per_polygon) {
            return Err(Error::InvalidInput(format!(
                "vertices per polygon must be within 3..={}",
                crate::MAX_VERTS_PER_POLY
            )));
        }
        if self.walkable_height < 1 {
            return Err(Error::InvalidInput(
                "agent height must span at least one cell".to_string(),
            ));
        }
        Ok(())
    }
}

/// Grid dimensions covering the given bounds.
pub fn calc_grid_size(bmin: Vec3, bmax: Vec3, cs: f32) -> (i32, i32) {
    let width = ((bmax.x - bmin.x) / cs + 0.5) as i32;
    let height = ((bmax.z - bmin.z) / cs + 0.5) as i32;
    (width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_like_setter() {
        let settings = BuildSettings {
            cell_size: 0.0,
            cell_height: -1.0,
            agent_height: -2.0,
            agent_radius: -0.5,
            verts_per_poly: 12.0,
            agent_max_slope: 120.0,
            ..Default::default()
        };
        let s = settings.sanitized().unwrap();
        assert_eq!(s.cell_size, MIN_CELL_SIZE);
        assert_eq!(s.cell_height, MIN_CELL_SIZE);
        assert_eq!(s.agent_height, 0.0);
        assert_eq!(s.agent_radius, 0.0);
        assert_eq!(s.verts_per_poly, 6.0);
        assert!(s.agent_max_slope < 90.0);

        let low = BuildSettings {
            verts_per_poly: 1.0,
            ..Default::default()
        };
        assert_eq!(low.sanitized().unwrap().verts_per_poly, 3.0);
    }

    #[test]
    fn test_sanitize_rejects_nan() {
        let settings = BuildSettings {
            edge_max_len: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(settings.sanitized(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_keyed_access() {
        let mut settings = BuildSettings::default();
        settings.set("cellSize", 0.5).unwrap();
        assert_eq!(settings.get("cellSize"), Some(0.5));
        assert!(settings.set("bogus", 1.0).is_err());
        assert_eq!(settings.entries().len(), BuildSettings::KEYS.len());
    }

    #[test]
    fn test_derived_config() {
        let settings = BuildSettings::default();
        let config = RecastConfig::from_settings(
            &settings,
            Vec3::ZERO,
            Vec3::new(30.0, 1.0, 15.0),
        )
        .unwrap();
        assert_eq!(config.width, 100);
        assert_eq!(config.height, 50);
        assert_eq!(config.walkable_height, 10);
        assert_eq!(config.walkable_climb, 4);
        assert_eq!(config.walkable_radius, 2);
        assert_eq!(config.max_edge_len, 40);
        assert_eq!(config.min_region_area, 64);
        assert_eq!(config.merge_region_area, 400);
        assert!((config.detail_sample_dist - 1.8).abs() < 1e-5);
    }

    #[test]
    fn test_partition_type_ids() {
        assert_eq!(PartitionType::from_index(1).unwrap(), PartitionType::Monotone);
        assert_eq!(PartitionType::Layers.index(), 2);
        assert!(PartitionType::from_index(7).is_err());
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_json_round_trip() {
        let settings = BuildSettings {
            cell_size: 0.25,
            ..Default::default()
        };
        let json = settings.to_json().unwrap();
        assert!(json.contains("cellSize"));
        let back = BuildSettings::from_json(&json).unwrap();
        assert_eq!(back, settings);
        let partial = BuildSettings::from_json(r#"{"agentRadius": 1.0}"#).unwrap();
        assert_eq!(partial.agent_radius, 1.0);
        assert_eq!(partial.cell_size, 0.3);
    }
}
