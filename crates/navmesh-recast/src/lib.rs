//! Recast stage of the navmesh pipeline
//!
//! Turns a triangle soup into a convex polygon mesh with per-polygon detail
//! heights: rasterization into a solid heightfield, walkability filtering,
//! region partitioning, contour tracing and polygon meshing.

mod area;
mod compact_heightfield;
mod config;
mod context;
mod contour;
mod convex_volume;
mod detail_mesh;
mod distance_field;
mod filter;
mod grid_geometry;
mod heightfield;
mod polymesh;
mod rasterization;
mod region;

#[cfg(test)]
mod pipeline_tests;

pub use area::{
    erode_walkable_area, mark_box_area, mark_convex_poly_area, mark_cylinder_area,
    mark_walkable_triangles, median_filter_walkable_area,
};
pub use compact_heightfield::{
    dir_for_offset, dir_offset, CompactCell, CompactHeightfield, CompactSpan, NOT_CONNECTED,
};
pub use config::{
    calc_grid_size, BuildSettings, PartitionType, RecastConfig, MAX_WALKABLE_SLOPE,
    MIN_CELL_SIZE,
};
pub use context::{BuildContext, LogEntry, LogLevel, TimerCategory};
pub use contour::{
    Contour, ContourSet, AREA_BORDER, CONTOUR_REG_MASK, CONTOUR_TESS_AREA_EDGES,
    CONTOUR_TESS_WALL_EDGES,
};
pub use convex_volume::{
    ConvexVolume, ConvexVolumeSet, CYLINDER_SEGMENTS, MAX_CONVEX_VOLUMES, MAX_CONVEX_VOLUME_VERTS,
};
pub use detail_mesh::{PolyMeshDetail, DETAIL_EDGE_BOUNDARY};
pub use distance_field::build_distance_field;
pub use filter::{
    filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
};
pub use heightfield::{Heightfield, Span, NULL_AREA, SPAN_MAX_HEIGHT, WALKABLE_AREA};
pub use polymesh::{PolyMesh, MESH_NULL_IDX};
pub use rasterization::{rasterize_triangle, rasterize_triangles};
pub use region::{build_layer_regions, build_regions_monotone, build_regions_watershed};

use glam::Vec3;
use navmesh_common::{Error, Result};

/// Largest number of vertices a navigation polygon may have.
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Output of a full build
#[derive(Debug, Clone)]
pub struct RecastOutput {
    pub poly_mesh: PolyMesh,
    pub detail_mesh: PolyMeshDetail,
}

/// Builder for Recast navigation mesh generation
#[derive(Debug, Clone)]
pub struct RecastBuilder {
    config: RecastConfig,
    partition: PartitionType,
    extra_erosion: i32,
    median_filter: bool,
}

impl RecastBuilder {
    /// Creates a new builder with the specified configuration
    pub fn new(config: RecastConfig) -> Self {
        Self {
            config,
            partition: PartitionType::default(),
            extra_erosion: 0,
            median_filter: false,
        }
    }

    /// Sets the region partitioning strategy
    pub fn with_partition(mut self, partition: PartitionType) -> Self {
        self.partition = partition;
        self
    }

    /// Erodes the walkable area by `radius` more cells than the agent radius
    pub fn with_extra_erosion(mut self, radius: i32) -> Self {
        self.extra_erosion = radius.max(0);
        self
    }

    /// Runs a median filter over the area ids after erosion
    pub fn with_median_filter(mut self, enabled: bool) -> Self {
        self.median_filter = enabled;
        self
    }

    /// Gets a reference to the configuration
    pub fn config(&self) -> &RecastConfig {
        &self.config
    }

    pub fn partition(&self) -> PartitionType {
        self.partition
    }

    /// Runs every stage from rasterization to the detail mesh.
    ///
    /// An input without walkable surface produces an empty mesh and a
    /// warning rather than an error.
    pub fn build(
        &self,
        ctx: &mut BuildContext,
        verts: &[Vec3],
        tris: &[[u32; 3]],
        volumes: &ConvexVolumeSet,
    ) -> Result<RecastOutput> {
        let cfg = &self.config;
        cfg.validate()?;
        if let Some(t) = tris.iter().find(|t| t.iter().any(|&i| i as usize >= verts.len())) {
            return Err(Error::InvalidInput(format!(
                "triangle {t:?} references a vertex outside 0..{}",
                verts.len()
            )));
        }

        ctx.reset_timers();
        ctx.start_timer(TimerCategory::Total);
        ctx.log_progress(format!(
            "building navigation mesh: {} vertices, {} triangles, {}x{} cells",
            verts.len(),
            tris.len(),
            cfg.width,
            cfg.height
        ));

        ctx.start_timer(TimerCategory::Rasterization);
        let mut hf = Heightfield::new(cfg.width, cfg.height, cfg.bmin, cfg.bmax, cfg.cs, cfg.ch);
        let areas = mark_walkable_triangles(cfg.walkable_slope_angle, verts, tris);
        rasterize_triangles(&mut hf, verts, tris, &areas, cfg.walkable_climb)?;
        ctx.stop_timer(TimerCategory::Rasterization);

        ctx.start_timer(TimerCategory::Filtering);
        filter_low_hanging_walkable_obstacles(&mut hf, cfg.walkable_climb);
        filter_ledge_spans(&mut hf, cfg.walkable_height, cfg.walkable_climb);
        filter_walkable_low_height_spans(&mut hf, cfg.walkable_height);
        ctx.stop_timer(TimerCategory::Filtering);

        ctx.start_timer(TimerCategory::CompactHeightfield);
        let mut chf = CompactHeightfield::build(ctx, cfg.walkable_height, cfg.walkable_climb, &hf);
        drop(hf);
        ctx.stop_timer(TimerCategory::CompactHeightfield);

        ctx.start_timer(TimerCategory::AreaMarking);
        erode_walkable_area(&mut chf, cfg.walkable_radius + self.extra_erosion);
        if self.median_filter {
            median_filter_walkable_area(&mut chf);
        }
        volumes.apply(&mut chf);
        ctx.stop_timer(TimerCategory::AreaMarking);

        let nvp = cfg.max_vertices_per_polygon;
        if chf.walkable_count() == 0 {
            ctx.log_warning("no walkable surface left after filtering; navigation mesh is empty");
            ctx.stop_timer(TimerCategory::Total);
            return Ok(RecastOutput {
                poly_mesh: PolyMesh::empty(chf.bmin, chf.bmax, cfg.cs, cfg.ch, nvp),
                detail_mesh: PolyMeshDetail::default(),
            });
        }

        ctx.start_timer(TimerCategory::Regions);
        match self.partition {
            PartitionType::Watershed => {
                build_distance_field(&mut chf);
                build_regions_watershed(ctx, &mut chf, cfg.min_region_area, cfg.merge_region_area)?;
            }
            PartitionType::Monotone => {
                build_regions_monotone(ctx, &mut chf, cfg.min_region_area, cfg.merge_region_area)?;
            }
            PartitionType::Layers => {
                build_layer_regions(&mut chf, cfg.min_region_area)?;
            }
        }
        ctx.stop_timer(TimerCategory::Regions);
        log::debug!("partitioned walkable surface into {} regions", chf.max_regions);
        if chf.max_regions == 0 {
            ctx.log_warning("partitioning produced no regions; navigation mesh is empty");
        }

        ctx.start_timer(TimerCategory::Contours);
        let cset = ContourSet::build(
            ctx,
            &chf,
            cfg.max_simplification_error,
            cfg.max_edge_len,
            CONTOUR_TESS_WALL_EDGES,
        );
        ctx.stop_timer(TimerCategory::Contours);

        ctx.start_timer(TimerCategory::PolyMesh);
        let poly_mesh = PolyMesh::build(ctx, &cset, nvp)?;
        ctx.stop_timer(TimerCategory::PolyMesh);

        ctx.start_timer(TimerCategory::DetailMesh);
        let detail_mesh = PolyMeshDetail::build(
            ctx,
            &poly_mesh,
            &chf,
            cfg.detail_sample_dist,
            cfg.detail_sample_max_error,
        )?;
        ctx.stop_timer(TimerCategory::DetailMesh);

        ctx.stop_timer(TimerCategory::Total);
        if let Some(total) = ctx.timer_duration(TimerCategory::Total) {
            ctx.log_progress(format!(
                "built {} polygons in {:.2} ms",
                poly_mesh.npolys,
                total.as_secs_f64() * 1000.0
            ));
        }

        Ok(RecastOutput {
            poly_mesh,
            detail_mesh,
        })
    }
}
