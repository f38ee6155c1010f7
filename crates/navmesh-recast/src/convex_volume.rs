//! Convex volumes used to stamp area ids onto the walkable surface

use glam::Vec3;
use navmesh_common::{Error, Result};

use crate::area::mark_convex_poly_area;
use crate::compact_heightfield::CompactHeightfield;

/// Maximum number of volumes in a set.
pub const MAX_CONVEX_VOLUMES: usize = 256;
/// Maximum number of footprint vertices of one volume.
pub const MAX_CONVEX_VOLUME_VERTS: usize = 12;
/// Segments used to approximate a cylinder footprint.
pub const CYLINDER_SEGMENTS: usize = 8;

/// A vertical prism with a convex footprint
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ConvexVolume {
    /// Footprint vertices; only x and z are used for containment
    pub verts: Vec<Vec3>,
    /// Bottom of the prism
    pub hmin: f32,
    /// Top of the prism
    pub hmax: f32,
    /// Area id applied to spans inside
    pub area: u8,
}

impl ConvexVolume {
    /// Creates a volume after validating its shape.
    pub fn new(verts: Vec<Vec3>, hmin: f32, hmax: f32, area: u8) -> Result<Self> {
        if verts.len() < 3 || verts.len() > MAX_CONVEX_VOLUME_VERTS {
            return Err(Error::InvalidInput(format!(
                "convex volume needs 3 to {MAX_CONVEX_VOLUME_VERTS} vertices, got {}",
                verts.len()
            )));
        }
        if !hmin.is_finite() || !hmax.is_finite() || verts.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "convex volume has non-finite coordinates".to_string(),
            ));
        }
        if hmin > hmax {
            return Err(Error::InvalidInput(format!(
                "convex volume bottom {hmin} above top {hmax}"
            )));
        }
        Ok(Self {
            verts,
            hmin,
            hmax,
            area,
        })
    }

    /// Axis-aligned box from `bmin.y` to `bmax.y`.
    pub fn from_box(bmin: Vec3, bmax: Vec3, area: u8) -> Result<Self> {
        let (lo, hi) = (bmin.min(bmax), bmin.max(bmax));
        Self::new(
            vec![
                Vec3::new(lo.x, lo.y, lo.z),
                Vec3::new(hi.x, lo.y, lo.z),
                Vec3::new(hi.x, lo.y, hi.z),
                Vec3::new(lo.x, lo.y, hi.z),
            ],
            lo.y,
            hi.y,
            area,
        )
    }

    /// Eight-sided prism around `pos`, from `pos.y` up to `pos.y + height`.
    pub fn from_cylinder(pos: Vec3, radius: f32, height: f32, area: u8) -> Result<Self> {
        if radius <= 0.0 || height < 0.0 {
            return Err(Error::InvalidInput(format!(
                "cylinder needs a positive radius and non-negative height, got {radius}/{height}"
            )));
        }
        let verts = (0..CYLINDER_SEGMENTS)
            .map(|i| {
                let a = i as f32 / CYLINDER_SEGMENTS as f32 * std::f32::consts::TAU;
                Vec3::new(pos.x + a.cos() * radius, pos.y, pos.z + a.sin() * radius)
            })
            .collect();
        Self::new(verts, pos.y, pos.y + height, area)
    }

    /// Stamps this volume's area onto the walkable spans it contains.
    pub fn apply(&self, chf: &mut CompactHeightfield) {
        mark_convex_poly_area(chf, &self.verts, self.hmin, self.hmax, self.area);
    }
}

/// Ordered, bounded collection of convex volumes
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ConvexVolumeSet {
    volumes: Vec<ConvexVolume>,
}

impl ConvexVolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a volume and returns its index.
    pub fn add(&mut self, volume: ConvexVolume) -> Result<usize> {
        if self.volumes.len() >= MAX_CONVEX_VOLUMES {
            return Err(Error::CapacityExceeded(format!(
                "convex volume limit of {MAX_CONVEX_VOLUMES} reached"
            )));
        }
        self.volumes.push(volume);
        Ok(self.volumes.len() - 1)
    }

    /// Removes the volume at `index`; later volumes shift down by one.
    pub fn delete(&mut self, index: usize) -> Result<ConvexVolume> {
        if index >= self.volumes.len() {
            return Err(Error::StaleReference(format!(
                "no convex volume at index {index}"
            )));
        }
        Ok(self.volumes.remove(index))
    }

    pub fn get(&self, index: usize) -> Result<&ConvexVolume> {
        self.volumes
            .get(index)
            .ok_or_else(|| Error::StaleReference(format!("no convex volume at index {index}")))
    }

    pub fn all(&self) -> &[ConvexVolume] {
        &self.volumes
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn clear(&mut self) {
        self.volumes.clear();
    }

    /// Applies every volume in insertion order.
    pub fn apply(&self, chf: &mut CompactHeightfield) {
        for volume in &self.volumes {
            volume.apply(chf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
        ]
    }

    #[test]
    fn test_volume_validation() {
        assert!(ConvexVolume::new(triangle(), 0.0, 1.0, 1).is_ok());
        assert!(ConvexVolume::new(triangle()[..2].to_vec(), 0.0, 1.0, 1).is_err());
        assert!(ConvexVolume::new(vec![Vec3::ZERO; 13], 0.0, 1.0, 1).is_err());
        assert!(ConvexVolume::new(triangle(), 2.0, 1.0, 1).is_err());
    }

    #[test]
    fn test_box_and_cylinder_shapes() {
        let b = ConvexVolume::from_box(Vec3::new(1.0, 0.0, 1.0), Vec3::new(3.0, 2.0, 4.0), 2).unwrap();
        assert_eq!(b.verts.len(), 4);
        assert_eq!((b.hmin, b.hmax), (0.0, 2.0));

        let c = ConvexVolume::from_cylinder(Vec3::new(5.0, 1.0, 5.0), 2.0, 3.0, 4).unwrap();
        assert_eq!(c.verts.len(), CYLINDER_SEGMENTS);
        assert_eq!((c.hmin, c.hmax), (1.0, 4.0));
        assert!(c.verts.iter().all(|v| ((v.x - 5.0).hypot(v.z - 5.0) - 2.0).abs() < 1e-4));
    }

    #[test]
    fn test_set_capacity_and_indices() {
        let mut set = ConvexVolumeSet::new();
        for _ in 0..MAX_CONVEX_VOLUMES {
            set.add(ConvexVolume::new(triangle(), 0.0, 1.0, 1).unwrap()).unwrap();
        }
        let err = set.add(ConvexVolume::new(triangle(), 0.0, 1.0, 1).unwrap());
        assert!(matches!(err, Err(Error::CapacityExceeded(_))));

        assert!(matches!(set.delete(MAX_CONVEX_VOLUMES), Err(Error::StaleReference(_))));
        set.delete(0).unwrap();
        assert_eq!(set.len(), MAX_CONVEX_VOLUMES - 1);
        assert!(set.get(MAX_CONVEX_VOLUMES - 1).is_err());
    }
}
