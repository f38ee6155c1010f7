//! Query filter: which polygons a query may visit and what they cost

use glam::Vec3;

use crate::nav_mesh::Poly;
use crate::PolyFlags;

/// Number of area ids a filter carries a cost for.
pub const MAX_AREAS: usize = 64;

/// Traversal policy of a query
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryFilter {
    /// Cost multiplier per area id
    #[cfg_attr(feature = "serialization", serde(with = "area_cost_serde"))]
    pub area_cost: [f32; MAX_AREAS],
    /// A polygon needs at least one of these flags
    pub include_flags: PolyFlags,
    /// A polygon must have none of these flags
    pub exclude_flags: PolyFlags,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            area_cost: [1.0; MAX_AREAS],
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
        }
    }
}

impl QueryFilter {
    /// Creates a filter with unit costs that accepts every polygon
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `poly` may be visited
    #[inline]
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` into a polygon of area `area`
    #[inline]
    pub fn cost(&self, pa: Vec3, pb: Vec3, area: u8) -> f32 {
        pa.distance(pb) * self.area_cost(area)
    }

    /// Cost multiplier of an area; unknown areas cost 1.
    #[inline]
    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of an area. Ids past the table are ignored.
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }
}

#[cfg(feature = "serialization")]
mod area_cost_serde {
    use super::MAX_AREAS;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(costs: &[f32; MAX_AREAS], s: S) -> Result<S::Ok, S::Error> {
        costs.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[f32; MAX_AREAS], D::Error> {
        let v = Vec::<f32>::deserialize(d)?;
        let mut costs = [1.0; MAX_AREAS];
        for (slot, c) in costs.iter_mut().zip(v) {
            *slot = c;
        }
        Ok(costs)
    }
}
