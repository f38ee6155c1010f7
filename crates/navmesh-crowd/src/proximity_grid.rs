//! Proximity grid for neighbour queries in crowd simulation
//!
//! A sparse 2D hash grid on the XZ plane. Agents are inserted with their
//! bounding square, rebuilt every frame, and queried by box; only agents in
//! the overlapped cells are returned instead of checking every pair.

use std::collections::HashMap;

use glam::Vec3;

/// Grid cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

impl GridCoord {
    /// Converts a world position to grid coordinates
    fn from_world(x: f32, z: f32, inv_cell_size: f32) -> Self {
        Self {
            x: (x * inv_cell_size).floor() as i32,
            z: (z * inv_cell_size).floor() as i32,
        }
    }
}

/// Proximity grid for efficient spatial queries
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cells: HashMap<GridCoord, Vec<usize>>,
    cell_size: f32,
    inv_cell_size: f32,
    item_count: usize,
}

impl ProximityGrid {
    /// Creates a new proximity grid
    pub fn new(cell_size: f32) -> Self {
        // Minimum cell size to avoid division by zero
        let cell_size = cell_size.max(0.1);
        Self {
            cells: HashMap::new(),
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            item_count: 0,
        }
    }

    /// Removes every item, keeping the allocated cells around
    pub fn clear(&mut self) {
        for cell in self.cells.values_mut() {
            cell.clear();
        }
        self.item_count = 0;
    }

    /// Inserts `id` into every cell its bounding square overlaps
    pub fn add_item(&mut self, id: usize, pos: Vec3, radius: f32) {
        let min = GridCoord::from_world(pos.x - radius, pos.z - radius, self.inv_cell_size);
        let max = GridCoord::from_world(pos.x + radius, pos.z + radius, self.inv_cell_size);
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                self.cells.entry(GridCoord { x, z }).or_default().push(id);
            }
        }
        self.item_count += 1;
    }

    /// Ids of the items whose cells overlap the square of half size `range`
    /// around `pos`, each reported once, in ascending order, at most
    /// `max_items` of them.
    pub fn query_items(&self, pos: Vec3, range: f32, max_items: usize) -> Vec<usize> {
        let min = GridCoord::from_world(pos.x - range, pos.z - range, self.inv_cell_size);
        let max = GridCoord::from_world(pos.x + range, pos.z + range, self.inv_cell_size);
        let mut result = Vec::new();
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                if let Some(cell) = self.cells.get(&GridCoord { x, z }) {
                    result.extend_from_slice(cell);
                }
            }
        }
        result.sort_unstable();
        result.dedup();
        result.truncate(max_items);
        result
    }

    /// Number of items inserted since the last clear
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Number of cells holding at least one item
    pub fn occupied_cell_count(&self) -> usize {
        self.cells.values().filter(|c| !c.is_empty()).count()
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}
