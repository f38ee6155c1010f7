//! Walkability filters applied to a solid heightfield after rasterization

use crate::heightfield::{Heightfield, NULL_AREA, SPAN_MAX_HEIGHT};

const MAX_HEIGHT: i32 = SPAN_MAX_HEIGHT as i32;

/// Direction offsets on the grid, indexed by direction 0..4.
const DIR_OFFSETS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

/// Marks non-walkable spans as walkable when their top is within
/// `walkable_climb` of a walkable span right below them (curbs, stairs).
pub fn filter_low_hanging_walkable_obstacles(hf: &mut Heightfield, walkable_climb: i32) {
    for column in &mut hf.columns {
        let mut previous_walkable = false;
        let mut previous_area = NULL_AREA;
        let mut previous_max = 0i32;
        for span in column.iter_mut() {
            let walkable = span.area != NULL_AREA;
            let original_area = span.area;
            if !walkable
                && previous_walkable
                && (span.smax as i32 - previous_max).abs() <= walkable_climb
            {
                span.area = previous_area;
            }
            previous_walkable = walkable;
            previous_area = original_area;
            previous_max = span.smax as i32;
        }
    }
}

/// Removes walkable spans next to a drop larger than `walkable_climb`, or
/// whose accessible neighbours are spread over too steep a range.
pub fn filter_ledge_spans(hf: &mut Heightfield, walkable_height: i32, walkable_climb: i32) {
    let w = hf.width;
    let h = hf.height;
    let mut to_clear = Vec::new();

    for z in 0..h {
        for x in 0..w {
            let column = hf.column(x, z);
            for (si, span) in column.iter().enumerate() {
                if span.area == NULL_AREA {
                    continue;
                }
                let bot = span.smax as i32;
                let top = column.get(si + 1).map_or(MAX_HEIGHT, |n| n.smin as i32);

                let mut min_h = MAX_HEIGHT;
                let mut accessible_min = bot;
                let mut accessible_max = bot;

                for (dx, dz) in DIR_OFFSETS {
                    let nx = x + dx;
                    let nz = z + dz;
                    if nx < 0 || nz < 0 || nx >= w || nz >= h {
                        min_h = min_h.min(-walkable_climb - bot);
                        continue;
                    }
                    let neighbour = hf.column(nx, nz);

                    // Gap below the first span of the neighbour column.
                    let nbot = -walkable_climb;
                    let ntop = neighbour.first().map_or(MAX_HEIGHT, |n| n.smin as i32);
                    if top.min(ntop) - bot.max(nbot) > walkable_height {
                        min_h = min_h.min(nbot - bot);
                    }

                    for (ni, ns) in neighbour.iter().enumerate() {
                        let nbot = ns.smax as i32;
                        let ntop = neighbour.get(ni + 1).map_or(MAX_HEIGHT, |n| n.smin as i32);
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            min_h = min_h.min(nbot - bot);
                            if (nbot - bot).abs() <= walkable_climb {
                                accessible_min = accessible_min.min(nbot);
                                accessible_max = accessible_max.max(nbot);
                            }
                        }
                    }
                }

                if min_h < -walkable_climb || accessible_max - accessible_min > walkable_climb {
                    to_clear.push((hf.column_index(x, z), si));
                }
            }
        }
    }

    for (ci, si) in to_clear {
        hf.columns[ci][si].area = NULL_AREA;
    }
}

/// Removes walkable spans without `walkable_height` of clearance above.
pub fn filter_walkable_low_height_spans(hf: &mut Heightfield, walkable_height: i32) {
    for column in &mut hf.columns {
        for i in 0..column.len() {
            let bot = column[i].smax as i32;
            let top = column.get(i + 1).map_or(MAX_HEIGHT, |n| n.smin as i32);
            if top - bot < walkable_height {
                column[i].area = NULL_AREA;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heightfield::WALKABLE_AREA;
    use glam::Vec3;

    fn flat_field(size: i32) -> Heightfield {
        let mut hf = Heightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 10.0, size as f32),
            1.0,
            0.1,
        );
        for z in 0..size {
            for x in 0..size {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        hf
    }

    #[test]
    fn test_low_hanging_obstacle_becomes_walkable() {
        let mut hf = flat_field(3);
        hf.add_span(1, 1, 4, 3 + 1, NULL_AREA, 0).unwrap();
        filter_low_hanging_walkable_obstacles(&mut hf, 3);
        assert_eq!(hf.column(1, 1)[1].area, WALKABLE_AREA);

        let mut tall = flat_field(3);
        tall.add_span(1, 1, 4, 20, NULL_AREA, 0).unwrap();
        filter_low_hanging_walkable_obstacles(&mut tall, 3);
        assert_eq!(tall.column(1, 1)[1].area, NULL_AREA);
    }

    #[test]
    fn test_ledges_removed_at_field_border() {
        let mut hf = flat_field(5);
        filter_ledge_spans(&mut hf, 10, 2);
        assert_eq!(hf.column(0, 2)[0].area, NULL_AREA);
        assert_eq!(hf.column(4, 4)[0].area, NULL_AREA);
        assert_eq!(hf.column(2, 2)[0].area, WALKABLE_AREA);
    }

    #[test]
    fn test_low_clearance_removed() {
        let mut hf = flat_field(3);
        hf.add_span(1, 1, 5, 8, NULL_AREA, 0).unwrap();
        filter_walkable_low_height_spans(&mut hf, 10);
        assert_eq!(hf.column(1, 1)[0].area, NULL_AREA);
        assert_eq!(hf.column(0, 0)[0].area, WALKABLE_AREA);
    }
}
