//! Region partitioning of the compact heightfield
//!
//! Three strategies assign a region id to every walkable span:
//! watershed flooding of the distance field, a monotone row sweep, and a
//! row sweep followed by grouping into non-overlapping layers. All of them
//! finish by dropping tiny islands and compacting ids to `1..=n`.

use std::collections::VecDeque;

use navmesh_common::{Error, Result};

use crate::compact_heightfield::CompactHeightfield;
use crate::context::BuildContext;
use crate::heightfield::NULL_AREA;

/// Number of distance levels consumed per flooding stack.
const NB_STACKS: usize = 8;
/// Expansion iterations per distance level.
const EXPAND_ITERS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct LevelEntry {
    x: i32,
    z: i32,
    index: Option<usize>,
}

#[derive(Debug, Clone)]
struct Region {
    span_count: i32,
    id: u16,
    area: u8,
    remap: bool,
    visited: bool,
    overlap: bool,
    connections: Vec<u16>,
    floors: Vec<u16>,
}

impl Region {
    fn new(id: u16) -> Self {
        Self {
            span_count: 0,
            id,
            area: 0,
            remap: false,
            visited: false,
            overlap: false,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn add_unique_floor(&mut self, id: u16) {
        if !self.floors.contains(&id) {
            self.floors.push(id);
        }
    }

    fn add_unique_connection(&mut self, id: u16) {
        if !self.connections.contains(&id) {
            self.connections.push(id);
        }
    }

    fn remove_adjacent_duplicates(&mut self) {
        let mut i = 0;
        while i < self.connections.len() && self.connections.len() > 1 {
            let ni = (i + 1) % self.connections.len();
            if self.connections[i] == self.connections[ni] {
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn replace_neighbour(&mut self, old_id: u16, new_id: u16) {
        let mut changed = false;
        for c in &mut self.connections {
            if *c == old_id {
                *c = new_id;
                changed = true;
            }
        }
        for f in &mut self.floors {
            if *f == old_id {
                *f = new_id;
            }
        }
        if changed {
            self.remove_adjacent_duplicates();
        }
    }

    fn can_merge_with(&self, other: &Region) -> bool {
        if self.area != other.area {
            return false;
        }
        let shared = self.connections.iter().filter(|&&c| c == other.id).count();
        shared <= 1 && !self.floors.contains(&other.id)
    }

    fn is_connected_to_border(&self) -> bool {
        self.connections.contains(&0)
    }
}

fn next_region_id(id: u16) -> Result<u16> {
    id.checked_add(1)
        .filter(|&n| n < 0xffff)
        .ok_or_else(|| Error::BuildFailure("region id overflow".to_string()))
}

/// Partitions the walkable surface with watershed flooding.
///
/// Requires [`crate::build_distance_field`] to have run first.
pub fn build_regions_watershed(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    let n = chf.span_count;
    if chf.dist.len() != n {
        return Err(Error::BuildFailure(
            "distance field missing before watershed partitioning".to_string(),
        ));
    }

    let mut src_reg = vec![0u16; n];
    let mut src_dist = vec![0u16; n];
    let mut stacks: Vec<Vec<LevelEntry>> = vec![Vec::new(); NB_STACKS];
    let mut flood_stack: Vec<(i32, i32, usize)> = Vec::new();

    let mut region_id: u16 = 1;
    let mut level = (chf.max_distance + 1) & !1;
    let mut stack_id = usize::MAX;

    while level > 0 {
        level = level.saturating_sub(2);
        stack_id = stack_id.wrapping_add(1) & (NB_STACKS - 1);

        if stack_id == 0 {
            sort_cells_by_level(level, chf, &src_reg, &mut stacks);
        } else {
            let (prev, cur) = stacks.split_at_mut(stack_id);
            append_stacks(&prev[stack_id - 1], &mut cur[0], &src_reg);
        }

        expand_regions(
            EXPAND_ITERS,
            level,
            chf,
            &mut src_reg,
            &mut src_dist,
            &mut stacks[stack_id],
            false,
        );

        for entry in stacks[stack_id].clone() {
            let Some(i) = entry.index else {
                continue;
            };
            if src_reg[i] != 0 {
                continue;
            }
            if flood_region(
                entry.x,
                entry.z,
                i,
                level,
                region_id,
                chf,
                &mut src_reg,
                &mut src_dist,
                &mut flood_stack,
            ) {
                region_id = next_region_id(region_id)?;
            }
        }
    }

    let mut rest = Vec::new();
    expand_regions(
        EXPAND_ITERS * 8,
        0,
        chf,
        &mut src_reg,
        &mut src_dist,
        &mut rest,
        true,
    );

    let max_region_id = merge_and_filter_regions(
        ctx,
        min_region_area,
        merge_region_area,
        region_id,
        chf,
        &mut src_reg,
    );
    chf.max_regions = max_region_id;
    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }
    Ok(())
}

fn sort_cells_by_level(
    start_level: u16,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    stacks: &mut [Vec<LevelEntry>],
) {
    let start_level = (start_level >> 1) as i32;
    for stack in stacks.iter_mut() {
        stack.clear();
    }
    for z in 0..chf.height {
        for x in 0..chf.width {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA || src_reg[i] != 0 {
                    continue;
                }
                let level = (chf.dist[i] >> 1) as i32;
                let sid = (start_level - level).max(0) as usize;
                if sid >= stacks.len() {
                    continue;
                }
                stacks[sid].push(LevelEntry {
                    x,
                    z,
                    index: Some(i),
                });
            }
        }
    }
}

fn append_stacks(src: &[LevelEntry], dst: &mut Vec<LevelEntry>, src_reg: &[u16]) {
    dst.extend(
        src.iter()
            .filter(|e| e.index.is_some_and(|i| src_reg[i] == 0))
            .copied(),
    );
}

#[allow(clippy::too_many_arguments)]
fn expand_regions(
    max_iter: usize,
    level: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<LevelEntry>,
    fill_stack: bool,
) {
    if fill_stack {
        stack.clear();
        for z in 0..chf.height {
            for x in 0..chf.width {
                for i in chf.cell_spans(x, z) {
                    if chf.dist[i] >= level && src_reg[i] == 0 && chf.areas[i] != NULL_AREA {
                        stack.push(LevelEntry {
                            x,
                            z,
                            index: Some(i),
                        });
                    }
                }
            }
        }
    } else {
        for entry in stack.iter_mut() {
            if entry.index.is_some_and(|i| src_reg[i] != 0) {
                entry.index = None;
            }
        }
    }

    let mut dirty: Vec<(usize, u16, u16)> = Vec::new();
    let mut iter = 0;
    while !stack.is_empty() {
        let mut failed = 0;
        dirty.clear();

        for entry in stack.iter_mut() {
            let Some(i) = entry.index else {
                failed += 1;
                continue;
            };
            let mut r = src_reg[i];
            let mut d2 = 0xffffu16;
            let area = chf.areas[i];
            for dir in 0..4 {
                let Some((_, _, ai)) = chf.neighbour(entry.x, entry.z, i, dir) else {
                    continue;
                };
                if chf.areas[ai] != area {
                    continue;
                }
                if src_reg[ai] > 0 && src_dist[ai].saturating_add(2) < d2 {
                    r = src_reg[ai];
                    d2 = src_dist[ai] + 2;
                }
            }
            if r != 0 {
                entry.index = None;
                dirty.push((i, r, d2));
            } else {
                failed += 1;
            }
        }

        for &(i, r, d) in &dirty {
            src_reg[i] = r;
            src_dist[i] = d;
        }

        if failed == stack.len() {
            break;
        }
        if level > 0 {
            iter += 1;
            if iter >= max_iter {
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn flood_region(
    x: i32,
    z: i32,
    i: usize,
    level: u16,
    r: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<(i32, i32, usize)>,
) -> bool {
    let area = chf.areas[i];
    stack.clear();
    stack.push((x, z, i));
    src_reg[i] = r;
    src_dist[i] = 0;

    let lev = level.saturating_sub(2);
    let mut count = 0;

    while let Some((cx, cz, ci)) = stack.pop() {
        // Stop at spans touching another region.
        let mut adjacent = 0u16;
        for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            if chf.areas[ai] != area {
                continue;
            }
            let nr = src_reg[ai];
            if nr != 0 && nr != r {
                adjacent = nr;
                break;
            }
            if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, (dir + 1) & 3) {
                if chf.areas[ai2] != area {
                    continue;
                }
                let nr2 = src_reg[ai2];
                if nr2 != 0 && nr2 != r {
                    adjacent = nr2;
                    break;
                }
            }
        }
        if adjacent != 0 {
            src_reg[ci] = 0;
            continue;
        }
        count += 1;

        for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            if chf.areas[ai] != area {
                continue;
            }
            if chf.dist[ai] >= lev && src_reg[ai] == 0 {
                src_reg[ai] = r;
                src_dist[ai] = 0;
                stack.push((ax, az, ai));
            }
        }
    }
    count > 0
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Row-local id
    rid: u16,
    /// Final region id
    id: u16,
    /// Number of samples connected to `nei`
    ns: u16,
    /// Neighbour id in the previous row (0 = none, 0xffff = several)
    nei: u16,
}

const NULL_NEI: u16 = 0xffff;

/// Row sweep shared by the monotone and layer partitioners. Returns the
/// next unused region id.
fn sweep_rows(chf: &CompactHeightfield, src_reg: &mut [u16]) -> Result<u16> {
    let mut id: u16 = 1;
    let mut sweeps: Vec<SweepSpan> = Vec::new();
    let mut prev: Vec<u16> = Vec::new();

    for z in 0..chf.height {
        prev.clear();
        prev.resize(id as usize + 1, 0);
        sweeps.clear();
        sweeps.push(SweepSpan::default());
        let mut rid: u16 = 1;

        for x in 0..chf.width {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    continue;
                }

                let mut previd = 0u16;
                if let Some((_, _, ai)) = chf.neighbour(x, z, i, 0) {
                    if chf.areas[i] == chf.areas[ai] {
                        previd = src_reg[ai];
                    }
                }
                if previd == 0 {
                    previd = rid;
                    rid = next_region_id(rid)?;
                    sweeps.push(SweepSpan {
                        rid: previd,
                        ..Default::default()
                    });
                }

                if let Some((_, _, ai)) = chf.neighbour(x, z, i, 3) {
                    let nr = src_reg[ai];
                    if nr != 0 && chf.areas[i] == chf.areas[ai] {
                        let sweep = &mut sweeps[previd as usize];
                        if sweep.nei == 0 || sweep.nei == nr {
                            sweep.nei = nr;
                            sweep.ns += 1;
                            prev[nr as usize] += 1;
                        } else {
                            sweep.nei = NULL_NEI;
                        }
                    }
                }
                src_reg[i] = previd;
            }
        }

        // A row segment continues the region above only if it is that
        // region's single continuation.
        for sweep in sweeps.iter_mut().skip(1) {
            if sweep.nei != NULL_NEI && sweep.nei != 0 && prev[sweep.nei as usize] == sweep.ns {
                sweep.id = sweep.nei;
            } else {
                sweep.id = id;
                id = next_region_id(id)?;
            }
        }

        for x in 0..chf.width {
            for i in chf.cell_spans(x, z) {
                let r = src_reg[i];
                if r > 0 && r < rid {
                    src_reg[i] = sweeps[r as usize].id;
                }
            }
        }
    }
    Ok(id)
}

/// Partitions the walkable surface into monotone regions.
pub fn build_regions_monotone(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    let mut src_reg = vec![0u16; chf.span_count];
    let id = sweep_rows(chf, &mut src_reg)?;
    let max_region_id =
        merge_and_filter_regions(ctx, min_region_area, merge_region_area, id, chf, &mut src_reg);
    chf.max_regions = max_region_id;
    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }
    Ok(())
}

/// Partitions the walkable surface into regions that never overlap
/// vertically, suited to multi-level geometry.
pub fn build_layer_regions(
    chf: &mut CompactHeightfield,
    min_region_area: i32,
) -> Result<()> {
    let mut src_reg = vec![0u16; chf.span_count];
    let id = sweep_rows(chf, &mut src_reg)?;
    let max_region_id = merge_and_filter_layer_regions(min_region_area, id, chf, &mut src_reg);
    chf.max_regions = max_region_id;
    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }
    Ok(())
}

fn is_solid_edge(chf: &CompactHeightfield, src_reg: &[u16], x: i32, z: i32, i: usize, dir: usize) -> bool {
    let r = chf
        .neighbour(x, z, i, dir)
        .map_or(0, |(_, _, ai)| src_reg[ai]);
    r != src_reg[i]
}

/// Walks the boundary of the region containing span `i`, recording the
/// sequence of neighbouring region ids.
fn walk_region_contour(
    mut x: i32,
    mut z: i32,
    mut i: usize,
    mut dir: usize,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    connections: &mut Vec<u16>,
) {
    let start_dir = dir;
    let start_i = i;

    let mut cur_reg = chf
        .neighbour(x, z, i, dir)
        .map_or(0, |(_, _, ai)| src_reg[ai]);
    connections.push(cur_reg);

    for _ in 0..40000 {
        if is_solid_edge(chf, src_reg, x, z, i, dir) {
            let r = chf
                .neighbour(x, z, i, dir)
                .map_or(0, |(_, _, ai)| src_reg[ai]);
            if r != cur_reg {
                cur_reg = r;
                connections.push(cur_reg);
            }
            dir = (dir + 1) & 3;
        } else {
            let Some((nx, nz, ni)) = chf.neighbour(x, z, i, dir) else {
                return;
            };
            x = nx;
            z = nz;
            i = ni;
            dir = (dir + 3) & 3;
        }
        if start_i == i && start_dir == dir {
            break;
        }
    }

    if connections.len() > 1 {
        let mut j = 0;
        while j < connections.len() {
            let nj = (j + 1) % connections.len();
            if connections[j] == connections[nj] && connections.len() > 1 {
                connections.remove(j);
            } else {
                j += 1;
            }
        }
    }
}

/// Merges two regions sharing a boundary; returns false if they do not.
fn merge_regions(regions: &mut [Region], a: usize, b: usize) -> bool {
    let aid = regions[a].id;
    let bid = regions[b].id;
    let acon = regions[a].connections.clone();
    let bcon = regions[b].connections.clone();

    let Some(insa) = acon.iter().position(|&c| c == bid) else {
        return false;
    };
    let Some(insb) = bcon.iter().position(|&c| c == aid) else {
        return false;
    };

    let na = acon.len();
    let nb = bcon.len();
    let mut merged = Vec::with_capacity(na + nb);
    for i in 0..na - 1 {
        merged.push(acon[(insa + 1 + i) % na]);
    }
    for i in 0..nb - 1 {
        merged.push(bcon[(insb + 1 + i) % nb]);
    }

    let b_floors = regions[b].floors.clone();
    let b_spans = regions[b].span_count;
    let ra = &mut regions[a];
    ra.connections = merged;
    ra.remove_adjacent_duplicates();
    for f in b_floors {
        ra.add_unique_floor(f);
    }
    ra.span_count += b_spans;

    let rb = &mut regions[b];
    rb.span_count = 0;
    rb.connections.clear();
    true
}

/// Compacts region ids to `1..=n` and remaps `src_reg`. Returns `n`.
fn compact_region_ids(regions: &mut [Region], src_reg: &mut [u16]) -> u16 {
    for reg in regions.iter_mut() {
        reg.remap = reg.id != 0;
    }
    let mut next_id: u16 = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        let old_id = regions[i].id;
        next_id += 1;
        for reg in regions[i..].iter_mut() {
            if reg.id == old_id {
                reg.id = next_id;
                reg.remap = false;
            }
        }
    }
    for r in src_reg.iter_mut() {
        *r = regions.get(*r as usize).map_or(0, |reg| reg.id);
    }
    next_id
}

fn merge_and_filter_regions(
    ctx: &mut BuildContext,
    min_region_area: i32,
    merge_region_size: i32,
    max_region_id: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) -> u16 {
    let nreg = max_region_id as usize + 1;
    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    // Span counts, floors and boundary connections.
    for z in 0..chf.height {
        for x in 0..chf.width {
            let range = chf.cell_spans(x, z);
            for i in range.clone() {
                let r = src_reg[i] as usize;
                if r == 0 || r >= nreg {
                    continue;
                }
                regions[r].span_count += 1;

                for j in range.clone() {
                    if i == j {
                        continue;
                    }
                    let floor = src_reg[j];
                    if floor == 0 || floor as usize >= nreg {
                        continue;
                    }
                    if floor as usize == r {
                        regions[r].overlap = true;
                    }
                    regions[r].add_unique_floor(floor);
                }

                if !regions[r].connections.is_empty() {
                    continue;
                }
                regions[r].area = chf.areas[i];

                if let Some(dir) = (0..4).find(|&d| is_solid_edge(chf, src_reg, x, z, i, d)) {
                    let mut connections = Vec::new();
                    walk_region_contour(x, z, i, dir, chf, src_reg, &mut connections);
                    regions[r].connections = connections;
                }
            }
        }
    }

    // Remove small islands.
    let mut stack = Vec::new();
    let mut trace = Vec::new();
    for i in 0..nreg {
        if regions[i].id == 0 || regions[i].span_count == 0 || regions[i].visited {
            continue;
        }
        let mut span_count = 0;
        stack.clear();
        trace.clear();
        regions[i].visited = true;
        stack.push(i);

        while let Some(ri) = stack.pop() {
            span_count += regions[ri].span_count;
            trace.push(ri);
            for c in regions[ri].connections.clone() {
                if c == 0 {
                    continue;
                }
                let nei = &mut regions[c as usize];
                if nei.visited || nei.id == 0 {
                    continue;
                }
                nei.visited = true;
                stack.push(c as usize);
            }
        }

        if span_count < min_region_area {
            for &t in &trace {
                regions[t].span_count = 0;
                regions[t].id = 0;
            }
        }
    }

    // Merge small regions into their smallest compatible neighbour.
    loop {
        let mut merge_count = 0;
        for i in 0..nreg {
            let reg = &regions[i];
            if reg.id == 0 || reg.overlap || reg.span_count == 0 {
                continue;
            }
            if reg.span_count > merge_region_size && reg.is_connected_to_border() {
                continue;
            }

            let mut smallest = i32::MAX;
            let mut merge_id = reg.id;
            for &c in &reg.connections {
                if c == 0 {
                    continue;
                }
                let other = &regions[c as usize];
                if other.id == 0 || other.overlap {
                    continue;
                }
                if other.span_count < smallest && reg.can_merge_with(other) && other.can_merge_with(reg)
                {
                    smallest = other.span_count;
                    merge_id = other.id;
                }
            }

            if merge_id != reg.id && merge_id as usize != i {
                let old_id = reg.id;
                if merge_regions(&mut regions, merge_id as usize, i) {
                    for other in regions.iter_mut() {
                        if other.id == 0 {
                            continue;
                        }
                        if other.id == old_id {
                            other.id = merge_id;
                        }
                        other.replace_neighbour(old_id, merge_id);
                    }
                    merge_count += 1;
                }
            }
        }
        if merge_count == 0 {
            break;
        }
    }

    let overlapping = regions.iter().filter(|r| r.overlap).count();
    if overlapping > 0 {
        ctx.log_warning(format!("{overlapping} regions overlap vertically"));
    }

    compact_region_ids(&mut regions, src_reg)
}

fn merge_and_filter_layer_regions(
    min_region_area: i32,
    max_region_id: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) -> u16 {
    let nreg = max_region_id as usize + 1;
    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    let mut column_regs: Vec<u16> = Vec::new();
    for z in 0..chf.height {
        for x in 0..chf.width {
            column_regs.clear();
            for i in chf.cell_spans(x, z) {
                let ri = src_reg[i];
                if ri == 0 || ri as usize >= nreg {
                    continue;
                }
                let reg = &mut regions[ri as usize];
                reg.span_count += 1;
                reg.area = chf.areas[i];
                column_regs.push(ri);

                for dir in 0..4 {
                    let Some((_, _, ai)) = chf.neighbour(x, z, i, dir) else {
                        continue;
                    };
                    let rai = src_reg[ai];
                    if rai > 0 && (rai as usize) < nreg && rai != ri {
                        regions[ri as usize].add_unique_connection(rai);
                    }
                }
            }

            for a in 0..column_regs.len() {
                for b in a + 1..column_regs.len() {
                    let (ra, rb) = (column_regs[a], column_regs[b]);
                    if ra != rb {
                        regions[ra as usize].add_unique_floor(rb);
                        regions[rb as usize].add_unique_floor(ra);
                    }
                }
            }
        }
    }

    // Grow layers by breadth-first search over non-overlapping neighbours.
    let mut layer_id: u16 = 1;
    for reg in regions.iter_mut() {
        reg.id = 0;
    }
    let mut queue = VecDeque::new();
    for root in 1..nreg {
        if regions[root].id != 0 {
            continue;
        }
        regions[root].id = layer_id;
        queue.clear();
        queue.push_back(root);

        while let Some(ri) = queue.pop_front() {
            for nei in regions[ri].connections.clone() {
                let n = nei as usize;
                if regions[n].id != 0 || regions[ri].area != regions[n].area {
                    continue;
                }
                if regions[root].floors.contains(&nei) {
                    continue;
                }
                queue.push_back(n);
                regions[n].id = layer_id;

                let floors = regions[n].floors.clone();
                let spans = regions[n].span_count;
                let root_reg = &mut regions[root];
                for f in floors {
                    root_reg.add_unique_floor(f);
                }
                root_reg.span_count += spans;
                regions[n].span_count = 0;
            }
        }
        layer_id += 1;
    }

    // Remove small layers.
    for i in 0..nreg {
        let reg = &regions[i];
        if reg.span_count > 0 && reg.span_count < min_region_area {
            let id = reg.id;
            for other in regions.iter_mut() {
                if other.id == id {
                    other.id = 0;
                }
            }
        }
    }

    compact_region_ids(&mut regions, src_reg)
}
