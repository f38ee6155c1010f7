//! Velocity-obstacle sampling for local collision avoidance
//!
//! Candidate velocities are scored against the neighbouring agents (moving
//! circles) and the nearby walls (segments). The score combines deviation
//! from the desired and current velocities, a side preference that keeps
//! agents passing each other on consistent sides, and the time to the
//! first impact inside the horizon.

use glam::Vec3;
use navmesh_common::{dist_2d, dist_pt_seg_sqr_2d, dot_2d, perp_2d, tri_area_2d, Error, Result};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

/// Moving circular obstacle, usually a neighbouring agent
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleCircle {
    pub p: Vec3,
    pub vel: Vec3,
    pub dvel: Vec3,
    pub rad: f32,
    /// Direction from the obstacle to the sampling agent
    dp: Vec3,
    /// Preferred passing side
    np: Vec3,
}

/// Static wall segment
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleSegment {
    pub p: Vec3,
    pub q: Vec3,
    /// The agent is touching the segment
    touch: bool,
}

/// Avoidance profile
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleAvoidanceParams {
    /// Share of the desired velocity the sampling pattern is centred on
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    /// Weight of the time-of-impact penalty
    pub weight_toi: f32,
    /// Time horizon of impact checks, in seconds
    pub horiz_time: f32,
    /// Samples per axis of the grid sampler
    pub grid_size: u8,
    /// Samples per ring of the adaptive sampler
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    /// Refinement passes of the adaptive sampler
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

impl ObstacleAvoidanceParams {
    /// Rejects non-finite weights, a non-positive horizon and out of range
    /// pattern sizes.
    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.vel_bias,
            self.weight_des_vel,
            self.weight_cur_vel,
            self.weight_side,
            self.weight_toi,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidInput(
                "avoidance weights must be finite and non-negative".to_string(),
            ));
        }
        if !(self.horiz_time.is_finite() && self.horiz_time > 0.0) {
            return Err(Error::InvalidInput(format!(
                "avoidance horizon {} must be positive",
                self.horiz_time
            )));
        }
        if self.adaptive_divs as usize > MAX_PATTERN_DIVS
            || self.adaptive_rings as usize > MAX_PATTERN_RINGS
        {
            return Err(Error::InvalidInput(format!(
                "adaptive pattern {}x{} exceeds {}x{}",
                self.adaptive_divs, self.adaptive_rings, MAX_PATTERN_DIVS, MAX_PATTERN_RINGS
            )));
        }
        Ok(())
    }
}

/// Obstacle set and sampler for one agent
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,
    max_circles: usize,
    max_segments: usize,
    circles: Vec<ObstacleCircle>,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            max_segments,
            circles: Vec::with_capacity(max_circles),
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a moving obstacle; ignored once the circle list is full.
    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    /// Adds a wall; ignored once the segment list is full.
    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment {
            p,
            q,
            touch: false,
        });
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Samples a regular grid of candidate velocities around the biased
    /// desired velocity. Returns the best velocity and the sample count.
    pub fn sample_velocity_grid(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> (Vec3, usize) {
        self.prepare(pos, dvel);
        self.set_params(params, vmax);

        let grid_size = params.grid_size.max(2) as usize;
        let cvx = dvel.x * params.vel_bias;
        let cvz = dvel.z * params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - params.vel_bias) / (grid_size - 1) as f32;
        let half = (grid_size - 1) as f32 * cs * 0.5;

        let mut min_penalty = f32::MAX;
        let mut nvel = Vec3::ZERO;
        let mut ns = 0;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let vcand = Vec3::new(
                    cvx + x as f32 * cs - half,
                    0.0,
                    cvz + y as f32 * cs - half,
                );
                if vcand.x * vcand.x + vcand.z * vcand.z > (vmax + cs / 2.0).powi(2) {
                    continue;
                }
                let penalty = self.process_sample(vcand, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }
        (nvel, ns)
    }

    /// Samples rings of candidate velocities aligned with the desired
    /// direction, refining around the best sample `adaptive_depth` times.
    /// Returns the best velocity and the sample count.
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> (Vec3, usize) {
        self.prepare(pos, dvel);
        self.set_params(params, vmax);

        let pattern = sampling_pattern(dvel, params);

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = Vec3::new(dvel.x * params.vel_bias, 0.0, dvel.z * params.vel_bias);
        let mut ns = 0;
        for _ in 0..params.adaptive_depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;
            for &(px, pz) in &pattern {
                let vcand = Vec3::new(res.x + px * cr, 0.0, res.z + pz * cr);
                if vcand.x * vcand.x + vcand.z * vcand.z > (vmax + 0.001).powi(2) {
                    continue;
                }
                let penalty = self.process_sample(vcand, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }
            res = bvel;
            cr *= 0.5;
        }
        (res, ns)
    }

    fn set_params(&mut self, params: &ObstacleAvoidanceParams, vmax: f32) {
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time.max(f32::EPSILON);
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            let dp = (pos - cir.p).normalize_or_zero();
            let dv = cir.dvel - dvel;
            let a = tri_area_2d(Vec3::ZERO, dp, dv);
            cir.dp = dp;
            cir.np = if a < 0.01 {
                Vec3::new(-dp.z, 0.0, dp.x)
            } else {
                Vec3::new(dp.z, 0.0, -dp.x)
            };
        }
        for seg in &mut self.segments {
            let (d, _) = dist_pt_seg_sqr_2d(pos, seg.p, seg.q);
            seg.touch = d < 0.01 * 0.01;
        }
    }

    /// Penalty of one candidate velocity. Bails out with `min_penalty` as
    /// soon as the impact time alone makes the sample worse than the best
    /// one so far.
    fn process_sample(
        &self,
        vcand: Vec3,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
    ) -> f32 {
        let params = &self.params;
        let vpen = params.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = params.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal: each side takes half of the avoidance.
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5)
                .min(dot_2d(cir.np, vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad)
            else {
                continue;
            };
            // Already overlapping: avoid harder.
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }
            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                // Moving away from a touched wall is free.
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };
            // Walls are approached less cautiously than agents.
            let htmin = htmin * 2.0;
            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }
        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        vpen + vcpen + spen + tpen
    }
}

/// Unit-disk sample offsets: the origin, then per ring a fan of `divs`
/// directions starting at the desired direction, alternating half a step
/// between rings.
fn sampling_pattern(dvel: Vec3, params: &ObstacleAvoidanceParams) -> Vec<(f32, f32)> {
    let nd = (params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
    let nr = (params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
    let da = std::f32::consts::TAU / nd as f32;
    let (sa, ca) = da.sin_cos();

    let dir = Vec3::new(dvel.x, 0.0, dvel.z).normalize_or_zero();
    let dirs = [dir, rotate_2d(dir, da * 0.5)];

    let mut pat = Vec::with_capacity(nd * nr + 1);
    pat.push((0.0, 0.0));
    for j in 0..nr {
        let r = (nr - j) as f32 / nr as f32;
        let first = (dirs[j % 2].x * r, dirs[j % 2].z * r);
        pat.push(first);
        let (mut right, mut left) = (first, first);
        let mut i = 1;
        while i + 1 < nd {
            right = (right.0 * ca + right.1 * sa, -right.0 * sa + right.1 * ca);
            left = (left.0 * ca - left.1 * sa, left.0 * sa + left.1 * ca);
            pat.push(right);
            pat.push(left);
            i += 2;
        }
        if nd % 2 == 0 {
            pat.push((left.0 * ca - left.1 * sa, left.0 * sa + left.1 * ca));
        }
    }
    pat
}

fn rotate_2d(v: Vec3, angle: f32) -> Vec3 {
    let (s, c) = angle.sin_cos();
    Vec3::new(v.x * c - v.z * s, v.y, v.x * s + v.z * c)
}

/// Times at which a circle at `c0` moving with `v` touches a static circle
/// at `c1`, if it ever does.
fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Parameter along the ray `ap + t*u` where it crosses segment `bp`-`bq`.
fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(v, w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_valid() {
        let params = ObstacleAvoidanceParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.adaptive_divs, 7);

        let bad = ObstacleAvoidanceParams {
            horiz_time: 0.0,
            ..params
        };
        assert!(bad.validate().is_err());
        let bad = ObstacleAvoidanceParams {
            adaptive_rings: 9,
            ..params
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_pattern_size() {
        let params = ObstacleAvoidanceParams::default();
        let pat = sampling_pattern(Vec3::X, &params);
        // Origin plus seven directions per ring.
        assert_eq!(pat.len(), 1 + 2 * 7);
        assert!((pat[1].0 - 1.0).abs() < 1e-5);
        for &(x, z) in &pat {
            assert!(x * x + z * z <= 1.0 + 1e-4);
        }
    }

    #[test]
    fn test_free_space_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        let dvel = Vec3::new(2.0, 0.0, 0.0);
        let (nvel, ns) =
            query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 3.5, dvel, dvel, &params);
        assert!(ns > 0);
        assert!((nvel - dvel).length() < 0.3);
    }

    #[test]
    fn test_head_on_obstacle_is_avoided() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        let dvel = Vec3::new(2.0, 0.0, 0.0);
        query.add_circle(
            Vec3::new(2.0, 0.0, 0.0),
            0.5,
            Vec3::new(-2.0, 0.0, 0.0),
            Vec3::new(-2.0, 0.0, 0.0),
        );
        assert_eq!(query.circle_count(), 1);
        let (nvel, _) = query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 3.5, dvel, dvel, &params);
        // Steers sideways instead of straight into the other agent.
        assert!(nvel.z.abs() > 0.1 || nvel.x < 1.5);
    }

    #[test]
    fn test_grid_sampler_respects_speed_limit() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams {
            grid_size: 9,
            ..Default::default()
        };
        query.add_segment(Vec3::new(1.0, 0.0, -2.0), Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(query.segment_count(), 1);
        let dvel = Vec3::new(2.0, 0.0, 0.0);
        let (nvel, ns) = query.sample_velocity_grid(Vec3::ZERO, 0.5, 2.0, dvel, dvel, &params);
        assert!(ns > 0);
        assert!(nvel.length() <= 2.0 + 0.2);
    }

    #[test]
    fn test_sweep_and_ray_helpers() {
        let hit = sweep_circle_circle(Vec3::ZERO, 0.5, Vec3::X, Vec3::new(3.0, 0.0, 0.0), 0.5);
        let (tmin, tmax) = hit.unwrap();
        assert!((tmin - 2.0).abs() < 1e-4);
        assert!((tmax - 4.0).abs() < 1e-4);
        assert!(sweep_circle_circle(Vec3::ZERO, 0.5, Vec3::ZERO, Vec3::X, 0.5).is_none());

        let t = isect_ray_seg(
            Vec3::ZERO,
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert!((t.unwrap() - 0.5).abs() < 1e-5);
        assert!(isect_ray_seg(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0)
        )
        .is_none());
    }
}
