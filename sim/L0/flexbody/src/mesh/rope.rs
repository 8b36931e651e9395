//! Rope surface: a cross-section swept along the particle line.
//!
//! Tangents are finite differences of the particles (central inside,
//! one-sided at the ends), blended per tier with the same weights as the
//! positions. A reference normal is parallel-transported from
//! sample to sample so the sweep does not twist.
//!
//! Per-tier counts, with `s` samples and `m` tube sides:
//!
//! | section | vertices               | triangles            |
//! |---------|------------------------|----------------------|
//! | tube    | `s·m` (+ `2(m+1)` caps) | `2m(s-1)` (+ `2m` caps) |
//! | cross   | `4s`                   | `4(s-1)`             |

use std::f32::consts::TAU;

use nalgebra::{Point3, Vector3};

use super::{LodLayout, RenderVertex, check_index_range, lod, unit_or};
use crate::config::CrossSection;
use crate::error::Result;

/// Rope render parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeSection {
    /// Sweep radius.
    pub radius: f32,
    /// Cross-section shape.
    pub cross_section: CrossSection,
}

impl RopeSection {
    fn caps(&self, include_endcaps: bool) -> bool {
        include_endcaps && matches!(self.cross_section, CrossSection::Tube { .. })
    }

    /// Vertex count of a tier for `particles` particles.
    #[must_use]
    pub fn vertex_count(&self, particles: usize, lod: usize, include_endcaps: bool) -> usize {
        let s = lod::tier_samples(particles, lod);
        match self.cross_section {
            CrossSection::Tube { sides } => {
                let m = sides as usize;
                let caps = if self.caps(include_endcaps) { 2 * (m + 1) } else { 0 };
                s * m + caps
            }
            CrossSection::Cross => 4 * s,
        }
    }

    /// Triangle count of a tier for `particles` particles.
    #[must_use]
    pub fn triangle_count(&self, particles: usize, lod: usize, include_endcaps: bool) -> usize {
        let segments = lod::tier_samples(particles, lod).saturating_sub(1);
        match self.cross_section {
            CrossSection::Tube { sides } => {
                let m = sides as usize;
                let caps = if self.caps(include_endcaps) { 2 * m } else { 0 };
                2 * m * segments + caps
            }
            CrossSection::Cross => 4 * segments,
        }
    }

    /// Index layout of a tier.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`](crate::FlexError) if the tier
    /// needs more than 32-bit indices.
    pub fn layout(&self, particles: usize, lod: usize, include_endcaps: bool) -> Result<LodLayout> {
        let vertex_count = self.vertex_count(particles, lod, include_endcaps);
        check_index_range(vertex_count)?;

        let s = lod::tier_samples(particles, lod) as u32;
        let mut indices = Vec::with_capacity(self.triangle_count(particles, lod, include_endcaps));
        match self.cross_section {
            CrossSection::Tube { sides: m } => {
                for j in 0..s.saturating_sub(1) {
                    for k in 0..m {
                        let a = j * m + k;
                        let b = j * m + (k + 1) % m;
                        let c = a + m;
                        let d = b + m;
                        indices.push([a, b, c]);
                        indices.push([b, d, c]);
                    }
                }
                if self.caps(include_endcaps) {
                    let start = s * m;
                    let end = start + m + 1;
                    for k in 0..m {
                        let next = (k + 1) % m;
                        indices.push([start, start + 1 + next, start + 1 + k]);
                        indices.push([end, end + 1 + k, end + 1 + next]);
                    }
                }
            }
            CrossSection::Cross => {
                for j in 0..s.saturating_sub(1) {
                    let here = j * 4;
                    let next = here + 4;
                    for ribbon in [0, 2] {
                        let (a0, a1) = (here + ribbon, here + ribbon + 1);
                        let (b0, b1) = (next + ribbon, next + ribbon + 1);
                        indices.push([a0, a1, b0]);
                        indices.push([a1, b1, b0]);
                    }
                }
            }
        }
        Ok(LodLayout::new(lod, vertex_count, indices))
    }
}

/// Any unit vector perpendicular to `t`.
fn perpendicular(t: &Vector3<f32>) -> Vector3<f32> {
    let axis = if t.x.abs() <= t.y.abs() && t.x.abs() <= t.z.abs() {
        Vector3::x()
    } else if t.y.abs() <= t.z.abs() {
        Vector3::y()
    } else {
        Vector3::z()
    };
    unit_or(t.cross(&axis), Vector3::y())
}

/// Unit tangents along `points` by central differences.
fn tangents(points: &[Vector3<f32>]) -> Vec<Vector3<f32>> {
    let n = points.len();
    let mut tangent = Vector3::x();
    (0..n)
        .map(|j| {
            let diff = if n < 2 {
                Vector3::zeros()
            } else if j == 0 {
                points[1] - points[0]
            } else if j == n - 1 {
                points[j] - points[j - 1]
            } else {
                points[j + 1] - points[j - 1]
            };
            tangent = unit_or(diff, tangent);
            tangent
        })
        .collect()
}

/// Sweep frames `(tangent, normal, binormal)` along `tangents`.
///
/// Tangents need not be unit length; degenerate ones reuse the last axis.
fn sweep_frames(tangents: &[Vector3<f32>]) -> Vec<(Vector3<f32>, Vector3<f32>, Vector3<f32>)> {
    let mut frames = Vec::with_capacity(tangents.len());
    let mut tangent = Vector3::x();
    let mut normal: Option<Vector3<f32>> = None;

    for t in tangents {
        tangent = unit_or(*t, tangent);
        let transported = normal
            .map(|prev| prev - tangent * prev.dot(&tangent))
            .and_then(|v| v.try_normalize(1.0e-12))
            .unwrap_or_else(|| perpendicular(&tangent));
        normal = Some(transported);
        frames.push((tangent, transported, tangent.cross(&transported)));
    }
    frames
}

/// Rebuild a rope tier into `out`.
///
/// `positions` and `velocities` hold one entry per particle (render-time
/// positions and per-frame displacement).
///
/// # Errors
///
/// Returns [`FlexError::IndexOutOfBounds`](crate::FlexError) if the tier
/// needs more than 32-bit indices.
pub fn reconstruct(
    section: &RopeSection,
    positions: &[Point3<f32>],
    velocities: &[Vector3<f32>],
    lod: usize,
    include_endcaps: bool,
    out: &mut Vec<RenderVertex>,
) -> Result<()> {
    let count = positions.len();
    let vertex_count = section.vertex_count(count, lod, include_endcaps);
    check_index_range(vertex_count)?;

    let coords: Vec<_> = positions.iter().map(|p| p.coords).collect();
    let fine = tangents(&coords);

    let mut centers = Vec::new();
    let mut motion = Vec::new();
    let mut axes = Vec::new();
    lod::resample(count, lod, |i| coords[i], &mut centers);
    lod::resample(count, lod, |i| velocities[i], &mut motion);
    lod::resample(count, lod, |i| fine[i], &mut axes);
    let frames = sweep_frames(&axes);

    out.clear();
    out.reserve(vertex_count);
    let r = section.radius;

    match section.cross_section {
        CrossSection::Tube { sides } => {
            let m = sides as usize;
            let ring: Vec<(f32, f32)> = (0..m)
                .map(|k| {
                    let theta = TAU * k as f32 / m as f32;
                    (theta.cos(), theta.sin())
                })
                .collect();

            for ((center, vel), (t, n, b)) in centers.iter().zip(&motion).zip(&frames) {
                for &(cos, sin) in &ring {
                    let dir = n * cos + b * sin;
                    out.push(RenderVertex::new(
                        Point3::from(center + dir * r),
                        *vel,
                        dir,
                        *t,
                        1.0,
                    ));
                }
            }

            if section.caps(include_endcaps) {
                let ends = [(0, -1.0_f32), (centers.len().saturating_sub(1), 1.0)];
                for (j, facing) in ends {
                    let (Some(center), Some(vel), Some((t, n, b))) =
                        (centers.get(j), motion.get(j), frames.get(j))
                    else {
                        continue;
                    };
                    let normal = t * facing;
                    out.push(RenderVertex::new(Point3::from(*center), *vel, normal, *n, 1.0));
                    for &(cos, sin) in &ring {
                        let dir = n * cos + b * sin;
                        out.push(RenderVertex::new(
                            Point3::from(center + dir * r),
                            *vel,
                            normal,
                            *n,
                            1.0,
                        ));
                    }
                }
            }
        }
        CrossSection::Cross => {
            for ((center, vel), (t, n, b)) in centers.iter().zip(&motion).zip(&frames) {
                for (offset, face) in [(*n, *b), (-n, *b), (*b, *n), (-b, *n)] {
                    out.push(RenderVertex::new(
                        Point3::from(center + offset * r),
                        *vel,
                        face,
                        *t,
                        1.0,
                    ));
                }
            }
        }
    }

    debug_assert_eq!(out.len(), vertex_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight(n: usize) -> (Vec<Point3<f32>>, Vec<Vector3<f32>>) {
        let positions = (0..n).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
        (positions, vec![Vector3::zeros(); n])
    }

    fn tube(sides: u32) -> RopeSection {
        RopeSection {
            radius: 0.1,
            cross_section: CrossSection::Tube { sides },
        }
    }

    #[test]
    fn test_tube_counts_per_tier() {
        let section = tube(6);
        // 17 particles: 17, 9, 5 samples.
        assert_eq!(section.vertex_count(17, 0, false), 17 * 6);
        assert_eq!(section.vertex_count(17, 1, true), 9 * 6 + 14);
        assert_eq!(section.triangle_count(17, 2, false), 2 * 6 * 4);
        assert_eq!(section.triangle_count(17, 2, true), 2 * 6 * 4 + 12);

        let layout = section.layout(17, 1, true).unwrap();
        assert_eq!(layout.vertex_count(), 68);
        assert_eq!(layout.triangle_count(), 2 * 6 * 8 + 12);
        assert!(
            layout
                .indices()
                .iter()
                .flatten()
                .all(|&i| (i as usize) < layout.vertex_count())
        );
    }

    #[test]
    fn test_cross_ignores_endcaps() {
        let section = RopeSection {
            radius: 0.1,
            cross_section: CrossSection::Cross,
        };
        assert_eq!(section.vertex_count(5, 0, true), 20);
        assert_eq!(section.triangle_count(5, 0, true), 16);
    }

    #[test]
    fn test_reconstruct_matches_layout() {
        let section = tube(8);
        let (positions, velocities) = straight(9);
        let mut out = Vec::new();
        for lod in 0..3 {
            for caps in [false, true] {
                reconstruct(&section, &positions, &velocities, lod, caps, &mut out).unwrap();
                assert_eq!(out.len(), section.vertex_count(9, lod, caps));
            }
        }
    }

    #[test]
    fn test_tube_ring_geometry() {
        let section = tube(4);
        let (positions, velocities) = straight(3);
        let mut out = Vec::new();
        reconstruct(&section, &positions, &velocities, 0, false, &mut out).unwrap();

        for v in &out {
            let p = v.position();
            let radial = Vector3::new(0.0, p.y, p.z);
            assert_relative_eq!(radial.norm(), 0.1, epsilon = 1e-6);
            assert_relative_eq!(v.normal().norm(), 1.0, epsilon = 1e-6);
            assert_relative_eq!(v.normal().dot(&v.tangent()), 0.0, epsilon = 1e-6);
            assert_relative_eq!(v.tangent().x, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_frames_do_not_flip_on_a_bend() {
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, -0.5),
            Vector3::new(2.5, 0.0, -1.5),
        ];
        let frames = sweep_frames(&tangents(&points));
        for pair in frames.windows(2) {
            assert!(pair[0].1.dot(&pair[1].1) > 0.5);
        }
        for (t, n, b) in &frames {
            assert_relative_eq!(t.dot(n), 0.0, epsilon = 1e-5);
            assert_relative_eq!(b.norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_velocity_passed_through() {
        let section = tube(3);
        let (positions, _) = straight(2);
        let velocities = vec![Vector3::new(0.0, 0.0, 0.2); 2];
        let mut out = Vec::new();
        reconstruct(&section, &positions, &velocities, 0, true, &mut out).unwrap();
        for v in &out {
            assert_relative_eq!(v.velocity[2], 0.2);
        }
    }

    #[test]
    fn test_coarse_tangents_blend_fine_tangents() {
        // Right-angle corner at particle 2: the fine tangent there is the
        // diagonal, its neighbours are +X and +Y.
        let positions = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(2.0, 1.0, 0.0),
            Point3::new(2.0, 2.0, 0.0),
        ];
        let velocities = [Vector3::zeros(); 5];
        let section = RopeSection {
            radius: 0.1,
            cross_section: CrossSection::Cross,
        };
        let mut out = Vec::new();
        reconstruct(&section, &positions, &velocities, 1, false, &mut out).unwrap();

        // Middle sample: (x + 6·diag + y) / 8 normalised stays on the diagonal.
        let diagonal = Vector3::new(1.0, 1.0, 0.0).normalize();
        let middle = out[4].tangent();
        assert_relative_eq!(middle, diagonal, epsilon = 1e-6);
        // End samples keep their own tangents.
        assert_relative_eq!(out[0].tangent(), Vector3::x(), epsilon = 1e-6);
        assert_relative_eq!(out[8].tangent(), Vector3::y(), epsilon = 1e-6);
    }
}
