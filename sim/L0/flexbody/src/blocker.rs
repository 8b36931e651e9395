//! Collision volumes that clip particle motion.
//!
//! A blocker receives the whole particle arrays once per substep, already
//! transformed into its own frame, and pushes particles out of its interior.
//! Velocity is redirected by rewriting the previous position, since the
//! integrator derives velocity from the position history.

use std::fmt::Debug;
use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Vector3};

/// An external collision volume.
pub trait Blocker: Send + Sync + Debug {
    /// Clip particles against this volume, in place.
    ///
    /// `positions` and `previous` are in the body's local frame;
    /// `local_to_blocker` and `blocker_to_local` convert between that frame
    /// and the blocker's. `radius` is the particle collision radius.
    fn clip(
        &self,
        positions: &mut [Point3<f32>],
        previous: &mut [Point3<f32>],
        radius: f32,
        local_to_blocker: &Isometry3<f32>,
        blocker_to_local: &Isometry3<f32>,
    );
}

/// Push one particle to `surface` along `normal` (blocker frame), removing
/// any velocity into the surface and scaling what remains by `1 - friction`.
fn resolve_contact(
    position: &mut Point3<f32>,
    previous: &mut Point3<f32>,
    surface: Point3<f32>,
    normal: Vector3<f32>,
    friction: f32,
    local_to_blocker: &Isometry3<f32>,
    blocker_to_local: &Isometry3<f32>,
) {
    let prev_b = local_to_blocker * *previous;
    let pos_b = local_to_blocker * *position;

    let mut motion = pos_b - prev_b;
    let into = motion.dot(&normal);
    if into < 0.0 {
        motion -= normal * into;
    }
    motion *= 1.0 - friction;

    *position = blocker_to_local * surface;
    *previous = blocker_to_local * (surface - motion);
}

/// Solid sphere centred on the blocker origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereBlocker {
    /// Sphere radius.
    pub radius: f32,
    /// Fraction of tangential motion removed on contact, in `[0, 1]`.
    pub friction: f32,
}

impl SphereBlocker {
    /// Frictionless sphere.
    #[must_use]
    pub const fn new(radius: f32) -> Self {
        Self {
            radius,
            friction: 0.0,
        }
    }

    /// Set the contact friction.
    #[must_use]
    pub const fn with_friction(mut self, friction: f32) -> Self {
        self.friction = friction;
        self
    }
}

impl Blocker for SphereBlocker {
    fn clip(
        &self,
        positions: &mut [Point3<f32>],
        previous: &mut [Point3<f32>],
        radius: f32,
        local_to_blocker: &Isometry3<f32>,
        blocker_to_local: &Isometry3<f32>,
    ) {
        let reach = self.radius + radius;
        for (p, q) in positions.iter_mut().zip(previous.iter_mut()) {
            let offset = (local_to_blocker * *p).coords;
            let dist_sq = offset.norm_squared();
            if dist_sq >= reach * reach {
                continue;
            }
            let normal = if dist_sq > f32::EPSILON {
                offset / dist_sq.sqrt()
            } else {
                Vector3::z()
            };
            resolve_contact(
                p,
                q,
                Point3::from(normal * reach),
                normal,
                self.friction,
                local_to_blocker,
                blocker_to_local,
            );
        }
    }
}

/// Half-space below the blocker's XY plane (`z < 0` is solid).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaneBlocker {
    /// Fraction of tangential motion removed on contact, in `[0, 1]`.
    pub friction: f32,
}

impl Blocker for PlaneBlocker {
    fn clip(
        &self,
        positions: &mut [Point3<f32>],
        previous: &mut [Point3<f32>],
        radius: f32,
        local_to_blocker: &Isometry3<f32>,
        blocker_to_local: &Isometry3<f32>,
    ) {
        for (p, q) in positions.iter_mut().zip(previous.iter_mut()) {
            let pos_b = local_to_blocker * *p;
            if pos_b.z >= radius {
                continue;
            }
            resolve_contact(
                p,
                q,
                Point3::new(pos_b.x, pos_b.y, radius),
                Vector3::z(),
                self.friction,
                local_to_blocker,
                blocker_to_local,
            );
        }
    }
}

/// A blocker connected to a body, with its world placement.
#[derive(Debug, Clone)]
pub struct BlockerBinding {
    /// The collision volume.
    pub blocker: Arc<dyn Blocker>,
    /// World transform of the blocker frame.
    pub transform: Isometry3<f32>,
}

impl BlockerBinding {
    /// Bind a blocker placed at `transform`.
    #[must_use]
    pub fn new(blocker: Arc<dyn Blocker>, transform: Isometry3<f32>) -> Self {
        Self { blocker, transform }
    }

    /// Clip a body's particles given the body's world transform.
    pub fn clip(
        &self,
        positions: &mut [Point3<f32>],
        previous: &mut [Point3<f32>],
        radius: f32,
        body_transform: &Isometry3<f32>,
    ) {
        let local_to_blocker = self.transform.inverse() * body_transform;
        let blocker_to_local = local_to_blocker.inverse();
        self.blocker.clip(
            positions,
            previous,
            radius,
            &local_to_blocker,
            &blocker_to_local,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sphere_pushes_particle_out() {
        let blocker = SphereBlocker::new(1.0);
        let mut positions = [Point3::new(0.5, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)];
        let mut previous = [Point3::new(0.6, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)];

        let id = Isometry3::identity();
        blocker.clip(&mut positions, &mut previous, 0.1, &id, &id);

        assert_relative_eq!(positions[0].x, 1.1, epsilon = 1e-6);
        // Inward motion removed: no implied velocity left.
        assert_relative_eq!(previous[0].x, 1.1, epsilon = 1e-6);
        assert_relative_eq!(positions[1].x, 3.0);
    }

    #[test]
    fn test_plane_keeps_tangential_motion() {
        let blocker = PlaneBlocker::default();
        let mut positions = [Point3::new(0.2, 0.0, -0.05)];
        let mut previous = [Point3::new(0.1, 0.0, 0.05)];

        let id = Isometry3::identity();
        blocker.clip(&mut positions, &mut previous, 0.0, &id, &id);

        assert_relative_eq!(positions[0].z, 0.0);
        let motion = positions[0] - previous[0];
        assert_relative_eq!(motion.x, 0.1, epsilon = 1e-6);
        assert_relative_eq!(motion.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_binding_uses_blocker_frame() {
        // Floor raised to z = 1 in world; body sits at the origin.
        let binding = BlockerBinding::new(
            Arc::new(PlaneBlocker { friction: 1.0 }),
            Isometry3::translation(0.0, 0.0, 1.0),
        );
        let mut positions = [Point3::new(0.3, 0.0, 0.5)];
        let mut previous = [Point3::new(0.0, 0.0, 0.6)];

        binding.clip(&mut positions, &mut previous, 0.0, &Isometry3::identity());

        assert_relative_eq!(positions[0].z, 1.0, epsilon = 1e-6);
        // Full friction stops the particle dead.
        assert_relative_eq!((positions[0] - previous[0]).norm(), 0.0, epsilon = 1e-6);
    }
}
