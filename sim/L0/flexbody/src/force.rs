//! Force contribution protocol shared by flexible and rigid bodies.
//!
//! A force source adds its contribution to a batch of particles, or computes
//! a force/torque pair for a rigid body. Contributions are always additive:
//! a source that has no effect on a particle leaves that particle's slot
//! untouched.
//!
//! Built-in sources are dispatched through the closed [`ForceField`] enum;
//! anything else plugs in as [`ForceField::Custom`] via the [`ForceSource`]
//! trait.

use std::fmt::Debug;
use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::{BoundingSphere, RigidBodyState};

/// Particle state handed to force sources, in the body-local frame.
#[derive(Debug, Clone, Copy)]
pub struct ParticleBatch<'a> {
    /// Particle positions.
    pub positions: &'a [Point3<f32>],
    /// Particle velocities.
    pub velocities: &'a [Vector3<f32>],
    /// Mass of each particle.
    pub particle_mass: f32,
}

impl ParticleBatch<'_> {
    /// Number of particles in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Force and torque acting on a rigid body's center of mass (world frame).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidForce {
    /// Linear force (N).
    pub force: Vector3<f32>,
    /// Torque (N·m).
    pub torque: Vector3<f32>,
}

impl RigidForce {
    /// A pure force with no torque.
    #[must_use]
    pub fn linear(force: Vector3<f32>) -> Self {
        Self {
            force,
            torque: Vector3::zeros(),
        }
    }
}

/// A source of external force.
pub trait ForceSource: Send + Sync + Debug {
    /// World-space bounds of the source's influence.
    fn bounds(&self) -> BoundingSphere;

    /// Whether this source overrides every non-exclusive source it overlaps.
    fn is_exclusive(&self) -> bool {
        false
    }

    /// Add this source's force into `forces` (one slot per particle).
    ///
    /// `local_to_world` maps the batch's frame into world space. Slots of
    /// unaffected particles must be left unmodified.
    fn contribute(
        &self,
        batch: &ParticleBatch<'_>,
        local_to_world: &Isometry3<f32>,
        forces: &mut [Vector3<f32>],
    );

    /// Force on a rigid body, or `None` if the source does not affect it.
    fn apply_to_rigid(&self, body: &RigidBodyState) -> Option<RigidForce>;
}

/// Kind tag of a force field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FieldKind {
    /// Uniform acceleration.
    Gravity,
    /// Moving air with linear drag.
    Wind,
    /// Fluid volume below a surface plane.
    Buoyancy,
    /// User-supplied source.
    Custom,
}

/// Uniform acceleration inside a sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GravityField {
    /// Influence bounds.
    pub bounds: BoundingSphere,
    /// World-space acceleration (m/s²).
    pub acceleration: Vector3<f32>,
    /// Whether the field overrides overlapping non-exclusive fields.
    pub exclusive: bool,
}

/// Air moving at a fixed velocity inside a sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WindField {
    /// Influence bounds.
    pub bounds: BoundingSphere,
    /// World-space wind velocity (m/s).
    pub velocity: Vector3<f32>,
    /// Linear drag coefficient (N·s/m).
    pub drag: f32,
    /// Whether the field overrides overlapping non-exclusive fields.
    pub exclusive: bool,
}

/// Fluid filling a sphere up to a horizontal surface at world height
/// `surface_height` (world +Z is up).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BuoyancyField {
    /// Influence bounds.
    pub bounds: BoundingSphere,
    /// World Z of the fluid surface.
    pub surface_height: f32,
    /// Fluid density (kg/m³).
    pub density: f32,
    /// Volume displaced by each submerged particle (m³).
    pub particle_volume: f32,
    /// Gravity magnitude used for the lift (m/s²).
    pub gravity: f32,
    /// Linear drag coefficient inside the fluid (N·s/m).
    pub drag: f32,
}

impl GravityField {
    fn contribute(
        &self,
        batch: &ParticleBatch<'_>,
        local_to_world: &Isometry3<f32>,
        forces: &mut [Vector3<f32>],
    ) {
        let force = local_to_world.inverse_transform_vector(&self.acceleration) * batch.particle_mass;
        for (p, f) in batch.positions.iter().zip(forces.iter_mut()) {
            if self.bounds.contains(&(local_to_world * p)) {
                *f += force;
            }
        }
    }

    fn apply_to_rigid(&self, body: &RigidBodyState) -> Option<RigidForce> {
        self.bounds
            .contains(&body.center())
            .then(|| RigidForce::linear(self.acceleration * body.mass))
    }
}

impl WindField {
    fn contribute(
        &self,
        batch: &ParticleBatch<'_>,
        local_to_world: &Isometry3<f32>,
        forces: &mut [Vector3<f32>],
    ) {
        let wind = local_to_world.inverse_transform_vector(&self.velocity);
        for ((p, v), f) in batch
            .positions
            .iter()
            .zip(batch.velocities)
            .zip(forces.iter_mut())
        {
            if self.bounds.contains(&(local_to_world * p)) {
                *f += (wind - v) * self.drag;
            }
        }
    }

    fn apply_to_rigid(&self, body: &RigidBodyState) -> Option<RigidForce> {
        self.bounds
            .contains(&body.center())
            .then(|| RigidForce::linear((self.velocity - body.linear_velocity) * self.drag))
    }
}

impl BuoyancyField {
    fn submerged(&self, world: &Point3<f32>) -> bool {
        world.z < self.surface_height && self.bounds.contains(world)
    }

    fn contribute(
        &self,
        batch: &ParticleBatch<'_>,
        local_to_world: &Isometry3<f32>,
        forces: &mut [Vector3<f32>],
    ) {
        let lift_world = Vector3::z() * (self.density * self.gravity * self.particle_volume);
        let lift = local_to_world.inverse_transform_vector(&lift_world);
        for ((p, v), f) in batch
            .positions
            .iter()
            .zip(batch.velocities)
            .zip(forces.iter_mut())
        {
            if self.submerged(&(local_to_world * p)) {
                *f += lift - v * self.drag;
            }
        }
    }

    fn apply_to_rigid(&self, body: &RigidBodyState) -> Option<RigidForce> {
        if !self.submerged(&body.center()) {
            return None;
        }
        let lift = Vector3::z() * (self.density * self.gravity * body.volume);
        Some(RigidForce::linear(lift - body.linear_velocity * self.drag))
    }
}

/// A force field registered in the spatial hierarchy.
#[derive(Debug, Clone)]
pub enum ForceField {
    /// Uniform acceleration.
    Gravity(GravityField),
    /// Wind drag.
    Wind(WindField),
    /// Fluid buoyancy.
    Buoyancy(BuoyancyField),
    /// User-supplied source.
    Custom(Arc<dyn ForceSource>),
}

impl ForceField {
    /// Kind tag of this field.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Gravity(_) => FieldKind::Gravity,
            Self::Wind(_) => FieldKind::Wind,
            Self::Buoyancy(_) => FieldKind::Buoyancy,
            Self::Custom(_) => FieldKind::Custom,
        }
    }

    /// World-space bounds of the field.
    #[must_use]
    pub fn bounds(&self) -> BoundingSphere {
        match self {
            Self::Gravity(f) => f.bounds,
            Self::Wind(f) => f.bounds,
            Self::Buoyancy(f) => f.bounds,
            Self::Custom(f) => f.bounds(),
        }
    }

    /// Whether the field overrides overlapping non-exclusive fields.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        match self {
            Self::Gravity(f) => f.exclusive,
            Self::Wind(f) => f.exclusive,
            Self::Buoyancy(_) => false,
            Self::Custom(f) => f.is_exclusive(),
        }
    }

    /// Add this field's force into `forces`.
    pub fn contribute(
        &self,
        batch: &ParticleBatch<'_>,
        local_to_world: &Isometry3<f32>,
        forces: &mut [Vector3<f32>],
    ) {
        debug_assert_eq!(batch.len(), forces.len());
        match self {
            Self::Gravity(f) => f.contribute(batch, local_to_world, forces),
            Self::Wind(f) => f.contribute(batch, local_to_world, forces),
            Self::Buoyancy(f) => f.contribute(batch, local_to_world, forces),
            Self::Custom(f) => f.contribute(batch, local_to_world, forces),
        }
    }

    /// Force on a rigid body, or `None` if unaffected.
    #[must_use]
    pub fn apply_to_rigid(&self, body: &RigidBodyState) -> Option<RigidForce> {
        match self {
            Self::Gravity(f) => f.apply_to_rigid(body),
            Self::Wind(f) => f.apply_to_rigid(body),
            Self::Buoyancy(f) => f.apply_to_rigid(body),
            Self::Custom(f) => f.apply_to_rigid(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn big_sphere() -> BoundingSphere {
        BoundingSphere::new(Point3::origin(), 100.0)
    }

    #[test]
    fn test_gravity_contribution_is_additive() {
        let field = ForceField::Gravity(GravityField {
            bounds: big_sphere(),
            acceleration: Vector3::new(0.0, 0.0, -10.0),
            exclusive: false,
        });
        let positions = [Point3::origin(), Point3::new(1.0, 0.0, 0.0)];
        let velocities = [Vector3::zeros(); 2];
        let batch = ParticleBatch {
            positions: &positions,
            velocities: &velocities,
            particle_mass: 0.5,
        };
        let mut forces = [Vector3::new(1.0, 0.0, 0.0); 2];

        field.contribute(&batch, &Isometry3::identity(), &mut forces);

        assert_relative_eq!(forces[0].x, 1.0);
        assert_relative_eq!(forces[0].z, -5.0);
    }

    #[test]
    fn test_gravity_rotated_into_local_frame() {
        let field = GravityField {
            bounds: big_sphere(),
            acceleration: Vector3::new(0.0, 0.0, -10.0),
            exclusive: false,
        };
        // Body rotated 90° about X: world -Z is local +Y.
        let transform = Isometry3::from_parts(
            nalgebra::Translation3::identity(),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::FRAC_PI_2),
        );
        let positions = [Point3::origin()];
        let velocities = [Vector3::zeros()];
        let batch = ParticleBatch {
            positions: &positions,
            velocities: &velocities,
            particle_mass: 1.0,
        };
        let mut forces = [Vector3::zeros()];
        field.contribute(&batch, &transform, &mut forces);

        assert_relative_eq!(forces[0].y, -10.0, epsilon = 1e-4);
        assert_relative_eq!(forces[0].z, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_wind_drags_toward_air_velocity() {
        let field = ForceField::Wind(WindField {
            bounds: big_sphere(),
            velocity: Vector3::new(5.0, 0.0, 0.0),
            drag: 0.1,
            exclusive: false,
        });
        let positions = [Point3::origin()];
        let velocities = [Vector3::new(1.0, 0.0, 0.0)];
        let batch = ParticleBatch {
            positions: &positions,
            velocities: &velocities,
            particle_mass: 1.0,
        };
        let mut forces = [Vector3::zeros()];
        field.contribute(&batch, &Isometry3::identity(), &mut forces);

        assert_relative_eq!(forces[0].x, 0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_buoyancy_leaves_dry_particles_untouched() {
        let field = ForceField::Buoyancy(BuoyancyField {
            bounds: big_sphere(),
            surface_height: 0.0,
            density: 1000.0,
            particle_volume: 1.0e-4,
            gravity: 9.81,
            drag: 0.0,
        });
        let positions = [Point3::new(0.0, 0.0, -1.0), Point3::new(0.0, 0.0, 1.0)];
        let velocities = [Vector3::zeros(); 2];
        let batch = ParticleBatch {
            positions: &positions,
            velocities: &velocities,
            particle_mass: 0.1,
        };
        let sentinel = Vector3::new(7.0, 7.0, 7.0);
        let mut forces = [sentinel; 2];
        field.contribute(&batch, &Isometry3::identity(), &mut forces);

        assert_relative_eq!(forces[0].z, 7.0 + 0.981, epsilon = 1e-4);
        assert_eq!(forces[1], sentinel);
    }

    #[test]
    fn test_outside_bounds_untouched() {
        let field = ForceField::Gravity(GravityField {
            bounds: BoundingSphere::new(Point3::new(50.0, 0.0, 0.0), 1.0),
            acceleration: Vector3::new(0.0, 0.0, -10.0),
            exclusive: true,
        });
        let positions = [Point3::origin()];
        let velocities = [Vector3::zeros()];
        let batch = ParticleBatch {
            positions: &positions,
            velocities: &velocities,
            particle_mass: 1.0,
        };
        let mut forces = [Vector3::zeros()];
        field.contribute(&batch, &Isometry3::identity(), &mut forces);

        assert_eq!(forces[0], Vector3::zeros());
        assert!(field.is_exclusive());
        assert_eq!(field.kind(), FieldKind::Gravity);
    }

    #[test]
    fn test_rigid_analog() {
        let wind = ForceField::Wind(WindField {
            bounds: big_sphere(),
            velocity: Vector3::new(0.0, 2.0, 0.0),
            drag: 0.5,
            exclusive: false,
        });
        let body = RigidBodyState::at_rest(Isometry3::identity(), 3.0, 0.01);
        let applied = wind.apply_to_rigid(&body).unwrap();
        assert_relative_eq!(applied.force.y, 1.0);
        assert_relative_eq!(applied.torque.norm(), 0.0);

        let water = ForceField::Buoyancy(BuoyancyField {
            bounds: big_sphere(),
            surface_height: -1.0,
            density: 1000.0,
            particle_volume: 0.0,
            gravity: 9.81,
            drag: 0.0,
        });
        assert!(water.apply_to_rigid(&body).is_none());
    }
}
