//! Fixed-substep integration of a [`FlexBody`].
//!
//! Each substep of length `dt`:
//!
//! 1. `v = (current - previous) / dt`
//! 2. base force `(wind - v)·drag + gravity`
//! 3. stretch, shear, then bend springs (force on `a`, negated on `b`)
//! 4. force fields into a separate zeroed buffer
//! 5. `previous ← current`,
//!    `current += (v·(1 - resistance)·dt + F·dt²/(2m))·flexibility`
//! 6. blocker clip
//! 7. attached particles snap to their targets; rigid targets accumulate the
//!    reaction impulse `F·dt`
//!
//! Accumulated impulses are delivered once per step under the impulse lock.

use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use smallvec::SmallVec;
use tracing::debug;

use crate::attachment::{AttachTarget, ImpulseLock, RigidBodyTarget};
use crate::body::FlexBody;
use crate::error::{FlexError, Result};
use crate::field_query::{ActiveFields, FieldContext, FieldHierarchy, query_fields};
use crate::force::ParticleBatch;
use crate::springs::{SpringKind, spring_force};
use crate::types::BodyFlags;

/// Per-step input from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInput {
    /// Substeps to run.
    pub substeps: u32,
    /// World gravity acceleration (m/s²), before the body's multiplier.
    pub gravity: Vector3<f32>,
    /// World ambient wind velocity (m/s).
    pub ambient_wind: Vector3<f32>,
    /// Worker-thread slot running this step.
    pub thread_index: usize,
}

impl StepInput {
    /// Input with no wind on thread slot 0.
    #[must_use]
    pub fn new(substeps: u32, gravity: Vector3<f32>) -> Self {
        Self {
            substeps,
            gravity,
            ambient_wind: Vector3::zeros(),
            thread_index: 0,
        }
    }

    /// Set the ambient wind.
    #[must_use]
    pub const fn with_wind(mut self, wind: Vector3<f32>) -> Self {
        self.ambient_wind = wind;
        self
    }

    /// Set the worker-thread slot.
    #[must_use]
    pub const fn with_thread(mut self, thread_index: usize) -> Self {
        self.thread_index = thread_index;
        self
    }
}

/// Shared collaborators available during a step. All optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepEnv<'a> {
    /// Force-field hierarchy to query.
    pub fields: Option<FieldContext<'a>>,
    /// Lock guarding rigid-body impulse delivery.
    pub impulse_lock: Option<&'a ImpulseLock>,
}

/// Diagnostics from the last step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepStats {
    /// Substeps actually run (0 while asleep).
    pub substeps: u32,
    /// Force fields applied.
    pub fields: usize,
    /// Kinetic energy after the step.
    pub kinetic_energy: f32,
    /// Largest particle speed after the step.
    pub max_speed: f32,
    /// Largest net force on a free particle in the final substep.
    pub max_net_force: f32,
    /// Whether the body fell asleep at the end of this step.
    pub fell_asleep: bool,
}

type ImpulseBatch = SmallVec<[(Arc<dyn RigidBodyTarget>, Vector3<f32>, Point3<f32>); 4]>;

impl FlexBody {
    /// Advance the body by `input.substeps` fixed substeps.
    ///
    /// A sleeping body is skipped unless an attached rigid body is awake.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::NumericalError`] if particle state becomes
    /// non-finite and propagates field query errors.
    pub fn step(&mut self, input: &StepInput, env: &StepEnv<'_>) -> Result<StepStats> {
        if self.is_asleep() {
            if !self.driven_by_awake_target() {
                self.particles.snapshot_initial();
                self.stats = StepStats::default();
                return Ok(self.stats);
            }
            self.wake();
        }

        let mut stats = self.advance(input, env.fields)?;
        self.flush_impulses(env.impulse_lock);
        stats.fell_asleep = self.update_sleep(&stats, input.substeps);
        self.stats = stats;
        Ok(stats)
    }

    /// Run substeps without sleep handling or impulse delivery.
    pub(crate) fn advance(
        &mut self,
        input: &StepInput,
        fields: Option<FieldContext<'_>>,
    ) -> Result<StepStats> {
        let dt = self.sim.substep_seconds();
        self.particles.snapshot_initial();

        let gravity = self
            .transform
            .inverse_transform_vector(&(input.gravity * self.sim.gravity_multiplier))
            * self.material.particle_mass;
        let wind = self.transform.inverse_transform_vector(&input.ambient_wind);

        let active = match fields {
            Some(ctx) if !self.flags.contains(BodyFlags::FORCE_FIELD_INHIBIT) => query_fields(
                ctx.hierarchy,
                ctx.mask,
                ctx.region,
                &self.world_bounds(),
                input.thread_index,
            )?,
            _ => ActiveFields::new(),
        };
        let hierarchy = fields.map(|ctx| ctx.hierarchy);

        let mut max_net_force = 0.0;
        for _ in 0..input.substeps {
            max_net_force = self.substep(dt, gravity, wind, hierarchy, &active);
        }

        let finite = self
            .particles
            .current()
            .iter()
            .all(|p| p.coords.iter().all(|c| c.is_finite()));
        if !finite {
            return Err(FlexError::numerical_error(format!(
                "{} diverged after {:.3}s",
                self.id, self.elapsed
            )));
        }

        let max_speed = (0..self.particles.len())
            .map(|i| self.particles.velocity(i, dt).norm())
            .fold(0.0_f32, f32::max);

        debug!(
            body = %self.id,
            substeps = input.substeps,
            fields = active.len(),
            max_speed,
            "stepped"
        );

        Ok(StepStats {
            substeps: input.substeps,
            fields: active.len(),
            kinetic_energy: self.kinetic_energy(),
            max_speed,
            max_net_force,
            fell_asleep: false,
        })
    }

    /// One fixed substep. Returns the largest net force on a free particle.
    fn substep(
        &mut self,
        dt: f32,
        gravity: Vector3<f32>,
        wind: Vector3<f32>,
        hierarchy: Option<&dyn FieldHierarchy>,
        active: &[usize],
    ) -> f32 {
        self.elapsed += dt;

        let drag = self.sim.wind_drag;
        let keep = 1.0 - self.sim.internal_resistance;
        let mass = self.material.particle_mass;
        let impulse_scale = dt * dt / (2.0 * mass);

        let (current, previous) = self.particles.split_mut();
        let velocities = &mut self.scratch.velocities;
        let forces = &mut self.scratch.forces;
        let field_forces = &mut self.scratch.field_forces;

        for ((v, f), (p, q)) in velocities
            .iter_mut()
            .zip(forces.iter_mut())
            .zip(current.iter().zip(previous.iter()))
        {
            *v = (p - q) / dt;
            *f = (wind - *v) * drag + gravity;
        }

        let springs = &self.material.springs;
        let dampers = &self.material.dampers;
        for (kind, set) in self.springs.sets() {
            let (k, c) = match kind {
                SpringKind::Stretch => (springs.stretch, dampers.stretch),
                SpringKind::Shear => (springs.shear, dampers.shear),
                SpringKind::Bend => (springs.bend, dampers.bend),
            };
            if k <= 0.0 && c <= 0.0 {
                continue;
            }
            for s in set {
                let delta = current[s.b] - current[s.a];
                let relative = velocities[s.b] - velocities[s.a];
                let f = spring_force(delta, relative, s.rest_length, k, c);
                forces[s.a] += f;
                forces[s.b] -= f;
            }
        }

        field_forces.fill(Vector3::zeros());
        if let Some(hierarchy) = hierarchy {
            let batch = ParticleBatch {
                positions: current,
                velocities,
                particle_mass: mass,
            };
            for field in active.iter().filter_map(|&id| hierarchy.field(id)) {
                field.contribute(&batch, &self.transform, field_forces);
            }
        }

        let mut max_net_force = 0.0_f32;
        for (i, (p, q)) in current.iter_mut().zip(previous.iter_mut()).enumerate() {
            let total = forces[i] + field_forces[i];
            forces[i] = total;

            let flex = self.flexibility.get(i);
            if flex > 0.0 {
                max_net_force = max_net_force.max(total.norm());
            }

            *q = *p;
            *p += (velocities[i] * (keep * dt) + total * impulse_scale) * flex;
        }

        if let Some(binding) = &self.blocker {
            binding.clip(current, previous, self.material.radius, &self.transform);
        }

        if !self.attachments.is_empty() {
            let to_local = self.transform.inverse();
            for slot in &mut self.attachments {
                let Some(target) = &slot.target else {
                    continue;
                };
                let mut world = target.world_position(self.elapsed);
                if let (Some(alpha), Some(origin)) = (self.warm_alpha, slot.origin) {
                    world = origin + (world - origin) * alpha;
                }
                current[slot.particle] = to_local * world;

                if target.rigid_body().is_some() {
                    slot.pending_impulse += self.transform.rotation * forces[slot.particle] * dt;
                }
            }
        }

        max_net_force
    }

    /// Deliver accumulated reaction impulses, taking the lock once.
    fn flush_impulses(&mut self, lock: Option<&ImpulseLock>) {
        let mut batch = ImpulseBatch::new();
        for slot in &mut self.attachments {
            let impulse = slot.take_impulse();
            if let Some(AttachTarget::RigidBody { body, local_anchor }) = &slot.target {
                if impulse.norm_squared() > 0.0 {
                    let local = body.transform().inverse_transform_vector(&impulse);
                    batch.push((Arc::clone(body), local, *local_anchor));
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        let deliver = || {
            for (body, impulse, anchor) in &batch {
                body.apply_impulse(*impulse, *anchor);
            }
        };
        match lock {
            Some(lock) => lock.with(deliver),
            None => deliver(),
        }
    }

    /// Whether an attachment keeps the body moving on its own.
    fn driven_by_awake_target(&self) -> bool {
        self.attachments.iter().any(|slot| match &slot.target {
            Some(AttachTarget::RigidBody { body, .. }) => !body.is_asleep(),
            Some(AttachTarget::Path(path)) => path.period() > 0.0,
            Some(AttachTarget::Static(_)) | None => false,
        })
    }

    /// Advance the stillness timer. Returns `true` if the body fell asleep.
    fn update_sleep(&mut self, stats: &StepStats, substeps: u32) -> bool {
        let timeout = self.sim.auto_sleep_timeout;
        if timeout <= 0.0 || self.driven_by_awake_target() {
            self.sleep_timer = 0.0;
            return false;
        }
        if stats.max_speed >= self.sim.sleep_velocity {
            self.sleep_timer = 0.0;
            return false;
        }

        self.sleep_timer += self.sim.substep_seconds() * substeps as f32;
        if self.sleep_timer < timeout {
            return false;
        }
        self.flags.insert(BodyFlags::ASLEEP);
        debug!(body = %self.id, after = self.sleep_timer, "auto-sleep");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::NodeRef;
    use crate::body::BodyMaterial;
    use crate::config::{DamperConstants, SimulationConfig, SpringConstants};
    use crate::field_query::{FieldVisitMask, RegionTree};
    use crate::force::{ForceField, WindField};
    use crate::springs::Lattice;
    use crate::types::BoundingSphere;
    use approx::assert_relative_eq;
    use nalgebra::Isometry3;
    use std::sync::Mutex;

    fn line_body(n: usize, sim: SimulationConfig) -> FlexBody {
        let positions: Vec<_> = (0..n)
            .map(|i| Point3::new(i as f32 * 0.1, 0.0, 0.0))
            .collect();
        FlexBody::new(
            "line",
            Lattice::Line { count: n },
            0.1,
            &positions,
            BodyMaterial {
                particle_mass: 0.05,
                radius: 0.01,
                springs: SpringConstants::new(200.0, 0.0, 10.0),
                dampers: DamperConstants::new(0.4, 0.0, 0.05),
            },
            sim,
            true,
        )
        .unwrap()
    }

    fn gravity() -> Vector3<f32> {
        Vector3::new(0.0, 0.0, -9.81)
    }

    #[test]
    fn test_free_fall_first_substep() {
        let sim = SimulationConfig {
            wind_drag: 0.0,
            ..SimulationConfig::default()
        };
        let mut body = line_body(3, sim);
        body.step(&StepInput::new(1, gravity()), &StepEnv::default())
            .unwrap();

        // Δz = g·dt²/2 with a = F/(2m) = g/2
        let dt = sim.substep_seconds();
        let expected = -9.81 * dt * dt / 2.0;
        for p in body.positions() {
            assert_relative_eq!(p.z, expected, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_pinned_particle_does_not_move() {
        let mut body = line_body(4, SimulationConfig::default());
        body.flexibility_mut().pin(0);
        body.step(&StepInput::new(20, gravity()), &StepEnv::default())
            .unwrap();

        assert_relative_eq!(body.positions()[0].z, 0.0);
        assert!(body.positions()[3].z < 0.0);
    }

    #[test]
    fn test_gravity_multiplier_and_transform() {
        let sim = SimulationConfig {
            gravity_multiplier: 0.0,
            ..SimulationConfig::default()
        };
        let mut body = line_body(3, sim);
        body.step(&StepInput::new(10, gravity()), &StepEnv::default())
            .unwrap();
        assert_relative_eq!(body.positions()[1].z, 0.0);
    }

    #[test]
    fn test_fields_applied_once_per_substep() {
        let sim = SimulationConfig {
            wind_drag: 0.0,
            gravity_multiplier: 0.0,
            internal_resistance: 0.0,
            ..SimulationConfig::default()
        };
        let wind = ForceField::Wind(WindField {
            bounds: BoundingSphere::new(Point3::origin(), 100.0),
            velocity: Vector3::new(0.0, 10.0, 0.0),
            drag: 0.1,
            exclusive: false,
        });

        let mut tree = RegionTree::new(BoundingSphere::new(Point3::origin(), 100.0));
        let child = tree
            .add_region(tree.root(), BoundingSphere::new(Point3::origin(), 50.0))
            .unwrap();
        let id = tree.add_field(tree.root(), wind).unwrap();
        tree.link_field(child, id).unwrap();
        let mask = FieldVisitMask::for_hierarchy(&tree).unwrap();

        let env = StepEnv {
            fields: Some(FieldContext {
                hierarchy: &tree,
                mask: &mask,
                region: tree.root(),
            }),
            impulse_lock: None,
        };
        let mut body = line_body(3, sim);
        let stats = body.step(&StepInput::new(1, Vector3::zeros()), &env).unwrap();
        assert_eq!(stats.fields, 1);

        // One contribution of drag·wind = 1 N.
        let dt = sim.substep_seconds();
        let expected = 1.0 * dt * dt / (2.0 * 0.05);
        assert_relative_eq!(body.positions()[0].y, expected, epsilon = 1e-7);

        body.set_force_field_inhibit(true);
        let stats = body.step(&StepInput::new(1, Vector3::zeros()), &env).unwrap();
        assert_eq!(stats.fields, 0);
    }

    #[derive(Debug)]
    struct Hook {
        impulse: Mutex<Vector3<f32>>,
        calls: Mutex<u32>,
    }

    impl RigidBodyTarget for Hook {
        fn transform(&self) -> Isometry3<f32> {
            Isometry3::identity()
        }
        fn apply_impulse(&self, local_impulse: Vector3<f32>, _local_position: Point3<f32>) {
            *self.impulse.lock().unwrap() += local_impulse;
            *self.calls.lock().unwrap() += 1;
        }
        fn is_asleep(&self) -> bool {
            true
        }
        fn wake(&self) {}
        fn sleep(&self) {}
    }

    #[test]
    fn test_hanging_rope_pulls_hook_down() {
        let hook = Arc::new(Hook {
            impulse: Mutex::new(Vector3::zeros()),
            calls: Mutex::new(0),
        });
        let mut body = line_body(4, SimulationConfig::default());
        let slot = body.add_attachment_slot(0).unwrap();
        body.attach_node(slot, NodeRef::RigidBody(hook.clone()))
            .unwrap();

        let lock = ImpulseLock::new();
        let env = StepEnv {
            fields: None,
            impulse_lock: Some(&lock),
        };
        body.step(&StepInput::new(8, gravity()), &env).unwrap();

        assert_eq!(*hook.calls.lock().unwrap(), 1);
        assert!(hook.impulse.lock().unwrap().z < 0.0);
        assert!(body.attachments()[slot].pending_impulse.norm() == 0.0);
    }

    #[test]
    fn test_auto_sleep_and_skip() {
        let sim = SimulationConfig::default().with_auto_sleep(0.02);
        let mut body = line_body(3, sim);

        let input = StepInput::new(2, Vector3::zeros());
        let mut fell = false;
        for _ in 0..4 {
            fell |= body.step(&input, &StepEnv::default()).unwrap().fell_asleep;
        }
        assert!(fell);
        assert!(body.is_asleep());

        let stats = body.step(&input, &StepEnv::default()).unwrap();
        assert_eq!(stats.substeps, 0);

        body.wake();
        let stats = body.step(&input, &StepEnv::default()).unwrap();
        assert_eq!(stats.substeps, 2);
    }

    #[test]
    fn test_sleeping_body_renders_at_rest() {
        let sim = SimulationConfig::default().with_auto_sleep(0.02);
        let mut body = line_body(3, sim);
        // Drift slower than the sleep threshold.
        body.set_particle_state(1, Point3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.005, 0.0))
            .unwrap();

        let input = StepInput::new(2, Vector3::zeros());
        for _ in 0..10 {
            if body.is_asleep() {
                break;
            }
            body.step(&input, &StepEnv::default()).unwrap();
        }
        assert!(body.is_asleep());
        let moved = body.particles().render_position(1, 0.0) != body.positions()[1];
        assert!(moved);

        body.step(&input, &StepEnv::default()).unwrap();
        for (i, p) in body.positions().iter().enumerate() {
            assert_eq!(body.particles().render_position(i, 0.0), *p);
        }
    }

    #[test]
    fn test_divergence_reported() {
        let mut body = line_body(3, SimulationConfig::default());
        body.set_particle_state(1, Point3::new(f32::NAN, 0.0, 0.0), Vector3::zeros())
            .unwrap();
        let result = body.step(&StepInput::new(1, gravity()), &StepEnv::default());
        assert!(matches!(result, Err(FlexError::NumericalError(_))));
    }
}
