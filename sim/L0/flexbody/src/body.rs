//! Simulation state shared by ropes and cloth.
//!
//! A [`FlexBody`] owns every physics buffer of one rope or cloth: particle
//! history, flexibility, springs, attachment slots and the scratch arrays
//! the integrator reuses between substeps. It is built on activation and
//! dropped on deactivation. Stepping lives in [`crate::integrator`], warm
//! start in [`crate::warm_start`].

use std::fmt::Debug;

use nalgebra::{Isometry3, Point3, Vector3};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::attachment::{
    AttachTarget, AttachmentSlot, ConnectorGraph, ConnectorId, NodeRef, resolve_connector,
};
use crate::blocker::BlockerBinding;
use crate::config::{DamperConstants, SimulationConfig, SpringConstants};
use crate::error::{FlexError, Result};
use crate::integrator::StepStats;
use crate::mesh::{LodLayout, ReconstructRequest, RenderVertex};
use crate::particles::{FlexibilityMask, ParticleHistory, try_filled};
use crate::springs::{Lattice, SpringNetwork};
use crate::types::{BodyFlags, BoundingSphere, FlexBodyId, next_body_id};

/// Physical parameters of a body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyMaterial {
    /// Mass of each particle (kg).
    pub particle_mass: f32,
    /// Particle collision radius (m).
    pub radius: f32,
    /// Spring constants.
    pub springs: SpringConstants,
    /// Damper constants.
    pub dampers: DamperConstants,
}

/// Reusable per-substep buffers.
#[derive(Debug, Clone)]
pub(crate) struct Scratch {
    pub(crate) velocities: Vec<Vector3<f32>>,
    pub(crate) forces: Vec<Vector3<f32>>,
    pub(crate) field_forces: Vec<Vector3<f32>>,
}

impl Scratch {
    fn new(len: usize) -> Result<Self> {
        Ok(Self {
            velocities: try_filled(len, Vector3::zeros())?,
            forces: try_filled(len, Vector3::zeros())?,
            field_forces: try_filled(len, Vector3::zeros())?,
        })
    }
}

/// Physics state of one rope or cloth.
#[derive(Debug, Clone)]
pub struct FlexBody {
    pub(crate) id: FlexBodyId,
    pub(crate) name: String,
    pub(crate) particles: ParticleHistory,
    pub(crate) flexibility: FlexibilityMask,
    pub(crate) springs: SpringNetwork,
    pub(crate) material: BodyMaterial,
    pub(crate) sim: SimulationConfig,
    pub(crate) transform: Isometry3<f32>,
    pub(crate) attachments: SmallVec<[AttachmentSlot; 4]>,
    pub(crate) blocker: Option<BlockerBinding>,
    pub(crate) flags: BodyFlags,
    pub(crate) sleep_timer: f32,
    pub(crate) elapsed: f32,
    pub(crate) warm_alpha: Option<f32>,
    pub(crate) stats: StepStats,
    pub(crate) scratch: Scratch,
}

impl FlexBody {
    /// Build a body at rest at `rest_positions`.
    ///
    /// `spacing` is the stretch rest length. With `keep_initial` the body
    /// keeps a per-frame snapshot for render interpolation.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidTopology`] if the position count does not
    /// match the lattice, [`FlexError::InvalidConfig`] for a bad simulation
    /// config, and [`FlexError::ResourceExhausted`] on allocation failure.
    pub fn new(
        name: impl Into<String>,
        lattice: Lattice,
        spacing: f32,
        rest_positions: &[Point3<f32>],
        material: BodyMaterial,
        sim: SimulationConfig,
        keep_initial: bool,
    ) -> Result<Self> {
        sim.validate()?;
        let count = lattice.particle_count();
        if rest_positions.len() != count {
            return Err(FlexError::invalid_topology(format!(
                "lattice has {count} particles, got {} positions",
                rest_positions.len()
            )));
        }

        let springs = SpringNetwork::build(lattice, spacing)?;
        let particles = ParticleHistory::at_rest(rest_positions, keep_initial)?;
        let flexibility = FlexibilityMask::free(count)?;
        let scratch = Scratch::new(count)?;

        Ok(Self {
            id: next_body_id(),
            name: name.into(),
            particles,
            flexibility,
            springs,
            material,
            sim,
            transform: Isometry3::identity(),
            attachments: SmallVec::new(),
            blocker: None,
            flags: BodyFlags::empty(),
            sleep_timer: 0.0,
            elapsed: 0.0,
            warm_alpha: None,
            stats: StepStats::default(),
            scratch,
        })
    }

    /// Set the world transform.
    #[must_use]
    pub fn with_transform(mut self, transform: Isometry3<f32>) -> Self {
        self.transform = transform;
        self
    }

    /// Body identifier.
    #[must_use]
    pub const fn id(&self) -> FlexBodyId {
        self.id
    }

    /// Body name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lattice shape.
    #[must_use]
    pub const fn lattice(&self) -> Lattice {
        self.springs.lattice()
    }

    /// Number of particles.
    #[must_use]
    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    /// Particle position history.
    #[must_use]
    pub const fn particles(&self) -> &ParticleHistory {
        &self.particles
    }

    /// Current particle positions (body-local).
    #[must_use]
    pub fn positions(&self) -> &[Point3<f32>] {
        self.particles.current()
    }

    /// Per-particle flexibility.
    #[must_use]
    pub const fn flexibility(&self) -> &FlexibilityMask {
        &self.flexibility
    }

    /// Mutable per-particle flexibility.
    pub fn flexibility_mut(&mut self) -> &mut FlexibilityMask {
        &mut self.flexibility
    }

    /// Spring network.
    #[must_use]
    pub const fn springs(&self) -> &SpringNetwork {
        &self.springs
    }

    /// Physical parameters.
    #[must_use]
    pub const fn material(&self) -> &BodyMaterial {
        &self.material
    }

    /// Replace spring and damper constants. Topology is unchanged.
    pub fn set_constants(&mut self, springs: SpringConstants, dampers: DamperConstants) {
        self.material.springs = springs;
        self.material.dampers = dampers;
    }

    /// Simulation tuning.
    #[must_use]
    pub const fn sim(&self) -> &SimulationConfig {
        &self.sim
    }

    /// World transform.
    #[must_use]
    pub const fn transform(&self) -> &Isometry3<f32> {
        &self.transform
    }

    /// Move the body's frame. Particles keep their local positions.
    pub fn set_transform(&mut self, transform: Isometry3<f32>) {
        self.transform = transform;
    }

    /// Body flags.
    #[must_use]
    pub const fn flags(&self) -> BodyFlags {
        self.flags
    }

    /// Ignore (or stop ignoring) force fields.
    pub fn set_force_field_inhibit(&mut self, inhibit: bool) {
        self.flags.set(BodyFlags::FORCE_FIELD_INHIBIT, inhibit);
    }

    /// Whether the body is asleep.
    #[must_use]
    pub const fn is_asleep(&self) -> bool {
        self.flags.contains(BodyFlags::ASLEEP)
    }

    /// Wake the body and reset its sleep timer.
    pub fn wake(&mut self) {
        if self.flags.intersects(BodyFlags::ASLEEP | BodyFlags::PRE_ASLEEP) {
            debug!(body = %self.id, "waking");
        }
        self.flags.remove(BodyFlags::ASLEEP | BodyFlags::PRE_ASLEEP);
        self.sleep_timer = 0.0;
    }

    /// Put the body to sleep.
    pub fn sleep(&mut self) {
        self.flags.insert(BodyFlags::ASLEEP);
    }

    pub(crate) fn insert_flags(&mut self, flags: BodyFlags) {
        self.flags.insert(flags);
    }

    /// Statistics of the last step.
    #[must_use]
    pub const fn stats(&self) -> &StepStats {
        &self.stats
    }

    /// Simulated seconds since activation.
    #[must_use]
    pub const fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Connect a collision volume, or disconnect with `None`.
    pub fn bind_blocker(&mut self, blocker: Option<BlockerBinding>) {
        self.blocker = blocker;
    }

    /// Attachment slots.
    #[must_use]
    pub fn attachments(&self) -> &[AttachmentSlot] {
        &self.attachments
    }

    /// Add an attachment slot for `particle`. Returns the slot index.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown particle.
    pub fn add_attachment_slot(&mut self, particle: usize) -> Result<usize> {
        self.check_particle(particle)?;
        self.attachments.push(AttachmentSlot::new(particle));
        Ok(self.attachments.len() - 1)
    }

    fn check_particle(&self, particle: usize) -> Result<()> {
        if particle >= self.particles.len() {
            return Err(FlexError::index_out_of_bounds(format!(
                "particle {particle} of {}",
                self.particles.len()
            )));
        }
        Ok(())
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut AttachmentSlot> {
        let count = self.attachments.len();
        self.attachments
            .get_mut(slot)
            .ok_or_else(|| FlexError::index_out_of_bounds(format!("slot {slot} of {count}")))
    }

    /// Name the connector a slot resolves on activation.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown slot.
    pub fn set_connector(&mut self, slot: usize, connector: Option<ConnectorId>) -> Result<()> {
        self.slot_mut(slot)?.connector = connector;
        Ok(())
    }

    /// World position of particle `i`.
    #[must_use]
    pub fn world_position(&self, i: usize) -> Point3<f32> {
        self.transform * self.particles.current()[i]
    }

    /// Bind a resolved node to a slot and pin its particle.
    ///
    /// The particle is moved onto the target immediately with zero implied
    /// velocity. Its previous world position is kept as the slot origin.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown slot and
    /// [`FlexError::InvalidAttachment`] for scene-root or link nodes.
    pub fn attach_node(&mut self, slot: usize, node: NodeRef) -> Result<()> {
        let particle = self.slot_mut(slot)?.particle;
        let world = self.world_position(particle);
        let target = AttachTarget::from_node(node, world).ok_or_else(|| {
            FlexError::invalid_attachment(format!("slot {slot} needs a concrete node"))
        })?;

        let local = self.transform.inverse() * target.world_position(self.elapsed);
        self.particles.teleport(particle, local);
        self.flexibility.pin(particle);

        let entry = self.slot_mut(slot)?;
        entry.origin = Some(world);
        entry.target = Some(target);
        entry.pending_impulse = Vector3::zeros();
        Ok(())
    }

    /// Resolve every slot's connector through `graph`.
    ///
    /// Slots that fail to resolve stay free and are reported with `warn!`.
    /// Returns the number of slots now attached.
    pub fn resolve_attachments(&mut self, graph: &dyn ConnectorGraph) -> usize {
        let mut attached = 0;
        for slot in 0..self.attachments.len() {
            let Some(connector) = self.attachments[slot].connector else {
                continue;
            };
            let bound =
                resolve_connector(graph, connector).and_then(|node| self.attach_node(slot, node));
            match bound {
                Ok(()) => attached += 1,
                Err(err) => {
                    warn!(body = %self.id, slot, connector, %err, "attachment left free");
                }
            }
        }
        attached
    }

    /// Detach a slot, freeing its particle.
    ///
    /// The particle's flexibility returns to 1 and its history collapses to
    /// its current position so it does not jump. The body is woken.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown slot.
    pub fn break_attachment(&mut self, slot: usize) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        entry.target = None;
        entry.connector = None;
        entry.pending_impulse = Vector3::zeros();
        let particle = entry.particle;

        self.flexibility.release(particle);
        self.particles.settle_particle(particle);
        self.wake();
        debug!(body = %self.id, slot, particle, "attachment broken");
        Ok(())
    }

    /// Place particle `i` at `position` moving at `velocity` (body-local).
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown particle.
    pub fn set_particle_state(
        &mut self,
        i: usize,
        position: Point3<f32>,
        velocity: Vector3<f32>,
    ) -> Result<()> {
        self.check_particle(i)?;
        let dt = self.sim.substep_seconds();
        self.particles.teleport(i, position);
        self.particles.split_mut().1[i] = position - velocity * dt;
        Ok(())
    }

    /// Replace the position history, e.g. from persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if either buffer does not match
    /// the particle count.
    pub fn restore_history(
        &mut self,
        current: Vec<Point3<f32>>,
        previous: Vec<Point3<f32>>,
    ) -> Result<()> {
        if current.len() != self.particles.len() {
            return Err(FlexError::invalid_config(format!(
                "stored history has {} particles, body has {}",
                current.len(),
                self.particles.len()
            )));
        }
        let keep_initial = self.particles.initial().is_some();
        self.particles = ParticleHistory::from_parts(current, previous, keep_initial)?;
        Ok(())
    }

    /// Finite-difference velocity of particle `i`.
    #[must_use]
    pub fn velocity(&self, i: usize) -> Vector3<f32> {
        self.particles.velocity(i, self.sim.substep_seconds())
    }

    /// Total kinetic energy, `Σ ½·m·|v|²`.
    #[must_use]
    pub fn kinetic_energy(&self) -> f32 {
        let dt = self.sim.substep_seconds();
        let sum_sq: f32 = (0..self.particles.len())
            .map(|i| self.particles.velocity(i, dt).norm_squared())
            .sum();
        0.5 * self.material.particle_mass * sum_sq
    }

    /// Bounding sphere of the particles in the body frame, padded by radius.
    #[must_use]
    pub fn local_bounds(&self) -> BoundingSphere {
        BoundingSphere::from_points(self.particles.current(), self.material.radius)
    }

    /// Bounding sphere in world space.
    #[must_use]
    pub fn world_bounds(&self) -> BoundingSphere {
        self.local_bounds().transformed(&self.transform)
    }

    /// Render-time positions and per-frame vertex velocities.
    ///
    /// Positions are interpolated by `fraction`. Velocities come from the
    /// un-interpolated history and are scaled by `frame_time`.
    pub fn render_samples(
        &self,
        fraction: f32,
        frame_time: f32,
        positions: &mut Vec<Point3<f32>>,
        velocities: &mut Vec<Vector3<f32>>,
    ) {
        let dt = self.sim.substep_seconds();
        let fraction = fraction.clamp(0.0, 1.0);
        positions.clear();
        velocities.clear();
        positions.extend((0..self.particles.len()).map(|i| self.particles.render_position(i, fraction)));
        velocities.extend((0..self.particles.len()).map(|i| self.particles.velocity(i, dt) * frame_time));
    }
}

/// A rope or cloth owning a [`FlexBody`].
pub trait FlexibleBody: Send + Debug {
    /// Shared physics state.
    fn body(&self) -> &FlexBody;

    /// Mutable shared physics state.
    fn body_mut(&mut self) -> &mut FlexBody;

    /// Number of LOD tiers including the high tier.
    fn lod_levels(&self) -> usize;

    /// Vertex/triangle layout of a tier. Out-of-range tiers are clamped.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] if the tier cannot be indexed
    /// with 32-bit indices.
    fn layout(&self, lod: usize, include_endcaps: bool) -> Result<LodLayout>;

    /// Rebuild the render vertex stream into `out`.
    ///
    /// # Errors
    ///
    /// Propagates mesh construction errors.
    fn reconstruct_into(
        &self,
        request: &ReconstructRequest,
        out: &mut Vec<RenderVertex>,
    ) -> Result<()>;

    /// Clamp a requested tier to the available range.
    fn clamp_lod(&self, lod: usize) -> usize {
        lod.min(self.lod_levels().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{ConnectorMap, PathTarget};
    use crate::integrator::{StepEnv, StepInput};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    /// Slides along +X by one unit per period.
    #[derive(Debug)]
    struct Slide {
        period: f32,
    }

    impl PathTarget for Slide {
        fn state_at(&self, t: f32) -> Point3<f32> {
            Point3::new(t, 0.0, 0.0)
        }
        fn period(&self) -> f32 {
            self.period
        }
    }

    fn material() -> BodyMaterial {
        BodyMaterial {
            particle_mass: 0.1,
            radius: 0.05,
            springs: SpringConstants::new(100.0, 0.0, 5.0),
            dampers: DamperConstants::new(0.5, 0.0, 0.05),
        }
    }

    fn line_body(n: usize) -> FlexBody {
        let positions: Vec<_> = (0..n).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
        FlexBody::new(
            "line",
            Lattice::Line { count: n },
            1.0,
            &positions,
            material(),
            SimulationConfig::default(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_position_count_must_match_lattice() {
        let positions = [Point3::origin(); 3];
        let result = FlexBody::new(
            "bad",
            Lattice::Line { count: 4 },
            1.0,
            &positions,
            material(),
            SimulationConfig::default(),
            false,
        );
        assert!(matches!(result, Err(FlexError::InvalidTopology(_))));
    }

    #[test]
    fn test_attach_static_node_pins_particle() {
        let mut body = line_body(3);
        let slot = body.add_attachment_slot(0).unwrap();
        body.attach_node(slot, NodeRef::Transform(Isometry3::translation(0.0, 0.0, 1.0)))
            .unwrap();

        assert!(body.flexibility().is_pinned(0));
        assert_relative_eq!(body.positions()[0].z, 1.0);
        assert_relative_eq!(body.velocity(0).norm(), 0.0);
        assert_eq!(body.attachments()[slot].origin, Some(Point3::origin()));
    }

    #[test]
    fn test_path_attachment_wraps_each_period() {
        let mut body = line_body(3);
        let slot = body.add_attachment_slot(0).unwrap();
        body.attach_node(slot, NodeRef::Path(Arc::new(Slide { period: 1.0 })))
            .unwrap();

        // 150 substeps of 5 ms: three quarters through the first lap.
        let env = StepEnv::default();
        body.step(&StepInput::new(150, Vector3::zeros()), &env)
            .unwrap();
        assert_relative_eq!(body.positions()[0].x, 0.75, epsilon = 1e-4);

        // 1.25 s elapsed wraps back to a quarter.
        body.step(&StepInput::new(100, Vector3::zeros()), &env)
            .unwrap();
        assert_relative_eq!(body.elapsed(), 1.25, epsilon = 1e-4);
        assert_relative_eq!(body.positions()[0].x, 0.25, epsilon = 1e-4);
        assert_relative_eq!(body.positions()[0].y, 0.0);
        assert!(!body.is_asleep());
    }

    #[test]
    fn test_unresolved_connector_left_free() {
        let mut body = line_body(3);
        let slot = body.add_attachment_slot(2).unwrap();
        body.set_connector(slot, Some(42)).unwrap();

        let attached = body.resolve_attachments(&ConnectorMap::new());
        assert_eq!(attached, 0);
        assert!(body.attachments()[slot].is_unresolved());
        assert!(!body.flexibility().is_pinned(2));
    }

    #[test]
    fn test_break_attachment_restores_freedom() {
        let mut body = line_body(3);
        let slot = body.add_attachment_slot(0).unwrap();
        body.attach_node(slot, NodeRef::Transform(Isometry3::identity()))
            .unwrap();
        body.sleep();
        body.particles.split_mut().0[0].z = 0.3;

        body.break_attachment(slot).unwrap();

        assert_relative_eq!(body.flexibility().get(0), 1.0);
        assert_eq!(body.particles().current()[0], body.particles().previous()[0]);
        assert!(!body.is_asleep());
        assert!(!body.attachments()[slot].is_attached());
        assert!(body.break_attachment(5).is_err());
    }

    #[test]
    fn test_set_particle_state_implies_velocity() {
        let mut body = line_body(2);
        body.set_particle_state(1, Point3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 2.0, 0.0))
            .unwrap();
        assert_relative_eq!(body.velocity(1).y, 2.0, epsilon = 1e-3);
        assert_relative_eq!(body.kinetic_energy(), 0.5 * 0.1 * 4.0, epsilon = 1e-3);
        assert!(body.set_particle_state(9, Point3::origin(), Vector3::zeros()).is_err());
    }

    #[test]
    fn test_world_bounds_follow_transform() {
        let body = line_body(3).with_transform(Isometry3::translation(0.0, 5.0, 0.0));
        let bounds = body.world_bounds();
        assert_relative_eq!(bounds.center.x, 1.0);
        assert_relative_eq!(bounds.center.y, 5.0);
        assert_relative_eq!(bounds.radius, 1.05);
    }

    #[test]
    fn test_restore_history_checks_length() {
        let mut body = line_body(3);
        let short = vec![Point3::origin(); 2];
        assert!(body.restore_history(short.clone(), short).is_err());

        let moved: Vec<_> = (0..3).map(|i| Point3::new(i as f32, 1.0, 0.0)).collect();
        body.restore_history(moved.clone(), moved).unwrap();
        assert_relative_eq!(body.positions()[2].y, 1.0);
        assert!(body.particles().initial().is_some());
    }
}
