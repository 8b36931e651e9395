//! Per-node lifecycle of a rope or cloth.
//!
//! A [`FlexController`] is created when a rope or cloth node is loaded and
//! lives as long as the node. The physics buffers inside it exist only while
//! the node is active:
//!
//! ```text
//!   new ──► activate ──► step / reconstruct ... ──► deactivate
//!              │                                        │
//!              └── resolve attachments, warm start      └── keep history
//! ```
//!
//! A controller flagged [`BodyFlags::EDITING`] never allocates physics
//! buffers; reconstruction mirrors the rest geometry instead.

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use nalgebra::{Isometry3, Point3, Vector3};
use smallvec::SmallVec;
use tracing::{info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::attachment::{ConnectorGraph, ConnectorId};
use crate::blocker::BlockerBinding;
use crate::body::{FlexBody, FlexibleBody};
use crate::cloth::{self, Cloth};
use crate::config::{ClothConfig, DamperConstants, RopeConfig, SimulationConfig, SpringConstants};
use crate::error::{FlexError, Result};
use crate::field_query::{FieldContext, RegionId};
use crate::integrator::{StepEnv, StepInput, StepStats};
use crate::mesh::{self, LodLayout, ReconstructRequest, RenderVertex};
use crate::persist::{PERSISTED_FLAGS, PersistedAttachment, PersistedHistory, PersistedState};
use crate::rope::{self, Rope};
use crate::types::{BodyFlags, FlexBodyId, next_body_id};

/// Geometry of a controlled body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BodyShape {
    /// A rope.
    Rope(RopeConfig),
    /// A cloth.
    Cloth(ClothConfig),
}

impl BodyShape {
    /// Validate the geometry.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Rope(config) => config.validate(),
            Self::Cloth(config) => config.validate(),
        }
    }

    /// Number of attachment slots.
    #[must_use]
    pub const fn slot_count(&self) -> usize {
        match self {
            Self::Rope(_) => 2,
            Self::Cloth(_) => 4,
        }
    }

    /// Number of particles.
    #[must_use]
    pub const fn particle_count(&self) -> usize {
        match self {
            Self::Rope(config) => config.segments + 1,
            Self::Cloth(config) => config.cols * config.rows,
        }
    }

    /// Number of LOD tiers.
    #[must_use]
    pub const fn lod_levels(&self) -> usize {
        match self {
            Self::Rope(config) => config.lod_levels,
            Self::Cloth(config) => config.lod_levels,
        }
    }

    /// Substeps run per frame.
    #[must_use]
    pub const fn substeps_per_frame(&self) -> u32 {
        match self {
            Self::Rope(config) => config.substeps_per_frame,
            Self::Cloth(config) => config.substeps_per_frame,
        }
    }

    /// Spring and damper constants.
    #[must_use]
    pub const fn constants(&self) -> (SpringConstants, DamperConstants) {
        match self {
            Self::Rope(config) => (config.springs, config.dampers),
            Self::Cloth(config) => (config.springs, config.dampers),
        }
    }

    fn set_constants(&mut self, springs: SpringConstants, dampers: DamperConstants) {
        match self {
            Self::Rope(config) => {
                config.springs = springs;
                config.dampers = dampers;
            }
            Self::Cloth(config) => {
                config.springs = springs;
                config.dampers = dampers;
            }
        }
    }

    /// Clamp a requested tier to the available range.
    #[must_use]
    pub fn clamp_lod(&self, lod: usize) -> usize {
        lod.min(self.lod_levels().saturating_sub(1))
    }

    /// Rest positions in the body frame.
    #[must_use]
    pub fn rest_positions(&self) -> Vec<Point3<f32>> {
        match self {
            Self::Rope(config) => rope::rest_positions(config),
            Self::Cloth(config) => cloth::rest_positions(config),
        }
    }

    /// Index layout of a tier. Out-of-range tiers are clamped.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] if the tier cannot be indexed
    /// with 32-bit indices.
    pub fn layout(&self, lod: usize, include_endcaps: bool) -> Result<LodLayout> {
        let lod = self.clamp_lod(lod);
        match self {
            Self::Rope(config) => {
                let section = mesh::rope::RopeSection {
                    radius: config.radius,
                    cross_section: config.cross_section,
                };
                section.layout(config.segments + 1, lod, include_endcaps)
            }
            Self::Cloth(config) => mesh::cloth::layout(config.cols, config.rows, lod),
        }
    }

    fn build(&self, name: &str, sim: SimulationConfig) -> Result<Box<dyn FlexibleBody>> {
        let body: Box<dyn FlexibleBody> = match self {
            Self::Rope(config) => Box::new(Rope::new(name, *config, sim)?),
            Self::Cloth(config) => Box::new(Cloth::new(name, *config, sim)?),
        };
        Ok(body)
    }

    /// Vertex stream of the undeformed geometry.
    fn reconstruct_rest(
        &self,
        request: &ReconstructRequest,
        out: &mut Vec<RenderVertex>,
    ) -> Result<()> {
        let positions = self.rest_positions();
        let velocities = vec![Vector3::zeros(); positions.len()];
        let lod = self.clamp_lod(request.lod);
        match self {
            Self::Rope(config) => {
                let section = mesh::rope::RopeSection {
                    radius: config.radius,
                    cross_section: config.cross_section,
                };
                mesh::rope::reconstruct(
                    &section,
                    &positions,
                    &velocities,
                    lod,
                    request.include_endcaps,
                    out,
                )
            }
            Self::Cloth(config) => {
                mesh::cloth::reconstruct(config.cols, config.rows, &positions, &velocities, lod, out)
            }
        }
    }
}

/// Owner of one rope or cloth node's simulation.
#[derive(Debug)]
pub struct FlexController {
    id: FlexBodyId,
    name: String,
    shape: BodyShape,
    sim: SimulationConfig,
    transform: Isometry3<f32>,
    flags: BodyFlags,
    connectors: SmallVec<[Option<ConnectorId>; 4]>,
    field_region: Option<RegionId>,
    blocker: Option<BlockerBinding>,
    active: bool,
    body: Option<Box<dyn FlexibleBody>>,
    layouts: HashMap<(usize, bool), LodLayout>,
    pending_history: Option<PersistedHistory>,
    warm_start_remaining: f32,
}

impl FlexController {
    /// Create an inactive controller.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if the shape or simulation
    /// config is out of range.
    pub fn new(name: impl Into<String>, shape: BodyShape, sim: SimulationConfig) -> Result<Self> {
        shape.validate()?;
        sim.validate()?;
        Ok(Self {
            id: next_body_id(),
            name: name.into(),
            shape,
            sim,
            transform: Isometry3::identity(),
            flags: BodyFlags::empty(),
            connectors: SmallVec::from_elem(None, shape.slot_count()),
            field_region: None,
            blocker: None,
            active: false,
            body: None,
            layouts: HashMap::new(),
            pending_history: None,
            warm_start_remaining: sim.warm_start_duration,
        })
    }

    /// Create an inactive rope controller.
    ///
    /// # Errors
    ///
    /// See [`FlexController::new`].
    pub fn new_rope(name: impl Into<String>, config: RopeConfig, sim: SimulationConfig) -> Result<Self> {
        Self::new(name, BodyShape::Rope(config), sim)
    }

    /// Create an inactive cloth controller.
    ///
    /// # Errors
    ///
    /// See [`FlexController::new`].
    pub fn new_cloth(
        name: impl Into<String>,
        config: ClothConfig,
        sim: SimulationConfig,
    ) -> Result<Self> {
        Self::new(name, BodyShape::Cloth(config), sim)
    }

    /// Body identifier, stable across activations.
    #[must_use]
    pub const fn id(&self) -> FlexBodyId {
        self.id
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Geometry.
    #[must_use]
    pub const fn shape(&self) -> &BodyShape {
        &self.shape
    }

    /// Simulation tuning.
    #[must_use]
    pub const fn sim(&self) -> &SimulationConfig {
        &self.sim
    }

    /// Substeps run per frame.
    #[must_use]
    pub const fn substeps_per_frame(&self) -> u32 {
        self.shape.substeps_per_frame()
    }

    /// Whether the controller is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the controller is in editing mode.
    #[must_use]
    pub const fn is_editing(&self) -> bool {
        self.flags.contains(BodyFlags::EDITING)
    }

    /// Current body flags.
    #[must_use]
    pub fn flags(&self) -> BodyFlags {
        match &self.body {
            Some(body) => body.body().flags() | (self.flags & BodyFlags::EDITING),
            None => self.flags,
        }
    }

    /// Warm-start seconds still to run on next activation.
    #[must_use]
    pub const fn warm_start_remaining(&self) -> f32 {
        self.warm_start_remaining
    }

    /// Simulated body, while active and not editing.
    #[must_use]
    pub fn body(&self) -> Option<&dyn FlexibleBody> {
        self.body.as_deref()
    }

    /// Mutable simulated body, while active and not editing.
    pub fn body_mut(&mut self) -> Option<&mut (dyn FlexibleBody + 'static)> {
        self.body.as_deref_mut()
    }

    /// Shared physics state, while active and not editing.
    #[must_use]
    pub fn flex_body(&self) -> Option<&FlexBody> {
        self.body.as_deref().map(FlexibleBody::body)
    }

    /// Enter or leave editing mode. Takes effect on next activation.
    pub fn set_editing(&mut self, editing: bool) {
        self.flags.set(BodyFlags::EDITING, editing);
    }

    /// Ignore (or stop ignoring) force fields.
    pub fn set_force_field_inhibit(&mut self, inhibit: bool) {
        self.flags.set(BodyFlags::FORCE_FIELD_INHIBIT, inhibit);
        if let Some(body) = &mut self.body {
            body.body_mut().set_force_field_inhibit(inhibit);
        }
    }

    /// Move the node.
    pub fn set_transform(&mut self, transform: Isometry3<f32>) {
        self.transform = transform;
        if let Some(body) = &mut self.body {
            body.body_mut().set_transform(transform);
        }
    }

    /// Replace spring and damper constants.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] for out-of-range constants. The
    /// previous constants stay in effect.
    pub fn set_constants(&mut self, springs: SpringConstants, dampers: DamperConstants) -> Result<()> {
        let mut shape = self.shape;
        shape.set_constants(springs, dampers);
        shape.validate()?;
        self.shape = shape;
        if let Some(body) = &mut self.body {
            body.body_mut().set_constants(springs, dampers);
        }
        Ok(())
    }

    /// Region the field query starts from. `None` starts from the region
    /// the caller supplies.
    pub fn set_field_region(&mut self, region: Option<RegionId>) {
        self.field_region = region;
    }

    /// Connect a collision volume, or disconnect with `None`.
    pub fn bind_blocker(&mut self, blocker: Option<BlockerBinding>) {
        if let Some(body) = &mut self.body {
            body.body_mut().bind_blocker(blocker.clone());
        }
        self.blocker = blocker;
    }

    /// Attachment connectors, one per slot.
    #[must_use]
    pub fn connectors(&self) -> &[Option<ConnectorId>] {
        &self.connectors
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.connectors.len() {
            return Err(FlexError::index_out_of_bounds(format!(
                "slot {slot} of {}",
                self.connectors.len()
            )));
        }
        Ok(())
    }

    /// Name the connector a slot resolves on activation.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown slot.
    pub fn set_connector(&mut self, slot: usize, connector: Option<ConnectorId>) -> Result<()> {
        self.check_slot(slot)?;
        self.connectors[slot] = connector;
        if let Some(body) = &mut self.body {
            body.body_mut().set_connector(slot, connector)?;
        }
        Ok(())
    }

    /// Detach a slot at runtime.
    ///
    /// The connector is cleared so the slot stays free on reactivation.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] for an unknown slot.
    pub fn break_attachment(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.connectors[slot] = None;
        if let Some(body) = &mut self.body {
            body.body_mut().break_attachment(slot)?;
        }
        Ok(())
    }

    /// Wake the body.
    pub fn wake(&mut self) {
        self.flags.remove(BodyFlags::ASLEEP | BodyFlags::PRE_ASLEEP);
        if let Some(body) = &mut self.body {
            body.body_mut().wake();
        }
    }

    /// Build the physics buffers and bring the body into the scene.
    ///
    /// Connectors are resolved through `graph`; unresolved ones leave their
    /// particle free. Warm start runs on the first activation only. Editing
    /// controllers become active without physics buffers.
    ///
    /// # Errors
    ///
    /// Returns allocation or configuration errors, and
    /// [`FlexError::NumericalError`] if the warm start diverges. The
    /// controller stays inactive on error.
    pub fn activate(&mut self, graph: &dyn ConnectorGraph) -> Result<()> {
        if self.active {
            return Ok(());
        }
        if self.is_editing() {
            self.active = true;
            info!(body = %self.id, name = %self.name, "activated for editing");
            return Ok(());
        }

        let mut flexible = self.shape.build(&self.name, self.sim)?;
        let body = flexible.body_mut();
        body.id = self.id;
        body.set_transform(self.transform);
        body.flags = self.flags & PERSISTED_FLAGS;
        body.bind_blocker(self.blocker.clone());
        for (slot, connector) in self.connectors.iter().enumerate() {
            body.set_connector(slot, *connector)?;
        }

        if let Some(history) = self.pending_history.take() {
            let restored = history
                .to_points()
                .and_then(|(current, previous)| body.restore_history(current, previous));
            if let Err(err) = restored {
                warn!(body = %self.id, %err, "stored history discarded; starting at rest");
            }
        }

        let attached = body.resolve_attachments(graph);

        let mut warm_started = false;
        if !body.flags().contains(BodyFlags::WARM_STARTED) && self.warm_start_remaining > 0.0 {
            body.warm_start(self.warm_start_remaining)?;
            self.warm_start_remaining = 0.0;
            warm_started = true;
        } else if body.flags().contains(BodyFlags::PRE_ASLEEP) {
            body.sleep();
        }

        self.flags = body.flags() | (self.flags & BodyFlags::EDITING);
        info!(
            body = %self.id,
            name = %self.name,
            particles = body.particle_count(),
            attached,
            warm_started,
            asleep = body.is_asleep(),
            "activated"
        );
        self.body = Some(flexible);
        self.active = true;
        Ok(())
    }

    /// Free the physics buffers.
    ///
    /// Particle history is kept so the next activation resumes where this
    /// one stopped.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        if let Some(flexible) = self.body.take() {
            let body = flexible.body();
            self.flags = (body.flags() & PERSISTED_FLAGS) | (self.flags & BodyFlags::EDITING);
            self.pending_history = Some(PersistedHistory::capture(body.particles()));
        }
        self.active = false;
        info!(body = %self.id, name = %self.name, "deactivated");
    }

    /// Advance the body by one frame's substeps.
    ///
    /// `env.fields`, if present, is queried from this controller's field
    /// region when one is set. Editing controllers do nothing.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::Inactive`] if the controller is not active and
    /// propagates step errors.
    pub fn step(&mut self, input: &StepInput, env: &StepEnv<'_>) -> Result<StepStats> {
        if self.active && self.is_editing() {
            return Ok(StepStats::default());
        }
        let Some(body) = &mut self.body else {
            return Err(FlexError::inactive(self.name.clone()));
        };
        let env = StepEnv {
            fields: env.fields.map(|ctx| FieldContext {
                region: self.field_region.unwrap_or(ctx.region),
                ..ctx
            }),
            impulse_lock: env.impulse_lock,
        };
        body.body_mut().step(input, &env)
    }

    /// Rebuild the render vertex stream into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::Inactive`] if the controller is not active and
    /// propagates mesh errors.
    pub fn reconstruct_into(
        &self,
        request: &ReconstructRequest,
        out: &mut Vec<RenderVertex>,
    ) -> Result<()> {
        match &self.body {
            Some(body) => body.reconstruct_into(request, out),
            None if self.active => self.shape.reconstruct_rest(request, out),
            None => Err(FlexError::inactive(self.name.clone())),
        }
    }

    /// Rebuild the render vertex stream.
    ///
    /// # Errors
    ///
    /// See [`FlexController::reconstruct_into`].
    pub fn reconstruct(&self, request: &ReconstructRequest) -> Result<Vec<RenderVertex>> {
        let mut out = Vec::new();
        self.reconstruct_into(request, &mut out)?;
        Ok(out)
    }

    /// Cached index layout of a tier. Out-of-range tiers are clamped.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::IndexOutOfBounds`] if the tier cannot be indexed
    /// with 32-bit indices.
    pub fn layout(&mut self, lod: usize, include_endcaps: bool) -> Result<&LodLayout> {
        let key = (self.shape.clamp_lod(lod), include_endcaps);
        match self.layouts.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(self.shape.layout(key.0, key.1)?)),
        }
    }

    /// Capture the state that cannot be rebuilt from configuration.
    #[must_use]
    pub fn persist(&self) -> PersistedState {
        let (springs, dampers) = self.shape.constants();
        let body = self.flex_body();
        let attachments = self
            .connectors
            .iter()
            .enumerate()
            .map(|(slot, &connector)| PersistedAttachment {
                slot,
                connector,
                attached: body
                    .and_then(|b| b.attachments().get(slot))
                    .is_some_and(|s| s.is_attached()),
            })
            .collect();
        let history = if self.is_editing() {
            None
        } else {
            body.map(|b| PersistedHistory::capture(b.particles()))
                .or_else(|| self.pending_history.clone())
        };

        PersistedState {
            springs,
            dampers,
            attachments,
            history,
            flags: self.flags() & PERSISTED_FLAGS,
            auto_sleep_timeout: self.sim.auto_sleep_timeout,
            warm_start_remaining: self.warm_start_remaining,
        }
    }

    /// Load persisted state into an inactive controller.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if the controller is active or
    /// the state does not fit this geometry, and
    /// [`FlexError::IndexOutOfBounds`] for an unknown attachment slot.
    pub fn restore(&mut self, state: &PersistedState) -> Result<()> {
        if self.active {
            return Err(FlexError::invalid_config(format!(
                "cannot restore active body {}",
                self.name
            )));
        }
        let mut shape = self.shape;
        shape.set_constants(state.springs, state.dampers);
        shape.validate()?;
        if !state.auto_sleep_timeout.is_finite() || state.auto_sleep_timeout < 0.0 {
            return Err(FlexError::invalid_config("auto-sleep timeout must be >= 0"));
        }
        if let Some(history) = &state.history {
            history.to_points()?;
            if history.len() != shape.particle_count() {
                return Err(FlexError::invalid_config(format!(
                    "stored history has {} particles, body has {}",
                    history.len(),
                    shape.particle_count()
                )));
            }
        }
        let mut connectors: SmallVec<[Option<ConnectorId>; 4]> =
            SmallVec::from_elem(None, shape.slot_count());
        for attachment in &state.attachments {
            let entry = connectors.get_mut(attachment.slot).ok_or_else(|| {
                FlexError::index_out_of_bounds(format!(
                    "slot {} of {}",
                    attachment.slot,
                    shape.slot_count()
                ))
            })?;
            *entry = attachment.connector;
        }

        self.shape = shape;
        self.connectors = connectors;
        self.pending_history = state.history.clone();
        self.flags = (state.flags & PERSISTED_FLAGS) | (self.flags & BodyFlags::EDITING);
        self.sim.auto_sleep_timeout = state.auto_sleep_timeout;
        self.warm_start_remaining = state.warm_start_remaining.max(0.0);
        Ok(())
    }
}
