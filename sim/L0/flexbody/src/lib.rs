//! Mass-spring simulation of ropes and cloth with LOD mesh reconstruction.
//!
//! Ropes and cloth are lattices of point masses joined by damped springs and
//! advanced by a fixed-substep explicit integrator. Each frame the particle
//! state is turned into an interleaved render vertex stream at a chosen level
//! of detail.
//!
//! - **Ropes**: a line of particles, rendered as a swept tube or a cheap
//!   crossed-quad ribbon
//! - **Cloth**: a rectangular grid, rendered two-sided
//!
//! # Physics Model
//!
//! ```text
//! For each substep of length dt:
//!   1. v = (current - previous) / dt
//!   2. F = (wind - v)·drag + m·g
//!   3. F += stretch, shear, bend springs
//!   4. F += force fields (queried once per step)
//!   5. current += (v·(1 - resistance)·dt + F·dt²/(2m))·flexibility
//!   6. clip against the bound blocker volume
//!   7. snap attached particles; accumulate rigid-body reaction impulses
//! ```
//!
//! Flexibility scales the position update only, so a pinned particle still
//! transmits spring and field forces to its neighbours.
//!
//! ## Spring Sets
//!
//! ```text
//!   stretch      shear (cloth)     bend
//!   ●───●        ●   ●             ●───────●
//!                 ╲ ╱
//!                 ╱ ╲
//!                ●   ●
//! ```
//!
//! Stretch rest length is the lattice spacing, shear is `√2` times that and
//! bend is twice that.
//!
//! # Lifecycle
//!
//! A [`FlexController`] owns one rope or cloth node. Activating it builds the
//! physics buffers, resolves attachments through a [`ConnectorGraph`] and
//! runs the one-time warm start. A [`FrameDriver`] steps, reconstructs and
//! finalizes many controllers per frame, in parallel with the `parallel`
//! feature.
//!
//! # Quick Start
//!
//! ```
//! use sim_flexbody::{
//!     ConnectorMap, FlexController, NodeRef, ReconstructRequest, RopeConfig,
//!     SimulationConfig, StepEnv, StepInput,
//! };
//! use nalgebra::{Isometry3, Vector3};
//!
//! let sim = SimulationConfig::default().with_warm_start(0.5);
//! let mut rope = FlexController::new_rope("rope", RopeConfig::rope(2.0, 16), sim)?;
//!
//! // Hang the start of the rope from a fixed hook.
//! let mut scene = ConnectorMap::new();
//! scene.insert(7, NodeRef::Transform(Isometry3::identity()));
//! rope.set_connector(0, Some(7))?;
//! rope.activate(&scene)?;
//!
//! let input = StepInput::new(rope.substeps_per_frame(), Vector3::new(0.0, 0.0, -9.81));
//! rope.step(&input, &StepEnv::default())?;
//! let vertices = rope.reconstruct(&ReconstructRequest::new(0, 1.0))?;
//! assert!(!vertices.is_empty());
//! # Ok::<(), sim_flexbody::FlexError>(())
//! ```
//!
//! # Layer 0 Crate
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**. Scene graphs,
//! spatial structures, rigid-body solvers and job schedulers are reached
//! through the traits in [`field_query`] and [`attachment`].

#![doc(html_root_url = "https://docs.rs/sim-flexbody/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
// Allow precision loss when converting particle indices to f32 - these are small values
#![allow(clippy::cast_precision_loss)]
// Allow sign loss for array indices - we validate bounds
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
// Allow long functions for the integrator and mesh sweeps
#![allow(clippy::too_many_lines)]
// Allow unused self for trait implementations
#![allow(clippy::unused_self)]
// Allow needless pass by ref mut for trait compliance
#![allow(clippy::needless_pass_by_ref_mut)]
// Allow pass by value for small Copy types
#![allow(clippy::needless_pass_by_value)]
// Test-related lints - these are style preferences
#![cfg_attr(test, allow(clippy::uninlined_format_args, clippy::float_cmp))]

pub mod attachment;
pub mod blocker;
pub mod body;
pub mod cloth;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod field_query;
pub mod force;
pub mod integrator;
pub mod mesh;
pub mod particles;
pub mod persist;
pub mod rope;
pub mod springs;
pub mod types;
pub mod warm_start;

// Re-export main types at crate root
pub use attachment::{
    AttachTarget, AttachmentSlot, ConnectorGraph, ConnectorId, ConnectorMap, ImpulseLock,
    NodeRef, PathTarget, RigidBodyTarget,
};
pub use blocker::{Blocker, BlockerBinding, PlaneBlocker, SphereBlocker};
pub use body::{BodyMaterial, FlexBody, FlexibleBody};
pub use cloth::{Cloth, ClothEdge};
pub use config::{
    ClothConfig, CrossSection, DamperConstants, RopeConfig, SimulationConfig, SpringConstants,
};
pub use controller::{BodyShape, FlexController};
pub use driver::{FrameDriver, FrameEnv, FrameInput, FrameReport, RenderBuffer, SharedFields};
pub use error::{FlexError, Result};
pub use field_query::{
    FieldContext, FieldHierarchy, FieldId, FieldVisitMask, RegionId, RegionTree, query_fields,
};
pub use force::{
    BuoyancyField, FieldKind, ForceField, ForceSource, GravityField, ParticleBatch, RigidForce,
    WindField,
};
pub use integrator::{StepEnv, StepInput, StepStats};
pub use mesh::{LodLayout, ReconstructRequest, RenderVertex};
pub use particles::{FlexibilityMask, ParticleHistory};
pub use persist::{PersistedAttachment, PersistedHistory, PersistedState};
pub use rope::Rope;
pub use springs::{Lattice, Spring, SpringKind, SpringNetwork};
pub use types::{BodyFlags, BoundingSphere, FlexBodyId, RigidBodyState};
pub use warm_start::WarmStartReport;
