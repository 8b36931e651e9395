//! Configuration for rope and cloth simulation.
//!
//! - [`SimulationConfig`] - Integration tuning shared by every body kind
//! - [`RopeConfig`] - Rope geometry, springs and render cross-section
//! - [`ClothConfig`] - Cloth lattice, springs and render thickness
//!
//! All configs provide `Default`, a handful of named presets, `with_*`
//! setters and a `validate()` that reports [`FlexError::InvalidConfig`].

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FlexError, Result};

/// Upper bound on worker-thread slots a field visit mask can track.
pub const MAX_THREAD_SLOTS: usize = 64;

/// Integration tuning shared by ropes and cloth.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig {
    /// Fixed substep quantum in milliseconds.
    pub substep_ms: f32,
    /// Drag coefficient against the ambient wind (N·s/m).
    pub wind_drag: f32,
    /// Fraction of velocity lost per substep, in `[0, 1)`.
    pub internal_resistance: f32,
    /// Multiplier applied to gravity before it becomes a force.
    pub gravity_multiplier: f32,
    /// Gravity used when the body runs without a scheduler (warm start).
    pub gravity: Vector3<f32>,
    /// Seconds of stillness before a body falls asleep. 0 disables.
    pub auto_sleep_timeout: f32,
    /// Particle speed below which a body counts as still (m/s).
    pub sleep_velocity: f32,
    /// Net force per particle below which a warm-started body is settled (N).
    pub settle_force: f32,
    /// Seconds of pre-simulation run before first display. 0 disables.
    pub warm_start_duration: f32,
    /// Number of worker threads that may step bodies concurrently.
    pub max_worker_threads: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            substep_ms: 5.0,
            wind_drag: 0.02,
            internal_resistance: 0.002,
            gravity_multiplier: 1.0,
            gravity: Vector3::new(0.0, 0.0, -9.81),
            auto_sleep_timeout: 2.0,
            sleep_velocity: 0.01,
            settle_force: 0.05,
            warm_start_duration: 0.0,
            max_worker_threads: 8,
        }
    }
}

impl SimulationConfig {
    /// Substep duration in seconds.
    #[must_use]
    pub fn substep_seconds(&self) -> f32 {
        self.substep_ms * 1.0e-3
    }

    /// Set the substep quantum in milliseconds.
    #[must_use]
    pub const fn with_substep_ms(mut self, substep_ms: f32) -> Self {
        self.substep_ms = substep_ms;
        self
    }

    /// Set the warm-start duration in seconds.
    #[must_use]
    pub const fn with_warm_start(mut self, seconds: f32) -> Self {
        self.warm_start_duration = seconds;
        self
    }

    /// Set the gravity used outside of scheduler steps.
    #[must_use]
    pub const fn with_gravity(mut self, gravity: Vector3<f32>) -> Self {
        self.gravity = gravity;
        self
    }

    /// Set the auto-sleep timeout in seconds.
    #[must_use]
    pub const fn with_auto_sleep(mut self, seconds: f32) -> Self {
        self.auto_sleep_timeout = seconds;
        self
    }

    /// Set the number of worker-thread slots.
    #[must_use]
    pub const fn with_max_worker_threads(mut self, threads: usize) -> Self {
        self.max_worker_threads = threads;
        self
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !(self.substep_ms.is_finite() && self.substep_ms > 0.0) {
            return Err(FlexError::invalid_config(format!(
                "substep_ms must be positive, got {}",
                self.substep_ms
            )));
        }
        if !(0.0..1.0).contains(&self.internal_resistance) {
            return Err(FlexError::invalid_config(format!(
                "internal_resistance must be in [0, 1), got {}",
                self.internal_resistance
            )));
        }
        if self.wind_drag < 0.0 || self.auto_sleep_timeout < 0.0 || self.warm_start_duration < 0.0
        {
            return Err(FlexError::invalid_config(
                "wind_drag, auto_sleep_timeout and warm_start_duration must be non-negative",
            ));
        }
        if self.max_worker_threads == 0 || self.max_worker_threads > MAX_THREAD_SLOTS {
            return Err(FlexError::invalid_config(format!(
                "max_worker_threads must be in 1..={MAX_THREAD_SLOTS}, got {}",
                self.max_worker_threads
            )));
        }
        Ok(())
    }
}

/// Spring constants (N/m) for the three spring sets.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpringConstants {
    /// Adjacent-particle springs.
    pub stretch: f32,
    /// Diagonal springs (cloth only).
    pub shear: f32,
    /// Springs between particles two apart.
    pub bend: f32,
}

impl SpringConstants {
    /// Create a new set of spring constants.
    #[must_use]
    pub const fn new(stretch: f32, shear: f32, bend: f32) -> Self {
        Self {
            stretch,
            shear,
            bend,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if [self.stretch, self.shear, self.bend]
            .iter()
            .any(|k| !k.is_finite() || *k < 0.0)
        {
            return Err(FlexError::invalid_config(format!(
                "{what} constants must be finite and non-negative"
            )));
        }
        Ok(())
    }
}

/// Damper constants (N·s/m) for the three spring sets.
pub type DamperConstants = SpringConstants;

/// Render cross-section of a rope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CrossSection {
    /// Closed tube with the given number of sides.
    Tube {
        /// Vertices around the ring (at least 3).
        sides: u32,
    },
    /// Two perpendicular ribbons.
    Cross,
}

/// Rope geometry and material.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RopeConfig {
    /// Rest length of the whole rope (m).
    pub length: f32,
    /// Number of segments (particles = segments + 1).
    pub segments: usize,
    /// Render and collision radius (m).
    pub radius: f32,
    /// Mass of each particle (kg).
    pub particle_mass: f32,
    /// Spring constants.
    pub springs: SpringConstants,
    /// Damper constants.
    pub dampers: DamperConstants,
    /// Render cross-section.
    pub cross_section: CrossSection,
    /// Number of LOD tiers including the high tier.
    pub lod_levels: usize,
    /// Substeps per logical update.
    pub substeps_per_frame: u32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self::rope(2.0, 16)
    }
}

impl RopeConfig {
    /// Fibre rope: moderate stretch, light bending resistance.
    #[must_use]
    pub const fn rope(length: f32, segments: usize) -> Self {
        Self {
            length,
            segments,
            radius: 0.02,
            particle_mass: 0.05,
            springs: SpringConstants::new(200.0, 0.0, 10.0),
            dampers: DamperConstants::new(0.4, 0.0, 0.05),
            cross_section: CrossSection::Tube { sides: 8 },
            lod_levels: 3,
            substeps_per_frame: 4,
        }
    }

    /// Steel cable: stiff and heavy.
    #[must_use]
    pub const fn cable(length: f32, segments: usize) -> Self {
        Self {
            length,
            segments,
            radius: 0.01,
            particle_mass: 0.12,
            springs: SpringConstants::new(600.0, 0.0, 60.0),
            dampers: DamperConstants::new(1.0, 0.0, 0.2),
            cross_section: CrossSection::Tube { sides: 6 },
            lod_levels: 3,
            substeps_per_frame: 6,
        }
    }

    /// Link chain: no bending resistance, rendered as crossed ribbons.
    #[must_use]
    pub const fn chain(length: f32, segments: usize) -> Self {
        Self {
            length,
            segments,
            radius: 0.015,
            particle_mass: 0.2,
            springs: SpringConstants::new(400.0, 0.0, 0.0),
            dampers: DamperConstants::new(0.8, 0.0, 0.0),
            cross_section: CrossSection::Cross,
            lod_levels: 2,
            substeps_per_frame: 4,
        }
    }

    /// Set the spring constants.
    #[must_use]
    pub const fn with_springs(mut self, springs: SpringConstants) -> Self {
        self.springs = springs;
        self
    }

    /// Set the damper constants.
    #[must_use]
    pub const fn with_dampers(mut self, dampers: DamperConstants) -> Self {
        self.dampers = dampers;
        self
    }

    /// Set the particle mass.
    #[must_use]
    pub const fn with_particle_mass(mut self, mass: f32) -> Self {
        self.particle_mass = mass;
        self
    }

    /// Set the render cross-section.
    #[must_use]
    pub const fn with_cross_section(mut self, cross_section: CrossSection) -> Self {
        self.cross_section = cross_section;
        self
    }

    /// Distance between neighbouring particles at rest.
    #[must_use]
    pub fn spacing(&self) -> f32 {
        self.length / self.segments.max(1) as f32
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] or [`FlexError::InvalidTopology`].
    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(FlexError::invalid_topology("rope needs at least one segment"));
        }
        if !(self.length.is_finite() && self.length > 0.0) {
            return Err(FlexError::invalid_config("rope length must be positive"));
        }
        if !(self.particle_mass.is_finite() && self.particle_mass > 0.0) {
            return Err(FlexError::invalid_config("particle mass must be positive"));
        }
        if let CrossSection::Tube { sides } = self.cross_section {
            if sides < 3 {
                return Err(FlexError::invalid_config("tube needs at least 3 sides"));
            }
        }
        if self.lod_levels == 0 {
            return Err(FlexError::invalid_config("at least one LOD tier is required"));
        }
        self.springs.validate("spring")?;
        self.dampers.validate("damper")
    }
}

/// Cloth lattice and material.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClothConfig {
    /// Extent along the column axis (m).
    pub width: f32,
    /// Extent along the row axis (m).
    pub height: f32,
    /// Particles per row.
    pub cols: usize,
    /// Particles per column.
    pub rows: usize,
    /// Collision radius of each particle (m).
    pub thickness: f32,
    /// Mass of each particle (kg).
    pub particle_mass: f32,
    /// Spring constants.
    pub springs: SpringConstants,
    /// Damper constants.
    pub dampers: DamperConstants,
    /// Number of LOD tiers including the high tier.
    pub lod_levels: usize,
    /// Substeps per logical update.
    pub substeps_per_frame: u32,
}

impl Default for ClothConfig {
    fn default() -> Self {
        Self::cotton(1.0, 1.0, 12, 12)
    }
}

impl ClothConfig {
    /// Cotton: medium weight, soft bending.
    #[must_use]
    pub const fn cotton(width: f32, height: f32, cols: usize, rows: usize) -> Self {
        Self {
            width,
            height,
            cols,
            rows,
            thickness: 0.005,
            particle_mass: 0.02,
            springs: SpringConstants::new(120.0, 40.0, 4.0),
            dampers: DamperConstants::new(0.15, 0.05, 0.01),
            lod_levels: 3,
            substeps_per_frame: 2,
        }
    }

    /// Silk: light and very flexible.
    #[must_use]
    pub const fn silk(width: f32, height: f32, cols: usize, rows: usize) -> Self {
        Self {
            width,
            height,
            cols,
            rows,
            thickness: 0.002,
            particle_mass: 0.005,
            springs: SpringConstants::new(40.0, 10.0, 0.5),
            dampers: DamperConstants::new(0.04, 0.01, 0.002),
            lod_levels: 3,
            substeps_per_frame: 2,
        }
    }

    /// Canvas: heavy, stiff bending.
    #[must_use]
    pub const fn canvas(width: f32, height: f32, cols: usize, rows: usize) -> Self {
        Self {
            width,
            height,
            cols,
            rows,
            thickness: 0.01,
            particle_mass: 0.06,
            springs: SpringConstants::new(300.0, 120.0, 30.0),
            dampers: DamperConstants::new(0.4, 0.15, 0.05),
            lod_levels: 3,
            substeps_per_frame: 3,
        }
    }

    /// Set the spring constants.
    #[must_use]
    pub const fn with_springs(mut self, springs: SpringConstants) -> Self {
        self.springs = springs;
        self
    }

    /// Set the damper constants.
    #[must_use]
    pub const fn with_dampers(mut self, dampers: DamperConstants) -> Self {
        self.dampers = dampers;
        self
    }

    /// Set the particle mass.
    #[must_use]
    pub const fn with_particle_mass(mut self, mass: f32) -> Self {
        self.particle_mass = mass;
        self
    }

    /// Particle spacing along columns and rows.
    #[must_use]
    pub fn axis_spacing(&self) -> (f32, f32) {
        (
            self.width / self.cols.saturating_sub(1).max(1) as f32,
            self.height / self.rows.saturating_sub(1).max(1) as f32,
        )
    }

    /// Shared stretch rest length: the smaller of the two axis spacings.
    #[must_use]
    pub fn spacing(&self) -> f32 {
        let (dx, dy) = self.axis_spacing();
        dx.min(dy)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] or [`FlexError::InvalidTopology`].
    pub fn validate(&self) -> Result<()> {
        if self.cols < 2 || self.rows < 2 {
            return Err(FlexError::invalid_topology(format!(
                "cloth lattice must be at least 2x2, got {}x{}",
                self.cols, self.rows
            )));
        }
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err(FlexError::invalid_config("cloth extent must be positive"));
        }
        if !(self.particle_mass.is_finite() && self.particle_mass > 0.0) {
            return Err(FlexError::invalid_config("particle mass must be positive"));
        }
        if self.lod_levels == 0 {
            return Err(FlexError::invalid_config("at least one LOD tier is required"));
        }
        self.springs.validate("spring")?;
        self.dampers.validate("damper")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simulation_defaults_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_relative_eq!(config.substep_seconds(), 0.005);
    }

    #[test]
    fn test_simulation_rejects_bad_threads() {
        let config = SimulationConfig::default().with_max_worker_threads(65);
        assert!(matches!(config.validate(), Err(FlexError::InvalidConfig(_))));

        let config = SimulationConfig::default().with_max_worker_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_simulation_rejects_bad_substep() {
        let config = SimulationConfig::default().with_substep_ms(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rope_presets() {
        let rope = RopeConfig::rope(2.0, 16);
        let cable = RopeConfig::cable(2.0, 16);
        let chain = RopeConfig::chain(2.0, 16);

        assert!(cable.springs.stretch > rope.springs.stretch);
        assert_eq!(chain.springs.bend, 0.0);
        assert_eq!(chain.cross_section, CrossSection::Cross);
        assert!(rope.validate().is_ok());
        assert_relative_eq!(rope.spacing(), 0.125);
    }

    #[test]
    fn test_rope_validation() {
        let mut rope = RopeConfig::default();
        rope.segments = 0;
        assert!(matches!(rope.validate(), Err(FlexError::InvalidTopology(_))));

        let rope = RopeConfig::default().with_cross_section(CrossSection::Tube { sides: 2 });
        assert!(rope.validate().is_err());

        let rope = RopeConfig::default().with_springs(SpringConstants::new(-1.0, 0.0, 0.0));
        assert!(rope.validate().is_err());
    }

    #[test]
    fn test_cloth_spacing_uses_minimum() {
        let cloth = ClothConfig::cotton(2.0, 1.0, 5, 5);
        let (dx, dy) = cloth.axis_spacing();
        assert_relative_eq!(dx, 0.5);
        assert_relative_eq!(dy, 0.25);
        assert_relative_eq!(cloth.spacing(), 0.25);
    }

    #[test]
    fn test_cloth_presets() {
        let silk = ClothConfig::silk(1.0, 1.0, 8, 8);
        let canvas = ClothConfig::canvas(1.0, 1.0, 8, 8);
        assert!(silk.particle_mass < canvas.particle_mass);
        assert!(silk.springs.bend < canvas.springs.bend);
    }

    #[test]
    fn test_cloth_validation() {
        let cloth = ClothConfig::cotton(1.0, 1.0, 1, 4);
        assert!(matches!(cloth.validate(), Err(FlexError::InvalidTopology(_))));
    }
}
