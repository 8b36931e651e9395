//! Ropes: a single line of particles.
//!
//! ```text
//!   slot 0                                   slot 1
//!     ●────●────●────●────●────●────●────●────●
//!     0    1    2   ...                       n-1
//! ```
//!
//! Particles are laid out along the body's local +X axis at
//! `length / segments` spacing. The two ends carry attachment slots
//! [`Rope::START`] and [`Rope::END`].

use nalgebra::Point3;

use crate::body::{BodyMaterial, FlexBody, FlexibleBody};
use crate::config::{RopeConfig, SimulationConfig};
use crate::error::Result;
use crate::mesh::rope::{RopeSection, reconstruct};
use crate::mesh::{LodLayout, ReconstructRequest, RenderVertex};
use crate::springs::Lattice;

/// Rest positions of a rope's particles.
#[must_use]
pub fn rest_positions(config: &RopeConfig) -> Vec<Point3<f32>> {
    let spacing = config.spacing();
    (0..=config.segments)
        .map(|i| Point3::new(i as f32 * spacing, 0.0, 0.0))
        .collect()
}

/// A simulated rope.
#[derive(Debug, Clone)]
pub struct Rope {
    config: RopeConfig,
    body: FlexBody,
}

impl Rope {
    /// Attachment slot of the first particle.
    pub const START: usize = 0;
    /// Attachment slot of the last particle.
    pub const END: usize = 1;

    /// Build a rope at rest along local +X.
    ///
    /// # Errors
    ///
    /// Returns configuration, topology or allocation errors.
    pub fn new(name: impl Into<String>, config: RopeConfig, sim: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let positions = rest_positions(&config);
        let material = BodyMaterial {
            particle_mass: config.particle_mass,
            radius: config.radius,
            springs: config.springs,
            dampers: config.dampers,
        };
        let mut body = FlexBody::new(
            name,
            Lattice::Line {
                count: positions.len(),
            },
            config.spacing(),
            &positions,
            material,
            sim,
            true,
        )?;
        body.add_attachment_slot(0)?;
        body.add_attachment_slot(config.segments)?;
        Ok(Self { config, body })
    }

    /// Rope configuration.
    #[must_use]
    pub const fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Render section parameters.
    #[must_use]
    pub const fn section(&self) -> RopeSection {
        RopeSection {
            radius: self.config.radius,
            cross_section: self.config.cross_section,
        }
    }

    /// Current body-local positions of both ends.
    #[must_use]
    pub fn ends(&self) -> (Point3<f32>, Point3<f32>) {
        let positions = self.body.positions();
        (positions[0], positions[positions.len() - 1])
    }

    /// Current rope length measured along the particles.
    #[must_use]
    pub fn current_length(&self) -> f32 {
        self.body
            .positions()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).norm())
            .sum()
    }
}

impl FlexibleBody for Rope {
    fn body(&self) -> &FlexBody {
        &self.body
    }

    fn body_mut(&mut self) -> &mut FlexBody {
        &mut self.body
    }

    fn lod_levels(&self) -> usize {
        self.config.lod_levels
    }

    fn layout(&self, lod: usize, include_endcaps: bool) -> Result<LodLayout> {
        self.section()
            .layout(self.body.particle_count(), self.clamp_lod(lod), include_endcaps)
    }

    fn reconstruct_into(
        &self,
        request: &ReconstructRequest,
        out: &mut Vec<RenderVertex>,
    ) -> Result<()> {
        let mut positions = Vec::new();
        let mut velocities = Vec::new();
        self.body.render_samples(
            request.fraction,
            request.frame_time,
            &mut positions,
            &mut velocities,
        );
        reconstruct(
            &self.section(),
            &positions,
            &velocities,
            self.clamp_lod(request.lod),
            request.include_endcaps,
            out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossSection;
    use approx::assert_relative_eq;

    #[test]
    fn test_rope_layout() {
        let rope = Rope::new("r", RopeConfig::rope(2.0, 8), SimulationConfig::default()).unwrap();
        let body = rope.body();

        assert_eq!(body.particle_count(), 9);
        assert_eq!(body.attachments().len(), 2);
        assert_eq!(body.attachments()[Rope::END].particle, 8);
        assert_relative_eq!(rope.current_length(), 2.0, epsilon = 1e-5);
        assert_relative_eq!(rope.ends().1.x, 2.0, epsilon = 1e-5);
        assert!(body.particles().initial().is_some());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = RopeConfig::default();
        config.segments = 0;
        assert!(Rope::new("r", config, SimulationConfig::default()).is_err());
    }

    #[test]
    fn test_reconstruct_clamps_lod() {
        let config = RopeConfig::chain(1.0, 8);
        let rope = Rope::new("c", config, SimulationConfig::default()).unwrap();
        assert_eq!(config.cross_section, CrossSection::Cross);

        let mut out = Vec::new();
        rope.reconstruct_into(&ReconstructRequest::new(10, 1.0), &mut out)
            .unwrap();
        let layout = rope.layout(10, true).unwrap();
        assert_eq!(layout.lod(), config.lod_levels - 1);
        assert_eq!(out.len(), layout.vertex_count());
    }
}
