//! Cloth: a rectangular particle grid.
//!
//! Particles are row-major in the body's local XY plane:
//!
//! ```text
//!  row rows-1  ●───●───●   ← Top
//!              |╲ ╱|╲ ╱|
//!              |╱ ╲|╱ ╲|
//!  row 0       ●───●───●   ← Bottom
//!              ↑       ↑
//!            Left    Right
//! ```
//!
//! Particle `(col, row)` sits at `(col·dx, row·dy, 0)`. The four corners
//! carry attachment slots in the order bottom-left, bottom-right, top-left,
//! top-right.

use nalgebra::Point3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::body::{BodyMaterial, FlexBody, FlexibleBody};
use crate::config::{ClothConfig, SimulationConfig};
use crate::error::Result;
use crate::mesh::{LodLayout, ReconstructRequest, RenderVertex, cloth};
use crate::springs::Lattice;

/// An edge of the cloth grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ClothEdge {
    /// Last row.
    Top,
    /// First row.
    Bottom,
    /// First column.
    Left,
    /// Last column.
    Right,
}

/// Rest positions of a cloth's particles.
#[must_use]
pub fn rest_positions(config: &ClothConfig) -> Vec<Point3<f32>> {
    let (dx, dy) = config.axis_spacing();
    (0..config.rows)
        .flat_map(|r| (0..config.cols).map(move |c| Point3::new(c as f32 * dx, r as f32 * dy, 0.0)))
        .collect()
}

/// A simulated cloth.
#[derive(Debug, Clone)]
pub struct Cloth {
    config: ClothConfig,
    body: FlexBody,
}

impl Cloth {
    /// Build a flat cloth at rest.
    ///
    /// # Errors
    ///
    /// Returns configuration, topology or allocation errors.
    pub fn new(
        name: impl Into<String>,
        config: ClothConfig,
        sim: SimulationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let positions = rest_positions(&config);
        let material = BodyMaterial {
            particle_mass: config.particle_mass,
            radius: config.thickness,
            springs: config.springs,
            dampers: config.dampers,
        };
        let mut body = FlexBody::new(
            name,
            Lattice::Grid {
                cols: config.cols,
                rows: config.rows,
            },
            config.spacing(),
            &positions,
            material,
            sim,
            false,
        )?;

        let (last_col, last_row) = (config.cols - 1, config.rows - 1);
        for (c, r) in [(0, 0), (last_col, 0), (0, last_row), (last_col, last_row)] {
            body.add_attachment_slot(r * config.cols + c)?;
        }
        Ok(Self { config, body })
    }

    /// Cloth configuration.
    #[must_use]
    pub const fn config(&self) -> &ClothConfig {
        &self.config
    }

    /// Particle index of `(col, row)`, if inside the grid.
    #[must_use]
    pub fn grid_index(&self, col: usize, row: usize) -> Option<usize> {
        (col < self.config.cols && row < self.config.rows).then(|| row * self.config.cols + col)
    }

    /// Particle indices along an edge.
    #[must_use]
    pub fn edge_indices(&self, edge: ClothEdge) -> Vec<usize> {
        let (cols, rows) = (self.config.cols, self.config.rows);
        match edge {
            ClothEdge::Bottom => (0..cols).collect(),
            ClothEdge::Top => ((rows - 1) * cols..rows * cols).collect(),
            ClothEdge::Left => (0..rows).map(|r| r * cols).collect(),
            ClothEdge::Right => (0..rows).map(|r| r * cols + cols - 1).collect(),
        }
    }

    /// Pin every particle along an edge.
    pub fn pin_edge(&mut self, edge: ClothEdge) {
        for i in self.edge_indices(edge) {
            self.body.flexibility_mut().pin(i);
        }
    }

    /// Pin the four corners.
    pub fn pin_corners(&mut self) {
        let corners: Vec<usize> = self.body.attachments().iter().map(|s| s.particle).collect();
        for i in corners {
            self.body.flexibility_mut().pin(i);
        }
    }
}

impl FlexibleBody for Cloth {
    fn body(&self) -> &FlexBody {
        &self.body
    }

    fn body_mut(&mut self) -> &mut FlexBody {
        &mut self.body
    }

    fn lod_levels(&self) -> usize {
        self.config.lod_levels
    }

    fn layout(&self, lod: usize, _include_endcaps: bool) -> Result<LodLayout> {
        cloth::layout(self.config.cols, self.config.rows, self.clamp_lod(lod))
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
        cloth::reconstruct(
            self.config.cols,
            self.config.rows,
            &positions,
            &velocities,
            self.clamp_lod(request.lod),
            out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cloth() -> Cloth {
        Cloth::new(
            "c",
            ClothConfig::cotton(1.0, 0.5, 5, 3),
            SimulationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_grid_layout() {
        let cloth = cloth();
        let body = cloth.body();
        assert_eq!(body.particle_count(), 15);
        assert_eq!(cloth.grid_index(4, 2), Some(14));
        assert_eq!(cloth.grid_index(5, 0), None);

        let p = body.positions()[cloth.grid_index(4, 2).unwrap()];
        assert_relative_eq!(p.x, 1.0);
        assert_relative_eq!(p.y, 0.5);
        assert!(body.particles().initial().is_none());
    }

    #[test]
    fn test_corner_slots() {
        let cloth = cloth();
        let corners: Vec<_> = cloth.body().attachments().iter().map(|s| s.particle).collect();
        assert_eq!(corners, vec![0, 4, 10, 14]);
    }

    #[test]
    fn test_pin_edges() {
        let mut cloth = cloth();
        cloth.pin_edge(ClothEdge::Top);
        let mask = cloth.body().flexibility();
        assert!((10..15).all(|i| mask.is_pinned(i)));
        assert!(!mask.is_pinned(5));

        let mut cloth = self::cloth();
        cloth.pin_edge(ClothEdge::Right);
        assert_eq!(cloth.edge_indices(ClothEdge::Right), vec![4, 9, 14]);
        assert!(cloth.body().flexibility().is_pinned(9));

        let mut cloth = self::cloth();
        cloth.pin_corners();
        assert!(cloth.body().flexibility().is_pinned(10));
        assert!(!cloth.body().flexibility().is_pinned(7));
    }

    #[test]
    fn test_reconstruct_two_sided() {
        let cloth = cloth();
        let mut out = Vec::new();
        cloth
            .reconstruct_into(&ReconstructRequest::default(), &mut out)
            .unwrap();
        assert_eq!(out.len(), 30);
        assert_relative_eq!(out[0].normal[2], 1.0, epsilon = 1e-6);
        assert_relative_eq!(out[15].normal[2], -1.0, epsilon = 1e-6);
    }
}
