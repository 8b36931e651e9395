//! Spring topology for ropes and cloth.
//!
//! Three disjoint spring sets connect the particle lattice:
//!
//! ```text
//! stretch        shear          bend
//! ●───●───●      ●   ●   ●      ●───────●
//! |   |   |       \ / \ /       |
//! ●───●───●       / \ / \       |
//!                ●   ●   ●      ●
//! ```
//!
//! - **Stretch**: adjacent particles, rest length `s`
//! - **Shear** (cloth only): diagonal neighbours, rest length `s·√2`
//! - **Bend**: particles two apart along a row or column, rest length `2s`
//!
//! Rest lengths are fixed at construction. The network is only rebuilt when
//! the lattice dimensions change.

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FlexError, Result};

/// Which set a spring belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SpringKind {
    /// Adjacent particles.
    Stretch,
    /// Diagonal neighbours.
    Shear,
    /// Particles two apart.
    Bend,
}

/// An unordered particle pair with a rest length.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spring {
    /// First particle index.
    pub a: usize,
    /// Second particle index.
    pub b: usize,
    /// Rest length.
    pub rest_length: f32,
}

impl Spring {
    /// Create a new spring.
    #[must_use]
    pub const fn new(a: usize, b: usize, rest_length: f32) -> Self {
        Self { a, b, rest_length }
    }

    /// Current length given particle positions.
    #[must_use]
    pub fn length(&self, positions: &[Point3<f32>]) -> f32 {
        (positions[self.b] - positions[self.a]).norm()
    }
}

/// Force that spring `(a, b)` applies to endpoint `a`.
///
/// `b` receives the negation. The stretch term is
/// `delta · k · (1 − rest / |delta|)` and the damper acts on the relative
/// velocity projected onto the spring axis.
///
/// Endpoints must not coincide.
#[inline]
#[must_use]
pub fn spring_force(
    delta: Vector3<f32>,
    relative_velocity: Vector3<f32>,
    rest_length: f32,
    stiffness: f32,
    damping: f32,
) -> Vector3<f32> {
    let length_sq = delta.norm_squared();
    // Non-finite state is reported by the integrator after the substep.
    debug_assert!(length_sq.is_nan() || length_sq > 0.0, "spring endpoints coincide");

    let inv_length = length_sq.sqrt().recip();
    let axis = delta * inv_length;

    let stretch = delta * (stiffness * (1.0 - rest_length * inv_length));
    let damper = axis * (damping * relative_velocity.dot(&axis));
    stretch + damper
}

/// Lattice shape a network was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Lattice {
    /// A single row of particles.
    Line {
        /// Particle count.
        count: usize,
    },
    /// A `cols × rows` grid, row-major (`index = row * cols + col`).
    Grid {
        /// Particles per row.
        cols: usize,
        /// Particles per column.
        rows: usize,
    },
}

impl Lattice {
    /// Number of particles in the lattice.
    #[must_use]
    pub const fn particle_count(&self) -> usize {
        match *self {
            Self::Line { count } => count,
            Self::Grid { cols, rows } => cols * rows,
        }
    }
}

/// Stretch, shear and bend springs of one body.
#[derive(Debug, Clone, PartialEq)]
pub struct SpringNetwork {
    lattice: Lattice,
    spacing: f32,
    stretch: Vec<Spring>,
    shear: Vec<Spring>,
    bend: Vec<Spring>,
}

impl SpringNetwork {
    /// Build the network for a lattice with the given stretch rest length.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidTopology`] for lattices with fewer than
    /// two particles along any used axis, or a non-positive spacing.
    pub fn build(lattice: Lattice, spacing: f32) -> Result<Self> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(FlexError::invalid_topology(format!(
                "spring spacing must be positive, got {spacing}"
            )));
        }
        match lattice {
            Lattice::Line { count } => Self::line(count, spacing),
            Lattice::Grid { cols, rows } => Self::grid(cols, rows, spacing),
        }
    }

    fn line(count: usize, spacing: f32) -> Result<Self> {
        if count < 2 {
            return Err(FlexError::invalid_topology(format!(
                "rope needs at least 2 particles, got {count}"
            )));
        }

        let mut stretch = Vec::new();
        stretch.try_reserve_exact(count - 1)?;
        stretch.extend((0..count - 1).map(|i| Spring::new(i, i + 1, spacing)));

        let bend_len = spacing * 2.0;
        let mut bend = Vec::new();
        bend.try_reserve_exact(count.saturating_sub(2))?;
        bend.extend((0..count.saturating_sub(2)).map(|i| Spring::new(i, i + 2, bend_len)));

        Ok(Self {
            lattice: Lattice::Line { count },
            spacing,
            stretch,
            shear: Vec::new(),
            bend,
        })
    }

    fn grid(cols: usize, rows: usize, spacing: f32) -> Result<Self> {
        if cols < 2 || rows < 2 {
            return Err(FlexError::invalid_topology(format!(
                "cloth lattice must be at least 2x2, got {cols}x{rows}"
            )));
        }
        let idx = |c: usize, r: usize| r * cols + c;

        let mut stretch = Vec::new();
        stretch.try_reserve_exact((cols - 1) * rows + cols * (rows - 1))?;
        for r in 0..rows {
            for c in 0..cols - 1 {
                stretch.push(Spring::new(idx(c, r), idx(c + 1, r), spacing));
            }
        }
        for r in 0..rows - 1 {
            for c in 0..cols {
                stretch.push(Spring::new(idx(c, r), idx(c, r + 1), spacing));
            }
        }

        let diagonal = spacing * std::f32::consts::SQRT_2;
        let mut shear = Vec::new();
        shear.try_reserve_exact(2 * (cols - 1) * (rows - 1))?;
        for r in 0..rows - 1 {
            for c in 0..cols - 1 {
                shear.push(Spring::new(idx(c, r), idx(c + 1, r + 1), diagonal));
                shear.push(Spring::new(idx(c + 1, r), idx(c, r + 1), diagonal));
            }
        }

        let bend_len = spacing * 2.0;
        let mut bend = Vec::new();
        bend.try_reserve_exact(cols.saturating_sub(2) * rows + cols * rows.saturating_sub(2))?;
        for r in 0..rows {
            for c in 0..cols.saturating_sub(2) {
                bend.push(Spring::new(idx(c, r), idx(c + 2, r), bend_len));
            }
        }
        for r in 0..rows.saturating_sub(2) {
            for c in 0..cols {
                bend.push(Spring::new(idx(c, r), idx(c, r + 2), bend_len));
            }
        }

        Ok(Self {
            lattice: Lattice::Grid { cols, rows },
            spacing,
            stretch,
            shear,
            bend,
        })
    }

    /// Rebuild only if the lattice dimensions changed.
    ///
    /// Returns `true` when the network was rebuilt.
    ///
    /// # Errors
    ///
    /// Propagates [`SpringNetwork::build`] errors.
    pub fn rebuild_if_changed(&mut self, lattice: Lattice, spacing: f32) -> Result<bool> {
        if self.lattice == lattice {
            return Ok(false);
        }
        *self = Self::build(lattice, spacing)?;
        Ok(true)
    }

    /// Lattice this network was built for.
    #[must_use]
    pub const fn lattice(&self) -> Lattice {
        self.lattice
    }

    /// Stretch rest length.
    #[must_use]
    pub const fn spacing(&self) -> f32 {
        self.spacing
    }

    /// Springs of one kind.
    #[must_use]
    pub fn springs(&self, kind: SpringKind) -> &[Spring] {
        match kind {
            SpringKind::Stretch => &self.stretch,
            SpringKind::Shear => &self.shear,
            SpringKind::Bend => &self.bend,
        }
    }

    /// All sets in integration order: stretch, shear, bend.
    #[must_use]
    pub fn sets(&self) -> [(SpringKind, &[Spring]); 3] {
        [
            (SpringKind::Stretch, &self.stretch),
            (SpringKind::Shear, &self.shear),
            (SpringKind::Bend, &self.bend),
        ]
    }

    /// Total number of springs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stretch.len() + self.shear.len() + self.bend.len()
    }

    /// Whether the network has no springs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
