//! Particle position history and per-particle flexibility.
//!
//! Velocity is never stored. It is recovered by finite difference of the two
//! most recent positions:
//!
//! ```text
//! v = (current - previous) / substep
//! ```
//!
//! Ropes additionally keep an `initial` snapshot taken once per frame so the
//! renderer can interpolate between last frame's state and this frame's.

use nalgebra::{Point3, Vector3};

use crate::error::{FlexError, Result};

/// Allocate a vector of `len` copies of `value`, reporting allocation
/// failure instead of aborting.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

/// Position history of every particle in a body (body-local frame).
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleHistory {
    current: Vec<Point3<f32>>,
    previous: Vec<Point3<f32>>,
    initial: Option<Vec<Point3<f32>>>,
}

impl ParticleHistory {
    /// History at rest at `positions`.
    ///
    /// With `keep_initial` a per-frame snapshot buffer is allocated (ropes).
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::ResourceExhausted`] if storage cannot be allocated.
    pub fn at_rest(positions: &[Point3<f32>], keep_initial: bool) -> Result<Self> {
        let mut current = Vec::new();
        current.try_reserve_exact(positions.len())?;
        current.extend_from_slice(positions);

        let previous = current.clone();
        let initial = if keep_initial {
            Some(current.clone())
        } else {
            None
        };

        Ok(Self {
            current,
            previous,
            initial,
        })
    }

    /// Rebuild a history from stored current/previous positions.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if the two buffers differ in length.
    pub fn from_parts(
        current: Vec<Point3<f32>>,
        previous: Vec<Point3<f32>>,
        keep_initial: bool,
    ) -> Result<Self> {
        if current.len() != previous.len() {
            return Err(FlexError::invalid_config(format!(
                "history length mismatch: {} current vs {} previous",
                current.len(),
                previous.len()
            )));
        }
        let initial = keep_initial.then(|| current.clone());
        Ok(Self {
            current,
            previous,
            initial,
        })
    }

    /// Number of particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether the history holds no particles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Most recently integrated positions.
    #[must_use]
    pub fn current(&self) -> &[Point3<f32>] {
        &self.current
    }

    /// Positions one substep back.
    #[must_use]
    pub fn previous(&self) -> &[Point3<f32>] {
        &self.previous
    }

    /// Snapshot taken at the start of the current frame, if kept.
    #[must_use]
    pub fn initial(&self) -> Option<&[Point3<f32>]> {
        self.initial.as_deref()
    }

    /// Mutable access to current and previous positions together.
    pub fn split_mut(&mut self) -> (&mut [Point3<f32>], &mut [Point3<f32>]) {
        (&mut self.current, &mut self.previous)
    }

    /// Overwrite the frame snapshot with the current positions.
    pub fn snapshot_initial(&mut self) {
        if let Some(initial) = &mut self.initial {
            initial.copy_from_slice(&self.current);
        }
    }

    /// Finite-difference velocity of particle `i` for substep `dt`.
    #[must_use]
    pub fn velocity(&self, i: usize, dt: f32) -> Vector3<f32> {
        (self.current[i] - self.previous[i]) / dt
    }

    /// Place particle `i` at `position` with zero implied velocity.
    pub fn teleport(&mut self, i: usize, position: Point3<f32>) {
        self.current[i] = position;
        self.previous[i] = position;
        if let Some(initial) = &mut self.initial {
            initial[i] = position;
        }
    }

    /// Collapse particle `i`'s history onto its current position.
    pub fn settle_particle(&mut self, i: usize) {
        let position = self.current[i];
        self.teleport(i, position);
    }

    /// Render-time position of particle `i`.
    ///
    /// Interpolates from the frame snapshot when one is kept, otherwise from
    /// the previous substep, toward the current position.
    #[must_use]
    pub fn render_position(&self, i: usize, fraction: f32) -> Point3<f32> {
        let from = self
            .initial
            .as_ref()
            .map_or(self.previous[i], |initial| initial[i]);
        from + (self.current[i] - from) * fraction
    }
}

/// Per-particle flexibility in `[0, 1]`. 0 pins a particle in place.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexibilityMask(Vec<f32>);

impl FlexibilityMask {
    /// Fully free mask for `len` particles.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::ResourceExhausted`] if storage cannot be allocated.
    pub fn free(len: usize) -> Result<Self> {
        Ok(Self(try_filled(len, 1.0)?))
    }

    /// Number of particles covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the mask is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flexibility of particle `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> f32 {
        self.0[i]
    }

    /// Set the flexibility of particle `i`, clamped to `[0, 1]`.
    pub fn set(&mut self, i: usize, value: f32) {
        self.0[i] = value.clamp(0.0, 1.0);
    }

    /// Pin particle `i`.
    pub fn pin(&mut self, i: usize) {
        self.0[i] = 0.0;
    }

    /// Release particle `i` completely.
    pub fn release(&mut self, i: usize) {
        self.0[i] = 1.0;
    }

    /// Whether particle `i` is fully pinned.
    #[must_use]
    pub fn is_pinned(&self, i: usize) -> bool {
        self.0[i] <= 0.0
    }

    /// Raw values.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}
