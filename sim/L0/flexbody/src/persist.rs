//! Persisted simulation state.
//!
//! Only what cannot be rebuilt from configuration is stored: tuned spring
//! and damper constants, attachment connectors, particle history, the
//! persistent subset of body flags and timing knobs. The format is whatever
//! serde backend the host picks (enable the `serde` feature).

use nalgebra::Point3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::attachment::ConnectorId;
use crate::config::{DamperConstants, SpringConstants};
use crate::error::{FlexError, Result};
use crate::particles::ParticleHistory;
use crate::types::BodyFlags;

/// Flags that survive a save/load cycle.
pub const PERSISTED_FLAGS: BodyFlags = BodyFlags::FORCE_FIELD_INHIBIT
    .union(BodyFlags::PRE_ASLEEP)
    .union(BodyFlags::WARM_STARTED);

/// One attachment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PersistedAttachment {
    /// Slot index.
    pub slot: usize,
    /// Connector to resolve on activation.
    pub connector: Option<ConnectorId>,
    /// Whether the slot was holding its particle when saved.
    pub attached: bool,
}

/// Particle position history.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PersistedHistory {
    /// Most recent positions.
    pub current: Vec<[f32; 3]>,
    /// Positions one substep back.
    pub previous: Vec<[f32; 3]>,
}

fn pack(points: &[Point3<f32>]) -> Vec<[f32; 3]> {
    points.iter().map(|p| [p.x, p.y, p.z]).collect()
}

fn unpack(points: &[[f32; 3]]) -> Vec<Point3<f32>> {
    points.iter().map(|&p| Point3::from(p)).collect()
}

impl PersistedHistory {
    /// Capture a history.
    #[must_use]
    pub fn capture(history: &ParticleHistory) -> Self {
        Self {
            current: pack(history.current()),
            previous: pack(history.previous()),
        }
    }

    /// Number of particles stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether no particles are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Unpack into `(current, previous)` points.
    ///
    /// # Errors
    ///
    /// Returns [`FlexError::InvalidConfig`] if the two buffers differ in
    /// length or hold non-finite values.
    pub fn to_points(&self) -> Result<(Vec<Point3<f32>>, Vec<Point3<f32>>)> {
        if self.current.len() != self.previous.len() {
            return Err(FlexError::invalid_config(format!(
                "stored history length mismatch: {} vs {}",
                self.current.len(),
                self.previous.len()
            )));
        }
        let finite = self
            .current
            .iter()
            .chain(&self.previous)
            .flatten()
            .all(|c| c.is_finite());
        if !finite {
            return Err(FlexError::invalid_config("stored history is not finite"));
        }
        Ok((unpack(&self.current), unpack(&self.previous)))
    }
}

/// Everything a controller needs to resume a body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PersistedState {
    /// Spring constants.
    pub springs: SpringConstants,
    /// Damper constants.
    pub dampers: DamperConstants,
    /// Attachment slots.
    pub attachments: Vec<PersistedAttachment>,
    /// Particle history; absent while editing or before first activation.
    pub history: Option<PersistedHistory>,
    /// Persistent body flags.
    pub flags: BodyFlags,
    /// Auto-sleep timeout in seconds.
    pub auto_sleep_timeout: f32,
    /// Warm-start seconds still to run on next activation.
    pub warm_start_remaining: f32,
}
