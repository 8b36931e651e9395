//! Render mesh reconstruction from particle state.
//!
//! Every frame the particle lattice is turned into an interleaved vertex
//! stream ([`RenderVertex`]) at a chosen level of detail:
//!
//! - [`rope`] - tube or crossed-ribbon sweep along a parallel-transported
//!   frame, with optional end caps
//! - [`cloth`] - two-sided sheet with per-vertex tangent frames
//! - [`lod`] - tier sample counts and the coarsening blend
//!
//! Vertex and triangle counts of every tier depend only on the lattice
//! dimensions; see [`LodLayout`].

pub mod cloth;
pub mod lod;
pub mod rope;

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FlexError, Result};

/// One interleaved render vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RenderVertex {
    /// Body-local position.
    pub position: [f32; 3],
    /// Displacement per frame.
    pub velocity: [f32; 3],
    /// Unit normal.
    pub normal: [f32; 3],
    /// Unit tangent; `w` is the bitangent sign.
    pub tangent: [f32; 4],
}

impl RenderVertex {
    /// Pack a vertex.
    #[must_use]
    pub fn new(
        position: Point3<f32>,
        velocity: Vector3<f32>,
        normal: Vector3<f32>,
        tangent: Vector3<f32>,
        handedness: f32,
    ) -> Self {
        Self {
            position: [position.x, position.y, position.z],
            velocity: [velocity.x, velocity.y, velocity.z],
            normal: [normal.x, normal.y, normal.z],
            tangent: [tangent.x, tangent.y, tangent.z, handedness],
        }
    }

    /// Position as a point.
    #[must_use]
    pub fn position(&self) -> Point3<f32> {
        Point3::from(self.position)
    }

    /// Normal as a vector.
    #[must_use]
    pub fn normal(&self) -> Vector3<f32> {
        Vector3::from(self.normal)
    }

    /// Tangent direction without the sign.
    #[must_use]
    pub fn tangent(&self) -> Vector3<f32> {
        Vector3::new(self.tangent[0], self.tangent[1], self.tangent[2])
    }
}

/// Parameters of one reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReconstructRequest {
    /// LOD tier (0 = high). Clamped to the body's tier count.
    pub lod: usize,
    /// Interpolation fraction between last frame and this frame, `[0, 1]`.
    pub fraction: f32,
    /// Emit rope end caps (ignored by cloth and crossed ribbons).
    pub include_endcaps: bool,
    /// Real frame duration in seconds, used to scale vertex velocity.
    pub frame_time: f32,
}

impl Default for ReconstructRequest {
    fn default() -> Self {
        Self {
            lod: 0,
            fraction: 1.0,
            include_endcaps: true,
            frame_time: 1.0 / 60.0,
        }
    }
}

impl ReconstructRequest {
    /// Request a tier at an interpolation fraction.
    #[must_use]
    pub fn new(lod: usize, fraction: f32) -> Self {
        Self {
            lod,
            fraction,
            ..Self::default()
        }
    }

    /// Enable or disable end caps.
    #[must_use]
    pub const fn with_endcaps(mut self, include_endcaps: bool) -> Self {
        self.include_endcaps = include_endcaps;
        self
    }

    /// Set the real frame duration.
    #[must_use]
    pub const fn with_frame_time(mut self, frame_time: f32) -> Self {
        self.frame_time = frame_time;
        self
    }
}

/// Vertex and triangle layout of one LOD tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LodLayout {
    lod: usize,
    vertex_count: usize,
    indices: Vec<[u32; 3]>,
}

impl LodLayout {
    pub(crate) fn new(lod: usize, vertex_count: usize, indices: Vec<[u32; 3]>) -> Self {
        Self {
            lod,
            vertex_count,
            indices,
        }
    }

    /// Tier index.
    #[must_use]
    pub const fn lod(&self) -> usize {
        self.lod
    }

    /// Vertices in the tier's stream.
    #[must_use]
    pub const fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Triangles in the tier.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Triangle list.
    #[must_use]
    pub fn indices(&self) -> &[[u32; 3]] {
        &self.indices
    }
}

/// Fail if a stream of `vertex_count` vertices cannot use 32-bit indices.
pub(crate) fn check_index_range(vertex_count: usize) -> Result<()> {
    if u32::try_from(vertex_count).is_err() {
        return Err(FlexError::index_out_of_bounds(format!(
            "{vertex_count} vertices exceed 32-bit indices"
        )));
    }
    Ok(())
}

/// Normalize `v`, falling back to `fallback` for near-zero input.
pub(crate) fn unit_or(v: Vector3<f32>, fallback: Vector3<f32>) -> Vector3<f32> {
    v.try_normalize(1.0e-12).unwrap_or(fallback)
}
