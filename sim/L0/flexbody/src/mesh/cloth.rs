//! Two-sided cloth surface.
//!
//! The tier grid is emitted twice: front vertices first, then back vertices
//! with negated normal and a `-1` bitangent sign. For a `u × v` sample grid:
//!
//! ```text
//! vertices  = 2·u·v
//! triangles = 4·(u - 1)·(v - 1)
//! ```

use nalgebra::{Point3, Vector3};

use super::{LodLayout, RenderVertex, check_index_range, lod, unit_or};
use crate::error::Result;

/// Sample grid dimensions of a tier.
#[must_use]
pub fn tier_dims(cols: usize, rows: usize, lod: usize) -> (usize, usize) {
    (lod::tier_samples(cols, lod), lod::tier_samples(rows, lod))
}

/// Vertex count of a tier.
#[must_use]
pub fn vertex_count(cols: usize, rows: usize, lod: usize) -> usize {
    let (u, v) = tier_dims(cols, rows, lod);
    2 * u * v
}

/// Triangle count of a tier.
#[must_use]
pub fn triangle_count(cols: usize, rows: usize, lod: usize) -> usize {
    let (u, v) = tier_dims(cols, rows, lod);
    4 * u.saturating_sub(1) * v.saturating_sub(1)
}

/// Index layout of a tier.
///
/// # Errors
///
/// Returns [`FlexError::IndexOutOfBounds`](crate::FlexError) if the tier
/// needs more than 32-bit indices.
pub fn layout(cols: usize, rows: usize, lod: usize) -> Result<LodLayout> {
    let count = vertex_count(cols, rows, lod);
    check_index_range(count)?;

    let (u, v) = tier_dims(cols, rows, lod);
    let (u, v) = (u as u32, v as u32);
    let back = u * v;
    let mut indices = Vec::with_capacity(triangle_count(cols, rows, lod));
    for j in 0..v.saturating_sub(1) {
        for i in 0..u.saturating_sub(1) {
            let a = j * u + i;
            let b = a + 1;
            let c = a + u;
            let d = c + 1;
            indices.push([a, b, d]);
            indices.push([a, d, c]);
            indices.push([back + a, back + d, back + b]);
            indices.push([back + a, back + c, back + d]);
        }
    }
    Ok(LodLayout::new(lod, count, indices))
}

/// Finite difference of `grid[(i, j)]` along one axis.
fn axis_difference(
    grid: &[Vector3<f32>],
    index: impl Fn(usize) -> usize,
    at: usize,
    len: usize,
) -> Vector3<f32> {
    if len < 2 {
        return Vector3::zeros();
    }
    let (lo, hi) = if at == 0 {
        (0, 1)
    } else if at == len - 1 {
        (at - 1, at)
    } else {
        (at - 1, at + 1)
    };
    grid[index(hi)] - grid[index(lo)]
}

/// Rebuild a cloth tier into `out`.
///
/// `positions` and `velocities` are row-major over a `cols × rows` lattice.
///
/// # Errors
///
/// Returns [`FlexError::IndexOutOfBounds`](crate::FlexError) if the tier
/// needs more than 32-bit indices.
pub fn reconstruct(
    cols: usize,
    rows: usize,
    positions: &[Point3<f32>],
    velocities: &[Vector3<f32>],
    lod: usize,
    out: &mut Vec<RenderVertex>,
) -> Result<()> {
    let count = vertex_count(cols, rows, lod);
    check_index_range(count)?;

    // Per-particle surface axes, blended per tier like the positions.
    let coords: Vec<_> = positions.iter().map(|p| p.coords).collect();
    let mut along_cols = Vec::with_capacity(coords.len());
    let mut along_rows = Vec::with_capacity(coords.len());
    for r in 0..rows {
        for c in 0..cols {
            let du = axis_difference(&coords, |x| r * cols + x, c, cols);
            let dv = axis_difference(&coords, |y| y * cols + c, r, rows);
            along_cols.push(unit_or(du, Vector3::x()));
            along_rows.push(unit_or(dv, Vector3::y()));
        }
    }

    let mut points = Vec::new();
    let mut motion = Vec::new();
    let mut tangents = Vec::new();
    let mut bitangents = Vec::new();
    let (u, v) = lod::resample_grid(cols, rows, lod, |i| coords[i], &mut points);
    lod::resample_grid(cols, rows, lod, |i| velocities[i], &mut motion);
    lod::resample_grid(cols, rows, lod, |i| along_cols[i], &mut tangents);
    lod::resample_grid(cols, rows, lod, |i| along_rows[i], &mut bitangents);

    out.clear();
    out.reserve(count);
    let mut back = Vec::with_capacity(u * v);

    for k in 0..u * v {
        let tangent = unit_or(tangents[k], Vector3::x());
        let normal = unit_or(tangent.cross(&bitangents[k]), Vector3::z());
        let position = Point3::from(points[k]);
        out.push(RenderVertex::new(position, motion[k], normal, tangent, 1.0));
        back.push(RenderVertex::new(position, motion[k], -normal, tangent, -1.0));
    }
    out.extend_from_slice(&back);

    debug_assert_eq!(out.len(), count);
    Ok(())
}
