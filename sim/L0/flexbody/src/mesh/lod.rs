//! Level-of-detail tiers.
//!
//! Tier `k` keeps every `2^k`-th particle along each lattice axis, always
//! including the last one:
//!
//! ```text
//! samples(n, k) = ceil((n - 1) / 2^k) + 1
//! ```
//!
//! Tier 0 copies the particles. Coarser tiers replace each interior sample
//! with a `(1, 6, 1) / 8` blend of itself and the particles half a stride on
//! either side; end samples are kept as-is so attached ends stay put.
//! Surface tangents go through the same blend and are renormalised by the
//! caller.

use nalgebra::Vector3;

/// Particle stride of tier `lod`.
#[must_use]
pub fn stride(lod: usize) -> usize {
    u32::try_from(lod)
        .ok()
        .and_then(|shift| 1_usize.checked_shl(shift))
        .unwrap_or(usize::MAX)
}

/// Samples along an axis of `count` particles at tier `lod`.
#[must_use]
pub fn tier_samples(count: usize, lod: usize) -> usize {
    if count < 2 {
        return count;
    }
    (count - 1).div_ceil(stride(lod)) + 1
}

/// Particle a sample is centred on.
#[must_use]
pub fn source_index(sample: usize, count: usize, lod: usize) -> usize {
    sample
        .saturating_mul(stride(lod))
        .min(count.saturating_sub(1))
}

/// Resample an axis of `count` values into `out`.
///
/// `fetch(i)` returns the value at particle `i`.
pub fn resample(
    count: usize,
    lod: usize,
    fetch: impl Fn(usize) -> Vector3<f32>,
    out: &mut Vec<Vector3<f32>>,
) {
    out.clear();
    let samples = tier_samples(count, lod);
    if lod == 0 || samples <= 2 {
        out.extend((0..samples).map(|j| fetch(source_index(j, count, lod))));
        return;
    }

    let half = stride(lod) / 2;
    let last = count - 1;
    out.extend((0..samples).map(|j| {
        let c = source_index(j, count, lod);
        if j == 0 || j == samples - 1 {
            return fetch(c);
        }
        let l = c.saturating_sub(half);
        let r = c.saturating_add(half).min(last);
        (fetch(l) + fetch(c) * 6.0 + fetch(r)) * 0.125
    }));
}

/// Resample a row-major `cols × rows` grid.
///
/// Blends along rows first, then columns. Returns the tier's
/// `(cols, rows)` sample counts; `out` is row-major in those.
pub fn resample_grid(
    cols: usize,
    rows: usize,
    lod: usize,
    fetch: impl Fn(usize) -> Vector3<f32>,
    out: &mut Vec<Vector3<f32>>,
) -> (usize, usize) {
    let u = tier_samples(cols, lod);
    let v = tier_samples(rows, lod);

    let mut row = Vec::with_capacity(u);
    let mut by_row = Vec::with_capacity(u * rows);
    for r in 0..rows {
        resample(cols, lod, |c| fetch(r * cols + c), &mut row);
        by_row.extend_from_slice(&row);
    }

    out.clear();
    out.resize(u * v, Vector3::zeros());
    let mut column = Vec::with_capacity(v);
    for i in 0..u {
        resample(rows, lod, |r| by_row[r * u + i], &mut column);
        for (j, value) in column.iter().enumerate() {
            out[j * u + i] = *value;
        }
    }
    (u, v)
}
